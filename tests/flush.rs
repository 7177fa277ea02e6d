mod common;

use common::World;
use rma_core::{
    AccOp, AccessState, LockType, ModeFlags, OriginSpec, ResultSpec, SyncFlag, TargetSpec,
};

#[test]
fn flush_local_without_writes_stays_local() {
    let mut world = World::new(2);
    let win = world.create_window(16);
    world.serve(&[1]);
    let origin = world.rank(0);

    origin
        .begin_access(win, 1, LockType::Exclusive, ModeFlags::NONE)
        .unwrap();
    let result = ResultSpec::new::<u64>(2);
    origin
        .enqueue_get(win, 1, result.clone(), TargetSpec::new::<u64>(0, 2))
        .unwrap();
    origin.flush_local(win, 1).block().unwrap();

    let status = origin.target_status(win, 1).unwrap().unwrap();
    assert!(!status.upgrade_flush_local);
    assert_eq!(status.sync_flag, SyncFlag::None);
    assert!(world.sent(0, 1).iter().all(|r| !r.requests_flush()));
    assert_eq!(result.buf.to_vec::<u64>(), vec![0, 0]);
    origin.unlock(win, 1).block().unwrap();
    world.stop();
}

#[test]
fn accumulate_after_flush_local_upgrades_it() {
    let mut world = World::new(2);
    let win = world.create_window(16);
    world.serve(&[1]);
    let origin = world.rank(0);

    origin
        .begin_access(win, 1, LockType::Exclusive, ModeFlags::NONE)
        .unwrap();
    // the get carries the lock request, nothing else goes out before the grant
    origin
        .enqueue_get(win, 1, ResultSpec::new::<u64>(1), TargetSpec::new::<u64>(0, 1))
        .unwrap();
    let flush_local = origin.flush_local(win, 1);
    let status = origin.target_status(win, 1).unwrap().unwrap();
    assert_eq!(status.sync_flag, SyncFlag::FlushLocal);
    assert!(!status.upgrade_flush_local);

    origin
        .enqueue_accumulate(win, 1, OriginSpec::from_slice(&[9u64]), TargetSpec::new::<u64>(8, 1), AccOp::Sum)
        .unwrap();
    assert_eq!(
        origin.target_status(win, 1).unwrap().unwrap().access_state,
        AccessState::LockRequested
    );
    flush_local.block().unwrap();

    let status = origin.target_status(win, 1).unwrap().unwrap();
    assert!(status.upgrade_flush_local);
    assert_eq!(status.outstanding_acks, 0);
    let acc = world
        .sent(0, 1)
        .into_iter()
        .find(|r| r.kind == rma_core::PacketKind::Accumulate)
        .unwrap();
    assert!(acc.requests_flush());
    // a flush only returns once the target applied the accumulate
    assert_eq!(world.rank(1).read_window::<u64>(win, 8, 1).unwrap(), vec![9]);
    origin.unlock(win, 1).block().unwrap();
    world.stop();
}

#[test]
fn flush_local_requested_with_pending_write_upgrades_immediately() {
    let mut world = World::with_options(2, Default::default(), |b| b.delay_issuing(true));
    let win = world.create_window(16);
    world.serve(&[1]);
    let origin = world.rank(0);

    origin
        .begin_access(win, 1, LockType::Shared, ModeFlags::NONE)
        .unwrap();
    origin
        .enqueue_put(win, 1, OriginSpec::from_slice(&[3u32]), TargetSpec::new::<u32>(0, 1))
        .unwrap();
    assert!(world.fabric.packet_log().is_empty());
    let handle = origin.flush_local(win, 1);
    let status = origin.target_status(win, 1).unwrap().unwrap();
    assert!(status.upgrade_flush_local);
    handle.block().unwrap();
    assert_eq!(world.rank(1).read_window::<u32>(win, 0, 1).unwrap(), vec![3]);
    origin.unlock(win, 1).block().unwrap();
    world.stop();
}

#[test]
fn flush_waits_for_the_target() {
    let mut world = World::new(2);
    let win = world.create_window(32);
    world.serve(&[1]);
    let origin = world.rank(0);

    origin
        .begin_access(win, 1, LockType::Shared, ModeFlags::NONE)
        .unwrap();
    origin
        .enqueue_put(win, 1, OriginSpec::from_slice(&[1.5f64, 2.5]), TargetSpec::new::<f64>(16, 2))
        .unwrap();
    origin.flush(win, 1).block().unwrap();
    assert_eq!(world.rank(1).read_window::<f64>(win, 16, 2).unwrap(), vec![1.5, 2.5]);
    // grant plus flush
    assert_eq!(origin.stats().acks_received, 2);

    // nothing written since the last flush: no packet needed
    let before = world.fabric.packet_log().len();
    origin.flush(win, 1).block().unwrap();
    assert_eq!(world.fabric.packet_log().len(), before);

    // a read only epoch remainder unlocks without asking for an ack
    origin.unlock(win, 1).block().unwrap();
    let unlock = world.sent(0, 1).pop().unwrap();
    assert_eq!(unlock.kind, rma_core::PacketKind::Unlock);
    assert_eq!(origin.stats().acks_received, 2);
    world.run_ticks(4);
    assert_eq!(world.rank(1).granted_lock(win).unwrap(), LockType::None);
    world.stop();
}

#[test]
fn flush_all_covers_every_locked_target() {
    let mut world = World::new(3);
    let win = world.create_window(8);
    world.serve(&[1, 2]);
    let origin = world.rank(0);

    for rank in [1, 2] {
        origin
            .begin_access(win, rank, LockType::Exclusive, ModeFlags::NONE)
            .unwrap();
        origin
            .enqueue_put(win, rank, OriginSpec::from_slice(&[rank as u64 * 11]), TargetSpec::new::<u64>(0, 1))
            .unwrap();
    }
    origin.flush_all(win).block().unwrap();
    for rank in [1, 2] {
        assert_eq!(
            world.rank(rank).read_window::<u64>(win, 0, 1).unwrap(),
            vec![rank as u64 * 11]
        );
        assert_eq!(world.rank(rank).granted_lock(win).unwrap(), LockType::Exclusive);
    }
    origin.flush_local_all(win).block().unwrap();
    for rank in [1, 2] {
        origin.unlock(win, rank).block().unwrap();
    }
    world.stop();
}

#[test]
fn unlock_of_nocheck_epoch_only_flushes() {
    let mut world = World::new(2);
    let win = world.create_window(8);
    world.serve(&[1]);
    let origin = world.rank(0);

    origin
        .begin_access(win, 1, LockType::Exclusive, ModeFlags::NOCHECK)
        .unwrap();
    assert_eq!(
        origin.target_status(win, 1).unwrap().unwrap().access_state,
        AccessState::Locked
    );
    origin
        .enqueue_put(win, 1, OriginSpec::from_slice(&[4u64]), TargetSpec::new::<u64>(0, 1))
        .unwrap();
    origin.unlock(win, 1).block().unwrap();

    let sent = world.sent(0, 1);
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|r| !r.requests_lock() && !r.requests_unlock()));
    assert_eq!(sent[0].kind, rma_core::PacketKind::Put);
    assert!(sent[1].requests_flush());
    assert_eq!(world.rank(1).read_window::<u64>(win, 0, 1).unwrap(), vec![4]);
    assert_eq!(world.rank(1).granted_lock(win).unwrap(), LockType::None);
    world.stop();
}
