mod common;

use common::World;
use rma_core::{
    AccessState, LockType, ModeFlags, OriginSpec, RmaError, TargetSpec, TransportEvent,
};

#[test]
fn failed_link_poisons_only_its_target() {
    let mut world = World::new(3);
    let win = world.create_window(8);
    world.serve(&[1, 2]);
    world.fabric.fail_link(0, 1);
    let origin = world.rank(0);

    for rank in [1, 2] {
        origin
            .begin_access(win, rank, LockType::Exclusive, ModeFlags::NONE)
            .unwrap();
        origin
            .enqueue_put(win, rank, OriginSpec::from_slice(&[7u64]), TargetSpec::new::<u64>(0, 1))
            .unwrap();
    }
    let err = origin.unlock(win, 1).block().unwrap_err();
    assert!(matches!(err, RmaError::TargetFailed { rank: 1, .. }));
    assert!(!err.is_fatal());

    // the failure sticks to the target
    let again = origin
        .enqueue_put(win, 1, OriginSpec::from_slice(&[8u64]), TargetSpec::new::<u64>(0, 1))
        .unwrap_err();
    assert!(matches!(again, RmaError::TargetFailed { rank: 1, .. }));

    origin.unlock(win, 2).block().unwrap();
    assert_eq!(world.rank(2).read_window::<u64>(win, 0, 1).unwrap(), vec![7]);
    assert_eq!(world.rank(1).read_window::<u64>(win, 0, 1).unwrap(), vec![0]);
    world.stop();
}

#[test]
fn stray_payload_is_fatal() {
    let world = World::new(2);
    world.create_window(8);
    world.fabric.inject(
        1,
        TransportEvent::Data {
            src: 0,
            data: vec![1, 2, 3],
        },
    );
    let err = world.rank(1).progress().unwrap_err();
    assert!(matches!(err, RmaError::PayloadMismatch { .. }));
    assert!(err.is_fatal());
    world.stop();
}

#[test]
fn window_teardown_with_open_epoch_is_refused() {
    let mut world = World::with_options(2, Default::default(), |b| b.delay_issuing(true));
    let win = world.create_window(8);
    world.serve(&[1]);
    let origin = world.rank(0);

    origin
        .begin_access(win, 1, LockType::Exclusive, ModeFlags::NONE)
        .unwrap();
    origin
        .enqueue_put(win, 1, OriginSpec::from_slice(&[5u32]), TargetSpec::new::<u32>(4, 1))
        .unwrap();
    let err = origin.free_window(win).block().unwrap_err();
    assert!(matches!(err, RmaError::InvalidState { rank: Some(1), .. }));
    assert_eq!(origin.num_windows(), 1);

    origin.unlock(win, 1).block().unwrap();
    origin.free_window(win).block().unwrap();
    assert_eq!(origin.num_windows(), 0);
    assert!(matches!(
        origin.begin_access(win, 1, LockType::Shared, ModeFlags::NONE),
        Err(RmaError::UnknownWindow(w)) if w == win
    ));
    assert_eq!(world.rank(1).read_window::<u32>(win, 4, 1).unwrap(), vec![5]);
    world.stop();
}

#[test]
fn exhausted_operation_pools_are_reported() {
    let mut world = World::with_options(2, Default::default(), |b| {
        b.op_pool_sizes(1, 0).delay_issuing(true)
    });
    let win = world.create_window(8);
    world.serve(&[1]);
    let origin = world.rank(0);

    origin
        .begin_access(win, 1, LockType::Shared, ModeFlags::NONE)
        .unwrap();
    origin
        .enqueue_put(win, 1, OriginSpec::from_slice(&[1u8]), TargetSpec::new::<u8>(0, 1))
        .unwrap();
    let err = origin
        .enqueue_put(win, 1, OriginSpec::from_slice(&[2u8]), TargetSpec::new::<u8>(1, 1))
        .unwrap_err();
    assert!(matches!(err, RmaError::OutOfResources(_)));
    assert!(!err.is_fatal());

    origin.unlock(win, 1).block().unwrap();
    // the record went back to the pool with the unlock
    origin
        .begin_access(win, 1, LockType::Shared, ModeFlags::NONE)
        .unwrap();
    origin
        .enqueue_put(win, 1, OriginSpec::from_slice(&[2u8]), TargetSpec::new::<u8>(1, 1))
        .unwrap();
    origin.unlock(win, 1).block().unwrap();
    assert_eq!(world.rank(1).read_window::<u8>(win, 0, 2).unwrap(), vec![1, 2]);
    world.stop();
}

#[test]
fn window_teardown_waits_for_lock_holders() {
    let world = World::new(2);
    let win = world.create_window(8);
    let origin = world.rank(0);

    origin
        .begin_access(win, 1, LockType::Exclusive, ModeFlags::NONE)
        .unwrap();
    origin
        .enqueue_put(win, 1, OriginSpec::from_slice(&[9u32]), TargetSpec::new::<u32>(0, 1))
        .unwrap();
    let teardown = world.rank(1).free_window(win).spawn();
    origin.flush(win, 1).block().unwrap();
    assert_eq!(world.rank(1).granted_lock(win).unwrap(), LockType::Exclusive);
    assert_eq!(world.rank(1).num_windows(), 1);

    origin.unlock(win, 1).block().unwrap();
    world.executor.block_on(teardown).unwrap();
    assert_eq!(world.rank(1).num_windows(), 0);
    world.stop();
}

#[test]
fn unknown_window_is_rejected() {
    let world = World::new(2);
    let win = world.create_window(8);
    let bogus = win + 7;
    let origin = world.rank(0);
    assert!(matches!(
        origin.begin_access(bogus, 1, LockType::Shared, ModeFlags::NONE),
        Err(RmaError::UnknownWindow(w)) if w == bogus
    ));
    assert!(matches!(
        origin.flush(bogus, 1).block(),
        Err(RmaError::UnknownWindow(_))
    ));
    assert!(matches!(
        origin.enqueue_put(bogus, 1, OriginSpec::from_slice(&[1u8]), TargetSpec::new::<u8>(0, 1)),
        Err(RmaError::UnknownWindow(_))
    ));
    assert!(matches!(
        origin.begin_access(win, 5, LockType::Shared, ModeFlags::NONE),
        Err(RmaError::InvalidArgument(_))
    ));
    world.stop();
}

#[test]
fn out_of_bounds_operation_fails_only_its_target() {
    let mut world = World::new(3);
    // rank 1 exposes less memory than its peers
    let win = world.rank(0).create_window(64).unwrap();
    assert_eq!(world.rank(1).create_window(8).unwrap(), win);
    assert_eq!(world.rank(2).create_window(64).unwrap(), win);
    world.serve(&[1]);
    let (a, b) = (world.rank(0), world.rank(2));

    a.begin_access(win, 1, LockType::Exclusive, ModeFlags::NONE)
        .unwrap();
    a.enqueue_put(win, 1, OriginSpec::from_slice(&[5u64]), TargetSpec::new::<u64>(32, 1))
        .unwrap();
    let err = a.unlock(win, 1).block().unwrap_err();
    assert!(matches!(err, RmaError::TargetFailed { rank: 1, .. }));
    assert!(!err.is_fatal());
    assert_eq!(
        a.target_status(win, 1).unwrap().unwrap().access_state,
        AccessState::Failed
    );

    // the lock was never granted and the target keeps serving
    assert_eq!(world.rank(1).granted_lock(win).unwrap(), LockType::None);
    let replies = world.sent(1, 0);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].rejects_op());
    assert!(!replies[0].grants_lock());

    b.begin_access(win, 1, LockType::Exclusive, ModeFlags::NONE)
        .unwrap();
    b.enqueue_put(win, 1, OriginSpec::from_slice(&[9u64]), TargetSpec::new::<u64>(0, 1))
        .unwrap();
    b.unlock(win, 1).block().unwrap();
    assert_eq!(world.rank(1).read_window::<u64>(win, 0, 1).unwrap(), vec![9]);
    world.stop();
}
