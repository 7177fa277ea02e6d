use tracing::debug;

use super::{AccessState, LockType, ModeFlags, SyncFlag, SyncState, Target};
use crate::error::{RmaError, RmaResult};
use crate::op::OpRecord;
use crate::packet::PktFlags;
use crate::pool::PoolPair;

/// What a waiting synchronization call needs from a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncWait {
    /// flush and flush-local
    Drained,
    Unlocked,
    Completed,
}

impl Target {
    fn check_failed(&self) -> RmaResult<()> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Opens a passive epoch. Nothing is sent: the lock goes out with the first operation that needs it.
    pub(crate) fn begin_access(&mut self, lock_type: LockType, mode: ModeFlags) -> RmaResult<()> {
        self.check_failed()?;
        match self.access_state {
            AccessState::Idle => {}
            AccessState::CollectiveEpoch => {
                return Err(RmaError::invalid_state(
                    self.rank,
                    "lock requested inside a collective epoch",
                ))
            }
            _ => {
                return Err(RmaError::invalid_state(
                    self.rank,
                    "lock already held or requested for this target",
                ))
            }
        }
        self.lock_type = lock_type;
        self.lock_mode = mode;
        self.sync = SyncState::default();
        self.put_acc_issued = false;
        self.access_state = if mode.nocheck {
            AccessState::Locked
        } else {
            AccessState::LockCalled
        };
        Ok(())
    }

    /// Records a flush-local, flush or unlock directive.
    ///
    /// Directives only ever get stronger. A flush-local requested while writes are still pending
    /// becomes a flush right away.
    pub(crate) fn request_sync(&mut self, flag: SyncFlag, ops: &PoolPair<OpRecord>) -> RmaResult<()> {
        self.check_failed()?;
        match self.access_state {
            AccessState::Idle | AccessState::CollectiveEpoch => {
                return Err(RmaError::invalid_state(
                    self.rank,
                    "passive target synchronization without a matching lock",
                ))
            }
            _ => {}
        }
        if self.sync.unlock_sent {
            return Err(RmaError::invalid_state(
                self.rank,
                "target is already being unlocked",
            ));
        }
        if self.sync.sync_flag == SyncFlag::None && self.sync.outstanding_acks == 0 {
            self.sync.upgrade_flush_local = false;
        }
        if flag > self.sync.sync_flag {
            self.sync.sync_flag = flag;
        }
        if self.has_pending_write(ops) {
            self.upgrade_flush_local();
        }
        Ok(())
    }

    /// Strengthens a pending flush-local into a flush, idempotent.
    pub(crate) fn upgrade_flush_local(&mut self) {
        if self.sync.sync_flag == SyncFlag::FlushLocal {
            debug!("upgrading flush_local to flush for target {}", self.rank);
            self.sync.sync_flag = SyncFlag::Flush;
            self.sync.upgrade_flush_local = true;
        }
    }

    pub(crate) fn handle_ack(&mut self, flags: PktFlags) -> RmaResult<()> {
        if flags.contains(PktFlags::LOCK_GRANTED) {
            if self.access_state != AccessState::LockRequested {
                return Err(RmaError::invalid_state(
                    self.rank,
                    "lock grant without an outstanding lock request",
                ));
            }
            debug!("{:?} lock granted by {}", self.lock_type, self.rank);
            self.access_state = AccessState::Locked;
        }
        if flags.contains(PktFlags::FLUSH_ACK) || flags.contains(PktFlags::UNLOCK_ACK) {
            if self.sync.outstanding_acks == 0 {
                return Err(RmaError::invalid_state(
                    self.rank,
                    "acknowledgement without a synchronization in flight",
                ));
            }
            self.sync.outstanding_acks -= 1;
        }
        self.finish_unlock_if_acked();
        Ok(())
    }

    pub(crate) fn finish_unlock_if_acked(&mut self) {
        if self.sync.unlock_sent && self.sync.outstanding_acks == 0 {
            self.end_access();
        }
    }

    pub(crate) fn end_access(&mut self) {
        debug!("passive epoch with {} closed", self.rank);
        self.access_state = AccessState::Idle;
        self.lock_type = LockType::None;
        self.lock_mode = ModeFlags::NONE;
        self.sync.unlock_sent = false;
        self.sync.sync_flag = SyncFlag::None;
    }

    pub(crate) fn start_collective(&mut self) -> RmaResult<()> {
        self.check_failed()?;
        if self.access_state != AccessState::Idle {
            return Err(RmaError::invalid_state(
                self.rank,
                "collective epoch started while a passive epoch is open",
            ));
        }
        self.access_state = AccessState::CollectiveEpoch;
        self.lock_type = LockType::None;
        self.win_complete_flag = false;
        self.complete_sent = false;
        self.put_acc_issued = false;
        Ok(())
    }

    pub(crate) fn request_complete(&mut self) -> RmaResult<()> {
        self.check_failed()?;
        if self.access_state != AccessState::CollectiveEpoch {
            return Err(RmaError::invalid_state(
                self.rank,
                "complete called outside of a collective epoch",
            ));
        }
        self.win_complete_flag = true;
        Ok(())
    }

    pub(crate) fn end_collective(&mut self) {
        self.access_state = AccessState::Idle;
        self.win_complete_flag = false;
        self.complete_sent = false;
        self.put_acc_issued = false;
    }

    /// Completion predicate of a waiting synchronization call, a failed target reports its error.
    pub(crate) fn sync_satisfied(&self, wait: SyncWait) -> RmaResult<bool> {
        self.check_failed()?;
        let drained = self.is_reclaimable();
        Ok(match wait {
            SyncWait::Drained => drained,
            SyncWait::Unlocked => drained && self.access_state == AccessState::Idle,
            SyncWait::Completed => drained && self.complete_sent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::AccOp;
    use crate::op::{OpArgs, OpKind, OpLimits, OriginSpec, TargetSpec};
    use crate::pool::{Arena, PoolKind};

    fn acc_record() -> OpRecord {
        let args = OpArgs {
            kind: OpKind::Accumulate(AccOp::Sum),
            origin: Some(OriginSpec::from_slice(&[1u32])),
            compare: None,
            result: None,
            target: TargetSpec::new::<u32>(0, 1),
        };
        let limits = OpLimits {
            stream_unit_size: 64,
            piggyback_lock_data_size: 64,
        };
        OpRecord::new(args, 0, 0, LockType::Exclusive, limits, None)
    }

    #[test]
    fn sync_without_lock_is_rejected() {
        let mut win = Arena::new("win", PoolKind::Window, 1);
        let mut global = Arena::new("global", PoolKind::Global, 1);
        let ops = PoolPair::new(&mut win, &mut global);
        let mut target = Target::new(3);
        let err = target.request_sync(SyncFlag::Unlock, &ops).unwrap_err();
        assert!(matches!(err, RmaError::InvalidState { rank: Some(3), .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn flush_local_upgrades_with_pending_write_and_never_downgrades() {
        let mut win = Arena::new("win", PoolKind::Window, 4);
        let mut global = Arena::new("global", PoolKind::Global, 4);
        let mut ops = PoolPair::new(&mut win, &mut global);
        let mut target = Target::new(3);
        target.begin_access(LockType::Exclusive, ModeFlags::NONE).unwrap();

        target.request_sync(SyncFlag::FlushLocal, &ops).unwrap();
        assert_eq!(target.sync.sync_flag, SyncFlag::FlushLocal);
        assert!(!target.sync.upgrade_flush_local);

        let h = ops.alloc(acc_record()).ok().unwrap();
        target.enqueue(h);
        target.request_sync(SyncFlag::FlushLocal, &ops).unwrap();
        assert_eq!(target.sync.sync_flag, SyncFlag::Flush);
        assert!(target.sync.upgrade_flush_local);

        // a second upgrade is a no-op and a weaker request does not downgrade
        target.upgrade_flush_local();
        target.request_sync(SyncFlag::FlushLocal, &ops).unwrap();
        assert_eq!(target.sync.sync_flag, SyncFlag::Flush);
        target.request_sync(SyncFlag::Unlock, &ops).unwrap();
        assert_eq!(target.sync.sync_flag, SyncFlag::Unlock);
        target.request_sync(SyncFlag::Flush, &ops).unwrap();
        assert_eq!(target.sync.sync_flag, SyncFlag::Unlock);
    }

    #[test]
    fn acks_drive_unlock_to_idle() {
        let mut target = Target::new(1);
        target.begin_access(LockType::Shared, ModeFlags::NONE).unwrap();
        target.access_state = AccessState::LockRequested;
        target.handle_ack(PktFlags::LOCK_GRANTED).unwrap();
        assert_eq!(target.access_state, AccessState::Locked);
        assert!(target.handle_ack(PktFlags::FLUSH_ACK).is_err());

        target.sync.unlock_sent = true;
        target.sync.outstanding_acks = 1;
        target.handle_ack(PktFlags::UNLOCK_ACK).unwrap();
        assert_eq!(target.access_state, AccessState::Idle);
        assert_eq!(target.lock_type, LockType::None);
        assert!(target.sync_satisfied(SyncWait::Unlocked).unwrap());
    }

    #[test]
    fn collective_and_passive_epochs_exclude_each_other() {
        let mut target = Target::new(0);
        target.start_collective().unwrap();
        assert!(target.begin_access(LockType::Shared, ModeFlags::NONE).is_err());
        target.end_collective();
        target.begin_access(LockType::Shared, ModeFlags::NOCHECK).unwrap();
        assert_eq!(target.access_state, AccessState::Locked);
        assert!(target.start_collective().is_err());
    }
}
