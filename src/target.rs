//! Per (window, target rank) synchronization state.
//!
//! A [Target] owns four ordered lists of operation handles: the pending list in program order and
//! one issued list per [OpClass]. Issue logic lives in `target/issue.rs`, the flush/unlock
//! protocol in `target/sync.rs`.
use serde::{Deserialize, Serialize};

use crate::error::{RmaError, RmaResult};
use crate::op::{OpClass, OpHandle, OpList, OpRecord};
use crate::pool::{Handle, PoolPair};

pub(crate) mod issue;
pub(crate) mod sync;

pub(crate) use issue::IssueCtx;

pub(crate) type TargetHandle = Handle<Target>;

/// Lock discipline requested for a passive target epoch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockType {
    None,
    Shared,
    Exclusive,
}

impl LockType {
    /// Can a lock of this kind be granted while `held` is granted to someone else.
    /// Shared goes with shared, exclusive only with nothing.
    pub fn compatible_with(self, held: LockType) -> bool {
        match (self, held) {
            (LockType::None, _) | (_, LockType::None) => true,
            (LockType::Shared, LockType::Shared) => true,
            _ => false,
        }
    }

    /// Does holding this lock cover an operation that required `required`.
    pub(crate) fn covers(self, required: LockType) -> bool {
        self >= required
    }
}

/// Assertions passed with a lock request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFlags {
    /// no other origin will contend for the lock, so none is requested from the target
    pub nocheck: bool,
}

impl ModeFlags {
    pub const NONE: ModeFlags = ModeFlags { nocheck: false };
    pub const NOCHECK: ModeFlags = ModeFlags { nocheck: true };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Idle,
    /// lock called locally, nothing sent yet
    LockCalled,
    LockRequested,
    Locked,
    CollectiveEpoch,
    /// the transport failed for this target, terminal
    Failed,
}

/// Next synchronization directive owed to the target, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SyncFlag {
    #[default]
    None,
    FlushLocal,
    Flush,
    Unlock,
}

#[derive(Debug, Default)]
pub(crate) struct SyncState {
    pub(crate) sync_flag: SyncFlag,
    pub(crate) outstanding_acks: usize,
    pub(crate) upgrade_flush_local: bool,
    /// the unlock went out, the target goes idle once acks drain
    pub(crate) unlock_sent: bool,
}

/// Snapshot of a target's state, for tests and tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub rank: usize,
    pub access_state: AccessState,
    pub lock_type: LockType,
    pub sync_flag: SyncFlag,
    pub outstanding_acks: usize,
    pub upgrade_flush_local: bool,
    pub put_acc_issued: bool,
    pub pending: usize,
    pub issued_read: usize,
    pub issued_write: usize,
    pub issued_dt: usize,
}

pub(crate) struct Target {
    pub(crate) rank: usize,
    pub(crate) issued_read: OpList,
    pub(crate) issued_write: OpList,
    pub(crate) issued_dt: OpList,
    pub(crate) pending: OpList,
    pub(crate) next_op_to_issue: Option<OpHandle>,
    pub(crate) access_state: AccessState,
    pub(crate) lock_type: LockType,
    pub(crate) lock_mode: ModeFlags,
    pub(crate) win_complete_flag: bool,
    pub(crate) complete_sent: bool,
    pub(crate) put_acc_issued: bool,
    pub(crate) sync: SyncState,
    pub(crate) error: Option<RmaError>,
}

impl Target {
    pub(crate) fn new(rank: usize) -> Target {
        Target {
            rank,
            issued_read: OpList::default(),
            issued_write: OpList::default(),
            issued_dt: OpList::default(),
            pending: OpList::default(),
            next_op_to_issue: None,
            access_state: AccessState::Idle,
            lock_type: LockType::None,
            lock_mode: ModeFlags::NONE,
            win_complete_flag: false,
            complete_sent: false,
            put_acc_issued: false,
            sync: SyncState::default(),
            error: None,
        }
    }

    /// Append in program order.
    pub(crate) fn enqueue(&mut self, op: OpHandle) {
        self.pending.push_back(op);
        if self.next_op_to_issue.is_none() {
            self.next_op_to_issue = Some(op);
        }
    }

    fn issued_list(&mut self, class: OpClass) -> &mut OpList {
        match class {
            OpClass::Read => &mut self.issued_read,
            OpClass::Write => &mut self.issued_write,
            OpClass::Derived => &mut self.issued_dt,
        }
    }

    /// Pops the cursor operation and files it under its issued list.
    pub(crate) fn take_cursor(&mut self, ops: &PoolPair<OpRecord>) -> RmaResult<Option<OpHandle>> {
        let Some(h) = self.pending.pop_front() else {
            return Ok(None);
        };
        let class = ops
            .get(h)
            .ok_or(RmaError::internal("stale operation handle"))?
            .class();
        self.issued_list(class).push_back(h);
        self.next_op_to_issue = self.pending.front();
        Ok(Some(h))
    }

    /// The next pending operation, if the access state allows it to go out now.
    pub(crate) fn dequeue_next_issuable(
        &mut self,
        ops: &PoolPair<OpRecord>,
    ) -> RmaResult<Option<OpHandle>> {
        let Some(h) = self.next_op_to_issue else {
            return Ok(None);
        };
        let op = ops
            .get(h)
            .ok_or(RmaError::internal("stale operation handle"))?;
        let issuable = match self.access_state {
            AccessState::Locked | AccessState::CollectiveEpoch => {
                self.lock_type.covers(op.required_lock)
            }
            _ => false,
        };
        if issuable {
            self.take_cursor(ops)
        } else {
            Ok(None)
        }
    }

    pub(crate) fn issued_empty(&self) -> bool {
        self.issued_read.is_empty() && self.issued_write.is_empty() && self.issued_dt.is_empty()
    }

    pub(crate) fn queues_empty(&self) -> bool {
        self.pending.is_empty() && self.issued_empty()
    }

    /// No queued work, no acks owed and no directive left to send.
    pub(crate) fn is_reclaimable(&self) -> bool {
        self.queues_empty()
            && self.sync.outstanding_acks == 0
            && self.sync.sync_flag == SyncFlag::None
    }

    pub(crate) fn has_pending_write(&self, ops: &PoolPair<OpRecord>) -> bool {
        self.pending
            .iter()
            .any(|h| ops.get(*h).map(|op| op.kind.is_write_class()).unwrap_or(false))
    }

    pub(crate) fn status(&self) -> TargetStatus {
        TargetStatus {
            rank: self.rank,
            access_state: self.access_state,
            lock_type: self.lock_type,
            sync_flag: self.sync.sync_flag,
            outstanding_acks: self.sync.outstanding_acks,
            upgrade_flush_local: self.sync.upgrade_flush_local,
            put_acc_issued: self.put_acc_issued,
            pending: self.pending.len(),
            issued_read: self.issued_read.len(),
            issued_write: self.issued_write.len(),
            issued_dt: self.issued_dt.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{AccOp, Datatype};
    use crate::op::{OpArgs, OpKind, OpLimits, OriginSpec, ResultSpec, TargetSpec};
    use crate::pool::{Arena, PoolKind};

    fn record(kind: OpKind, required_lock: LockType, datatype: Datatype) -> OpRecord {
        let (origin, result) = match kind {
            OpKind::Get => (None, Some(ResultSpec::new::<i64>(1))),
            _ => (Some(OriginSpec::from_slice(&[1i64])), None),
        };
        let args = OpArgs {
            kind,
            origin,
            compare: None,
            result,
            target: TargetSpec::with_datatype(0, 1, datatype),
        };
        let limits = OpLimits {
            stream_unit_size: 1024,
            piggyback_lock_data_size: 1024,
        };
        OpRecord::new(args, 0, 0, required_lock, limits, None)
    }

    #[test]
    fn lock_compatibility() {
        assert!(LockType::Shared.compatible_with(LockType::Shared));
        assert!(LockType::Shared.compatible_with(LockType::None));
        assert!(LockType::Exclusive.compatible_with(LockType::None));
        assert!(!LockType::Exclusive.compatible_with(LockType::Shared));
        assert!(!LockType::Shared.compatible_with(LockType::Exclusive));
        assert!(!LockType::Exclusive.compatible_with(LockType::Exclusive));
        assert!(LockType::Exclusive.covers(LockType::Shared));
        assert!(!LockType::Shared.covers(LockType::Exclusive));
    }

    #[test]
    fn dequeue_respects_state_and_categorizes() {
        let mut win = Arena::new("win", PoolKind::Window, 8);
        let mut global = Arena::new("global", PoolKind::Global, 8);
        let mut ops = PoolPair::new(&mut win, &mut global);
        let get = ops
            .alloc(record(OpKind::Get, LockType::Shared, Datatype::contiguous::<i64>()))
            .ok()
            .unwrap();
        let acc = ops
            .alloc(record(
                OpKind::Accumulate(AccOp::Sum),
                LockType::Shared,
                Datatype::contiguous::<i64>(),
            ))
            .ok()
            .unwrap();
        let dt = ops
            .alloc(record(OpKind::Put, LockType::Shared, Datatype::vector::<i64>(1, 2)))
            .ok()
            .unwrap();

        let mut target = Target::new(1);
        target.enqueue(get);
        target.enqueue(acc);
        target.enqueue(dt);
        assert_eq!(target.next_op_to_issue, Some(get));

        target.access_state = AccessState::LockRequested;
        target.lock_type = LockType::Shared;
        assert_eq!(target.dequeue_next_issuable(&ops).unwrap(), None);

        target.access_state = AccessState::Locked;
        assert_eq!(target.dequeue_next_issuable(&ops).unwrap(), Some(get));
        assert_eq!(target.dequeue_next_issuable(&ops).unwrap(), Some(acc));
        assert_eq!(target.dequeue_next_issuable(&ops).unwrap(), Some(dt));
        assert_eq!(target.dequeue_next_issuable(&ops).unwrap(), None);
        assert_eq!(target.issued_read.len(), 1);
        assert_eq!(target.issued_write.len(), 1);
        assert_eq!(target.issued_dt.len(), 1);
        assert!(target.pending.is_empty());
        assert!(!target.is_reclaimable());
    }

    #[test]
    fn reclaim_requires_acks_and_directive_cleared() {
        let mut target = Target::new(2);
        assert!(target.is_reclaimable());
        target.sync.outstanding_acks = 1;
        assert!(!target.is_reclaimable());
        target.sync.outstanding_acks = 0;
        target.sync.sync_flag = SyncFlag::FlushLocal;
        assert!(!target.is_reclaimable());
    }
}
