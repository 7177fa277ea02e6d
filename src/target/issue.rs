use tracing::{debug, trace};

use super::{AccessState, SyncFlag, Target};
use crate::engine::EngineStats;
use crate::error::{RmaError, RmaResult};
use crate::op::{OpHandle, OpKind, OpList, OpRecord};
use crate::packet::{Packet, PktFlags};
use crate::pool::PoolPair;
use crate::request::{RequestStatus, RequestTable};
use crate::transport::{send_packet, Fabric};
use crate::window::WinId;

/// Everything a target needs from its window and engine while issuing.
pub(crate) struct IssueCtx<'a> {
    pub(crate) rank: usize,
    pub(crate) win: WinId,
    pub(crate) ops: PoolPair<'a, OpRecord>,
    pub(crate) requests: &'a mut RequestTable,
    pub(crate) transport: &'a Fabric,
    pub(crate) delay_issuing: bool,
    pub(crate) stats: &'a mut EngineStats,
}

impl Target {
    /// Retire, switch lock state, issue and send sync directives, as far as the state allows.
    ///
    /// A transport failure is absorbed here: the target moves to `Failed` and keeps the error for
    /// whoever waits on it. Anything else is returned to the caller.
    #[tracing::instrument(skip_all, level = "trace", fields(rank = self.rank))]
    pub(crate) fn make_progress(&mut self, ctx: &mut IssueCtx) -> RmaResult<()> {
        if self.access_state == AccessState::Failed {
            return Ok(());
        }
        match self.drive(ctx) {
            Err(err @ RmaError::TargetFailed { .. }) => {
                self.fail(ctx, err);
                Ok(())
            }
            res => res,
        }
    }

    fn drive(&mut self, ctx: &mut IssueCtx) -> RmaResult<()> {
        self.retire_completed(ctx)?;
        let delaying = ctx.delay_issuing
            && self.sync.sync_flag == SyncFlag::None
            && !self.win_complete_flag;
        if !delaying {
            self.switch_lock_state(ctx)?;
            while let Some(op) = self.dequeue_next_issuable(&ctx.ops)? {
                self.issue_op(op, ctx, PktFlags::NONE)?;
            }
        }
        self.send_sync(ctx)?;
        self.retire_completed(ctx)
    }

    /// Drops operations whose requests all completed and returns them to their pools.
    pub(crate) fn retire_completed(&mut self, ctx: &mut IssueCtx) -> RmaResult<()> {
        let mut failed = false;
        let lists = [
            &mut self.issued_read,
            &mut self.issued_write,
            &mut self.issued_dt,
        ];
        for list in lists {
            list.retain(|h| {
                let status = match ctx.ops.get(*h) {
                    Some(op) => op.local_status(ctx.requests),
                    None => return false,
                };
                if status == RequestStatus::Pending {
                    return true;
                }
                failed |= status == RequestStatus::Failed;
                if let Some(op) = ctx.ops.free(*h) {
                    op.retire(ctx.requests, status);
                    ctx.stats.ops_completed += 1;
                }
                false
            });
        }
        if failed {
            return Err(RmaError::TargetFailed {
                rank: self.rank,
                reason: "an issued operation failed in the transport".to_owned(),
            });
        }
        Ok(())
    }

    /// Sends the lock request of a lazily locked target once something needs it.
    fn switch_lock_state(&mut self, ctx: &mut IssueCtx) -> RmaResult<()> {
        if self.access_state != AccessState::LockCalled {
            return Ok(());
        }
        let Some(front) = self.pending.front() else {
            match self.sync.sync_flag {
                SyncFlag::Unlock => {
                    debug!("lock and unlock of {} without operations", self.rank);
                    self.end_access();
                }
                SyncFlag::Flush | SyncFlag::FlushLocal => self.sync.sync_flag = SyncFlag::None,
                SyncFlag::None => {}
            }
            return Ok(());
        };
        let candidate = ctx
            .ops
            .get(front)
            .ok_or(RmaError::internal("stale operation handle"))?
            .piggyback_lock_candidate;
        self.access_state = AccessState::LockRequested;
        if candidate {
            if let Some(op) = self.take_cursor(&ctx.ops)? {
                trace!("piggybacking {:?} lock on first operation", self.lock_type);
                self.issue_op(op, ctx, PktFlags::with_lock(self.lock_type))?;
            }
        } else {
            let pkt = Packet::Lock {
                win: ctx.win,
                source: ctx.rank,
                lock_type: self.lock_type,
            };
            send_packet(ctx.transport, self.rank, &pkt, None, None)?;
        }
        Ok(())
    }

    /// Puts one (already dequeued) operation on the wire, every stream unit of it.
    pub(crate) fn issue_op(
        &mut self,
        h: OpHandle,
        ctx: &mut IssueCtx,
        extra: PktFlags,
    ) -> RmaResult<()> {
        let last = self.pending.is_empty();
        let op = ctx
            .ops
            .get_mut(h)
            .ok_or(RmaError::internal("stale operation handle"))?;

        if op.kind.is_write_class() {
            // must happen before the packet is built so a piggybacked directive is a flush
            self.upgrade_flush_local();
            self.put_acc_issued = true;
        }

        let mut sync_flags = PktFlags::NONE;
        if last
            && matches!(
                self.access_state,
                AccessState::Locked | AccessState::LockRequested
            )
        {
            sync_flags = match self.sync.sync_flag {
                SyncFlag::Flush => PktFlags::FLUSH,
                SyncFlag::Unlock if self.lock_mode.nocheck => PktFlags::FLUSH,
                SyncFlag::Unlock => PktFlags::UNLOCK,
                SyncFlag::FlushLocal | SyncFlag::None => PktFlags::NONE,
            };
        }

        let elem_size = op.target.datatype.elem().size();
        let fetches = op.kind.fetches();
        let units = op.units();
        let num_units = units.len();
        for (i, (start, count)) in units.into_iter().enumerate() {
            let result = match &op.result {
                Some(res) if fetches => Some((res.buf.clone(), start * elem_size)),
                _ => None,
            };
            let token = ctx.requests.register(fetches, result)?;
            let payload = match op.kind {
                OpKind::Put | OpKind::Accumulate(_) | OpKind::GetAccumulate(_) => op
                    .origin
                    .as_ref()
                    .map(|o| &o.data[start * elem_size..(start + count) * elem_size]),
                OpKind::Get | OpKind::CompareAndSwap => None,
            };
            let mut flags = extra;
            if i + 1 == num_units {
                flags.insert(sync_flags);
            }
            let mut pkt = op.pkt.clone();
            if let Some(hdr) = pkt.op_header_mut() {
                hdr.flags = flags;
                hdr.stream_offset = start;
                hdr.count = count;
                hdr.data_len = payload.map(|p| p.len()).unwrap_or(0);
            }
            match &mut pkt {
                Packet::Get { token: t, .. }
                | Packet::GetAccumulate { token: t, .. }
                | Packet::CompareAndSwap { token: t, .. } => *t = token,
                _ => {}
            }
            trace!(
                "issuing {:?} unit {}/{} to {}",
                pkt.kind(),
                i + 1,
                num_units,
                self.rank
            );
            if let Err(err) = send_packet(ctx.transport, self.rank, &pkt, payload, Some(token)) {
                ctx.requests.free(token);
                return Err(err);
            }
            op.record_issue(token);
        }
        ctx.stats.ops_issued += 1;

        if !sync_flags.is_empty() {
            self.sync.outstanding_acks += 1;
            if self.sync.sync_flag == SyncFlag::Unlock {
                self.sync.unlock_sent = true;
            }
            self.sync.sync_flag = SyncFlag::None;
            self.put_acc_issued = false;
        }
        Ok(())
    }

    /// Sends (or retires) the pending sync directive once every operation went out.
    fn send_sync(&mut self, ctx: &mut IssueCtx) -> RmaResult<()> {
        if !self.pending.is_empty() {
            return Ok(());
        }
        if self.sync.sync_flag == SyncFlag::FlushLocal {
            if self.issued_empty() {
                self.sync.sync_flag = SyncFlag::None;
            }
            return Ok(());
        }
        match self.access_state {
            AccessState::Locked => {}
            AccessState::CollectiveEpoch => {
                if self.win_complete_flag && !self.complete_sent {
                    let pkt = Packet::Complete {
                        win: ctx.win,
                        source: ctx.rank,
                    };
                    send_packet(ctx.transport, self.rank, &pkt, None, None)?;
                    self.complete_sent = true;
                }
                return Ok(());
            }
            _ => return Ok(()),
        }
        match self.sync.sync_flag {
            SyncFlag::None | SyncFlag::FlushLocal => {}
            SyncFlag::Flush => {
                if self.put_acc_issued {
                    self.send_flush(ctx)?;
                }
                self.sync.sync_flag = SyncFlag::None;
            }
            SyncFlag::Unlock => {
                if self.lock_mode.nocheck {
                    if self.put_acc_issued {
                        self.send_flush(ctx)?;
                    }
                } else {
                    let ack = self.put_acc_issued;
                    let pkt = Packet::Unlock {
                        win: ctx.win,
                        source: ctx.rank,
                        ack,
                    };
                    send_packet(ctx.transport, self.rank, &pkt, None, None)?;
                    if ack {
                        self.sync.outstanding_acks += 1;
                    }
                }
                self.put_acc_issued = false;
                self.sync.unlock_sent = true;
                self.sync.sync_flag = SyncFlag::None;
            }
        }
        self.finish_unlock_if_acked();
        Ok(())
    }

    fn send_flush(&mut self, ctx: &mut IssueCtx) -> RmaResult<()> {
        let pkt = Packet::Flush {
            win: ctx.win,
            source: ctx.rank,
        };
        send_packet(ctx.transport, self.rank, &pkt, None, None)?;
        self.sync.outstanding_acks += 1;
        self.put_acc_issued = false;
        Ok(())
    }

    /// Moves the target to its terminal error state, releasing every queued record.
    pub(crate) fn fail(&mut self, ctx: &mut IssueCtx, err: RmaError) {
        tracing::error!("target {} failed: {}", self.rank, err);
        let mut all = OpList::default();
        all.splice(&mut self.pending);
        all.splice(&mut self.issued_read);
        all.splice(&mut self.issued_write);
        all.splice(&mut self.issued_dt);
        for h in all.iter() {
            if let Some(op) = ctx.ops.free(*h) {
                op.retire(ctx.requests, RequestStatus::Failed);
            }
        }
        self.next_op_to_issue = None;
        self.sync = Default::default();
        self.put_acc_issued = false;
        self.access_state = AccessState::Failed;
        self.error = Some(err);
    }
}
