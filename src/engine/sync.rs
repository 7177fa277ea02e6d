use tracing::debug;

use super::{Engine, EngineInner, RecvSink};
use crate::error::{RmaError, RmaResult};
use crate::pool::PoolPair;
use crate::request::{RequestStatus, RmaRequest};
use crate::target::sync::SyncWait;
use crate::target::{AccessState, SyncFlag};
use crate::window::WinId;

/// A synchronization call a [SyncHandle](super::SyncHandle) waits on.
pub(crate) enum SyncKind {
    Flush { win: WinId, rank: usize, local: bool },
    Unlock { win: WinId, rank: usize },
    /// `ranks` is filled in with the passive targets when the flush is requested
    FlushAll {
        win: WinId,
        local: bool,
        ranks: Vec<usize>,
    },
    Complete { win: WinId },
    WaitEpoch { win: WinId, origins: usize },
    Request(RmaRequest),
    FreeWindow { win: WinId },
}

impl SyncKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            SyncKind::Flush { local: false, .. } => "a flush handle",
            SyncKind::Flush { local: true, .. } => "a flush_local handle",
            SyncKind::Unlock { .. } => "an unlock handle",
            SyncKind::FlushAll { local: false, .. } => "a flush_all handle",
            SyncKind::FlushAll { local: true, .. } => "a flush_local_all handle",
            SyncKind::Complete { .. } => "a complete_epoch handle",
            SyncKind::WaitEpoch { .. } => "a wait_epoch handle",
            SyncKind::Request(_) => "a wait_request handle",
            SyncKind::FreeWindow { .. } => "a free_window handle",
        }
    }
}

fn flush_flag(local: bool) -> SyncFlag {
    if local {
        SyncFlag::FlushLocal
    } else {
        SyncFlag::Flush
    }
}

fn is_passive(state: AccessState) -> bool {
    matches!(
        state,
        AccessState::LockCalled | AccessState::LockRequested | AccessState::Locked
    )
}

impl Engine {
    /// One round of progress, then the completion predicate of `kind`.
    pub(crate) fn poll_sync(&self, kind: &SyncKind) -> RmaResult<bool> {
        let mut inner = self.inner.borrow_mut();
        inner.progress()?;
        inner.poll_sync(kind)
    }
}

impl EngineInner {
    /// Records the synchronization directive and sends whatever can go right away.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn request_sync(&mut self, kind: &mut SyncKind) -> RmaResult<()> {
        match kind {
            SyncKind::Flush { win, rank, local } => {
                self.request_target_sync(*win, *rank, flush_flag(*local))
            }
            SyncKind::Unlock { win, rank } => {
                self.request_target_sync(*win, *rank, SyncFlag::Unlock)
            }
            SyncKind::FlushAll { win, local, ranks } => {
                let mut passive = vec![];
                for (rank, _) in self.registry.window(*win)?.directory.entries() {
                    if let Some(true) = self.target(*win, rank, |t| is_passive(t.access_state))? {
                        passive.push(rank);
                    }
                }
                for rank in &passive {
                    self.request_target_sync(*win, *rank, flush_flag(*local))?;
                }
                *ranks = passive;
                Ok(())
            }
            SyncKind::Complete { win } => {
                let ranks = self
                    .registry
                    .window(*win)?
                    .epoch
                    .clone()
                    .ok_or(RmaError::internal("complete called without a collective epoch"))?;
                for rank in ranks {
                    self.with_target(*win, rank, false, |target, ctx| {
                        target.request_complete()?;
                        target.make_progress(ctx)
                    })?
                    .ok_or(RmaError::internal("collective epoch target missing"))?;
                }
                Ok(())
            }
            SyncKind::WaitEpoch { win, .. } => self.registry.window(*win).map(|_| ()),
            SyncKind::Request(_) => Ok(()),
            SyncKind::FreeWindow { win } => self.check_free_window(*win),
        }
    }

    fn request_target_sync(&mut self, win: WinId, rank: usize, flag: SyncFlag) -> RmaResult<()> {
        self.check_rank(rank)?;
        self.with_target(win, rank, false, |target, ctx| {
            target.request_sync(flag, &ctx.ops)?;
            target.make_progress(ctx)
        })?
        .ok_or(RmaError::invalid_state(
            rank,
            "passive target synchronization without a matching lock",
        ))
    }

    fn target_satisfied(&self, win: WinId, rank: usize, wait: SyncWait) -> RmaResult<bool> {
        // a target that is gone has nothing left in flight
        Ok(self
            .target(win, rank, |t| t.sync_satisfied(wait))?
            .transpose()?
            .unwrap_or(true))
    }

    /// Whether the synchronization `kind` is satisfied, finishing it if so.
    pub(crate) fn poll_sync(&mut self, kind: &SyncKind) -> RmaResult<bool> {
        match kind {
            SyncKind::Flush { win, rank, .. } => {
                self.target_satisfied(*win, *rank, SyncWait::Drained)
            }
            SyncKind::Unlock { win, rank } => {
                if !self.target_satisfied(*win, *rank, SyncWait::Unlocked)? {
                    return Ok(false);
                }
                self.reclaim(*win, *rank)?;
                Ok(true)
            }
            SyncKind::FlushAll { win, ranks, .. } => {
                for rank in ranks {
                    if !self.target_satisfied(*win, *rank, SyncWait::Drained)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            SyncKind::Complete { win } => {
                let Some(ranks) = self.registry.window(*win)?.epoch.clone() else {
                    return Ok(true);
                };
                for rank in &ranks {
                    if !self.target_satisfied(*win, *rank, SyncWait::Completed)? {
                        return Ok(false);
                    }
                }
                self.finish_epoch(*win, &ranks)?;
                Ok(true)
            }
            SyncKind::WaitEpoch { win, origins } => {
                let window = self.window_mut(*win)?;
                if window.epoch_completions < *origins {
                    return Ok(false);
                }
                window.epoch_completions -= origins;
                Ok(true)
            }
            SyncKind::Request(req) => match req.status() {
                RequestStatus::Complete => Ok(true),
                RequestStatus::Pending => Ok(false),
                RequestStatus::Failed => Err(RmaError::TargetFailed {
                    rank: req.rank(),
                    reason: "the operation failed in the transport".to_owned(),
                }),
            },
            SyncKind::FreeWindow { win } => {
                if !self.window_drained(*win)? {
                    return Ok(false);
                }
                self.finish_free_window(*win)?;
                Ok(true)
            }
        }
    }

    fn finish_epoch(&mut self, win: WinId, ranks: &[usize]) -> RmaResult<()> {
        for rank in ranks {
            self.with_target(win, *rank, false, |target, _| {
                target.end_collective();
                Ok(())
            })?;
            self.reclaim(win, *rank)?;
        }
        self.window_mut(win)?.epoch = None;
        debug!("collective epoch on window {} closed", win);
        Ok(())
    }

    /// Teardown with an open epoch, or with operations nobody will ever synchronize, is refused.
    fn check_free_window(&self, win: WinId) -> RmaResult<()> {
        let window = self.registry.window(win)?;
        if window.epoch.is_some() {
            return Err(RmaError::internal("window freed inside a collective epoch"));
        }
        for (rank, _) in window.directory.entries() {
            self.target(win, rank, |t| {
                let unlocking = t.sync.unlock_sent || t.sync.sync_flag == SyncFlag::Unlock;
                if is_passive(t.access_state) && !unlocking {
                    return Err(RmaError::invalid_state(
                        rank,
                        "window freed with a passive epoch still open",
                    ));
                }
                if !t.pending.is_empty()
                    && t.sync.sync_flag == SyncFlag::None
                    && t.sync.outstanding_acks == 0
                {
                    return Err(RmaError::invalid_state(
                        rank,
                        "window freed with queued operations and no synchronization in flight",
                    ));
                }
                Ok(())
            })?
            .transpose()?;
        }
        Ok(())
    }

    /// Nothing in flight from this window and nobody holding or waiting for its lock.
    fn window_drained(&self, win: WinId) -> RmaResult<bool> {
        let window = self.registry.window(win)?;
        if window.lock.holders() > 0 || !window.lock_queue.is_empty() {
            return Ok(false);
        }
        for (rank, _) in window.directory.entries() {
            let done = self
                .target(win, rank, |t| {
                    t.is_reclaimable()
                        && matches!(t.access_state, AccessState::Idle | AccessState::Failed)
                })?
                .unwrap_or(true);
            if !done {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn finish_free_window(&mut self, win: WinId) -> RmaResult<()> {
        let (window, global) = self.registry.split_mut(win)?;
        let mut targets = PoolPair::new(&mut window.targets, &mut global.targets);
        for (_, h) in window.directory.drain() {
            targets.free(h);
        }
        self.registry.deregister(win);
        self.recvs
            .retain(|_, sink| !matches!(sink, RecvSink::Queued { win: w, .. } if *w == win));
        debug!("window {} freed", win);
        Ok(())
    }
}
