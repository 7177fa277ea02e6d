//! The per rank RMA engine: public operation and synchronization calls on top of the target
//! state machines, plus the progress loop that feeds transport events back into them.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::datatype::{from_bytes, to_bytes, AccOp, Element};
use crate::env_var::{config, Config};
use crate::error::{RmaError, RmaResult};
use crate::op::{
    CompareSpec, OpArgs, OpHandle, OpKind, OpLimits, OpRecord, OriginSpec, ResultSpec, TargetSpec,
};
use crate::packet::Packet;
use crate::pool::{PoolKind, PoolPair};
use crate::request::{RequestTable, RmaRequest};
use crate::scheduler::ProgressExecutor;
use crate::target::{AccessState, IssueCtx, LockType, ModeFlags, SyncFlag, Target, TargetStatus};
use crate::transport::{Fabric, Transport};
use crate::window::{WinId, Window, WindowLayout, WindowRegistry};

mod handle;
mod handlers;
mod sync;

pub use handle::SyncHandle;
pub(crate) use sync::SyncKind;

/// Counters kept by an engine, for tests and tooling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub ops_issued: usize,
    pub ops_completed: usize,
    pub acks_received: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    pub(crate) op_win_pool_size: usize,
    pub(crate) op_global_pool_size: usize,
    pub(crate) target_win_pool_size: usize,
    pub(crate) target_global_pool_size: usize,
    pub(crate) stream_unit_size: usize,
    pub(crate) piggyback_lock_data_size: usize,
    pub(crate) delay_issuing: bool,
    pub(crate) slots_size: usize,
    pub(crate) deadlock_timeout: f64,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        EngineSettings {
            op_win_pool_size: config.op_win_pool_size,
            op_global_pool_size: config.op_global_pool_size,
            target_win_pool_size: config.target_win_pool_size,
            target_global_pool_size: config.target_global_pool_size,
            stream_unit_size: config.stream_unit_size,
            piggyback_lock_data_size: config.piggyback_lock_data_size,
            delay_issuing: config.delay_issuing_for_piggybacking,
            slots_size: config.slots_size,
            deadlock_timeout: config.deadlock_timeout,
        }
    }
}

/// Where the payload of a packet from one source goes while its chunks arrive.
pub(crate) enum RecvSink {
    Assemble {
        pkt: Packet,
        buf: Vec<u8>,
        lock_granted: bool,
    },
    /// appended to a lock queue entry
    Queued { win: WinId, id: u64 },
}

pub(crate) struct EngineInner {
    pub(crate) rank: usize,
    pub(crate) num_ranks: usize,
    pub(crate) transport: Fabric,
    pub(crate) registry: WindowRegistry,
    pub(crate) requests: RequestTable,
    pub(crate) settings: EngineSettings,
    pub(crate) recvs: HashMap<usize, RecvSink>,
    pub(crate) stats: EngineStats,
    pub(crate) shutdown: bool,
}

impl EngineInner {
    pub(crate) fn window_mut(&mut self, win: WinId) -> RmaResult<&mut Window> {
        self.registry.window_mut(win)
    }

    fn check_rank(&self, rank: usize) -> RmaResult<()> {
        if rank >= self.num_ranks {
            return Err(RmaError::InvalidArgument(format!(
                "rank {} outside of {} ranks",
                rank, self.num_ranks
            )));
        }
        Ok(())
    }

    /// Runs `f` on the target state of (`win`, `rank`) with an issue context.
    ///
    /// Returns `None` if the window tracks no target for `rank` and `create` is false.
    pub(crate) fn with_target<R>(
        &mut self,
        win: WinId,
        rank: usize,
        create: bool,
        f: impl FnOnce(&mut Target, &mut IssueCtx) -> RmaResult<R>,
    ) -> RmaResult<Option<R>> {
        let EngineInner {
            rank: me,
            transport,
            registry,
            requests,
            settings,
            stats,
            ..
        } = self;
        let (window, global) = registry.split_mut(win)?;
        let mut targets = PoolPair::new(&mut window.targets, &mut global.targets);
        let h = if create {
            Some(window.directory.find_or_create(rank, &mut targets)?)
        } else {
            window.directory.lookup(rank)
        };
        let Some(h) = h else {
            return Ok(None);
        };
        let target = targets
            .get_mut(h)
            .ok_or(RmaError::internal("stale target handle"))?;
        let mut ctx = IssueCtx {
            rank: *me,
            win,
            ops: PoolPair::new(&mut window.ops, &mut global.ops),
            requests,
            transport,
            delay_issuing: settings.delay_issuing,
            stats,
        };
        f(target, &mut ctx).map(Some)
    }

    /// Read only access to a target's state.
    pub(crate) fn target<R>(
        &self,
        win: WinId,
        rank: usize,
        f: impl FnOnce(&Target) -> R,
    ) -> RmaResult<Option<R>> {
        let window = self.registry.window(win)?;
        let Some(h) = window.directory.lookup(rank) else {
            return Ok(None);
        };
        let target = match h.pool() {
            PoolKind::Window => window.targets.get(h),
            PoolKind::Global => self.registry.global().and_then(|g| g.targets.get(h)),
        };
        target
            .map(|t| Some(f(t)))
            .ok_or(RmaError::internal("stale target handle"))
    }

    /// Drops the target of `rank` if it is idle with nothing left in flight.
    pub(crate) fn reclaim(&mut self, win: WinId, rank: usize) -> RmaResult<bool> {
        let (window, global) = self.registry.split_mut(win)?;
        let mut targets = PoolPair::new(&mut window.targets, &mut global.targets);
        let reclaimed = window.directory.remove_if_reclaimable(rank, &mut targets);
        if reclaimed {
            debug!("reclaimed target {} of window {}", rank, win);
        }
        Ok(reclaimed)
    }

    fn try_alloc_op(&mut self, win: WinId, rec: OpRecord) -> RmaResult<Result<OpHandle, OpRecord>> {
        let (window, global) = self.registry.split_mut(win)?;
        Ok(PoolPair::new(&mut window.ops, &mut global.ops).alloc(rec))
    }

    /// Window pool, then global pool, then one round of progress to retire completed records.
    fn alloc_op(&mut self, win: WinId, rec: OpRecord) -> RmaResult<OpHandle> {
        let rec = match self.try_alloc_op(win, rec)? {
            Ok(h) => return Ok(h),
            Err(rec) => rec,
        };
        debug!("operation pools of window {} exhausted, progressing before retry", win);
        self.progress()?;
        match self.try_alloc_op(win, rec)? {
            Ok(h) => Ok(h),
            Err(_) => Err(RmaError::OutOfResources("operation")),
        }
    }

    fn enqueue_op(
        &mut self,
        win: WinId,
        rank: usize,
        args: OpArgs,
        ureq: Option<RmaRequest>,
    ) -> RmaResult<()> {
        self.check_rank(rank)?;
        args.validate(self.registry.window(win)?.size())?;
        let state = self.target(win, rank, |t| {
            let closing = t.sync.unlock_sent || t.sync.sync_flag == SyncFlag::Unlock;
            (t.access_state, t.lock_type, closing, t.error.clone())
        })?;
        let required_lock = match state {
            Some((AccessState::Failed, _, _, Some(err))) => return Err(err),
            Some((AccessState::Idle, ..)) | Some((AccessState::Failed, ..)) | None => {
                return Err(RmaError::invalid_state(
                    rank,
                    "operation outside of an access epoch",
                ))
            }
            Some((_, _, true, _)) => {
                return Err(RmaError::invalid_state(
                    rank,
                    "operation after the epoch was unlocked",
                ))
            }
            Some((AccessState::CollectiveEpoch, ..)) => LockType::None,
            Some((_, lock_type, ..)) => lock_type,
        };
        let limits = OpLimits {
            stream_unit_size: self.settings.stream_unit_size,
            piggyback_lock_data_size: self.settings.piggyback_lock_data_size,
        };
        let rec = OpRecord::new(args, win, self.rank, required_lock, limits, ureq);
        let h = self.alloc_op(win, rec)?;
        self.with_target(win, rank, false, |target, ctx| {
            target.enqueue(h);
            target.make_progress(ctx)
        })?
        .ok_or(RmaError::internal("target vanished during enqueue"))
    }

    fn begin_access(
        &mut self,
        win: WinId,
        rank: usize,
        lock_type: LockType,
        mode: ModeFlags,
    ) -> RmaResult<()> {
        self.check_rank(rank)?;
        if lock_type == LockType::None {
            return Err(RmaError::InvalidArgument(
                "a passive epoch needs a shared or exclusive lock".to_owned(),
            ));
        }
        if self.registry.window(win)?.epoch.is_some() {
            return Err(RmaError::invalid_state(
                rank,
                "lock requested inside a collective epoch",
            ));
        }
        self.with_target(win, rank, true, |target, _| {
            target.begin_access(lock_type, mode)
        })?;
        debug!("{:?} epoch opened on {} for window {}", lock_type, rank, win);
        Ok(())
    }

    fn start_epoch(&mut self, win: WinId, ranks: &[usize]) -> RmaResult<()> {
        for rank in ranks {
            self.check_rank(*rank)?;
        }
        if self.registry.window(win)?.epoch.is_some() {
            return Err(RmaError::internal("collective epoch already open"));
        }
        for (i, rank) in ranks.iter().enumerate() {
            let res = self.with_target(win, *rank, true, |target, _| target.start_collective());
            if let Err(err) = res {
                for started in &ranks[..i] {
                    self.with_target(win, *started, false, |target, _| {
                        target.end_collective();
                        Ok(())
                    })?;
                }
                return Err(err);
            }
        }
        self.window_mut(win)?.epoch = Some(ranks.to_vec());
        debug!("collective epoch on window {} with {:?}", win, ranks);
        Ok(())
    }

    /// Handles every transport event available, then sweeps every target of every window.
    #[tracing::instrument(skip_all, level = "trace")]
    pub(crate) fn progress(&mut self) -> RmaResult<()> {
        while let Some(event) = self.transport.poll() {
            self.handle_event(event)?;
        }
        for win in self.registry.window_ids() {
            let ranks: Vec<usize> = self
                .registry
                .window(win)?
                .directory
                .entries()
                .into_iter()
                .map(|(rank, _)| rank)
                .collect();
            for rank in ranks {
                self.with_target(win, rank, false, |target, ctx| target.make_progress(ctx))?;
                self.reclaim(win, rank)?;
            }
        }
        Ok(())
    }

    /// Handles at most `n` transport events without sweeping the targets.
    #[cfg(test)]
    pub(crate) fn progress_events(&mut self, n: usize) -> RmaResult<usize> {
        let mut handled = 0;
        while handled < n {
            match self.transport.poll() {
                Some(event) => self.handle_event(event)?,
                None => break,
            }
            handled += 1;
        }
        Ok(handled)
    }
}

/// Configures and builds an [Engine], starting from the `RMA_*` environment configuration.
pub struct EngineBuilder {
    transport: Fabric,
    registry: Option<WindowRegistry>,
    executor: Option<ProgressExecutor>,
    settings: EngineSettings,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: WindowRegistry) -> EngineBuilder {
        self.registry = Some(registry);
        self
    }

    /// Executor used by [SyncHandle::block] and [SyncHandle::spawn].
    pub fn executor(mut self, executor: ProgressExecutor) -> EngineBuilder {
        self.executor = Some(executor);
        self
    }

    pub fn op_pool_sizes(mut self, window: usize, global: usize) -> EngineBuilder {
        self.settings.op_win_pool_size = window;
        self.settings.op_global_pool_size = global;
        self
    }

    pub fn target_pool_sizes(mut self, window: usize, global: usize) -> EngineBuilder {
        self.settings.target_win_pool_size = window;
        self.settings.target_global_pool_size = global;
        self
    }

    pub fn stream_unit_size(mut self, bytes: usize) -> EngineBuilder {
        self.settings.stream_unit_size = bytes.max(1);
        self
    }

    /// 0 disables piggybacked lock requests
    pub fn piggyback_lock_data_size(mut self, bytes: usize) -> EngineBuilder {
        self.settings.piggyback_lock_data_size = bytes;
        self
    }

    pub fn delay_issuing(mut self, delay: bool) -> EngineBuilder {
        self.settings.delay_issuing = delay;
        self
    }

    pub fn slots_size(mut self, slots: usize) -> EngineBuilder {
        self.settings.slots_size = slots;
        self
    }

    pub fn deadlock_timeout(mut self, seconds: f64) -> EngineBuilder {
        self.settings.deadlock_timeout = seconds;
        self
    }

    pub fn build(self) -> Engine {
        let rank = self.transport.rank();
        let num_ranks = self.transport.num_ranks();
        debug!("engine for rank {} of {} built with {:?}", rank, num_ranks, self.settings);
        Engine {
            inner: Rc::new(RefCell::new(EngineInner {
                rank,
                num_ranks,
                transport: self.transport,
                registry: self.registry.unwrap_or_default(),
                requests: RequestTable::new(),
                settings: self.settings,
                recvs: HashMap::new(),
                stats: EngineStats::default(),
                shutdown: false,
            })),
            executor: self.executor.unwrap_or_default(),
        }
    }
}

/// One rank's RMA engine.
///
/// Operation calls return as soon as the operation is queued (and, when the target state
/// allows, issued). Synchronization calls return a [SyncHandle] that completes once the
/// synchronization is satisfied. All state lives on the thread that drives the engine.
///
/// # Examples
/// ```no_run
/// use rma_core::{Engine, LockType, LoopbackFabric, ModeFlags, OriginSpec, TargetSpec};
///
/// let fabric = LoopbackFabric::new(2);
/// let engine = Engine::builder(fabric.endpoint(0)).build();
/// let win = engine.create_window(64).unwrap();
/// engine.begin_access(win, 1, LockType::Exclusive, ModeFlags::NONE).unwrap();
/// engine
///     .enqueue_put(win, 1, OriginSpec::from_slice(&[1u64, 2]), TargetSpec::new::<u64>(0, 2))
///     .unwrap();
/// // rank 1 has to drive its own engine for the unlock to complete
/// engine.unlock(win, 1).block().unwrap();
/// ```
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Rc<RefCell<EngineInner>>,
    executor: ProgressExecutor,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        write!(
            f,
            "Engine {{ rank: {}, num_ranks: {}, windows: {} }}",
            inner.rank,
            inner.num_ranks,
            inner.registry.len()
        )
    }
}

impl Engine {
    pub fn builder(transport: impl Into<Fabric>) -> EngineBuilder {
        EngineBuilder {
            transport: transport.into(),
            registry: None,
            executor: None,
            settings: EngineSettings::from(config()),
        }
    }

    pub fn rank(&self) -> usize {
        self.inner.borrow().rank
    }

    pub fn num_ranks(&self) -> usize {
        self.inner.borrow().num_ranks
    }

    pub fn executor(&self) -> &ProgressExecutor {
        &self.executor
    }

    /// Exposes `size` zeroed bytes. Every rank creates its windows in the same order.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn create_window(&self, size: usize) -> RmaResult<WinId> {
        let mut inner = self.inner.borrow_mut();
        let settings = inner.settings.clone();
        let window = Window::new(WindowLayout {
            size,
            num_ranks: inner.num_ranks,
            op_pool_size: settings.op_win_pool_size,
            target_pool_size: settings.target_win_pool_size,
            slots_size: settings.slots_size,
        });
        let win = inner.registry.register(
            window,
            settings.op_global_pool_size,
            settings.target_global_pool_size,
        );
        debug!("window {} created with {} bytes", win, size);
        Ok(win)
    }

    fn enqueue(&self, win: WinId, rank: usize, args: OpArgs, ureq: Option<RmaRequest>) -> RmaResult<()> {
        self.inner.borrow_mut().enqueue_op(win, rank, args, ureq)
    }

    fn enqueue_request(&self, win: WinId, rank: usize, args: OpArgs) -> RmaResult<RmaRequest> {
        let req = RmaRequest::new(rank);
        self.enqueue(win, rank, args, Some(req.clone()))?;
        Ok(req)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub fn enqueue_put(
        &self,
        win: WinId,
        rank: usize,
        origin: OriginSpec,
        target: TargetSpec,
    ) -> RmaResult<()> {
        self.enqueue(win, rank, put_args(origin, target), None)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub fn enqueue_get(
        &self,
        win: WinId,
        rank: usize,
        result: ResultSpec,
        target: TargetSpec,
    ) -> RmaResult<()> {
        self.enqueue(win, rank, get_args(result, target), None)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub fn enqueue_accumulate(
        &self,
        win: WinId,
        rank: usize,
        origin: OriginSpec,
        target: TargetSpec,
        op: AccOp,
    ) -> RmaResult<()> {
        self.enqueue(win, rank, acc_args(origin, target, op), None)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub fn enqueue_get_accumulate(
        &self,
        win: WinId,
        rank: usize,
        origin: OriginSpec,
        result: ResultSpec,
        target: TargetSpec,
        op: AccOp,
    ) -> RmaResult<()> {
        self.enqueue(win, rank, get_acc_args(origin, result, target, op), None)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub fn enqueue_compare_and_swap(
        &self,
        win: WinId,
        rank: usize,
        origin: OriginSpec,
        compare: CompareSpec,
        result: ResultSpec,
        target: TargetSpec,
    ) -> RmaResult<()> {
        let args = OpArgs {
            kind: OpKind::CompareAndSwap,
            origin: Some(origin),
            compare: Some(compare),
            result: Some(result),
            target,
        };
        self.enqueue(win, rank, args, None)
    }

    pub fn rput(
        &self,
        win: WinId,
        rank: usize,
        origin: OriginSpec,
        target: TargetSpec,
    ) -> RmaResult<RmaRequest> {
        self.enqueue_request(win, rank, put_args(origin, target))
    }

    pub fn rget(
        &self,
        win: WinId,
        rank: usize,
        result: ResultSpec,
        target: TargetSpec,
    ) -> RmaResult<RmaRequest> {
        self.enqueue_request(win, rank, get_args(result, target))
    }

    pub fn raccumulate(
        &self,
        win: WinId,
        rank: usize,
        origin: OriginSpec,
        target: TargetSpec,
        op: AccOp,
    ) -> RmaResult<RmaRequest> {
        self.enqueue_request(win, rank, acc_args(origin, target, op))
    }

    pub fn rget_accumulate(
        &self,
        win: WinId,
        rank: usize,
        origin: OriginSpec,
        result: ResultSpec,
        target: TargetSpec,
        op: AccOp,
    ) -> RmaResult<RmaRequest> {
        self.enqueue_request(win, rank, get_acc_args(origin, result, target, op))
    }

    /// Opens a passive epoch on `rank`. The lock request itself goes out lazily.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn begin_access(
        &self,
        win: WinId,
        rank: usize,
        lock_type: LockType,
        mode: ModeFlags,
    ) -> RmaResult<()> {
        self.inner
            .borrow_mut()
            .begin_access(win, rank, lock_type, mode)
    }

    /// Opens a collective access epoch on `ranks`, closed by [Engine::complete_epoch].
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn start_epoch(&self, win: WinId, ranks: &[usize]) -> RmaResult<()> {
        self.inner.borrow_mut().start_epoch(win, ranks)
    }

    fn sync(&self, mut kind: SyncKind) -> SyncHandle {
        let (early, timeout) = {
            let mut inner = self.inner.borrow_mut();
            (inner.request_sync(&mut kind).err(), inner.settings.deadlock_timeout)
        };
        SyncHandle::new(self.clone(), kind, early, timeout)
    }

    pub fn flush(&self, win: WinId, rank: usize) -> SyncHandle {
        self.sync(SyncKind::Flush {
            win,
            rank,
            local: false,
        })
    }

    pub fn flush_local(&self, win: WinId, rank: usize) -> SyncHandle {
        self.sync(SyncKind::Flush {
            win,
            rank,
            local: true,
        })
    }

    pub fn unlock(&self, win: WinId, rank: usize) -> SyncHandle {
        self.sync(SyncKind::Unlock { win, rank })
    }

    /// Flushes every target of `win` with an open passive epoch.
    pub fn flush_all(&self, win: WinId) -> SyncHandle {
        self.sync(SyncKind::FlushAll {
            win,
            local: false,
            ranks: vec![],
        })
    }

    pub fn flush_local_all(&self, win: WinId) -> SyncHandle {
        self.sync(SyncKind::FlushAll {
            win,
            local: true,
            ranks: vec![],
        })
    }

    /// Closes the collective epoch: notifies every target once its operations went out.
    pub fn complete_epoch(&self, win: WinId) -> SyncHandle {
        self.sync(SyncKind::Complete { win })
    }

    /// Exposure side of a collective epoch: waits for `origins` `Complete` notifications.
    pub fn wait_epoch(&self, win: WinId, origins: usize) -> SyncHandle {
        self.sync(SyncKind::WaitEpoch { win, origins })
    }

    pub fn wait_request(&self, req: &RmaRequest) -> SyncHandle {
        self.sync(SyncKind::Request(req.clone()))
    }

    /// Waits for in-flight synchronization to drain, then releases the window and its records.
    pub fn free_window(&self, win: WinId) -> SyncHandle {
        self.sync(SyncKind::FreeWindow { win })
    }

    /// Handles pending transport events and issues whatever the target states allow.
    pub fn progress(&self) -> RmaResult<()> {
        self.inner.borrow_mut().progress()
    }

    /// Drives progress until [Engine::shutdown] is called, for a rank with nothing else to wait on.
    pub async fn serve(self) -> RmaResult<()> {
        loop {
            if self.inner.borrow().shutdown {
                debug!("rank {} stopped serving", self.rank());
                return Ok(());
            }
            if let Err(err) = self.progress() {
                tracing::error!("progress loop of rank {} stopped: {}", self.rank(), err);
                return Err(err);
            }
            async_std::task::yield_now().await;
        }
    }

    pub fn shutdown(&self) {
        self.inner.borrow_mut().shutdown = true;
    }

    pub fn target_status(&self, win: WinId, rank: usize) -> RmaResult<Option<TargetStatus>> {
        self.inner.borrow().target(win, rank, |t| t.status())
    }

    pub fn lock_queue_len(&self, win: WinId) -> RmaResult<usize> {
        Ok(self.inner.borrow().registry.window(win)?.lock_queue.len())
    }

    /// The lock other ranks currently hold on this rank's part of `win`.
    pub fn granted_lock(&self, win: WinId) -> RmaResult<LockType> {
        Ok(self.inner.borrow().registry.window(win)?.lock.current())
    }

    /// `count` elements of local window memory starting at byte `disp`.
    pub fn read_window<T: Element>(&self, win: WinId, disp: usize, count: usize) -> RmaResult<Vec<T>> {
        let inner = self.inner.borrow();
        let bytes = inner
            .registry
            .window(win)?
            .read_bytes(disp, count * T::ELEM.size())?;
        Ok(from_bytes(&bytes))
    }

    pub fn write_window<T: Element>(&self, win: WinId, disp: usize, vals: &[T]) -> RmaResult<()> {
        self.inner
            .borrow_mut()
            .window_mut(win)?
            .write_bytes(disp, &to_bytes(vals))
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.borrow().stats
    }

    pub fn num_windows(&self) -> usize {
        self.inner.borrow().registry.len()
    }
}

fn put_args(origin: OriginSpec, target: TargetSpec) -> OpArgs {
    OpArgs {
        kind: OpKind::Put,
        origin: Some(origin),
        compare: None,
        result: None,
        target,
    }
}

fn get_args(result: ResultSpec, target: TargetSpec) -> OpArgs {
    OpArgs {
        kind: OpKind::Get,
        origin: None,
        compare: None,
        result: Some(result),
        target,
    }
}

fn acc_args(origin: OriginSpec, target: TargetSpec, op: AccOp) -> OpArgs {
    OpArgs {
        kind: OpKind::Accumulate(op),
        origin: Some(origin),
        compare: None,
        result: None,
        target,
    }
}

fn get_acc_args(origin: OriginSpec, result: ResultSpec, target: TargetSpec, op: AccOp) -> OpArgs {
    OpArgs {
        kind: OpKind::GetAccumulate(op),
        origin: Some(origin),
        compare: None,
        result: Some(result),
        target,
    }
}
