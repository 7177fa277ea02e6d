use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use async_task::Task;
use futures::Future;
use pin_project::{pin_project, pinned_drop};

use super::{Engine, SyncKind};
use crate::error::{RmaError, RmaResult};
use crate::warnings::RuntimeWarning;

#[must_use = " synchronization handles do nothing unless polled or awaited, or 'spawn()' or 'block()' are called"]
#[pin_project(PinnedDrop)]
/// A pending flush, unlock, epoch or teardown call.
///
/// The synchronization directive is recorded (and sent, where the target state allows) when the
/// handle is created. Awaiting, blocking on or spawning the handle drives the engine's progress
/// until the call is satisfied. Errors found when the call was made are reported on first poll.
///
/// # Examples
/// ```no_run
/// use rma_core::{Engine, LockType, LoopbackFabric, ModeFlags};
///
/// let fabric = LoopbackFabric::new(2);
/// let engine = Engine::builder(fabric.endpoint(0)).build();
/// let win = engine.create_window(8).unwrap();
/// engine.begin_access(win, 1, LockType::Shared, ModeFlags::NONE).unwrap();
/// let task = engine.flush(win, 1).spawn();
/// engine.executor().block_on(task).unwrap();
/// ```
pub struct SyncHandle {
    engine: Engine,
    kind: SyncKind,
    early: Option<RmaError>,
    launched: bool,
    done: bool,
    started: Option<Instant>,
    timeout: f64,
    warned: bool,
}

#[pinned_drop]
impl PinnedDrop for SyncHandle {
    fn drop(self: Pin<&mut Self>) {
        if !self.launched {
            RuntimeWarning::DroppedHandle(self.kind.name()).print();
        }
    }
}

impl SyncHandle {
    pub(crate) fn new(
        engine: Engine,
        kind: SyncKind,
        early: Option<RmaError>,
        timeout: f64,
    ) -> SyncHandle {
        SyncHandle {
            engine,
            kind,
            early,
            launched: false,
            done: false,
            started: None,
            timeout,
            warned: false,
        }
    }

    /// Drives the engine's executor until the synchronization is satisfied.
    pub fn block(mut self) -> RmaResult<()> {
        self.launched = true;
        let executor = self.engine.executor().clone();
        executor.block_on(self)
    }

    /// Runs the synchronization as a task on the engine's executor.
    #[must_use = "this function returns a future used to poll for completion. Call '.await' on the returned future in an async context or block on it with the engine's executor"]
    pub fn spawn(mut self) -> Task<RmaResult<()>> {
        self.launched = true;
        let executor = self.engine.executor().clone();
        executor.spawn(self)
    }
}

impl Future for SyncHandle {
    type Output = RmaResult<()>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        *this.launched = true;
        if *this.done {
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = this.early.take() {
            *this.done = true;
            return Poll::Ready(Err(err));
        }
        match this.engine.poll_sync(this.kind) {
            Ok(false) => {
                let elapsed = this.started.get_or_insert_with(Instant::now).elapsed();
                if !*this.warned && *this.timeout > 0.0 && elapsed.as_secs_f64() > *this.timeout {
                    RuntimeWarning::SyncTimeout(this.kind.name(), elapsed.as_secs_f64(), *this.timeout)
                        .print();
                    *this.warned = true;
                }
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            res => {
                *this.done = true;
                Poll::Ready(res.map(|_| ()))
            }
        }
    }
}
