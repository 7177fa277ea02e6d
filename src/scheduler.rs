use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_task::{Runnable, Task};
use crossbeam::queue::SegQueue;
use futures::task::noop_waker_ref;
use futures::Future;

/// Single threaded cooperative executor driving engines and the calls waiting on them.
///
/// Every task spawned here, and every future passed to [ProgressExecutor::block_on], runs on
/// the calling thread. Engines sharing one executor make progress together, so ranks of an
/// in-process fabric can all live on one thread. The executor is neither `Send` nor `Sync`:
///
/// ```compile_fail
/// fn on_another_thread<T: Send>(_: T) {}
/// on_another_thread(rma_core::ProgressExecutor::new());
/// ```
#[derive(Clone, Default)]
pub struct ProgressExecutor {
    // wakers may reschedule from any thread, runnables only ever run on the owning one
    queue: Arc<SegQueue<Runnable>>,
    _local: PhantomData<Rc<()>>,
}

impl std::fmt::Debug for ProgressExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProgressExecutor {{ queued: {} }}", self.queue.len())
    }
}

impl ProgressExecutor {
    pub fn new() -> ProgressExecutor {
        ProgressExecutor::default()
    }

    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let queue = self.queue.clone();
        let schedule = move |runnable| queue.push(runnable);
        let (runnable, task) = async_task::spawn_local(future, schedule);
        runnable.schedule();
        task
    }

    /// Runs every task that is queued right now once, returns how many ran.
    pub fn tick(&self) -> usize {
        let queued = self.queue.len();
        let mut ran = 0;
        for _ in 0..queued {
            match self.queue.pop() {
                Some(runnable) => {
                    runnable.run();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    pub fn run_ticks(&self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Polls `future` to completion, running the other tasks whenever it is pending.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        futures::pin_mut!(future);
        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
            if self.tick() == 0 {
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn block_on_runs_spawned_tasks() {
        let exec = ProgressExecutor::new();
        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        exec.spawn(async move {
            for _ in 0..3 {
                c.set(c.get() + 1);
                async_std::task::yield_now().await;
            }
        })
        .detach();
        let c = counter.clone();
        let seen = exec.block_on(async move {
            while c.get() < 3 {
                async_std::task::yield_now().await;
            }
            c.get()
        });
        assert_eq!(seen, 3);
    }

    #[test]
    fn tick_runs_each_task_once() {
        let exec = ProgressExecutor::new();
        let polls = Rc::new(Cell::new(0));
        let p = polls.clone();
        let task = exec.spawn(async move {
            loop {
                p.set(p.get() + 1);
                async_std::task::yield_now().await;
            }
        });
        assert_eq!(exec.tick(), 1);
        assert_eq!(exec.tick(), 1);
        assert_eq!(polls.get(), 2);
        drop(task);
    }
}
