use std::sync::atomic::{AtomicBool, Ordering};

use crate::config;

static ENABLED: AtomicBool = AtomicBool::new(true);

pub(crate) enum RuntimeWarning<'a> {
    DroppedHandle(&'a str),
    SyncTimeout(&'a str, f64, f64),
}

impl<'a> RuntimeWarning<'a> {
    pub(crate) fn enable_warnings() {
        ENABLED.store(true, Ordering::Relaxed);
    }
    pub(crate) fn disable_warnings() {
        ENABLED.store(false, Ordering::Relaxed);
    }
    fn print_warning(&self) -> bool {
        if ENABLED.load(Ordering::Relaxed) {
            match self {
                RuntimeWarning::DroppedHandle(_) => {
                    config().dropped_handle_warning.unwrap_or(true)
                }
                RuntimeWarning::SyncTimeout(_, elapsed, timeout) => {
                    config().sync_timeout_warning.unwrap_or(true)
                        && *timeout > 0.0
                        && elapsed > timeout
                }
            }
        } else {
            false
        }
    }

    #[cfg(feature = "runtime-warnings-panic")]
    fn panic(&self, msg: &str) {
        match self {
            RuntimeWarning::SyncTimeout(..) => {}
            _ => panic!(
                "{msg}
                Note this warning causes a panic because rma-core was compiled with the `runtime-warnings-panic` feature."
            ),
        }
    }

    pub(crate) fn print(self) {
        #[cfg(not(feature = "disable-runtime-warnings"))]
        if self.print_warning() {
            let msg = match &self {
                RuntimeWarning::DroppedHandle(what) => {
                    format!("[RMA WARNING] You are dropping {what} before it completed.
                    The synchronization it requested will still be carried out by later progress, but nothing waits for it.
                    Set RMA_DROPPED_HANDLE_WARNING=false to disable this warning.")
                }
                RuntimeWarning::SyncTimeout(what, elapsed, timeout) => {
                    format!("[RMA WARNING] {what} has been waiting for {elapsed:.1} seconds. Potential deadlock detected.
                    Make sure every target rank keeps driving progress (serve() or its own synchronization calls).
                    The timeout can be set via RMA_DEADLOCK_TIMEOUT, the current timeout is {timeout} seconds, setting this to 0 will disable this warning.")
                }
            };

            #[cfg(feature = "runtime-warnings-panic")]
            self.panic(&msg);
            tracing::warn!("{msg}");
        }
    }
}
