use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// Shared stop flag, checked between samples and while waiting out a retry.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Installs the process-wide Ctrl-C handler. The first press requests a
    /// graceful stop; a second press exits with status 130.
    pub fn install() -> Self {
        let token = Self::default();
        let handler_token = token.clone();

        if let Err(err) = ctrlc::set_handler(move || {
            if handler_token.is_cancelled() {
                eprintln!("second interrupt received, exiting");
                std::process::exit(130);
            }
            handler_token.cancel();
            eprintln!("interrupt received, finishing current sample (press Ctrl-C again to abort)");
        }) {
            warn!(error = %err, "could not install interrupt handler");
        }

        token
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps up to `duration`; returns `false` when woken by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
