//! Cooperative cancellation flag shared between a caller and a running pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::info;

/// A set-once flag observed at defined poll points. Never interrupts a thread.
///
/// Clones share the same flag, so one handle can be given to a UI or watchdog
/// while another is passed to the runner.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Set the flag after `after` elapses, from a detached thread.
    pub fn cancel_after(&self, after: Duration) -> thread::JoinHandle<()> {
        let signal = self.clone();
        thread::spawn(move || {
            thread::sleep(after);
            info!(after_ms = after.as_millis() as u64, "cancel deadline reached");
            signal.cancel();
        })
    }
}
