//! Coalesced stabilization.
//!
//! Writes only dirty nodes; recomputing what depends on them is left to a
//! stabilization pass. Any number of writes in one turn share a single pass,
//! which runs once the writer yields back to the runtime.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::trace;

use crate::config::StabilizeMode;

type Pass = Arc<dyn Fn() -> usize + Send + Sync>;

/// Schedules at most one pending stabilization pass at a time.
#[derive(Clone)]
pub struct DeferredStabilizer {
    queued: Arc<AtomicBool>,
    mode: StabilizeMode,
    pass: Pass,
}

impl DeferredStabilizer {
    /// `pass` runs one stabilization and returns how many nodes it visited.
    pub fn new<F>(mode: StabilizeMode, pass: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        Self {
            queued: Arc::new(AtomicBool::new(false)),
            mode,
            pass: Arc::new(pass),
        }
    }

    /// Request a pass. Returns immediately unless the mode is immediate or
    /// there is no runtime to defer onto.
    pub fn schedule(&self) {
        if self.mode == StabilizeMode::Immediate {
            self.run();
            return;
        }
        if self.queued.swap(true, Ordering::AcqRel) {
            trace!("stabilization already queued");
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    this.queued.store(false, Ordering::Release);
                    this.run();
                });
            }
            Err(_) => {
                self.queued.store(false, Ordering::Release);
                self.run();
            }
        }
    }

    /// Run a pass now.
    pub fn run(&self) -> usize {
        let visited = (self.pass)();
        trace!(visited, "stabilization pass");
        visited
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DeferredStabilizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredStabilizer")
            .field("mode", &self.mode)
            .field("queued", &self.is_queued())
            .finish()
    }
}
