use signal_hook::{SigId, consts::SIGINT, flag};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Process-wide stop request, set from a signal handler and polled by the
/// capture loop once per iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Setting it more than once has no further effect.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sets the flag when SIGINT arrives. No other signal is handled.
    pub fn register_interrupt(&self) -> io::Result<SigId> {
        flag::register(SIGINT, Arc::clone(&self.0))
    }
}
