use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use crate::error::Interrupted;

static GLOBAL: LazyLock<Interrupt> = LazyLock::new(Interrupt::new);

/// Cooperative cancellation flag.
///
/// Blocking loops (lock waits, the scheduler's event loop) poll it at every
/// iteration and unwind with [`Interrupted`] once it is set. Clones share the
/// same flag, so a signal handler or another thread can stop every operation
/// that was handed a copy.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide flag used when no explicit one is supplied.
    pub fn global() -> Interrupt {
        GLOBAL.clone()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_triggered() {
            return Err(Interrupted);
        }

        Ok(())
    }
}
