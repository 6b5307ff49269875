//! Cancellation flag shared between the Ctrl-C handler and a session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, TransferError};

#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Fails with `Aborted` once the flag is set
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TransferError::Aborted);
        }
        Ok(())
    }

    /// Trip the flag on Ctrl-C. Only one handler can exist per process.
    pub fn install_ctrlc(&self) -> std::result::Result<(), ctrlc::Error> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupted by user, closing channels...");
            flag.cancel();
        })
    }
}
