//! Cooperative cancellation
//!
//! A run is only ever cancelled between operations: the executor checks the
//! token before each `BackingUp` transition, and an operation that is already
//! mutating runs to completion. A second interrupt while a run is winding down
//! exits immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Token shared by the signal handler and the pipeline
static GLOBAL_TOKEN: OnceLock<CancelToken> = OnceLock::new();

/// Exit code after a second interrupt (128 + SIGINT)
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Install the process-wide Ctrl-C / SIGTERM handler once and return its token
pub fn install_ctrlc_handler() -> Result<CancelToken, ctrlc::Error> {
    if let Some(token) = GLOBAL_TOKEN.get() {
        return Ok(token.clone());
    }
    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            warn!("Second interrupt received, exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        }
        info!("Interrupt received, finishing the current operation before stopping");
        handler_token.cancel();
    })?;
    Ok(GLOBAL_TOKEN.get_or_init(|| token).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
