//! Two-level stop token for batch drivers.
//!
//! A graceful stop lets a driver finish the dataset it is working on and
//! then stop claiming work. An abort additionally forbids starting any new
//! subprocess or document batch. Neither interrupts a state transition that
//! is already committing.

use crate::{PbenchError, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const ABORTED: u8 = 2;

/// A stop token shared between a signal handler and batch drivers.
///
/// Clones share state. Requests only escalate: once aborted, a later
/// graceful request does not downgrade the token.
///
/// # Example
///
/// ```
/// use pbench_core::stop::StopToken;
///
/// let token = StopToken::new();
/// let handler = token.clone();
///
/// handler.request_stop();
/// assert!(token.should_stop());
/// assert!(!token.is_aborted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    level: Arc<AtomicU8>,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            level: Arc::new(AtomicU8::new(RUNNING)),
        }
    }

    /// Finish in-flight work, then stop claiming new datasets.
    pub fn request_stop(&self) {
        self.level.fetch_max(STOPPING, Ordering::SeqCst);
    }

    /// Stop before starting any further subprocess or batch.
    pub fn abort(&self) {
        self.level.store(ABORTED, Ordering::SeqCst);
    }

    /// Escalate one level: running becomes stopping, stopping becomes aborted.
    pub fn escalate(&self) {
        if self.should_stop() {
            self.abort();
        } else {
            self.request_stop();
        }
    }

    pub fn should_stop(&self) -> bool {
        self.level.load(Ordering::SeqCst) >= STOPPING
    }

    pub fn is_aborted(&self) -> bool {
        self.level.load(Ordering::SeqCst) == ABORTED
    }

    /// Fail with [`PbenchError::Stopped`] once an abort has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(PbenchError::Stopped)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_running() {
        let token = StopToken::new();
        assert!(!token.should_stop());
        assert!(!token.is_aborted());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_graceful_stop_does_not_abort() {
        let token = StopToken::new();
        token.request_stop();
        assert!(token.should_stop());
        assert!(!token.is_aborted());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_abort_implies_stop() {
        let token = StopToken::new();
        token.abort();
        assert!(token.should_stop());
        assert!(matches!(token.check(), Err(PbenchError::Stopped)));
    }

    #[test]
    fn test_stop_never_downgrades_abort() {
        let token = StopToken::new();
        token.abort();
        token.request_stop();
        assert!(token.is_aborted());
    }

    #[test]
    fn test_escalate() {
        let token = StopToken::new();
        token.escalate();
        assert!(token.should_stop());
        assert!(!token.is_aborted());
        token.escalate();
        assert!(token.is_aborted());
    }

    #[test]
    fn test_clone_shares_state() {
        let token = StopToken::default();
        let clone = token.clone();
        clone.request_stop();
        assert!(token.should_stop());
    }
}
