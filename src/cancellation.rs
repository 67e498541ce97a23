use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Why a run was asked to stop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Stop at the next unit boundary and keep everything already committed
    Cooperative,
    /// Stop now; the run reports `Abort`
    Hard,
}

const NOT_CANCELLED: u8 = 0;
const COOPERATIVE: u8 = 1;
const HARD: u8 = 2;

/// Shared stop signal, consulted only between units of work (one table,
/// one sub-window). Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    state: Arc<AtomicU8>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cooperative stop. Never downgrades a hard abort.
    pub fn request_stop(&self) {
        let _ = self.state.compare_exchange(
            NOT_CANCELLED,
            COOPERATIVE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Request a hard abort
    pub fn request_abort(&self) {
        self.state.store(HARD, Ordering::Release);
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.state.load(Ordering::Acquire) {
            COOPERATIVE => Some(CancelReason::Cooperative),
            HARD => Some(CancelReason::Hard),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_signal_is_not_cancelled() {
        let signal = CancellationSignal::new();
        assert_eq!(signal.reason(), None);
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let signal = CancellationSignal::new();
        let observer = signal.clone();
        signal.request_stop();
        assert_eq!(observer.reason(), Some(CancelReason::Cooperative));
    }

    #[test]
    fn test_stop_does_not_downgrade_abort() {
        let signal = CancellationSignal::new();
        signal.request_abort();
        signal.request_stop();
        assert_eq!(signal.reason(), Some(CancelReason::Hard));
    }

    #[test]
    fn test_abort_upgrades_stop() {
        let signal = CancellationSignal::new();
        signal.request_stop();
        signal.request_abort();
        assert_eq!(signal.reason(), Some(CancelReason::Hard));
    }
}
