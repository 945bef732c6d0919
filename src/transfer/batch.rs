//! Transfer lifecycle and progress events.
//!
//! Both are published on broadcast streams by the transfer engine and are
//! plain values for subscribers.

use std::fmt;

/// Lifecycle of one bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    TransferStarted,
    TransferEnded,
    TransferFailed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransferStarted => write!(f, "started"),
            Self::TransferEnded => write!(f, "ended"),
            Self::TransferFailed => write!(f, "failed"),
        }
    }
}

/// Progress of the active transfer, out of [`BatchProgress::TOTAL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub progress: u8,
    pub total: u8,
}

impl BatchProgress {
    pub const TOTAL: u8 = 100;

    /// Clamps `progress` to the total.
    pub fn new(progress: u8) -> Self {
        Self {
            progress: progress.min(Self::TOTAL),
            total: Self::TOTAL,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= self.total
    }
}

impl fmt::Display for BatchProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.progress, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(BatchState::TransferStarted.to_string(), "started");
        assert_eq!(BatchState::TransferFailed.to_string(), "failed");
    }

    #[test]
    fn test_progress_clamped() {
        assert_eq!(BatchProgress::new(40).progress, 40);
        assert_eq!(BatchProgress::new(250).progress, 100);
        assert_eq!(BatchProgress::new(7).total, 100);
        assert!(BatchProgress::new(100).is_complete());
        assert_eq!(BatchProgress::new(55).to_string(), "55/100");
    }
}
