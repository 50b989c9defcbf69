use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::DfuError;

/// Liveness of a [DfuConnection](crate::DfuConnection).
///
/// Shared between the connection and whoever learns about the device going
/// away (hotplug watcher, failed transfer). Once invalidated it never
/// becomes valid again.
#[derive(Clone, Debug, Default)]
pub struct Liveness {
    disconnected: Arc<AtomicBool>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> Result<(), DfuError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(DfuError::Disconnected)
        }
    }
}

/// Cancellation request for a running download, observed between chunks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_shared() {
        let liveness = Liveness::new();
        let watcher = liveness.clone();
        assert!(liveness.check().is_ok());

        watcher.invalidate();
        assert!(!liveness.is_alive());
        assert!(matches!(liveness.check(), Err(DfuError::Disconnected)));
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.clone().cancel();
        assert!(token.is_cancelled());
    }
}
