//! Cooperative cancellation for repository operations.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::error::{DocumentStoreError, DocumentStoreResult};

/// A shared cancellation flag.
///
/// Clones observe the same flag. Repositories check it when an operation starts
/// and once per element of a streamed read.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with [`DocumentStoreError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> DocumentStoreResult<()> {
        if self.is_cancelled() {
            Err(DocumentStoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let observer = token.clone();

        assert!(observer.check().is_ok());
        token.cancel();
        assert!(matches!(observer.check(), Err(DocumentStoreError::Cancelled)));
    }
}
