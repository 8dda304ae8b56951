use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DumpError, DumpResult};

/// Cooperative cancellation signal shared between the driver and every
/// walker. Each per-entry loader checks it before starting an entry; a
/// cancelled pipeline yields no partial model.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn check(&self) -> DumpResult<()> {
        if self.is_cancelled() {
            Err(DumpError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(observer.check().is_ok());
        token.cancel();
        assert!(observer.is_cancelled());
        assert!(matches!(observer.check(), Err(DumpError::Cancelled)));
    }
}
