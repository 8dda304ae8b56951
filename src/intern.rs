use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

/// Content-addressed string store.
///
/// Selectors and type encodings repeat heavily across a binary; interning
/// them means equal content shares one allocation and comparisons stay
/// pointer-cheap. The interner is an explicit dependency of the driver; the
/// process-wide default exists for callers that do not care.
#[derive(Debug, Default)]
pub struct StringInterner {
    inner: Mutex<HashSet<Arc<str>>>,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner::default()
    }

    pub fn intern(&self, s: &str) -> Arc<str> {
        let mut set = match self.inner.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = set.get(s) {
            return existing.clone();
        }
        let owned: Arc<str> = Arc::from(s);
        set.insert(owned.clone());
        owned
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

lazy_static! {
    pub static ref DEFAULT_INTERNER: StringInterner = StringInterner::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_shares_storage() {
        let interner = StringInterner::new();
        let a = interner.intern("viewDidLoad");
        let b = interner.intern("viewDidLoad");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn distinct_content_is_distinct() {
        let interner = StringInterner::new();
        let a = interner.intern("init");
        let b = interner.intern("dealloc");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 2);
    }
}
