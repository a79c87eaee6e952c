//! A duplicate filter shared between tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::DuplicateFilter;

/// Cloneable handle to a filter behind a mutex.
///
/// Every call takes the lock for exactly one filter operation. A poisoned
/// lock is recovered.
pub struct SharedFilter<F> {
    inner: Arc<Mutex<F>>,
}

impl<F: DuplicateFilter> SharedFilter<F> {
    pub fn new(filter: F) -> Self {
        Self {
            inner: Arc::new(Mutex::new(filter)),
        }
    }

    pub fn add(&self, data: &[u8]) {
        self.lock().add(data);
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        self.lock().contains(data)
    }

    /// Atomically test and record `data`; `true` if it was new.
    pub fn check_and_add(&self, data: &[u8]) -> bool {
        self.lock().check_and_add(data)
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, F> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<F> Clone for SharedFilter<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BloomFilter, DecayingFilter};

    #[test]
    fn test_clones_share_state() {
        let a = SharedFilter::new(DecayingFilter::default());
        let b = a.clone();
        a.add(b"seen");
        assert!(b.contains(b"seen"));
        assert!(!b.check_and_add(b"seen"));
        assert!(b.check_and_add(b"new"));
        assert!(a.contains(b"new"));
    }

    #[test]
    fn test_with_exposes_filter() {
        let shared = SharedFilter::new(BloomFilter::new());
        shared.add(b"one");
        assert_eq!(shared.with(|f| f.count()), 1);
        shared.with(|f| f.clear());
        assert!(!shared.contains(b"one"));
    }

    #[test]
    fn test_concurrent_adds() {
        let shared = SharedFilter::new(DecayingFilter::new(100_000).expect("filter"));
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let filter = shared.clone();
                std::thread::spawn(move || {
                    for i in 0..250u16 {
                        let mut item = vec![t];
                        item.extend_from_slice(&i.to_be_bytes());
                        filter.add(&item);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(shared.with(|f| f.len()), 1000);
    }
}
