//! Store doubles for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{InMemoryStore, Reply, Store, StoreError, Transaction};

/// Wraps an [`InMemoryStore`] and fails on demand.
#[derive(Debug)]
pub(crate) struct FlakyStore {
    inner: Arc<InMemoryStore>,
    failing: AtomicBool,
    /// Fail only transactions after this many successful ones (`usize::MAX` = off)
    fail_after: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            fail_after: AtomicUsize::new(usize::MAX),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Let the next `n` transactions through, then fail every later one.
    pub(crate) fn fail_after(&self, n: usize) {
        let base = self.calls.load(Ordering::SeqCst);
        self.fail_after.store(base + n, Ordering::SeqCst);
    }

    /// Number of transactions that reached this store.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn execute(&self, tx: Transaction) -> Result<Vec<Reply>, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) || call >= self.fail_after.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.execute(tx).await
    }
}
