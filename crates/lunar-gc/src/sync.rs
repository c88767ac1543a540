//! Externally serialized heap sharing
//!
//! The collector itself is single-threaded. Hosts that drive one heap from
//! several OS threads serialize every mutator and collector call through a
//! single lock.

use crate::error::GcResult;
use crate::heap::{GcConfig, Heap};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// A heap behind `Arc<Mutex<_>>`
#[derive(Clone)]
pub struct SharedHeap {
    inner: Arc<Mutex<Heap>>,
}

impl SharedHeap {
    /// Create a shared heap with the system allocator
    pub fn new(config: GcConfig) -> GcResult<Self> {
        Ok(Self::from_heap(Heap::new(config)?))
    }

    /// Share an existing heap
    pub fn from_heap(heap: Heap) -> Self {
        Self {
            inner: Arc::new(Mutex::new(heap)),
        }
    }

    /// Lock the heap for a sequence of operations
    pub fn lock(&self) -> MutexGuard<'_, Heap> {
        self.inner.lock()
    }

    /// Run `f` with the heap locked
    pub fn with<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl std::fmt::Debug for SharedHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHeap")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}
