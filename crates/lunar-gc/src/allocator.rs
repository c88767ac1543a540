//! Raw memory gateway
//!
//! Object bodies live in ordinary Rust collections; the heap books their
//! footprint against a [`RawAllocator`] before creating them. An allocator may
//! refuse a request, which triggers an emergency collection and one retry.

use thiserror::Error;

/// The allocator refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("allocator refused {requested} bytes ({in_use} in use)")]
pub struct AllocError {
    /// Bytes requested
    pub requested: usize,
    /// Bytes already booked when the request was made
    pub in_use: usize,
}

/// Books and releases raw bytes on behalf of the heap
pub trait RawAllocator: Send {
    /// Book `size` bytes or refuse
    fn raw_alloc(&mut self, size: usize) -> Result<(), AllocError>;

    /// Release `size` previously booked bytes
    fn raw_free(&mut self, size: usize);

    /// Bytes currently booked
    fn in_use(&self) -> usize;
}

/// Never refuses
#[derive(Debug, Default)]
pub struct SystemAllocator {
    in_use: usize,
}

impl RawAllocator for SystemAllocator {
    fn raw_alloc(&mut self, size: usize) -> Result<(), AllocError> {
        self.in_use += size;
        Ok(())
    }

    fn raw_free(&mut self, size: usize) {
        self.in_use = self.in_use.saturating_sub(size);
    }

    fn in_use(&self) -> usize {
        self.in_use
    }
}

/// Refuses any request that would push usage past a fixed limit
#[derive(Debug)]
pub struct LimitedAllocator {
    limit: usize,
    in_use: usize,
}

impl LimitedAllocator {
    /// Create with a byte limit
    pub fn new(limit: usize) -> Self {
        Self { limit, in_use: 0 }
    }

    /// Current limit
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl RawAllocator for LimitedAllocator {
    fn raw_alloc(&mut self, size: usize) -> Result<(), AllocError> {
        match self.in_use.checked_add(size) {
            Some(total) if total <= self.limit => {
                self.in_use = total;
                Ok(())
            }
            _ => Err(AllocError {
                requested: size,
                in_use: self.in_use,
            }),
        }
    }

    fn raw_free(&mut self, size: usize) {
        self.in_use = self.in_use.saturating_sub(size);
    }

    fn in_use(&self) -> usize {
        self.in_use
    }
}
