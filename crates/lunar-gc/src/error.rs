//! Collector error types

use crate::object::{GcRef, ObjectKind};
use crate::upvalue::UpvalId;
use thiserror::Error;

/// Errors surfaced by the heap and the collector
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GcError {
    /// The allocator refused a request even after an emergency collection
    #[error("OutOfMemory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// Bytes that were requested
        requested: usize,
    },

    /// The heap's bookkeeping disagrees with itself; the cycle is abandoned
    #[error("InternalConsistencyError: {0}")]
    InternalConsistency(String),

    /// A finalizer hook reported a failure. Finalization of other objects continues.
    #[error("error in __gc metamethod of {object:?}: {message}")]
    Finalizer {
        /// Object whose finalizer failed
        object: GcRef,
        /// Message returned by the hook
        message: String,
    },

    /// Nil and NaN cannot index a table
    #[error("invalid table key (nil or NaN)")]
    InvalidKey,

    /// The handle refers to an object that has already been reclaimed
    #[error("stale reference {0:?}")]
    StaleReference(GcRef),

    /// The upvalue cell has already been released
    #[error("stale upvalue {0:?}")]
    StaleUpvalue(UpvalId),

    /// The object is of a different kind than the operation expects
    #[error("expected {expected:?}, found {found:?}")]
    KindMismatch {
        /// Kind required by the operation
        expected: ObjectKind,
        /// Kind actually stored behind the handle
        found: ObjectKind,
    },

    /// Stack slot is outside the thread's stack
    #[error("stack slot {slot} out of range (stack holds {len} values)")]
    StackSlot {
        /// Requested slot
        slot: usize,
        /// Current stack length
        len: usize,
    },
}

/// Result type for heap operations
pub type GcResult<T> = Result<T, GcError>;

impl GcError {
    pub(crate) fn consistency(message: impl Into<String>) -> Self {
        GcError::InternalConsistency(message.into())
    }
}
