//! # Lunar Garbage Collector
//!
//! Incremental tri-color mark-and-sweep collector for the Lunar scripting
//! runtime.
//!
//! ## Design
//!
//! - **Two whites**: the current white flips at the end of every mark phase,
//!   so objects allocated during sweep are never mistaken for garbage
//! - **Incremental**: marking, sweeping and finalization run in bounded steps
//!   paced by allocation debt
//! - **Barriers**: backward for tables, forward for everything else
//! - **Weak tables and ephemerons**: `__mode` driven, cleared atomically
//! - **Finalizers**: `__gc` objects are resurrected for one cycle and handed
//!   to a host hook
//!
//! Objects live in a generation-checked arena and are addressed by
//! [`GcRef`] handles; a stale handle is an error, never a dangling pointer.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
mod barrier;
pub mod collector;
pub mod color;
mod dealloc;
pub mod ephemeron;
pub mod error;
pub mod finalization;
pub mod heap;
mod mark_sweep;
mod mutator;
pub mod object;
pub mod objects;
pub mod sync;
pub mod upvalue;
pub mod value;
mod verify;

pub use allocator::{AllocError, LimitedAllocator, RawAllocator, SystemAllocator};
pub use collector::{CollectionKind, GcState, GcStats};
pub use color::{Color, Marked, Shade};
pub use ephemeron::WeakMode;
pub use error::{GcError, GcResult};
pub use finalization::FinalizerHook;
pub use heap::{GcConfig, Heap, ListCounts};
pub use object::{GcHeader, GcList, GcRef, ObjectKind, Trace};
pub use objects::{LuaClosure, LuaString, NativeClosure, Object, Proto, Table, Thread, Userdata};
pub use sync::SharedHeap;
pub use upvalue::{Capture, UpvalId, UpvalState};
pub use value::{Key, Value};
