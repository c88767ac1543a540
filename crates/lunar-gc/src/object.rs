//! Object handles and headers

use crate::color::{Color, Marked, Shade};
use std::fmt;

/// Handle to a collectable object.
///
/// The index addresses a heap slot; the generation is bumped whenever that
/// slot is reclaimed, so a handle that outlives its object is detected
/// instead of silently aliasing a newer one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef {
    index: u32,
    generation: u32,
}

impl GcRef {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at the time the object was allocated
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({}#{})", self.index, self.generation)
    }
}

/// Object type tag
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Byte string
    String = 4,
    /// Associative table
    Table = 5,
    /// Closure over a function prototype
    LuaClosure = 6,
    /// Host function with inline upvalues
    NativeClosure = 6 | (2 << 4),
    /// Opaque host payload
    Userdata = 7,
    /// Coroutine with its own value stack
    Thread = 8,
    /// Compiled function prototype
    Proto = 9,
}

impl ObjectKind {
    /// Every kind, in tag order
    pub const ALL: [ObjectKind; 7] = [
        ObjectKind::String,
        ObjectKind::Table,
        ObjectKind::LuaClosure,
        ObjectKind::NativeClosure,
        ObjectKind::Userdata,
        ObjectKind::Thread,
        ObjectKind::Proto,
    ];

    /// Raw tag byte
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// Tracking list an object currently lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcList {
    /// Ordinary objects
    AllGc,
    /// Objects with a `__gc` metamethod that have not been found dead
    FinObj,
    /// Dead objects waiting for their finalizer to run
    ToBeFnz,
    /// Never collected
    Fixed,
    /// The main thread, owned directly by the heap
    Root,
}

/// Per-object bookkeeping
#[derive(Debug, Clone)]
pub struct GcHeader {
    pub(crate) marked: Marked,
    pub(crate) kind: ObjectKind,
    pub(crate) list: GcList,
    /// Next slot on the same tracking list
    pub(crate) next: Option<u32>,
    /// Bytes charged to the allocator for this object
    pub(crate) size: usize,
}

impl GcHeader {
    pub(crate) fn new(kind: ObjectKind, white: Shade, size: usize) -> Self {
        Self {
            marked: Marked::white(white),
            kind,
            list: GcList::AllGc,
            next: None,
            size,
        }
    }

    /// Mark byte
    pub fn marked(&self) -> Marked {
        self.marked
    }

    /// Decoded color
    pub fn color(&self) -> Color {
        self.marked.color()
    }

    /// Object type tag
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Tracking list
    pub fn list(&self) -> GcList {
        self.list
    }

    /// Accounted size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Enumerates the collectable references held directly by an object body.
///
/// Upvalue cells are not objects; closures report only their prototype here
/// and the heap resolves cell contents separately.
pub trait Trace {
    /// Call `tracer` once per outgoing reference
    fn trace(&self, tracer: &mut dyn FnMut(GcRef));
}
