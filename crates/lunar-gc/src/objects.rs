//! Object bodies
//!
//! Every collectable kind is a variant of [`Object`]. Bodies only hold data;
//! all mutation that can create a reference goes through the heap so that the
//! write barrier is never skipped.

use crate::object::{GcRef, ObjectKind, Trace};
use crate::upvalue::UpvalId;
use crate::value::{Key, Value};
use rustc_hash::FxHashMap;
use std::mem::size_of;

pub(crate) const VALUE_SIZE: usize = size_of::<Value>();
pub(crate) const REF_SIZE: usize = size_of::<GcRef>();
/// One key/value pair in a table
pub(crate) const NODE_SIZE: usize = 2 * VALUE_SIZE;

const STRING_BASE: usize = 24;
const TABLE_BASE: usize = 56;
const CLOSURE_BASE: usize = 32;
const USERDATA_BASE: usize = 40;
const THREAD_BASE: usize = 208;
const PROTO_BASE: usize = 128;

/// Immutable byte string. Short strings are interned.
#[derive(Debug, Clone)]
pub struct LuaString {
    bytes: Box<[u8]>,
    short: bool,
}

impl LuaString {
    pub(crate) fn new(bytes: &[u8], short: bool) -> Self {
        Self {
            bytes: bytes.into(),
            short,
        }
    }

    /// Raw contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Contents as UTF-8, if valid
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Interned short string
    pub fn is_short(&self) -> bool {
        self.short
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Zero length
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Hash table with an optional metatable
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub(crate) entries: FxHashMap<Key, Value>,
    pub(crate) metatable: Option<GcRef>,
}

impl Table {
    /// Raw lookup; absent keys read as nil
    pub fn get(&self, key: &Key) -> Value {
        self.entries.get(key).copied().unwrap_or_default()
    }

    /// Number of non-nil entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter()
    }

    /// Metatable, if set
    pub fn metatable(&self) -> Option<GcRef> {
        self.metatable
    }

    pub(crate) fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }
}

/// Closure over a prototype with shared upvalue cells
#[derive(Debug, Clone)]
pub struct LuaClosure {
    pub(crate) proto: GcRef,
    pub(crate) upvalues: Box<[UpvalId]>,
}

impl LuaClosure {
    /// Prototype
    pub fn proto(&self) -> GcRef {
        self.proto
    }

    /// Upvalue cells in capture order
    pub fn upvalues(&self) -> &[UpvalId] {
        &self.upvalues
    }
}

/// Host function with upvalues stored inline
#[derive(Debug, Clone)]
pub struct NativeClosure {
    pub(crate) entry: usize,
    pub(crate) upvalues: Box<[Value]>,
}

impl NativeClosure {
    /// Host entry point identifier
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Inline upvalues
    pub fn upvalues(&self) -> &[Value] {
        &self.upvalues
    }
}

/// Opaque host payload with a metatable and one user value
#[derive(Debug, Clone)]
pub struct Userdata {
    pub(crate) data: Box<[u8]>,
    pub(crate) metatable: Option<GcRef>,
    pub(crate) user_value: Value,
}

impl Userdata {
    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Metatable, if set
    pub fn metatable(&self) -> Option<GcRef> {
        self.metatable
    }

    /// Associated user value
    pub fn user_value(&self) -> Value {
        self.user_value
    }
}

/// Coroutine value stack with the upvalue cells still pointing into it
#[derive(Debug, Clone, Default)]
pub struct Thread {
    pub(crate) stack: Vec<Value>,
    pub(crate) open_upvalues: Vec<UpvalId>,
    /// Registered in the heap's list of threads with open upvalues
    pub(crate) in_twups: bool,
}

impl Thread {
    /// Live stack slots
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Open upvalue cells
    pub fn open_upvalues(&self) -> &[UpvalId] {
        &self.open_upvalues
    }
}

/// Compiled function prototype
#[derive(Debug, Clone, Default)]
pub struct Proto {
    pub(crate) code: Box<[u32]>,
    pub(crate) constants: Vec<Value>,
    pub(crate) protos: Vec<GcRef>,
    pub(crate) source: Option<GcRef>,
    pub(crate) local_names: Vec<GcRef>,
    pub(crate) upvalue_names: Vec<Option<GcRef>>,
    /// Last closure created from this prototype; dropped if it dies
    pub(crate) cache: Option<GcRef>,
}

impl Proto {
    /// Instructions
    pub fn code(&self) -> &[u32] {
        &self.code
    }

    /// Constant pool
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Nested prototypes
    pub fn protos(&self) -> &[GcRef] {
        &self.protos
    }

    /// Chunk name
    pub fn source(&self) -> Option<GcRef> {
        self.source
    }

    /// Debug names of locals
    pub fn local_names(&self) -> &[GcRef] {
        &self.local_names
    }

    /// Debug names of upvalues
    pub fn upvalue_names(&self) -> &[Option<GcRef>] {
        &self.upvalue_names
    }

    /// Cached closure
    pub fn cache(&self) -> Option<GcRef> {
        self.cache
    }
}

/// A heap object body
#[derive(Debug, Clone)]
pub enum Object {
    /// String
    String(LuaString),
    /// Table
    Table(Table),
    /// Script closure
    LuaClosure(LuaClosure),
    /// Host closure
    NativeClosure(NativeClosure),
    /// Userdata
    Userdata(Userdata),
    /// Thread
    Thread(Thread),
    /// Prototype
    Proto(Proto),
}

macro_rules! object_casts {
    ($($variant:ident => $ty:ty, $as_ref:ident, $as_mut:ident;)*) => {
        impl Object {
            $(
                #[doc = concat!("Borrow as [`", stringify!($ty), "`]")]
                pub fn $as_ref(&self) -> Option<&$ty> {
                    match self {
                        Object::$variant(o) => Some(o),
                        _ => None,
                    }
                }

                #[allow(dead_code)]
                pub(crate) fn $as_mut(&mut self) -> Option<&mut $ty> {
                    match self {
                        Object::$variant(o) => Some(o),
                        _ => None,
                    }
                }
            )*
        }
    };
}

object_casts! {
    String => LuaString, as_string, as_string_mut;
    Table => Table, as_table, as_table_mut;
    LuaClosure => LuaClosure, as_lua_closure, as_lua_closure_mut;
    NativeClosure => NativeClosure, as_native_closure, as_native_closure_mut;
    Userdata => Userdata, as_userdata, as_userdata_mut;
    Thread => Thread, as_thread, as_thread_mut;
    Proto => Proto, as_proto, as_proto_mut;
}

impl Object {
    /// Type tag of the body
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::String(_) => ObjectKind::String,
            Object::Table(_) => ObjectKind::Table,
            Object::LuaClosure(_) => ObjectKind::LuaClosure,
            Object::NativeClosure(_) => ObjectKind::NativeClosure,
            Object::Userdata(_) => ObjectKind::Userdata,
            Object::Thread(_) => ObjectKind::Thread,
            Object::Proto(_) => ObjectKind::Proto,
        }
    }

    /// Bytes charged to the allocator for this body.
    ///
    /// Growth after allocation is charged in the same units, so the header's
    /// recorded size always equals this value.
    pub fn footprint(&self) -> usize {
        match self {
            Object::String(s) => STRING_BASE + s.bytes.len() + 1,
            Object::Table(t) => TABLE_BASE + t.entries.len() * NODE_SIZE,
            Object::LuaClosure(c) => CLOSURE_BASE + c.upvalues.len() * REF_SIZE,
            Object::NativeClosure(c) => CLOSURE_BASE + c.upvalues.len() * VALUE_SIZE,
            Object::Userdata(u) => USERDATA_BASE + u.data.len(),
            Object::Thread(t) => THREAD_BASE + t.stack.len() * VALUE_SIZE,
            Object::Proto(p) => {
                PROTO_BASE
                    + p.code.len() * size_of::<u32>()
                    + p.constants.len() * VALUE_SIZE
                    + (p.protos.len() + p.local_names.len() + p.upvalue_names.len()) * REF_SIZE
            }
        }
    }
}

fn trace_value(value: &Value, tracer: &mut dyn FnMut(GcRef)) {
    if let Value::Object(r) = value {
        tracer(*r);
    }
}

impl Trace for Table {
    fn trace(&self, tracer: &mut dyn FnMut(GcRef)) {
        if let Some(mt) = self.metatable {
            tracer(mt);
        }
        for (key, value) in &self.entries {
            if let Some(k) = key.as_object() {
                tracer(k);
            }
            trace_value(value, tracer);
        }
    }
}

impl Trace for Object {
    fn trace(&self, tracer: &mut dyn FnMut(GcRef)) {
        match self {
            Object::String(_) => {}
            Object::Table(t) => t.trace(tracer),
            Object::LuaClosure(c) => tracer(c.proto),
            Object::NativeClosure(c) => {
                for value in c.upvalues.iter() {
                    trace_value(value, tracer);
                }
            }
            Object::Userdata(u) => {
                if let Some(mt) = u.metatable {
                    tracer(mt);
                }
                trace_value(&u.user_value, tracer);
            }
            Object::Thread(t) => {
                for value in &t.stack {
                    trace_value(value, tracer);
                }
            }
            Object::Proto(p) => {
                if let Some(source) = p.source {
                    tracer(source);
                }
                for value in &p.constants {
                    trace_value(value, tracer);
                }
                let names = p.local_names.iter().chain(p.upvalue_names.iter().flatten());
                for &r in p.protos.iter().chain(names) {
                    tracer(r);
                }
                if let Some(cache) = p.cache {
                    tracer(cache);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs_of(object: &Object) -> Vec<GcRef> {
        let mut out = Vec::new();
        object.trace(&mut |r| out.push(r));
        out.sort();
        out
    }

    #[test]
    fn test_table_footprint_tracks_entries() {
        let mut t = Table::default();
        let empty = Object::Table(t.clone()).footprint();
        t.entries.insert(Key::Integer(1), Value::Boolean(true));
        assert_eq!(Object::Table(t).footprint(), empty + NODE_SIZE);
    }

    #[test]
    fn test_table_traces_keys_values_and_metatable() {
        let (a, b, mt) = (GcRef::new(1, 0), GcRef::new(2, 0), GcRef::new(3, 0));
        let mut t = Table::default();
        t.entries.insert(Key::Object(a), Value::Integer(1));
        t.entries.insert(Key::Integer(2), Value::Object(b));
        t.metatable = Some(mt);
        assert_eq!(refs_of(&Object::Table(t)), vec![a, b, mt]);
    }

    #[test]
    fn test_strings_hold_no_references() {
        let s = Object::String(LuaString::new(b"hello", true));
        assert!(refs_of(&s).is_empty());
        assert_eq!(s.kind(), ObjectKind::String);
        assert_eq!(s.as_string().and_then(|s| s.as_str()), Some("hello"));
    }

    #[test]
    fn test_proto_traces_everything_including_cache() {
        let r = |i| GcRef::new(i, 0);
        let proto = Proto {
            constants: vec![Value::Object(r(1)), Value::Integer(7)],
            protos: vec![r(2)],
            source: Some(r(3)),
            local_names: vec![r(4)],
            upvalue_names: vec![None, Some(r(5))],
            cache: Some(r(6)),
            ..Proto::default()
        };
        assert_eq!(
            refs_of(&Object::Proto(proto)),
            vec![r(1), r(2), r(3), r(4), r(5), r(6)]
        );
    }
}
