//! Mutator-facing constructors and writes.
//!
//! Every write that can store a reference into an existing object applies
//! the matching barrier, and every write that grows an object charges the
//! growth before touching the body so a refused allocation leaves the object
//! unchanged.

use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::{GcRef, ObjectKind};
use crate::objects::{
    LuaClosure, LuaString, NODE_SIZE, NativeClosure, Object, Proto, REF_SIZE, Table, Thread,
    Userdata, VALUE_SIZE,
};
use crate::upvalue::{Capture, UpvalId, UpvalState};
use crate::value::{Key, Value};

impl Heap {
    // ---------------------------------------------------------------------
    // Strings
    // ---------------------------------------------------------------------

    /// Create or reuse a string. Short strings are interned; an interned
    /// string that is dead but not yet swept is resurrected.
    pub fn new_string(&mut self, bytes: &[u8]) -> GcResult<GcRef> {
        if bytes.len() > self.config.max_short_string {
            return self.allocate(Object::String(LuaString::new(bytes, false)));
        }
        if let Some(&r) = self.strings.get(bytes) {
            let current = self.current_white;
            let marked = &mut self.entry_mut(r)?.header.marked;
            if marked.is_dead(current) {
                marked.change_white();
            }
            return Ok(r);
        }
        let r = self.allocate(Object::String(LuaString::new(bytes, true)))?;
        self.strings.insert(bytes.into(), r);
        Ok(r)
    }

    /// [`Heap::new_string`] for UTF-8 text
    pub fn new_str(&mut self, s: &str) -> GcResult<GcRef> {
        self.new_string(s.as_bytes())
    }

    /// Number of interned strings
    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    // ---------------------------------------------------------------------
    // Tables
    // ---------------------------------------------------------------------

    /// Create an empty table
    pub fn new_table(&mut self) -> GcResult<GcRef> {
        self.allocate(Object::Table(Table::default()))
    }

    /// Raw read; nil for absent keys and for keys that cannot exist
    pub fn table_get(&self, t: GcRef, key: Value) -> GcResult<Value> {
        let table = self.table(t)?;
        Ok(Key::from_value(key).map_or(Value::Nil, |k| table.get(&k)))
    }

    /// Raw write. Assigning nil removes the entry.
    pub fn table_set(&mut self, t: GcRef, key: Value, value: Value) -> GcResult<()> {
        let key = Key::from_value(key).ok_or(GcError::InvalidKey)?;
        self.check_live(key.to_value())?;
        self.check_live(value)?;
        let present = self.table(t)?.contains(&key);
        if value.is_nil() {
            if present {
                self.table_mut(t)?.entries.remove(&key);
                self.shrink(t, NODE_SIZE)?;
            }
            return Ok(());
        }
        if !present {
            self.grow(t, NODE_SIZE, &[key.to_value(), value])?;
        }
        self.table_mut(t)?.entries.insert(key, value);
        self.barrier_back(t, key.to_value())?;
        self.barrier_back(t, value)
    }

    /// Own metatable of a table or userdata, else the per-kind metatable
    pub fn metatable(&self, obj: GcRef) -> GcResult<Option<GcRef>> {
        match self.object(obj)? {
            Object::Table(t) => Ok(t.metatable),
            Object::Userdata(u) => Ok(u.metatable),
            other => Ok(self.type_metatable(other.kind())),
        }
    }

    /// Set the metatable of a table or userdata. A metatable with a `__gc`
    /// field registers the object for finalization.
    pub fn set_metatable(&mut self, obj: GcRef, mt: Option<GcRef>) -> GcResult<()> {
        if let Some(mt) = mt {
            self.expect_kind(mt, ObjectKind::Table)?;
        }
        match self.kind_of(obj)? {
            ObjectKind::Table => self.table_mut(obj)?.metatable = mt,
            ObjectKind::Userdata => self.userdata_mut(obj)?.metatable = mt,
            found => {
                return Err(GcError::KindMismatch {
                    expected: ObjectKind::Table,
                    found,
                });
            }
        }
        if let Some(mt) = mt {
            self.barrier(obj, Value::Object(mt))?;
            self.check_finalizer(obj, Some(mt))?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Userdata
    // ---------------------------------------------------------------------

    /// Create a zeroed userdata payload of `size` bytes
    pub fn new_userdata(&mut self, size: usize) -> GcResult<GcRef> {
        self.allocate(Object::Userdata(Userdata {
            data: vec![0; size].into_boxed_slice(),
            metatable: None,
            user_value: Value::Nil,
        }))
    }

    /// Mutable payload. The payload holds no references.
    pub fn userdata_bytes_mut(&mut self, u: GcRef) -> GcResult<&mut [u8]> {
        Ok(&mut self.userdata_mut(u)?.data)
    }

    /// Replace the user value
    pub fn set_user_value(&mut self, u: GcRef, value: Value) -> GcResult<()> {
        self.check_live(value)?;
        self.userdata_mut(u)?.user_value = value;
        self.barrier(u, value)
    }

    // ---------------------------------------------------------------------
    // Threads
    // ---------------------------------------------------------------------

    /// Create a coroutine with an empty stack
    pub fn new_thread(&mut self) -> GcResult<GcRef> {
        self.allocate(Object::Thread(Thread::default()))
    }

    /// Push onto a thread's stack
    pub fn push(&mut self, thread: GcRef, value: Value) -> GcResult<()> {
        self.expect_kind(thread, ObjectKind::Thread)?;
        self.check_live(value)?;
        self.grow(thread, VALUE_SIZE, &[value])?;
        self.thread_mut(thread)?.stack.push(value);
        Ok(())
    }

    /// Pop the top of a thread's stack, closing a cell that aliases it
    pub fn pop(&mut self, thread: GcRef) -> GcResult<Value> {
        let stack = &self.thread(thread)?.stack;
        let Some(&top) = stack.last() else {
            return Ok(Value::Nil);
        };
        let len = stack.len();
        self.truncate(thread, len - 1)?;
        Ok(top)
    }

    /// Shrink a thread's stack to `len` slots, closing cells above it
    pub fn truncate(&mut self, thread: GcRef, len: usize) -> GcResult<()> {
        let current = self.thread(thread)?.stack.len();
        if len >= current {
            return Ok(());
        }
        self.close_upvalues(thread, len)?;
        self.thread_mut(thread)?.stack.truncate(len);
        self.shrink(thread, (current - len) * VALUE_SIZE)
    }

    /// Read a stack slot
    pub fn stack_get(&self, thread: GcRef, slot: usize) -> GcResult<Value> {
        let stack = &self.thread(thread)?.stack;
        stack.get(slot).copied().ok_or(GcError::StackSlot {
            slot,
            len: stack.len(),
        })
    }

    /// Write a stack slot. Threads are never black, so no barrier applies.
    pub fn stack_set(&mut self, thread: GcRef, slot: usize, value: Value) -> GcResult<()> {
        self.check_live(value)?;
        let stack = &mut self.thread_mut(thread)?.stack;
        let len = stack.len();
        let target = stack.get_mut(slot).ok_or(GcError::StackSlot { slot, len })?;
        *target = value;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Closures
    // ---------------------------------------------------------------------

    /// Create a closure over `proto`, resolving each capture to a cell
    pub fn new_lua_closure(&mut self, proto: GcRef, captures: &[Capture]) -> GcResult<GcRef> {
        self.expect_kind(proto, ObjectKind::Proto)?;
        let mark = self.pins.len();
        self.pins.push(Value::Object(proto));
        let result = self.build_lua_closure(proto, captures);
        self.pins.truncate(mark);
        result
    }

    fn build_lua_closure(&mut self, proto: GcRef, captures: &[Capture]) -> GcResult<GcRef> {
        let mut cells: Vec<UpvalId> = Vec::with_capacity(captures.len());
        for capture in captures {
            match self.resolve_capture(*capture) {
                Ok(id) => cells.push(id),
                Err(err) => {
                    cells.into_iter().for_each(|id| self.release_upvalue(id));
                    return Err(err);
                }
            }
        }
        let closure = Object::LuaClosure(LuaClosure {
            proto,
            upvalues: cells.clone().into_boxed_slice(),
        });
        match self.allocate(closure) {
            Ok(r) => Ok(r),
            Err(err) => {
                cells.into_iter().for_each(|id| self.release_upvalue(id));
                Err(err)
            }
        }
    }

    /// Resolve a capture to a retained cell. Values reachable only through
    /// the capture are pinned until the closure exists.
    fn resolve_capture(&mut self, capture: Capture) -> GcResult<UpvalId> {
        let id = match capture {
            Capture::Open { thread, slot } => {
                self.pins.push(Value::Object(thread));
                self.find_upvalue(thread, slot)?
            }
            Capture::Shared(id) => {
                if let UpvalState::Closed(value) = self.upvals.get(id)?.state {
                    self.pins.push(value);
                }
                id
            }
            Capture::Closed(value) => {
                self.check_live(value)?;
                self.pins.push(value);
                self.new_closed_upvalue(value)?
            }
        };
        self.retain_upvalue(id)?;
        Ok(id)
    }

    /// Create a host closure with inline upvalues
    pub fn new_native_closure(&mut self, entry: usize, upvalues: Vec<Value>) -> GcResult<GcRef> {
        self.allocate(Object::NativeClosure(NativeClosure {
            entry,
            upvalues: upvalues.into_boxed_slice(),
        }))
    }

    /// Replace an inline upvalue of a host closure
    pub fn set_native_upvalue(
        &mut self,
        closure: GcRef,
        index: usize,
        value: Value,
    ) -> GcResult<()> {
        self.check_live(value)?;
        let upvalues = &mut self.native_closure_mut(closure)?.upvalues;
        let len = upvalues.len();
        let target = upvalues
            .get_mut(index)
            .ok_or(GcError::StackSlot { slot: index, len })?;
        *target = value;
        self.barrier(closure, value)
    }

    // ---------------------------------------------------------------------
    // Prototypes
    // ---------------------------------------------------------------------

    /// Create a prototype around compiled `code`
    pub fn new_proto(&mut self, code: Vec<u32>) -> GcResult<GcRef> {
        self.allocate(Object::Proto(Proto {
            code: code.into_boxed_slice(),
            ..Proto::default()
        }))
    }

    /// Append a constant, returning its index
    pub fn proto_add_constant(&mut self, p: GcRef, value: Value) -> GcResult<usize> {
        self.expect_kind(p, ObjectKind::Proto)?;
        self.check_live(value)?;
        self.grow(p, VALUE_SIZE, &[value])?;
        let constants = &mut self.proto_mut(p)?.constants;
        constants.push(value);
        let index = constants.len() - 1;
        self.barrier(p, value)?;
        Ok(index)
    }

    /// Append a nested prototype
    pub fn proto_add_child(&mut self, p: GcRef, child: GcRef) -> GcResult<()> {
        self.expect_kind(child, ObjectKind::Proto)?;
        self.expect_kind(p, ObjectKind::Proto)?;
        self.grow(p, REF_SIZE, &[Value::Object(child)])?;
        self.proto_mut(p)?.protos.push(child);
        self.barrier(p, Value::Object(child))
    }

    /// Set the chunk name
    pub fn proto_set_source(&mut self, p: GcRef, source: GcRef) -> GcResult<()> {
        self.expect_kind(source, ObjectKind::String)?;
        self.proto_mut(p)?.source = Some(source);
        self.barrier(p, Value::Object(source))
    }

    /// Append a local variable name
    pub fn proto_add_local_name(&mut self, p: GcRef, name: GcRef) -> GcResult<()> {
        self.expect_kind(name, ObjectKind::String)?;
        self.expect_kind(p, ObjectKind::Proto)?;
        self.grow(p, REF_SIZE, &[Value::Object(name)])?;
        self.proto_mut(p)?.local_names.push(name);
        self.barrier(p, Value::Object(name))
    }

    /// Append an upvalue name; `None` for stripped debug info
    pub fn proto_add_upvalue_name(&mut self, p: GcRef, name: Option<GcRef>) -> GcResult<()> {
        if let Some(name) = name {
            self.expect_kind(name, ObjectKind::String)?;
        }
        self.expect_kind(p, ObjectKind::Proto)?;
        let pins: Vec<Value> = name.map(Value::Object).into_iter().collect();
        self.grow(p, REF_SIZE, &pins)?;
        self.proto_mut(p)?.upvalue_names.push(name);
        match name {
            Some(name) => self.barrier(p, Value::Object(name)),
            None => Ok(()),
        }
    }

    /// Remember `closure` as the prototype's cached instance. A black
    /// prototype is left alone so the cache never points at a white object
    /// from a black one. Returns whether the cache was updated.
    pub fn proto_set_cache(&mut self, p: GcRef, closure: GcRef) -> GcResult<bool> {
        self.expect_kind(closure, ObjectKind::LuaClosure)?;
        if self.entry(p)?.header.marked.is_black() {
            return Ok(false);
        }
        self.proto_mut(p)?.cache = Some(closure);
        Ok(true)
    }
}
