//! Heap management: the object arena, tracking lists and byte accounting

use crate::allocator::{RawAllocator, SystemAllocator};
use crate::collector::{CollectionKind, GcState, GcStats};
use crate::color::{Color, Shade};
use crate::error::{GcError, GcResult};
use crate::finalization::FinalizerHook;
use crate::mark_sweep::SweepCursor;
use crate::object::{GcHeader, GcList, GcRef, ObjectKind, Trace};
use crate::objects::{
    LuaClosure, LuaString, NativeClosure, Object, Proto, Table, Thread, Userdata,
};
use crate::upvalue::UpvalArena;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::time::Instant;

/// Default pause, in percent of the live estimate
pub const DEFAULT_PAUSE: u32 = 200;
/// Default step multiplier, in percent
pub const DEFAULT_STEP_MULTIPLIER: u32 = 200;
/// Smallest accepted step multiplier
pub const MIN_STEP_MULTIPLIER: u32 = 40;
/// Default debt granularity of one step: a hundred small strings
pub const DEFAULT_STEP_SIZE: usize = 100 * 24;

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Start a new cycle once the heap reaches this percentage of the live
    /// estimate (default: 200)
    pub pause: u32,
    /// Collector work per allocated byte, in percent (default: 200)
    pub step_multiplier: u32,
    /// Debt granularity of one step in bytes (default: 2400)
    pub step_size: usize,
    /// Objects visited per sweep step (default: 80)
    pub sweep_max: usize,
    /// Cap on finalizers run per step (default: 10)
    pub finalizer_max: usize,
    /// Strings up to this length are interned (default: 40)
    pub max_short_string: usize,
    /// Run [`Heap::verify`] around every collector step (default: false)
    pub verify_steps: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            pause: DEFAULT_PAUSE,
            step_multiplier: DEFAULT_STEP_MULTIPLIER,
            step_size: DEFAULT_STEP_SIZE,
            sweep_max: 80,
            finalizer_max: 10,
            max_short_string: 40,
            verify_steps: false,
        }
    }
}

/// Objects per tracking list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListCounts {
    /// Ordinary objects
    pub allgc: usize,
    /// Objects registered for finalization
    pub finobj: usize,
    /// Objects waiting for their finalizer
    pub tobefnz: usize,
    /// Objects that are never collected
    pub fixed: usize,
}

impl ListCounts {
    /// Sum over every list
    pub fn total(&self) -> usize {
        self.allgc + self.finobj + self.tobefnz + self.fixed
    }
}

pub(crate) struct Entry {
    pub(crate) header: GcHeader,
    pub(crate) object: Object,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// The collected heap.
///
/// Objects live in an arena of generation-checked slots and are threaded
/// through intrusive tracking lists (`allgc`, `finobj`, `tobefnz`, `fixed`).
/// Gray lists are plain vectors of handles. The heap is single-threaded; wrap
/// it in [`crate::SharedHeap`] to share it.
pub struct Heap {
    pub(crate) config: GcConfig,
    allocator: Box<dyn RawAllocator>,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,

    pub(crate) allgc: Option<u32>,
    pub(crate) finobj: Option<u32>,
    pub(crate) tobefnz: Option<u32>,
    pub(crate) fixedgc: Option<u32>,

    pub(crate) gray: Vec<GcRef>,
    pub(crate) grayagain: Vec<GcRef>,
    pub(crate) weak: Vec<GcRef>,
    pub(crate) allweak: Vec<GcRef>,
    pub(crate) ephemeron: Vec<GcRef>,
    /// Threads that may have open upvalues
    pub(crate) twups: Vec<GcRef>,

    pub(crate) state: GcState,
    pub(crate) kind: CollectionKind,
    pub(crate) inside_atomic: bool,
    pub(crate) current_white: Shade,
    pub(crate) sweep: Option<SweepCursor>,
    pub(crate) running: bool,

    pub(crate) total_bytes: isize,
    pub(crate) debt: isize,
    pub(crate) estimate: usize,
    /// Work done by the current step, in bytes traversed
    pub(crate) work: usize,
    pub(crate) fin_batch: usize,

    pub(crate) upvals: UpvalArena,
    pub(crate) strings: FxHashMap<Box<[u8]>, GcRef>,
    pub(crate) type_metatables: FxHashMap<ObjectKind, GcRef>,
    pub(crate) pins: Vec<Value>,

    main_thread: GcRef,
    pub(crate) running_thread: GcRef,
    registry: GcRef,
    pub(crate) tm_gc: GcRef,
    pub(crate) tm_mode: GcRef,

    pub(crate) finalizer: Option<Box<FinalizerHook>>,
    /// A finalizer hook is running; nested cycles leave `tobefnz` queued
    pub(crate) in_finalizer: bool,
    pub(crate) finalizer_errors: Vec<GcError>,
    pub(crate) stats: GcStats,
    pub(crate) cycle_started: Option<Instant>,
    ready: bool,
    closed: bool,
}

impl Heap {
    /// Create a heap backed by the system allocator
    pub fn new(config: GcConfig) -> GcResult<Self> {
        Self::with_allocator(config, Box::new(SystemAllocator::default()))
    }

    /// Create a heap that books its memory through `allocator`
    pub fn with_allocator(config: GcConfig, allocator: Box<dyn RawAllocator>) -> GcResult<Self> {
        let placeholder = GcRef::new(u32::MAX, 0);
        let mut heap = Self {
            config,
            allocator,
            slots: Vec::new(),
            free_slots: Vec::new(),
            allgc: None,
            finobj: None,
            tobefnz: None,
            fixedgc: None,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            allweak: Vec::new(),
            ephemeron: Vec::new(),
            twups: Vec::new(),
            state: GcState::Pause,
            kind: CollectionKind::Normal,
            inside_atomic: false,
            current_white: Shade::White0,
            sweep: None,
            running: false,
            total_bytes: 0,
            debt: 0,
            estimate: 0,
            work: 0,
            fin_batch: 0,
            upvals: UpvalArena::default(),
            strings: FxHashMap::default(),
            type_metatables: FxHashMap::default(),
            pins: Vec::new(),
            main_thread: placeholder,
            running_thread: placeholder,
            registry: placeholder,
            tm_gc: placeholder,
            tm_mode: placeholder,
            finalizer: None,
            in_finalizer: false,
            finalizer_errors: Vec::new(),
            stats: GcStats::default(),
            cycle_started: None,
            ready: false,
            closed: false,
        };
        heap.config.step_multiplier = heap.config.step_multiplier.max(MIN_STEP_MULTIPLIER);
        heap.bootstrap()?;
        Ok(heap)
    }

    fn bootstrap(&mut self) -> GcResult<()> {
        let main = self.allocate(Object::Thread(Thread::default()))?;
        let index = main.index();
        self.unlink(index)?;
        self.entry_at_mut(index)?.header.list = GcList::Root;
        self.main_thread = main;
        self.running_thread = main;

        self.registry = self.allocate(Object::Table(Table::default()))?;

        self.tm_gc = self.new_str("__gc")?;
        self.fix(self.tm_gc)?;
        self.tm_mode = self.new_str("__mode")?;
        self.fix(self.tm_mode)?;

        // Start with a clean slate: everything so far is the baseline
        self.set_debt(0);
        self.estimate = self.total_bytes();
        self.running = true;
        self.ready = true;
        tracing::debug!(target: "lunar::gc", bytes = self.total_bytes(), "heap created");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Arena
    // ---------------------------------------------------------------------

    pub(crate) fn entry(&self, r: GcRef) -> GcResult<&Entry> {
        match self.slots.get(r.index() as usize) {
            Some(Slot {
                generation,
                entry: Some(entry),
            }) if *generation == r.generation() => Ok(entry),
            _ => Err(GcError::StaleReference(r)),
        }
    }

    pub(crate) fn entry_mut(&mut self, r: GcRef) -> GcResult<&mut Entry> {
        match self.slots.get_mut(r.index() as usize) {
            Some(Slot {
                generation,
                entry: Some(entry),
            }) if *generation == r.generation() => Ok(entry),
            _ => Err(GcError::StaleReference(r)),
        }
    }

    /// Slot reached through a tracking-list link; a vacant slot means the
    /// list is corrupt.
    pub(crate) fn entry_at(&self, index: u32) -> GcResult<&Entry> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or_else(|| GcError::consistency(format!("tracking list links vacant slot {index}")))
    }

    pub(crate) fn entry_at_mut(&mut self, index: u32) -> GcResult<&mut Entry> {
        self.slots
            .get_mut(index as usize)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or_else(|| GcError::consistency(format!("tracking list links vacant slot {index}")))
    }

    pub(crate) fn ref_at(&self, index: u32) -> GcResult<GcRef> {
        self.slots
            .get(index as usize)
            .map(|slot| GcRef::new(index, slot.generation))
            .ok_or_else(|| GcError::consistency(format!("slot {index} out of range")))
    }

    fn insert_slot(&mut self, entry: Entry) -> u32 {
        match self.free_slots.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Vacate a slot, invalidating every handle to it
    pub(crate) fn take_slot(&mut self, index: u32) -> GcResult<Entry> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| GcError::consistency(format!("freeing slot {index} out of range")))?;
        let entry = slot
            .entry
            .take()
            .ok_or_else(|| GcError::consistency(format!("freeing vacant slot {index}")))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(index);
        Ok(entry)
    }

    /// Handles of every object currently in the arena
    pub(crate) fn live_refs(&self) -> Vec<GcRef> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(i, slot)| GcRef::new(i as u32, slot.generation))
            .collect()
    }

    // ---------------------------------------------------------------------
    // Tracking lists
    // ---------------------------------------------------------------------

    pub(crate) fn list_head(&self, list: GcList) -> Option<u32> {
        match list {
            GcList::AllGc => self.allgc,
            GcList::FinObj => self.finobj,
            GcList::ToBeFnz => self.tobefnz,
            GcList::Fixed => self.fixedgc,
            GcList::Root => None,
        }
    }

    pub(crate) fn set_list_head(&mut self, list: GcList, head: Option<u32>) {
        match list {
            GcList::AllGc => self.allgc = head,
            GcList::FinObj => self.finobj = head,
            GcList::ToBeFnz => self.tobefnz = head,
            GcList::Fixed => self.fixedgc = head,
            GcList::Root => {}
        }
    }

    /// Push onto the head of `list`
    pub(crate) fn link(&mut self, index: u32, list: GcList) -> GcResult<()> {
        let head = self.list_head(list);
        let header = &mut self.entry_at_mut(index)?.header;
        header.next = head;
        header.list = list;
        self.set_list_head(list, Some(index));
        Ok(())
    }

    /// Append `indices` to the tail of `list`, preserving their order
    pub(crate) fn append_all(&mut self, indices: &[u32], list: GcList) -> GcResult<()> {
        let mut tail = None;
        let mut cursor = self.list_head(list);
        while let Some(index) = cursor {
            tail = Some(index);
            cursor = self.entry_at(index)?.header.next;
        }
        for &index in indices {
            let header = &mut self.entry_at_mut(index)?.header;
            header.next = None;
            header.list = list;
            match tail {
                None => self.set_list_head(list, Some(index)),
                Some(t) => self.entry_at_mut(t)?.header.next = Some(index),
            }
            tail = Some(index);
        }
        Ok(())
    }

    /// Remove from whatever list the object is on. The sweep cursor is moved
    /// back if it rested on the object.
    pub(crate) fn unlink(&mut self, index: u32) -> GcResult<()> {
        let (list, next) = {
            let header = &self.entry_at(index)?.header;
            (header.list, header.next)
        };
        let mut prev = None;
        let mut cursor = self.list_head(list);
        loop {
            match cursor {
                Some(i) if i == index => break,
                Some(i) => {
                    prev = Some(i);
                    cursor = self.entry_at(i)?.header.next;
                }
                None => {
                    return Err(GcError::consistency(format!(
                        "slot {index} claims list {list:?} but is not on it"
                    )));
                }
            }
        }
        match prev {
            None => self.set_list_head(list, next),
            Some(p) => self.entry_at_mut(p)?.header.next = next,
        }
        if let Some(cursor) = self.sweep.as_mut()
            && cursor.list == list
            && cursor.prev == Some(index)
        {
            cursor.prev = prev;
        }
        self.entry_at_mut(index)?.header.next = None;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Byte accounting
    // ---------------------------------------------------------------------

    /// Book `size` bytes. On refusal, run an emergency full collection with
    /// `pins` protected and retry once.
    pub(crate) fn reserve(&mut self, size: usize, pins: &[Value]) -> GcResult<()> {
        if self.allocator.raw_alloc(size).is_err() {
            if !self.ready || self.closed {
                return Err(GcError::OutOfMemory { requested: size });
            }
            let mark = self.pins.len();
            self.pins.extend_from_slice(pins);
            let collected = self.full_collect(true);
            self.pins.truncate(mark);
            collected?;
            if let Err(err) = self.allocator.raw_alloc(size) {
                tracing::warn!(
                    target: "lunar::gc",
                    requested = err.requested,
                    in_use = err.in_use,
                    "allocation failed after emergency collection"
                );
                return Err(GcError::OutOfMemory { requested: size });
            }
        }
        self.debt = self.debt.saturating_add(size as isize);
        Ok(())
    }

    pub(crate) fn release(&mut self, size: usize) {
        self.allocator.raw_free(size);
        self.debt = self.debt.saturating_sub(size as isize);
    }

    /// Charge an existing object for `size` more bytes
    pub(crate) fn grow(&mut self, r: GcRef, size: usize, pins: &[Value]) -> GcResult<()> {
        let mark = self.pins.len();
        self.pins.push(Value::Object(r));
        let reserved = self.reserve(size, pins);
        self.pins.truncate(mark);
        reserved?;
        self.entry_mut(r)?.header.size += size;
        Ok(())
    }

    pub(crate) fn shrink(&mut self, r: GcRef, size: usize) -> GcResult<()> {
        let header = &mut self.entry_mut(r)?.header;
        header.size = header.size.saturating_sub(size);
        self.release(size);
        Ok(())
    }

    /// Move the debt while keeping `total_bytes + debt` constant. Only the
    /// lower bound is clamped; a debt above the heap size is kept as is.
    pub(crate) fn set_debt(&mut self, debt: isize) {
        let total = self.total_bytes() as isize;
        let debt = debt.max(total.saturating_sub(isize::MAX / 2));
        self.total_bytes = total - debt;
        self.debt = debt;
    }

    /// Bytes currently accounted to live and not-yet-swept objects
    pub fn total_bytes(&self) -> usize {
        (self.total_bytes + self.debt).max(0) as usize
    }

    /// Outstanding allocation debt; positive means a step is due
    pub fn debt(&self) -> isize {
        self.debt
    }

    /// Live bytes as of the last atomic phase, minus everything swept since
    pub fn estimated_live_bytes(&self) -> usize {
        self.estimate
    }

    // ---------------------------------------------------------------------
    // Allocation gateway
    // ---------------------------------------------------------------------

    /// Allocate an object. It starts white, on `allgc`.
    ///
    /// References held by the body survive the emergency collection that a
    /// refused allocation triggers. Allocation never steps the collector;
    /// call [`Heap::check_debt_and_maybe_step`] at a safe point.
    pub fn allocate(&mut self, object: Object) -> GcResult<GcRef> {
        let size = object.footprint();
        let mut pins = Vec::new();
        object.trace(&mut |r| pins.push(Value::Object(r)));
        for &pin in &pins {
            self.check_live(pin)?;
        }
        self.reserve(size, &pins)?;

        let header = GcHeader::new(object.kind(), self.current_white, size);
        let index = self.insert_slot(Entry { header, object });
        self.link(index, GcList::AllGc)?;
        let r = self.ref_at(index)?;
        tracing::trace!(target: "lunar::gc", object = ?r, size, "allocated");
        Ok(r)
    }

    /// Move an object to the fixed list. It stays gray and is never swept.
    pub fn fix(&mut self, r: GcRef) -> GcResult<()> {
        let list = self.entry(r)?.header.list;
        if list != GcList::AllGc {
            return Err(GcError::consistency(format!(
                "only objects on allgc can be fixed, {r:?} is on {list:?}"
            )));
        }
        self.unlink(r.index())?;
        self.entry_mut(r)?.header.marked.white_to_gray();
        self.link(r.index(), GcList::Fixed)
    }

    // ---------------------------------------------------------------------
    // Typed access
    // ---------------------------------------------------------------------

    /// Header of an object
    pub fn header(&self, r: GcRef) -> GcResult<&GcHeader> {
        Ok(&self.entry(r)?.header)
    }

    /// Body of an object
    pub fn object(&self, r: GcRef) -> GcResult<&Object> {
        Ok(&self.entry(r)?.object)
    }

    /// Kind of an object
    pub fn kind_of(&self, r: GcRef) -> GcResult<ObjectKind> {
        Ok(self.entry(r)?.header.kind)
    }

    /// Protect `value` from collection until the matching [`Heap::unpin`].
    ///
    /// Pins are roots. Use them for handles a host holds across an
    /// allocation, which may run an emergency collection. Pins taken inside
    /// a finalizer hook are released when the hook returns.
    pub fn pin(&mut self, value: Value) -> GcResult<()> {
        self.check_live(value)?;
        self.pins.push(value);
        Ok(())
    }

    /// Release the most recent pin
    pub fn unpin(&mut self) -> Option<Value> {
        self.pins.pop()
    }

    /// Run `f` with `value` pinned, releasing the pin even when `f` fails
    pub fn with_pinned<R>(
        &mut self,
        value: Value,
        f: impl FnOnce(&mut Heap) -> GcResult<R>,
    ) -> GcResult<R> {
        self.check_live(value)?;
        let mark = self.pins.len();
        self.pins.push(value);
        let result = f(self);
        self.pins.truncate(mark);
        result
    }

    /// A stored reference must point at an unreclaimed object
    pub(crate) fn check_live(&self, value: Value) -> GcResult<()> {
        match value {
            Value::Object(r) => self.entry(r).map(|_| ()),
            _ => Ok(()),
        }
    }

    pub(crate) fn expect_kind(&self, r: GcRef, expected: ObjectKind) -> GcResult<()> {
        let found = self.kind_of(r)?;
        if found == expected {
            Ok(())
        } else {
            Err(GcError::KindMismatch { expected, found })
        }
    }

    fn body<'a, T>(
        &'a self,
        r: GcRef,
        expected: ObjectKind,
        project: fn(&'a Object) -> Option<&'a T>,
    ) -> GcResult<&'a T> {
        let entry = self.entry(r)?;
        let found = entry.header.kind;
        project(&entry.object).ok_or(GcError::KindMismatch { expected, found })
    }

    fn body_mut<'a, T>(
        &'a mut self,
        r: GcRef,
        expected: ObjectKind,
        project: fn(&'a mut Object) -> Option<&'a mut T>,
    ) -> GcResult<&'a mut T> {
        let entry = self.entry_mut(r)?;
        let found = entry.header.kind;
        project(&mut entry.object).ok_or(GcError::KindMismatch { expected, found })
    }

    /// Borrow a string
    pub fn string(&self, r: GcRef) -> GcResult<&LuaString> {
        self.body(r, ObjectKind::String, Object::as_string)
    }

    /// Borrow a table
    pub fn table(&self, r: GcRef) -> GcResult<&Table> {
        self.body(r, ObjectKind::Table, Object::as_table)
    }

    /// Borrow a script closure
    pub fn lua_closure(&self, r: GcRef) -> GcResult<&LuaClosure> {
        self.body(r, ObjectKind::LuaClosure, Object::as_lua_closure)
    }

    /// Borrow a host closure
    pub fn native_closure(&self, r: GcRef) -> GcResult<&NativeClosure> {
        self.body(r, ObjectKind::NativeClosure, Object::as_native_closure)
    }

    /// Borrow a userdata
    pub fn userdata(&self, r: GcRef) -> GcResult<&Userdata> {
        self.body(r, ObjectKind::Userdata, Object::as_userdata)
    }

    /// Borrow a thread
    pub fn thread(&self, r: GcRef) -> GcResult<&Thread> {
        self.body(r, ObjectKind::Thread, Object::as_thread)
    }

    /// Borrow a prototype
    pub fn proto(&self, r: GcRef) -> GcResult<&Proto> {
        self.body(r, ObjectKind::Proto, Object::as_proto)
    }

    pub(crate) fn table_mut(&mut self, r: GcRef) -> GcResult<&mut Table> {
        self.body_mut(r, ObjectKind::Table, Object::as_table_mut)
    }

    pub(crate) fn native_closure_mut(&mut self, r: GcRef) -> GcResult<&mut NativeClosure> {
        self.body_mut(r, ObjectKind::NativeClosure, Object::as_native_closure_mut)
    }

    pub(crate) fn userdata_mut(&mut self, r: GcRef) -> GcResult<&mut Userdata> {
        self.body_mut(r, ObjectKind::Userdata, Object::as_userdata_mut)
    }

    pub(crate) fn thread_mut(&mut self, r: GcRef) -> GcResult<&mut Thread> {
        self.body_mut(r, ObjectKind::Thread, Object::as_thread_mut)
    }

    pub(crate) fn proto_mut(&mut self, r: GcRef) -> GcResult<&mut Proto> {
        self.body_mut(r, ObjectKind::Proto, Object::as_proto_mut)
    }

    // ---------------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------------

    /// The main thread; never collected
    pub fn main_thread(&self) -> GcRef {
        self.main_thread
    }

    /// The registry table; always reachable
    pub fn registry(&self) -> GcRef {
        self.registry
    }

    /// Thread currently executing
    pub fn running_thread(&self) -> GcRef {
        self.running_thread
    }

    /// Switch the executing thread. It is re-marked at every atomic phase.
    pub fn set_running_thread(&mut self, thread: GcRef) -> GcResult<()> {
        self.expect_kind(thread, ObjectKind::Thread)?;
        self.running_thread = thread;
        Ok(())
    }

    /// Metatable shared by every object of `kind` that has no own metatable
    pub fn type_metatable(&self, kind: ObjectKind) -> Option<GcRef> {
        self.type_metatables.get(&kind).copied()
    }

    /// Set or clear a per-kind metatable
    pub fn set_type_metatable(&mut self, kind: ObjectKind, mt: Option<GcRef>) -> GcResult<()> {
        match mt {
            Some(mt) => {
                self.expect_kind(mt, ObjectKind::Table)?;
                self.type_metatables.insert(kind, mt);
            }
            None => {
                self.type_metatables.remove(&kind);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    /// Number of objects on each tracking list. The main thread is on none.
    pub fn object_count_by_list(&self) -> ListCounts {
        let mut counts = ListCounts::default();
        for slot in &self.slots {
            if let Some(entry) = &slot.entry {
                match entry.header.list {
                    GcList::AllGc => counts.allgc += 1,
                    GcList::FinObj => counts.finobj += 1,
                    GcList::ToBeFnz => counts.tobefnz += 1,
                    GcList::Fixed => counts.fixed += 1,
                    GcList::Root => {}
                }
            }
        }
        counts
    }

    /// Number of objects in the arena, including the main thread
    pub fn object_count(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    /// Color of an object
    pub fn color_of(&self, r: GcRef) -> GcResult<Color> {
        Ok(self.entry(r)?.header.marked.color())
    }

    /// True while the handle still refers to an unreclaimed object
    pub fn is_alive(&self, r: GcRef) -> bool {
        self.entry(r).is_ok()
    }

    /// Unreached in the last completed mark phase and not yet swept
    pub fn is_dead(&self, r: GcRef) -> GcResult<bool> {
        Ok(self.entry(r)?.header.marked.is_dead(self.current_white))
    }

    /// Active configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Collection statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Current white shade
    pub fn current_white(&self) -> Shade {
        self.current_white
    }

    /// Bytes currently booked with the raw allocator
    pub fn allocator_in_use(&self) -> usize {
        self.allocator.in_use()
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    /// Run every pending finalizer, including those of objects that are
    /// still reachable, then free every object.
    pub fn close(mut self) -> GcResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> GcResult<()> {
        if self.closed {
            return Ok(());
        }
        self.separate_to_be_finalized(true)?;
        self.call_all_pending_finalizers()?;
        self.closed = true;

        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.allweak.clear();
        self.ephemeron.clear();
        self.sweep = None;
        for r in self.live_refs() {
            self.free_object(r.index())?;
        }
        for list in [GcList::AllGc, GcList::FinObj, GcList::ToBeFnz, GcList::Fixed] {
            self.set_list_head(list, None);
        }
        self.upvals.release_all(|size| self.allocator.raw_free(size));
        tracing::debug!(
            target: "lunar::gc",
            leaked = self.allocator.in_use(),
            "heap closed"
        );
        Ok(())
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(target: "lunar::gc", error = %err, "failed to close heap");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::LimitedAllocator;

    #[test]
    fn test_heap_bootstrap() {
        let heap = Heap::new(GcConfig::default()).unwrap();
        assert_eq!(heap.state(), GcState::Pause);
        assert!(heap.is_running());

        let counts = heap.object_count_by_list();
        // registry on allgc, "__gc" and "__mode" fixed
        assert_eq!(counts.allgc, 1);
        assert_eq!(counts.fixed, 2);
        assert_eq!(heap.object_count(), 4);
        assert_eq!(heap.header(heap.main_thread()).unwrap().list(), GcList::Root);
        assert_eq!(heap.color_of(heap.tm_gc).unwrap(), Color::Gray);
    }

    #[test]
    fn test_allocation_charges_footprint() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let before = heap.total_bytes();
        let t = heap.allocate(Object::Table(Table::default())).unwrap();
        let size = heap.header(t).unwrap().size();
        assert_eq!(size, Object::Table(Table::default()).footprint());
        assert_eq!(heap.total_bytes(), before + size);
        assert_eq!(heap.allocator_in_use(), heap.total_bytes());
    }

    #[test]
    fn test_new_objects_are_current_white_on_allgc() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let t = heap.new_table().unwrap();
        let header = heap.header(t).unwrap();
        assert_eq!(header.color(), Color::White(heap.current_white()));
        assert_eq!(header.list(), GcList::AllGc);
        assert_eq!(heap.allgc, Some(t.index()));
    }

    #[test]
    fn test_unlink_middle_of_list() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let a = heap.new_table().unwrap();
        let b = heap.new_table().unwrap();
        let c = heap.new_table().unwrap();
        heap.unlink(b.index()).unwrap();
        assert_eq!(heap.entry(c).unwrap().header.next, Some(a.index()));
        assert!(heap.unlink(b.index()).is_err());
    }

    #[test]
    fn test_stale_handle_is_detected() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let t = heap.new_table().unwrap();
        heap.full_collect(false).unwrap();
        assert!(!heap.is_alive(t));
        assert_eq!(heap.table(t).unwrap_err(), GcError::StaleReference(t));

        // The slot is reused under a new generation
        let u = heap.new_table().unwrap();
        assert_eq!(u.index(), t.index());
        assert_ne!(u, t);
    }

    #[test]
    fn test_kind_mismatch() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let s = heap.new_str("x").unwrap();
        assert_eq!(
            heap.table(s).unwrap_err(),
            GcError::KindMismatch {
                expected: ObjectKind::Table,
                found: ObjectKind::String
            }
        );
    }

    #[test]
    fn test_bootstrap_fails_without_memory() {
        let result = Heap::with_allocator(GcConfig::default(), Box::new(LimitedAllocator::new(64)));
        assert!(matches!(result, Err(GcError::OutOfMemory { .. })));
    }

    #[test]
    fn test_close_frees_everything() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let t = heap.new_table().unwrap();
        let registry = heap.registry();
        heap.table_set(registry, Value::Integer(1), Value::Object(t)).unwrap();
        heap.shutdown().unwrap();
        assert_eq!(heap.object_count(), 0);
        assert_eq!(heap.allocator_in_use(), 0);
    }

    #[test]
    fn test_pinned_handle_survives_emergency_collection() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let held = heap.new_table().unwrap();
        heap.pin(Value::Object(held)).unwrap();
        let garbage = heap.new_table().unwrap();
        heap.full_collect(true).unwrap();
        assert!(heap.is_alive(held));
        assert!(!heap.is_alive(garbage));

        assert_eq!(heap.unpin(), Some(Value::Object(held)));
        heap.full_collect(true).unwrap();
        assert!(!heap.is_alive(held));
    }

    #[test]
    fn test_with_pinned_releases_on_error() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let held = heap.new_table().unwrap();
        let result = heap.with_pinned(Value::Object(held), |heap| {
            heap.full_collect(false)?;
            assert!(heap.is_alive(held));
            heap.table_set(held, Value::Nil, Value::Integer(1))
        });
        assert_eq!(result, Err(GcError::InvalidKey));
        assert_eq!(heap.unpin(), None);
    }

    #[test]
    fn test_debt_above_heap_size_is_kept() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let total = heap.total_bytes();
        let debt = total as isize * 1000;
        heap.set_debt(debt);
        assert_eq!(heap.debt(), debt);
        assert_eq!(heap.total_bytes(), total);
    }
}
