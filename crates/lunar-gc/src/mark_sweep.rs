//! Incremental mark and sweep
//!
//! Marking is driven by the gray list: each propagation step pops one gray
//! object, blackens it and grays its white children. Strings and userdata have
//! no traversal of their own and go straight to black. Tables and threads that
//! must be revisited are queued on `grayagain` and rescanned atomically.
//!
//! Sweeping walks one tracking list at a time, at most `sweep_max` objects per
//! step, freeing objects that still carry the previous white and whitening the
//! rest for the next cycle.

use crate::collector::{CollectionKind, GcState};
use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::{GcList, GcRef, ObjectKind, Trace};
use crate::objects::Object;
use crate::upvalue::UpvalState;
use crate::value::Value;
use std::mem;

/// Position of an in-progress sweep: the last surviving object visited on
/// `list`, or `None` when the next object to visit is the list head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepCursor {
    pub(crate) list: GcList,
    pub(crate) prev: Option<u32>,
}

impl SweepCursor {
    pub(crate) fn start(list: GcList) -> Self {
        Self { list, prev: None }
    }
}

enum Reached {
    Black,
    Userdata { metatable: Option<GcRef>, user_value: Value },
    Gray,
}

impl Heap {
    // ---------------------------------------------------------------------
    // Marking
    // ---------------------------------------------------------------------

    pub(crate) fn mark_value(&mut self, value: Value) -> GcResult<()> {
        match value {
            Value::Object(r) => self.mark_object(r),
            _ => Ok(()),
        }
    }

    /// Gray a white object; no-op for anything already reached
    pub(crate) fn mark_object(&mut self, r: GcRef) -> GcResult<()> {
        if self.entry(r)?.header.marked.is_white() {
            self.really_mark_object(r)
        } else {
            Ok(())
        }
    }

    fn really_mark_object(&mut self, r: GcRef) -> GcResult<()> {
        let mut current = r;
        loop {
            let (reached, size) = {
                let entry = self.entry_mut(current)?;
                entry.header.marked.white_to_gray();
                let reached = match &entry.object {
                    Object::String(_) => Reached::Black,
                    Object::Userdata(u) => Reached::Userdata {
                        metatable: u.metatable,
                        user_value: u.user_value,
                    },
                    _ => Reached::Gray,
                };
                if !matches!(reached, Reached::Gray) {
                    entry.header.marked.gray_to_black();
                }
                (reached, entry.header.size)
            };
            match reached {
                Reached::Black => {
                    self.work += size;
                    return Ok(());
                }
                Reached::Gray => {
                    self.gray.push(current);
                    return Ok(());
                }
                Reached::Userdata {
                    metatable,
                    user_value,
                } => {
                    self.work += size;
                    if let Some(mt) = metatable {
                        self.mark_object(mt)?;
                    }
                    // Follow the user value iteratively
                    match user_value {
                        Value::Object(next) if self.entry(next)?.header.marked.is_white() => {
                            current = next;
                        }
                        _ => return Ok(()),
                    }
                }
            }
        }
    }

    fn mark_children(&mut self, r: GcRef) -> GcResult<()> {
        let mut children = Vec::new();
        self.object(r)?.trace(&mut |child| children.push(child));
        for child in children {
            self.mark_object(child)?;
        }
        Ok(())
    }

    pub(crate) fn mark_metatables(&mut self) -> GcResult<()> {
        let metatables: Vec<GcRef> = self.type_metatables.values().copied().collect();
        for mt in metatables {
            self.mark_object(mt)?;
        }
        Ok(())
    }

    fn mark_pins(&mut self) -> GcResult<()> {
        for i in 0..self.pins.len() {
            self.mark_value(self.pins[i])?;
        }
        Ok(())
    }

    /// Clear every gray list and mark the root set
    pub(crate) fn restart_collection(&mut self) -> GcResult<()> {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.allweak.clear();
        self.ephemeron.clear();
        self.mark_object(self.main_thread())?;
        self.mark_object(self.registry())?;
        self.mark_metatables()?;
        self.mark_pins()?;
        self.mark_being_finalized()
    }

    // ---------------------------------------------------------------------
    // Traversal
    // ---------------------------------------------------------------------

    /// Blacken one gray object and gray its children
    pub(crate) fn propagate_mark(&mut self) -> GcResult<()> {
        let Some(r) = self.gray.pop() else {
            return Ok(());
        };
        let (kind, size) = {
            let header = &mut self.entry_mut(r)?.header;
            if !header.marked.is_gray() {
                let color = header.marked.color();
                return Err(self.consistency_failure(format!(
                    "{r:?} popped from the gray list while {color:?}"
                )));
            }
            header.marked.gray_to_black();
            (header.kind, header.size)
        };
        match kind {
            ObjectKind::Table => self.traverse_table(r)?,
            ObjectKind::LuaClosure => self.traverse_lua_closure(r)?,
            ObjectKind::NativeClosure | ObjectKind::Proto => self.traverse_plain(r)?,
            ObjectKind::Thread => {
                self.entry_mut(r)?.header.marked.black_to_gray();
                self.grayagain.push(r);
                self.traverse_thread(r)?;
            }
            ObjectKind::String | ObjectKind::Userdata => {
                return Err(self.consistency_failure(format!("{kind:?} {r:?} on the gray list")));
            }
        }
        self.work += size;
        Ok(())
    }

    pub(crate) fn propagate_all(&mut self) -> GcResult<()> {
        while !self.gray.is_empty() {
            self.propagate_mark()?;
        }
        Ok(())
    }

    fn traverse_table(&mut self, r: GcRef) -> GcResult<()> {
        let metatable = self.table(r)?.metatable;
        let mode = self.weak_mode(metatable)?;
        if let Some(mt) = metatable {
            self.mark_object(mt)?;
        }
        match mode {
            None => self.mark_children(r),
            Some(mode) => {
                // Weak tables stay gray so they are revisited atomically
                self.entry_mut(r)?.header.marked.black_to_gray();
                self.traverse_weak_table(r, mode)
            }
        }
    }

    /// Prototypes and host closures hold only strong references. A
    /// prototype's cache is dropped if the cached closure was not reached.
    fn traverse_plain(&mut self, r: GcRef) -> GcResult<()> {
        let cache = self.object(r)?.as_proto().and_then(|p| p.cache);
        if let Some(cache) = cache
            && self.entry(cache)?.header.marked.is_white()
        {
            self.proto_mut(r)?.cache = None;
        }
        self.mark_children(r)
    }

    fn traverse_lua_closure(&mut self, r: GcRef) -> GcResult<()> {
        let (proto, cells) = {
            let closure = self.lua_closure(r)?;
            (closure.proto, closure.upvalues.clone())
        };
        self.mark_object(proto)?;
        for id in cells.iter().copied() {
            match self.upvals.get(id)?.state {
                UpvalState::Open { .. } if !self.inside_atomic => {
                    if let UpvalState::Open { touched, .. } = &mut self.upvals.get_mut(id)?.state {
                        *touched = true;
                    }
                }
                _ => {
                    let value = self.upvalue_get(id)?;
                    self.mark_value(value)?;
                }
            }
        }
        Ok(())
    }

    fn traverse_thread(&mut self, r: GcRef) -> GcResult<()> {
        self.mark_children(r)?;
        let inside_atomic = self.inside_atomic;
        let emergency = self.kind == CollectionKind::Emergency;
        let thread = self.thread_mut(r)?;
        if inside_atomic {
            if !thread.in_twups && !thread.open_upvalues.is_empty() {
                thread.in_twups = true;
                self.twups.push(r);
            }
        } else if !emergency && thread.stack.capacity() > 2 * thread.stack.len() {
            thread.stack.shrink_to_fit();
        }
        Ok(())
    }

    /// Mark the values of touched open cells whose thread was not reached.
    /// Threads that were reached are traversed atomically anyway.
    fn remark_upvalues(&mut self) -> GcResult<()> {
        for thread in mem::take(&mut self.twups) {
            let (keep, cells) = {
                let marked = self.entry(thread)?.header.marked;
                let th = self.thread(thread)?;
                (
                    marked.is_gray() && !th.open_upvalues.is_empty(),
                    th.open_upvalues.clone(),
                )
            };
            if keep {
                self.twups.push(thread);
                continue;
            }
            self.thread_mut(thread)?.in_twups = false;
            for id in cells {
                if let UpvalState::Open { touched: true, .. } = self.upvals.get(id)?.state {
                    if let UpvalState::Open { touched, .. } = &mut self.upvals.get_mut(id)?.state {
                        *touched = false;
                    }
                    let value = self.upvalue_get(id)?;
                    self.mark_value(value)?;
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Atomic phase
    // ---------------------------------------------------------------------

    /// Finish marking in one go. Returns the work done.
    pub(crate) fn atomic(&mut self) -> GcResult<usize> {
        self.inside_atomic = true;
        let result = self.atomic_inner();
        self.inside_atomic = false;
        result
    }

    fn atomic_inner(&mut self) -> GcResult<usize> {
        let grayagain = mem::take(&mut self.grayagain);
        self.work = 0;

        self.mark_object(self.running_thread)?;
        self.mark_object(self.registry())?;
        self.mark_metatables()?;
        self.mark_pins()?;
        self.remark_upvalues()?;
        self.propagate_all()?;
        let mut work = self.work;

        self.gray = grayagain;
        self.propagate_all()?;
        self.work = 0;
        self.converge_ephemerons()?;

        // Everything strongly reachable is marked now
        let weak = self.weak.clone();
        let allweak = self.allweak.clone();
        self.clear_values(&weak)?;
        self.clear_values(&allweak)?;
        let (orig_weak, orig_allweak) = (self.weak.len(), self.allweak.len());
        work += self.work;

        // Resurrect objects about to be finalized, with everything they use
        self.separate_to_be_finalized(false)?;
        self.fin_batch = 1;
        self.mark_being_finalized()?;
        self.propagate_all()?;
        self.work = 0;
        self.converge_ephemerons()?;

        let ephemeron = self.ephemeron.clone();
        let allweak = self.allweak.clone();
        self.clear_keys(&ephemeron)?;
        self.clear_keys(&allweak)?;
        let weak = self.weak[orig_weak..].to_vec();
        let allweak = self.allweak[orig_allweak..].to_vec();
        self.clear_values(&weak)?;
        self.clear_values(&allweak)?;

        self.current_white = self.current_white.other();
        work += self.work;
        Ok(work)
    }

    // ---------------------------------------------------------------------
    // Sweep
    // ---------------------------------------------------------------------

    pub(crate) fn enter_sweep(&mut self) {
        self.state = GcState::SweepAllGc;
        self.sweep = Some(SweepCursor::start(GcList::AllGc));
    }

    /// Sweep up to `count` objects. Returns true once the list is exhausted.
    fn sweep_list(&mut self, mut cursor: SweepCursor, count: usize) -> GcResult<bool> {
        let white = self.current_white;
        for _ in 0..count {
            let next = match cursor.prev {
                None => self.list_head(cursor.list),
                Some(prev) => self.entry_at(prev)?.header.next,
            };
            let Some(index) = next else {
                self.sweep = None;
                return Ok(true);
            };
            let entry = self.entry_at_mut(index)?;
            if entry.header.marked.is_dead(white) {
                let after = entry.header.next;
                match cursor.prev {
                    None => self.set_list_head(cursor.list, after),
                    Some(prev) => self.entry_at_mut(prev)?.header.next = after,
                }
                self.free_object(index)?;
            } else {
                entry.header.marked.make_white(white);
                cursor.prev = Some(index);
            }
        }
        let exhausted = match cursor.prev {
            None => self.list_head(cursor.list).is_none(),
            Some(prev) => self.entry_at(prev)?.header.next.is_none(),
        };
        self.sweep = if exhausted { None } else { Some(cursor) };
        Ok(exhausted)
    }

    /// One sweep increment. When the current list is done, move to `next`.
    pub(crate) fn sweep_step(
        &mut self,
        next_state: GcState,
        next_list: Option<GcList>,
    ) -> GcResult<usize> {
        if let Some(cursor) = self.sweep {
            let debt_before = self.debt;
            let exhausted = self.sweep_list(cursor, self.config.sweep_max)?;
            let freed = (debt_before - self.debt).max(0) as usize;
            self.estimate = self.estimate.saturating_sub(freed);
            if !exhausted {
                return Ok(self.config.sweep_max * SWEEP_COST);
            }
        }
        self.state = next_state;
        self.sweep = next_list.map(SweepCursor::start);
        Ok(0)
    }

    /// End of sweep: whiten the main thread and shrink the intern table
    pub(crate) fn sweep_end(&mut self) -> GcResult<()> {
        let white = self.current_white;
        let main = self.main_thread();
        self.entry_mut(main)?.header.marked.make_white(white);
        if self.strings.len() < self.strings.capacity() / 4 {
            self.strings.shrink_to(self.strings.len() * 2);
        }
        Ok(())
    }

    pub(crate) fn consistency_failure(&self, message: String) -> GcError {
        tracing::error!(target: "lunar::gc", state = ?self.state, "{message}");
        GcError::InternalConsistency(message)
    }
}

/// Work charged per swept object
pub(crate) const SWEEP_COST: usize = (24 + 4) / 4;

#[cfg(test)]
mod tests {
    use crate::collector::GcState;
    use crate::color::Color;
    use crate::heap::{GcConfig, Heap};
    use crate::upvalue::Capture;
    use crate::value::Value;

    fn heap() -> Heap {
        Heap::new(GcConfig::default()).unwrap()
    }

    #[test]
    fn test_restart_grays_roots() {
        let mut heap = heap();
        heap.single_step().unwrap();
        assert_eq!(heap.state(), GcState::Propagate);
        assert_eq!(heap.color_of(heap.main_thread()).unwrap(), Color::Gray);
        assert_eq!(heap.color_of(heap.registry()).unwrap(), Color::Gray);
        assert_eq!(heap.gray.len(), 2);
    }

    #[test]
    fn test_strings_go_straight_to_black() {
        let mut heap = heap();
        let s = heap.new_str("leaf").unwrap();
        heap.mark_object(s).unwrap();
        assert_eq!(heap.color_of(s).unwrap(), Color::Black);
        assert!(heap.gray.is_empty());
    }

    #[test]
    fn test_userdata_marks_metatable_and_user_value_chain() {
        let mut heap = heap();
        let mt = heap.new_table().unwrap();
        let a = heap.new_userdata(0).unwrap();
        let b = heap.new_userdata(0).unwrap();
        heap.set_metatable(a, Some(mt)).unwrap();
        heap.set_user_value(a, Value::Object(b)).unwrap();

        heap.mark_object(a).unwrap();
        assert_eq!(heap.color_of(a).unwrap(), Color::Black);
        assert_eq!(heap.color_of(b).unwrap(), Color::Black);
        assert_eq!(heap.color_of(mt).unwrap(), Color::Gray);
        assert_eq!(heap.gray, vec![mt]);
    }

    #[test]
    fn test_thread_stays_gray_on_grayagain() {
        let mut heap = heap();
        let main = heap.main_thread();
        heap.single_step().unwrap();
        while heap.grayagain.is_empty() {
            heap.single_step().unwrap();
        }
        assert!(heap.grayagain.contains(&main));
        assert_eq!(heap.color_of(main).unwrap(), Color::Gray);
    }

    #[test]
    fn test_propagating_white_object_is_consistency_error() {
        let mut heap = heap();
        let t = heap.new_table().unwrap();
        heap.gray.push(t);
        assert!(matches!(
            heap.propagate_mark(),
            Err(crate::GcError::InternalConsistency(_))
        ));
    }

    #[test]
    fn test_open_upvalue_is_touched_not_marked() {
        let mut heap = heap();
        let thread = heap.new_thread().unwrap();
        let value = heap.new_table().unwrap();
        heap.push(thread, Value::Object(value)).unwrap();
        let proto = heap.new_proto(Vec::new()).unwrap();
        let closure = heap
            .new_lua_closure(proto, &[Capture::Open { thread, slot: 0 }])
            .unwrap();
        // Only the closure is rooted; the thread itself is unreachable
        let registry = heap.registry();
        heap.table_set(registry, Value::Integer(1), Value::Object(closure)).unwrap();

        heap.full_collect(false).unwrap();
        // Remarked through the touched cell even though its thread died
        assert!(!heap.is_alive(thread));
        assert!(heap.is_alive(value));
        let cell = heap.lua_closure(closure).unwrap().upvalues()[0];
        assert!(!heap.upvalue_is_open(cell).unwrap());
        assert_eq!(heap.upvalue_get(cell).unwrap(), Value::Object(value));
    }

    #[test]
    fn test_proto_cache_cleared_when_closure_dies() {
        let mut heap = heap();
        let proto = heap.new_proto(Vec::new()).unwrap();
        let registry = heap.registry();
        heap.table_set(registry, Value::Integer(1), Value::Object(proto)).unwrap();
        let closure = heap.new_lua_closure(proto, &[]).unwrap();
        assert!(heap.proto_set_cache(proto, closure).unwrap());

        heap.full_collect(false).unwrap();
        assert!(!heap.is_alive(closure));
        assert_eq!(heap.proto(proto).unwrap().cache(), None);
    }

    #[test]
    fn test_sweep_whitens_survivors_and_frees_dead() {
        let mut heap = heap();
        let live = heap.new_table().unwrap();
        let dead = heap.new_table().unwrap();
        let registry = heap.registry();
        heap.table_set(registry, Value::Integer(1), Value::Object(live)).unwrap();

        heap.run_until(GcState::SweepAllGc).unwrap();
        assert!(heap.is_dead(dead).unwrap());
        assert!(!heap.is_dead(live).unwrap());

        heap.run_until(GcState::SweepEnd).unwrap();
        assert!(!heap.is_alive(dead));
        assert_eq!(
            heap.color_of(live).unwrap(),
            Color::White(heap.current_white())
        );
    }

    #[test]
    fn test_sweep_respects_sweep_max() {
        let mut heap = Heap::new(GcConfig {
            sweep_max: 4,
            ..GcConfig::default()
        })
        .unwrap();
        for _ in 0..20 {
            heap.new_table().unwrap();
        }
        heap.run_until(GcState::SweepAllGc).unwrap();
        let before = heap.object_count();
        heap.single_step().unwrap();
        assert_eq!(heap.object_count(), before - 4);
        assert_eq!(heap.state(), GcState::SweepAllGc);
    }
}
