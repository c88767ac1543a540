//! Upvalue cells
//!
//! Cells are shared between closures and reference counted rather than
//! collected. While open, a cell aliases a slot of its thread's stack; closing
//! copies the slot's value into the cell.

use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::GcRef;
use crate::value::Value;

pub(crate) const UPVAL_SIZE: usize = 40;

/// Identifier of an upvalue cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpvalId(u32);

/// Where a cell's value lives
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalState {
    /// Aliases `thread.stack[slot]`
    Open {
        /// Owning thread
        thread: GcRef,
        /// Stack slot
        slot: usize,
        /// A closure using this cell was traversed while it was open
        touched: bool,
    },
    /// Owns its value
    Closed(Value),
}

#[derive(Debug, Clone)]
pub(crate) struct UpVal {
    pub(crate) state: UpvalState,
    pub(crate) refcount: u32,
}

/// How a new closure obtains each of its upvalues
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Capture {
    /// A local of `thread` that is still on the stack
    Open {
        /// Thread owning the local
        thread: GcRef,
        /// Stack slot of the local
        slot: usize,
    },
    /// A cell already used by the enclosing closure
    Shared(UpvalId),
    /// A fresh closed cell holding `value`
    Closed(Value),
}

#[derive(Debug, Default)]
pub(crate) struct UpvalArena {
    cells: Vec<Option<UpVal>>,
    free: Vec<u32>,
}

impl UpvalArena {
    pub(crate) fn insert(&mut self, cell: UpVal) -> UpvalId {
        match self.free.pop() {
            Some(i) => {
                self.cells[i as usize] = Some(cell);
                UpvalId(i)
            }
            None => {
                self.cells.push(Some(cell));
                UpvalId((self.cells.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn get(&self, id: UpvalId) -> GcResult<&UpVal> {
        self.cells
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(GcError::StaleUpvalue(id))
    }

    pub(crate) fn get_mut(&mut self, id: UpvalId) -> GcResult<&mut UpVal> {
        self.cells
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(GcError::StaleUpvalue(id))
    }

    fn remove(&mut self, id: UpvalId) -> Option<UpVal> {
        let cell = self.cells.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        Some(cell)
    }

    pub(crate) fn len(&self) -> usize {
        self.cells.len() - self.free.len()
    }

    /// Drop every cell, reporting each cell's size to `free`
    pub(crate) fn release_all(&mut self, mut free: impl FnMut(usize)) {
        for _ in self.cells.iter().flatten() {
            free(UPVAL_SIZE);
        }
        self.cells.clear();
        self.free.clear();
    }
}

impl Heap {
    /// Open cell for `thread.stack[slot]`, created on first use
    pub fn find_upvalue(&mut self, thread: GcRef, slot: usize) -> GcResult<UpvalId> {
        let th = self.thread(thread)?;
        if slot >= th.stack.len() {
            return Err(GcError::StackSlot {
                slot,
                len: th.stack.len(),
            });
        }
        for &id in &th.open_upvalues {
            if let UpvalState::Open { slot: s, .. } = self.upvals.get(id)?.state
                && s == slot
            {
                return Ok(id);
            }
        }

        self.reserve(UPVAL_SIZE, &[Value::Object(thread)])?;
        let id = self.upvals.insert(UpVal {
            state: UpvalState::Open {
                thread,
                slot,
                touched: true,
            },
            refcount: 0,
        });
        let th = self.thread_mut(thread)?;
        th.open_upvalues.push(id);
        if !th.in_twups {
            th.in_twups = true;
            self.twups.push(thread);
        }
        Ok(id)
    }

    pub(crate) fn new_closed_upvalue(&mut self, value: Value) -> GcResult<UpvalId> {
        self.reserve(UPVAL_SIZE, &[value])?;
        Ok(self.upvals.insert(UpVal {
            state: UpvalState::Closed(value),
            refcount: 0,
        }))
    }

    /// Close every open cell of `thread` at or above `level`. Cells no
    /// closure uses any more are released instead.
    pub fn close_upvalues(&mut self, thread: GcRef, level: usize) -> GcResult<()> {
        let closing = {
            let th = self.thread(thread)?;
            let mut closing = Vec::new();
            for &id in &th.open_upvalues {
                if let UpvalState::Open { slot, .. } = self.upvals.get(id)?.state
                    && slot >= level
                {
                    closing.push((id, th.stack.get(slot).copied().unwrap_or_default()));
                }
            }
            closing
        };
        if closing.is_empty() {
            return Ok(());
        }
        self.thread_mut(thread)?
            .open_upvalues
            .retain(|id| !closing.iter().any(|(c, _)| c == id));

        for (id, value) in closing {
            let cell = self.upvals.get_mut(id)?;
            if cell.refcount == 0 {
                self.free_upvalue(id);
            } else {
                cell.state = UpvalState::Closed(value);
                self.upvalue_barrier(id)?;
            }
        }
        Ok(())
    }

    /// Close the cells of a thread that is being freed
    pub(crate) fn close_detached_upvalues(&mut self, stack: &[Value], cells: &[UpvalId]) {
        for &id in cells {
            match self.upvals.get_mut(id) {
                Ok(cell) if cell.refcount > 0 => {
                    if let UpvalState::Open { slot, .. } = cell.state {
                        let value = stack.get(slot).copied().unwrap_or_default();
                        cell.state = UpvalState::Closed(value);
                    }
                }
                Ok(_) => self.free_upvalue(id),
                Err(_) => {}
            }
        }
    }

    /// Current value of a cell
    pub fn upvalue_get(&self, id: UpvalId) -> GcResult<Value> {
        match self.upvals.get(id)?.state {
            UpvalState::Open { thread, slot, .. } => {
                Ok(self.thread(thread)?.stack.get(slot).copied().unwrap_or_default())
            }
            UpvalState::Closed(value) => Ok(value),
        }
    }

    /// Write through a cell
    pub fn upvalue_set(&mut self, id: UpvalId, value: Value) -> GcResult<()> {
        match self.upvals.get(id)?.state {
            UpvalState::Open { thread, slot, .. } => {
                let th = self.thread_mut(thread)?;
                let len = th.stack.len();
                let target = th
                    .stack
                    .get_mut(slot)
                    .ok_or(GcError::StackSlot { slot, len })?;
                *target = value;
                Ok(())
            }
            UpvalState::Closed(_) => {
                self.upvals.get_mut(id)?.state = UpvalState::Closed(value);
                self.upvalue_barrier(id)
            }
        }
    }

    /// Whether the cell still aliases a stack slot
    pub fn upvalue_is_open(&self, id: UpvalId) -> GcResult<bool> {
        Ok(matches!(self.upvals.get(id)?.state, UpvalState::Open { .. }))
    }

    /// Number of live cells
    pub fn upvalue_count(&self) -> usize {
        self.upvals.len()
    }

    pub(crate) fn retain_upvalue(&mut self, id: UpvalId) -> GcResult<()> {
        self.upvals.get_mut(id)?.refcount += 1;
        Ok(())
    }

    /// Drop one closure's use of a cell
    pub(crate) fn release_upvalue(&mut self, id: UpvalId) {
        if let Ok(cell) = self.upvals.get_mut(id) {
            cell.refcount = cell.refcount.saturating_sub(1);
            if cell.refcount == 0 && matches!(cell.state, UpvalState::Closed(_)) {
                self.free_upvalue(id);
            }
        }
    }

    fn free_upvalue(&mut self, id: UpvalId) {
        if self.upvals.remove(id).is_some() {
            self.release(UPVAL_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GcConfig;

    fn heap_with_stack(values: &[Value]) -> (Heap, GcRef) {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let thread = heap.main_thread();
        for &v in values {
            heap.push(thread, v).unwrap();
        }
        (heap, thread)
    }

    #[test]
    fn test_find_upvalue_reuses_open_cell() {
        let (mut heap, thread) = heap_with_stack(&[Value::Integer(1), Value::Integer(2)]);
        let a = heap.find_upvalue(thread, 1).unwrap();
        let b = heap.find_upvalue(thread, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.upvalue_count(), 1);
        assert_eq!(heap.upvalue_get(a).unwrap(), Value::Integer(2));
        assert!(heap.find_upvalue(thread, 5).is_err());
    }

    #[test]
    fn test_open_cell_aliases_stack() {
        let (mut heap, thread) = heap_with_stack(&[Value::Integer(1)]);
        let id = heap.find_upvalue(thread, 0).unwrap();
        heap.upvalue_set(id, Value::Boolean(true)).unwrap();
        assert_eq!(heap.thread(thread).unwrap().stack()[0], Value::Boolean(true));
    }

    #[test]
    fn test_close_copies_value_or_frees_unused_cell() {
        let (mut heap, thread) = heap_with_stack(&[Value::Integer(10), Value::Integer(20)]);
        let proto = heap.new_proto(Vec::new()).unwrap();
        let used = heap.find_upvalue(thread, 0).unwrap();
        let _unused = heap.find_upvalue(thread, 1).unwrap();
        let closure = heap
            .new_lua_closure(proto, &[Capture::Shared(used)])
            .unwrap();
        assert_eq!(heap.upvalue_count(), 2);

        heap.close_upvalues(thread, 0).unwrap();
        assert_eq!(heap.upvalue_count(), 1);
        assert!(!heap.upvalue_is_open(used).unwrap());

        // The closed cell no longer follows the stack
        heap.stack_set(thread, 0, Value::Nil).unwrap();
        let cell = heap.lua_closure(closure).unwrap().upvalues()[0];
        assert_eq!(heap.upvalue_get(cell).unwrap(), Value::Integer(10));
        assert!(heap.thread(thread).unwrap().open_upvalues().is_empty());
    }

    #[test]
    fn test_release_frees_closed_cell_at_zero() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let id = heap.new_closed_upvalue(Value::Integer(3)).unwrap();
        heap.retain_upvalue(id).unwrap();
        heap.retain_upvalue(id).unwrap();
        heap.release_upvalue(id);
        assert!(heap.upvalue_get(id).is_ok());
        heap.release_upvalue(id);
        assert_eq!(heap.upvalue_get(id).unwrap_err(), GcError::StaleUpvalue(id));
    }
}
