//! Write barriers
//!
//! While the collector keeps the tri-color invariant (propagate and atomic),
//! storing a white reference into a black object must be repaired:
//! - Forward barrier (Dijkstra-style): gray the stored object. Used for
//!   objects written rarely, such as userdata, closures and prototypes.
//! - Backward barrier: re-gray the owner and queue it on `grayagain` so it is
//!   rescanned in the atomic phase. Used for tables, which are written often.
//! - Upvalue barrier: marking the value written into a closed cell.
//!
//! During sweep and pause the invariant is not needed and every barrier is a
//! no-op.

use crate::error::GcResult;
use crate::heap::Heap;
use crate::object::{GcRef, ObjectKind};
use crate::upvalue::{UpvalId, UpvalState};
use crate::value::Value;

impl Heap {
    /// Notify the collector that `value` was stored into `owner`. Picks the
    /// barrier matching the owner's kind.
    pub fn on_field_write(&mut self, owner: GcRef, value: Value) -> GcResult<()> {
        match self.kind_of(owner)? {
            ObjectKind::Table => self.barrier_back(owner, value),
            _ => self.barrier(owner, value),
        }
    }

    /// Forward barrier
    pub fn barrier(&mut self, owner: GcRef, value: Value) -> GcResult<()> {
        let Value::Object(target) = value else {
            return Ok(());
        };
        let owner_black = self.entry(owner)?.header.marked.is_black();
        let target_white = self.entry(target)?.header.marked.is_white();
        if owner_black && target_white && self.state.keeps_invariant() {
            self.stats.forward_barriers += 1;
            tracing::trace!(target: "lunar::gc", ?owner, ?target, "forward barrier");
            self.mark_object(target)?;
        }
        Ok(())
    }

    /// Backward barrier for tables
    pub fn barrier_back(&mut self, table: GcRef, value: Value) -> GcResult<()> {
        let Value::Object(target) = value else {
            return Ok(());
        };
        let target_white = self.entry(target)?.header.marked.is_white();
        let keeps_invariant = self.state.keeps_invariant();
        let owner = &mut self.entry_mut(table)?.header.marked;
        if owner.is_black() && target_white && keeps_invariant {
            owner.black_to_gray();
            self.grayagain.push(table);
            self.stats.back_barriers += 1;
            tracing::trace!(target: "lunar::gc", ?table, "back barrier");
        }
        Ok(())
    }

    /// Barrier for a closed upvalue cell: its value is reachable from
    /// possibly-black closures, so it is marked outright.
    pub(crate) fn upvalue_barrier(&mut self, id: UpvalId) -> GcResult<()> {
        if !self.state.keeps_invariant() {
            return Ok(());
        }
        if let UpvalState::Closed(Value::Object(target)) = self.upvals.get(id)?.state {
            self.mark_object(target)?;
        }
        Ok(())
    }
}
