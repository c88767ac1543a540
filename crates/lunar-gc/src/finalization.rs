//! `__gc` finalization support
//!
//! An object whose metatable carries a `__gc` field when the metatable is set
//! is moved from `allgc` to `finobj`. When marking finds it unreachable it is
//! moved again to `tobefnz`, resurrected along with everything it references,
//! and handed to the host's finalizer hook a few objects at a time. After its
//! finalizer ran the object is an ordinary `allgc` object and dies with the
//! next cycle that does not reach it.

use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::{GcList, GcRef};
use crate::value::Value;

/// Host callback running `__gc` metamethods.
///
/// Receives the heap, the object being finalized and the metatable's `__gc`
/// value. The collector is stopped while the hook runs; the hook may allocate
/// and mutate freely. A collection the hook requests leaves the remaining
/// queued objects for the calls that follow. A returned error is recorded as
/// [`GcError::Finalizer`] and does not interrupt finalization of other
/// objects.
pub type FinalizerHook = dyn FnMut(&mut Heap, GcRef, Value) -> Result<(), String> + Send;

/// Work charged per finalizer call
pub(crate) const FINALIZE_COST: usize = 50;

impl Heap {
    /// Install the hook that runs `__gc` metamethods
    pub fn set_finalizer_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Heap, GcRef, Value) -> Result<(), String> + Send + 'static,
    {
        self.finalizer = Some(Box::new(hook));
    }

    /// Remove the finalizer hook. Pending objects are still unlinked from
    /// `tobefnz` on schedule, without a call.
    pub fn clear_finalizer_hook(&mut self) {
        self.finalizer = None;
    }

    /// Drain the finalizer failures recorded so far
    pub fn take_finalizer_errors(&mut self) -> Vec<GcError> {
        std::mem::take(&mut self.finalizer_errors)
    }

    /// Objects waiting for their finalizer, in the order they will run
    pub fn pending_finalizers(&self) -> GcResult<Vec<GcRef>> {
        let mut pending = Vec::new();
        let mut cursor = self.tobefnz;
        while let Some(index) = cursor {
            pending.push(self.ref_at(index)?);
            cursor = self.entry_at(index)?.header.next;
        }
        Ok(pending)
    }

    /// Register `obj` for finalization if `mt` has a `__gc` field
    pub(crate) fn check_finalizer(&mut self, obj: GcRef, mt: Option<GcRef>) -> GcResult<()> {
        let Some(mt) = mt else {
            return Ok(());
        };
        let header = &self.entry(obj)?.header;
        if header.marked.is_finalized() || header.list != GcList::AllGc {
            return Ok(());
        }
        if self.table_get(mt, Value::Object(self.tm_gc))?.is_nil() {
            return Ok(());
        }
        if self.state.is_sweep_phase() {
            // The finobj sweep must not take it for dead
            let white = self.current_white;
            self.entry_mut(obj)?.header.marked.make_white(white);
        }
        self.unlink(obj.index())?;
        self.link(obj.index(), GcList::FinObj)?;
        self.entry_mut(obj)?.header.marked.set_finalized();
        tracing::trace!(target: "lunar::gc", object = ?obj, "registered for finalization");
        Ok(())
    }

    /// Move unreached objects (or every object, when `all`) from `finobj` to
    /// the tail of `tobefnz`, keeping their order.
    pub(crate) fn separate_to_be_finalized(&mut self, all: bool) -> GcResult<()> {
        let mut kept = Vec::new();
        let mut moving = Vec::new();
        let mut cursor = self.finobj;
        while let Some(index) = cursor {
            let (white, next) = {
                let header = &self.entry_at(index)?.header;
                (header.marked.is_white(), header.next)
            };
            if all || white {
                moving.push(index);
                // A sweep resting on a moved object resumes at its kept predecessor
                if let Some(sweep) = self.sweep.as_mut()
                    && sweep.list == GcList::FinObj
                    && sweep.prev == Some(index)
                {
                    sweep.prev = kept.last().copied();
                }
            } else {
                kept.push(index);
            }
            cursor = next;
        }
        if moving.is_empty() {
            return Ok(());
        }

        self.finobj = kept.first().copied();
        for (i, &index) in kept.iter().enumerate() {
            self.entry_at_mut(index)?.header.next = kept.get(i + 1).copied();
        }
        self.append_all(&moving, GcList::ToBeFnz)?;
        tracing::trace!(target: "lunar::gc", count = moving.len(), "separated for finalization");
        Ok(())
    }

    /// Resurrect everything waiting for its finalizer
    pub(crate) fn mark_being_finalized(&mut self) -> GcResult<()> {
        let mut cursor = self.tobefnz;
        while let Some(index) = cursor {
            let r = self.ref_at(index)?;
            self.mark_object(r)?;
            cursor = self.entry_at(index)?.header.next;
        }
        Ok(())
    }

    /// Run up to `fin_batch` finalizers and grow the batch. Returns how many
    /// ran.
    pub(crate) fn run_a_few_finalizers(&mut self) -> GcResult<usize> {
        if self.in_finalizer {
            return Ok(0);
        }
        let max = self.config.finalizer_max.max(1);
        let batch = self.fin_batch.clamp(1, max);
        let mut done = 0;
        while done < batch && self.tobefnz.is_some() {
            self.call_one_finalizer()?;
            done += 1;
        }
        self.fin_batch = if self.tobefnz.is_none() {
            0
        } else {
            (self.fin_batch * 2).clamp(1, max)
        };
        Ok(done)
    }

    pub(crate) fn call_all_pending_finalizers(&mut self) -> GcResult<()> {
        while self.tobefnz.is_some() {
            self.call_one_finalizer()?;
        }
        Ok(())
    }

    fn call_one_finalizer(&mut self) -> GcResult<()> {
        let Some(index) = self.tobefnz else {
            return Ok(());
        };
        self.unlink(index)?;
        self.link(index, GcList::AllGc)?;
        let sweeping = self.state.is_sweep_phase();
        let white = self.current_white;
        let marked = &mut self.entry_at_mut(index)?.header.marked;
        marked.clear_finalized();
        if sweeping {
            marked.make_white(white);
        }

        let obj = self.ref_at(index)?;
        let gc = match self.metatable(obj)? {
            Some(mt) => self.table_get(mt, Value::Object(self.tm_gc))?,
            None => Value::Nil,
        };
        if gc.is_nil() {
            return Ok(());
        }
        let Some(mut hook) = self.finalizer.take() else {
            return Ok(());
        };

        let running = self.running;
        self.running = false;
        self.in_finalizer = true;
        let mark = self.pins.len();
        self.pins.push(Value::Object(obj));
        let result = hook(self, obj, gc);
        self.pins.truncate(mark);
        self.in_finalizer = false;
        self.running = running;
        // The hook may have installed a replacement
        if self.finalizer.is_none() {
            self.finalizer = Some(hook);
        }

        self.stats.finalizers_run += 1;
        if let Err(message) = result {
            tracing::warn!(target: "lunar::gc", object = ?obj, %message, "finalizer failed");
            self.stats.finalizer_errors += 1;
            self.finalizer_errors
                .push(GcError::Finalizer { object: obj, message });
        }
        Ok(())
    }
}
