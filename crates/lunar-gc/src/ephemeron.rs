//! Weak tables and ephemerons
//!
//! A table whose metatable has a `__mode` string containing `k` and/or `v`
//! holds its keys and/or values weakly:
//!
//! - `v`: keys are marked, values are not. Entries whose value died are
//!   removed after marking.
//! - `k`: an ephemeron table. A value is marked only once its key is. Marking
//!   iterates to a fixpoint so chains through several tables resolve.
//! - `kv`: nothing is marked through the table.
//!
//! Strings are values, not objects, as far as weakness goes: they are marked
//! on sight and never cleared.

use crate::error::GcResult;
use crate::heap::Heap;
use crate::object::GcRef;
use crate::objects::NODE_SIZE;
use crate::value::{Key, Value};

/// Which half of a table's entries is held weakly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakMode {
    /// `__mode` contains `k`
    Keys,
    /// `__mode` contains `v`
    Values,
    /// `__mode` contains both
    Both,
}

impl WeakMode {
    /// Parse a `__mode` string
    pub fn parse(mode: &[u8]) -> Option<Self> {
        match (mode.contains(&b'k'), mode.contains(&b'v')) {
            (true, true) => Some(WeakMode::Both),
            (true, false) => Some(WeakMode::Keys),
            (false, true) => Some(WeakMode::Values),
            (false, false) => None,
        }
    }
}

impl Heap {
    /// Weakness declared by a metatable's `__mode` field
    pub(crate) fn weak_mode(&self, metatable: Option<GcRef>) -> GcResult<Option<WeakMode>> {
        let Some(mt) = metatable else {
            return Ok(None);
        };
        match self.table_get(mt, Value::Object(self.tm_mode))? {
            Value::Object(mode) => Ok(self
                .object(mode)?
                .as_string()
                .and_then(|s| WeakMode::parse(s.as_bytes()))),
            _ => Ok(None),
        }
    }

    /// Weakness of a table, if any
    pub fn table_weak_mode(&self, t: GcRef) -> GcResult<Option<WeakMode>> {
        let metatable = self.table(t)?.metatable;
        self.weak_mode(metatable)
    }

    /// Whether a weak entry holding `value` must be dropped. Strings are
    /// marked and kept; non-collectable values are never cleared.
    pub(crate) fn is_cleared(&mut self, value: Value) -> GcResult<bool> {
        let Value::Object(r) = value else {
            return Ok(false);
        };
        let entry = self.entry(r)?;
        if entry.object.as_string().is_some() {
            self.mark_object(r)?;
            return Ok(false);
        }
        Ok(entry.header.marked.is_white())
    }

    fn is_white_value(&self, value: Value) -> GcResult<bool> {
        match value {
            Value::Object(r) => Ok(self.entry(r)?.header.marked.is_white()),
            _ => Ok(false),
        }
    }

    fn snapshot(&self, t: GcRef) -> GcResult<Vec<(Key, Value)>> {
        Ok(self.table(t)?.iter().map(|(k, v)| (*k, *v)).collect())
    }

    pub(crate) fn traverse_weak_table(&mut self, t: GcRef, mode: WeakMode) -> GcResult<()> {
        match mode {
            WeakMode::Values => self.traverse_weak_value(t),
            WeakMode::Keys => self.traverse_ephemeron(t).map(|_| ()),
            WeakMode::Both => {
                self.allweak.push(t);
                Ok(())
            }
        }
    }

    /// Mark the keys of a weak-valued table
    fn traverse_weak_value(&mut self, t: GcRef) -> GcResult<()> {
        let mut has_clears = false;
        for (key, value) in self.snapshot(t)? {
            if let Some(k) = key.as_object() {
                self.mark_object(k)?;
            }
            if !has_clears && self.is_cleared(value)? {
                has_clears = true;
            }
        }
        if self.inside_atomic && has_clears {
            self.weak.push(t);
        } else {
            self.grayagain.push(t);
        }
        Ok(())
    }

    /// Mark the values whose keys are already marked. Returns whether
    /// anything was marked.
    pub(crate) fn traverse_ephemeron(&mut self, t: GcRef) -> GcResult<bool> {
        let mut marked = false;
        let mut has_clears = false;
        // Entries with both key and value white
        let mut white_white = false;
        for (key, value) in self.snapshot(t)? {
            if self.is_cleared(key.to_value())? {
                has_clears = true;
                if self.is_white_value(value)? {
                    white_white = true;
                }
            } else if self.is_white_value(value)? {
                marked = true;
                self.mark_value(value)?;
            }
        }
        if !self.inside_atomic {
            self.grayagain.push(t);
        } else if white_white {
            self.ephemeron.push(t);
        } else if has_clears {
            self.allweak.push(t);
        }
        Ok(marked)
    }

    /// Retraverse ephemeron tables until no new value gets marked
    pub(crate) fn converge_ephemerons(&mut self) -> GcResult<()> {
        let mut rounds = 0usize;
        loop {
            let pending = std::mem::take(&mut self.ephemeron);
            let mut changed = false;
            for t in pending {
                if self.traverse_ephemeron(t)? {
                    self.propagate_all()?;
                    changed = true;
                }
            }
            rounds += 1;
            if !changed {
                break;
            }
        }
        tracing::trace!(target: "lunar::gc", rounds, "ephemerons converged");
        Ok(())
    }

    /// Remove entries with unmarked keys
    pub(crate) fn clear_keys(&mut self, tables: &[GcRef]) -> GcResult<()> {
        for &t in tables {
            for (key, _) in self.snapshot(t)? {
                if self.is_cleared(key.to_value())? {
                    self.remove_weak_entry(t, &key)?;
                }
            }
        }
        Ok(())
    }

    /// Remove entries with unmarked values
    pub(crate) fn clear_values(&mut self, tables: &[GcRef]) -> GcResult<()> {
        for &t in tables {
            for (key, value) in self.snapshot(t)? {
                if self.is_cleared(value)? {
                    self.remove_weak_entry(t, &key)?;
                }
            }
        }
        Ok(())
    }

    fn remove_weak_entry(&mut self, t: GcRef, key: &Key) -> GcResult<()> {
        if self.table_mut(t)?.entries.remove(key).is_some() {
            self.shrink(t, NODE_SIZE)?;
        }
        Ok(())
    }
}
