//! Heap consistency checks
//!
//! [`Heap::verify`] walks the whole heap and checks the collector's
//! invariants at a step boundary. It is linear in the heap size and meant
//! for tests and stress runs.

use crate::error::GcResult;
use crate::heap::Heap;
use crate::object::{GcList, GcRef, Trace};
use crate::objects::Object;
use crate::upvalue::UpvalState;
use crate::value::Value;
use rustc_hash::{FxHashMap, FxHashSet};

impl Heap {
    /// Check the heap's invariants:
    ///
    /// - every tracking list is well formed and together they cover the heap
    /// - every object's accounted size matches its footprint
    /// - references held by objects that are not dead point at live objects
    /// - while marking, no black object references a white one, and every
    ///   gray object sits in exactly one gray list
    pub fn verify(&self) -> GcResult<()> {
        self.verify_lists()?;
        self.verify_objects()?;
        if self.state.keeps_invariant() {
            self.verify_gray_lists()?;
            self.verify_no_black_to_white()?;
        }
        Ok(())
    }

    fn verify_lists(&self) -> GcResult<()> {
        let mut seen = FxHashSet::default();
        for list in [GcList::AllGc, GcList::FinObj, GcList::ToBeFnz, GcList::Fixed] {
            let mut cursor = self.list_head(list);
            while let Some(index) = cursor {
                if !seen.insert(index) {
                    return Err(self.consistency_failure(format!(
                        "slot {index} reached twice while walking {list:?}"
                    )));
                }
                let header = &self.entry_at(index)?.header;
                if header.list != list {
                    return Err(self.consistency_failure(format!(
                        "slot {index} on {list:?} claims {:?}",
                        header.list
                    )));
                }
                if list == GcList::FinObj && !header.marked.is_finalized() {
                    return Err(self.consistency_failure(format!(
                        "slot {index} on finobj without its finalized bit"
                    )));
                }
                cursor = header.next;
            }
        }
        // The main thread is the only object outside every list
        if seen.len() + 1 != self.object_count() {
            return Err(self.consistency_failure(format!(
                "tracking lists hold {} objects, arena holds {}",
                seen.len() + 1,
                self.object_count()
            )));
        }
        Ok(())
    }

    fn verify_objects(&self) -> GcResult<()> {
        let white = self.current_white;
        for r in self.live_refs() {
            let entry = self.entry(r)?;
            if entry.header.kind != entry.object.kind() {
                return Err(self.consistency_failure(format!(
                    "{r:?} tagged {:?} but holds a {:?}",
                    entry.header.kind,
                    entry.object.kind()
                )));
            }
            if entry.header.size != entry.object.footprint() {
                return Err(self.consistency_failure(format!(
                    "{r:?} accounted at {} bytes, footprint is {}",
                    entry.header.size,
                    entry.object.footprint()
                )));
            }
            if entry.header.marked.is_dead(white) {
                continue;
            }
            for child in self.references_of(&entry.object)? {
                if self.entry(child).is_err() {
                    return Err(self.consistency_failure(format!(
                        "{r:?} references reclaimed {child:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Direct references, including the values of a closure's closed cells
    fn references_of(&self, object: &Object) -> GcResult<Vec<GcRef>> {
        let mut refs = Vec::new();
        object.trace(&mut |r| refs.push(r));
        if let Object::LuaClosure(closure) = object {
            for &id in closure.upvalues.iter() {
                match self.upvals.get(id)?.state {
                    UpvalState::Closed(Value::Object(r)) => refs.push(r),
                    UpvalState::Open { thread, .. } => refs.push(thread),
                    UpvalState::Closed(_) => {}
                }
            }
        }
        Ok(refs)
    }

    fn verify_gray_lists(&self) -> GcResult<()> {
        let mut membership: FxHashMap<GcRef, usize> = FxHashMap::default();
        let lists = [
            ("gray", &self.gray),
            ("grayagain", &self.grayagain),
            ("weak", &self.weak),
            ("allweak", &self.allweak),
            ("ephemeron", &self.ephemeron),
        ];
        for (name, list) in lists {
            for &r in list.iter() {
                if !self.entry(r)?.header.marked.is_gray() {
                    return Err(self.consistency_failure(format!(
                        "{r:?} on {name} is {:?}",
                        self.entry(r)?.header.color()
                    )));
                }
                *membership.entry(r).or_default() += 1;
            }
        }
        for r in self.live_refs() {
            let header = &self.entry(r)?.header;
            if !header.marked.is_gray() || header.list == GcList::Fixed {
                continue;
            }
            match membership.get(&r).copied().unwrap_or(0) {
                1 => {}
                n => {
                    return Err(self.consistency_failure(format!(
                        "gray {r:?} found in {n} gray lists"
                    )));
                }
            }
        }
        Ok(())
    }

    fn verify_no_black_to_white(&self) -> GcResult<()> {
        for r in self.live_refs() {
            let entry = self.entry(r)?;
            if !entry.header.marked.is_black() {
                continue;
            }
            let mut refs = Vec::new();
            entry.object.trace(&mut |child| refs.push(child));
            if let Object::LuaClosure(closure) = &entry.object {
                for &id in closure.upvalues.iter() {
                    if let UpvalState::Closed(Value::Object(child)) = self.upvals.get(id)?.state {
                        refs.push(child);
                    }
                }
            }
            for child in refs {
                if self.entry(child)?.header.marked.is_white() {
                    return Err(self.consistency_failure(format!(
                        "black {r:?} references white {child:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::color::Color;
    use crate::error::GcError;
    use crate::heap::{GcConfig, Heap};
    use crate::value::Value;

    #[test]
    fn test_fresh_heap_verifies() {
        let heap = Heap::new(GcConfig::default()).unwrap();
        heap.verify().unwrap();
    }

    #[test]
    fn test_every_step_verifies() {
        let mut heap = Heap::new(GcConfig {
            verify_steps: true,
            ..GcConfig::default()
        })
        .unwrap();
        let registry = heap.registry();
        for i in 0..20 {
            let t = heap.new_table().unwrap();
            if i % 3 == 0 {
                heap.table_set(registry, Value::Integer(i), Value::Object(t)).unwrap();
            }
        }
        heap.full_collect(false).unwrap();
        heap.verify().unwrap();
    }

    #[test]
    fn test_detects_black_to_white_edge() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let t = heap.new_table().unwrap();
        let registry = heap.registry();
        heap.table_set(registry, Value::Integer(1), Value::Object(t)).unwrap();
        heap.single_step().unwrap();
        while heap.color_of(t).unwrap() != Color::Black {
            heap.single_step().unwrap();
        }
        // Bypass the barrier
        let fresh = heap.new_table().unwrap();
        heap.table_mut(t)
            .unwrap()
            .entries
            .insert(crate::Key::Integer(1), Value::Object(fresh));
        heap.grow(t, crate::objects::NODE_SIZE, &[]).unwrap();
        assert!(matches!(heap.verify(), Err(GcError::InternalConsistency(_))));
    }

    #[test]
    fn test_detects_size_drift() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let t = heap.new_table().unwrap();
        heap.entry_mut(t).unwrap().header.size += 1;
        assert!(matches!(heap.verify(), Err(GcError::InternalConsistency(_))));
        heap.entry_mut(t).unwrap().header.size -= 1;
    }
}
