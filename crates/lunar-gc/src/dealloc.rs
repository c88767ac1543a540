//! Deallocation dispatch

use crate::error::GcResult;
use crate::heap::Heap;
use crate::objects::Object;

impl Heap {
    /// Destroy the object in slot `index`, which must already be off every
    /// tracking list. Releases whatever the object owns outside the arena:
    /// its intern table entry, its upvalue cells, or its open cells.
    pub(crate) fn free_object(&mut self, index: u32) -> GcResult<()> {
        let r = self.ref_at(index)?;
        {
            let entry = self.entry_at(index)?;
            if entry.header.kind != entry.object.kind() {
                let (tag, body) = (entry.header.kind, entry.object.kind());
                return Err(self.consistency_failure(format!(
                    "{r:?} tagged {tag:?} but holds a {body:?}"
                )));
            }
        }
        let entry = self.take_slot(index)?;
        let size = entry.header.size;

        match entry.object {
            Object::String(s) => {
                if s.is_short() && self.strings.get(s.as_bytes()) == Some(&r) {
                    self.strings.remove(s.as_bytes());
                }
            }
            Object::LuaClosure(closure) => {
                for &id in closure.upvalues.iter() {
                    self.release_upvalue(id);
                }
            }
            Object::Thread(thread) => {
                self.close_detached_upvalues(&thread.stack, &thread.open_upvalues);
                if thread.in_twups {
                    self.twups.retain(|&t| t != r);
                }
            }
            Object::Table(_)
            | Object::NativeClosure(_)
            | Object::Userdata(_)
            | Object::Proto(_) => {}
        }

        self.release(size);
        self.stats.last_objects_freed += 1;
        self.stats.last_bytes_freed += size;
        self.stats.total_objects_freed += 1;
        Ok(())
    }
}
