//! Collector state machine and pacing
//!
//! A cycle advances through [`GcState`] one bounded step at a time. Each step
//! reports the work it did (roughly, bytes traversed or swept), and
//! [`Heap::step`] keeps stepping until the allocation debt, scaled by the
//! step multiplier, is paid off.

use crate::error::GcResult;
use crate::finalization::FINALIZE_COST;
use crate::heap::{Heap, MIN_STEP_MULTIPLIER};
use crate::object::GcList;
use crate::objects::REF_SIZE;
use std::time::{Duration, Instant};

/// Divisor applied to the debt before scaling it by the step multiplier
const STEP_MUL_ADJ: isize = 200;
/// Divisor applied to the live estimate before scaling it by the pause
const PAUSE_ADJ: usize = 100;

/// Collector phase, in cycle order
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcState {
    /// Incremental marking
    Propagate = 0,
    /// Marking is about to finish in one indivisible step
    Atomic = 1,
    /// Sweeping `allgc`
    SweepAllGc = 2,
    /// Sweeping `finobj`
    SweepFinObj = 3,
    /// Sweeping `tobefnz`
    SweepToBeFnz = 4,
    /// Sweep bookkeeping
    SweepEnd = 5,
    /// Running pending finalizers
    CallFinalizers = 6,
    /// Between cycles
    Pause = 7,
}

impl GcState {
    /// Whether black objects must not point at white ones. Barriers are
    /// only active in these states.
    pub fn keeps_invariant(self) -> bool {
        self <= GcState::Atomic
    }

    /// Any of the sweep states
    pub fn is_sweep_phase(self) -> bool {
        (GcState::SweepAllGc..=GcState::SweepEnd).contains(&self)
    }
}

/// Why the current cycle is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionKind {
    /// Paced by allocation debt or requested by the host
    #[default]
    Normal,
    /// Forced by a refused allocation; never runs finalizers or shrinks stacks
    Emergency,
}

/// GC statistics
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Completed cycles
    pub cycles: u64,
    /// Full collections forced by allocation failure
    pub emergency_collections: u64,
    /// Objects freed by the last completed cycle
    pub last_objects_freed: usize,
    /// Bytes freed by the last completed cycle
    pub last_bytes_freed: usize,
    /// Objects freed since the heap was created
    pub total_objects_freed: u64,
    /// Finalizer hook invocations
    pub finalizers_run: u64,
    /// Finalizer hook invocations that returned an error
    pub finalizer_errors: u64,
    /// Wall time from the start to the end of the last completed cycle
    pub last_cycle_time: Duration,
    /// Forward barriers that marked an object
    pub forward_barriers: u64,
    /// Backward barriers that re-grayed a table
    pub back_barriers: u64,
}

impl Heap {
    /// Current phase
    pub fn state(&self) -> GcState {
        self.state
    }

    /// Whether debt-driven collection is enabled
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Disable debt-driven collection. Explicit and emergency collections
    /// still run.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Re-enable debt-driven collection
    pub fn restart(&mut self) {
        self.set_debt(0);
        self.running = true;
    }

    /// Set the pause percentage, returning the previous value
    pub fn set_pause(&mut self, pause: u32) -> u32 {
        std::mem::replace(&mut self.config.pause, pause)
    }

    /// Set the step multiplier (at least 40), returning the previous value
    pub fn set_step_multiplier(&mut self, step_multiplier: u32) -> u32 {
        std::mem::replace(
            &mut self.config.step_multiplier,
            step_multiplier.max(MIN_STEP_MULTIPLIER),
        )
    }

    /// Advance the collector by one bounded unit of work. Returns the work
    /// done.
    pub fn single_step(&mut self) -> GcResult<usize> {
        if self.config.verify_steps {
            self.verify()?;
        }
        let from = self.state;
        let work = self.advance()?;
        tracing::trace!(target: "lunar::gc", ?from, to = ?self.state, work, "step");
        if self.config.verify_steps {
            self.verify()?;
        }
        Ok(work)
    }

    fn advance(&mut self) -> GcResult<usize> {
        match self.state {
            GcState::Pause => {
                self.start_cycle();
                self.work = self.strings.len() * REF_SIZE;
                self.restart_collection()?;
                self.state = GcState::Propagate;
                Ok(self.work)
            }
            GcState::Propagate => {
                self.work = 0;
                self.propagate_mark()?;
                if self.gray.is_empty() {
                    self.state = GcState::Atomic;
                }
                Ok(self.work)
            }
            GcState::Atomic => {
                self.work = 0;
                self.propagate_all()?;
                let propagated = self.work;
                let work = propagated + self.atomic()?;
                self.enter_sweep();
                self.estimate = self.total_bytes();
                Ok(work)
            }
            GcState::SweepAllGc => self.sweep_step(GcState::SweepFinObj, Some(GcList::FinObj)),
            GcState::SweepFinObj => self.sweep_step(GcState::SweepToBeFnz, Some(GcList::ToBeFnz)),
            GcState::SweepToBeFnz => self.sweep_step(GcState::SweepEnd, None),
            GcState::SweepEnd => {
                self.sweep_end()?;
                self.state = GcState::CallFinalizers;
                Ok(0)
            }
            GcState::CallFinalizers => {
                // A cycle nested in a finalizer leaves the queue to the outer call
                if self.tobefnz.is_some()
                    && self.kind != CollectionKind::Emergency
                    && !self.in_finalizer
                {
                    Ok(self.run_a_few_finalizers()? * FINALIZE_COST)
                } else {
                    self.state = GcState::Pause;
                    self.finish_cycle();
                    Ok(0)
                }
            }
        }
    }

    fn start_cycle(&mut self) {
        self.cycle_started = Some(Instant::now());
        self.stats.last_objects_freed = 0;
        self.stats.last_bytes_freed = 0;
        tracing::debug!(
            target: "lunar::gc",
            kind = ?self.kind,
            heap_bytes = self.total_bytes(),
            objects = self.object_count(),
            "GC cycle starting"
        );
    }

    fn finish_cycle(&mut self) {
        self.stats.cycles += 1;
        if let Some(started) = self.cycle_started.take() {
            self.stats.last_cycle_time = started.elapsed();
        }
        tracing::debug!(
            target: "lunar::gc",
            reclaimed_bytes = self.stats.last_bytes_freed,
            reclaimed_objects = self.stats.last_objects_freed,
            live_bytes = self.estimate,
            cycle_us = self.stats.last_cycle_time.as_micros() as u64,
            "GC cycle complete"
        );
    }

    /// Pay off the allocation debt with collector work. While collection is
    /// stopped, only postpones the next check.
    pub fn step(&mut self) -> GcResult<()> {
        let step_size = self.config.step_size as isize;
        if !self.running {
            self.set_debt(step_size.saturating_mul(-10));
            return Ok(());
        }
        let stepmul = self.config.step_multiplier as isize;
        let mut debt = if self.debt <= 0 {
            0
        } else {
            (self.debt / STEP_MUL_ADJ + 1).saturating_mul(stepmul)
        };
        loop {
            let work = self.single_step()?;
            debt = debt.saturating_sub(work as isize);
            if debt <= -step_size || self.state == GcState::Pause {
                break;
            }
        }
        if self.state == GcState::Pause {
            self.apply_pause();
        } else {
            self.set_debt((debt / stepmul).saturating_mul(STEP_MUL_ADJ));
            self.run_a_few_finalizers()?;
        }
        Ok(())
    }

    /// Host-requested step. With `kb == 0` performs one basic step;
    /// otherwise adds `kb` kilobytes of debt and steps if that made the
    /// debt positive. Runs even while collection is stopped. Returns true
    /// if a cycle finished.
    pub fn step_with(&mut self, kb: usize) -> GcResult<bool> {
        let running = std::mem::replace(&mut self.running, true);
        let result = if kb == 0 {
            self.set_debt(0);
            self.step().map(|()| 1)
        } else {
            let debt = (kb.saturating_mul(1024) as isize).saturating_add(self.debt);
            self.set_debt(debt);
            self.check_debt_and_maybe_step().map(|()| debt)
        };
        self.running = running;
        let debt = result?;
        Ok(debt > 0 && self.state == GcState::Pause)
    }

    /// Step until the collector reaches `state`
    pub fn run_until(&mut self, state: GcState) -> GcResult<()> {
        while self.state != state {
            self.single_step()?;
        }
        Ok(())
    }

    /// Run a complete cycle from scratch. An emergency collection skips
    /// finalizers and stack shrinking.
    pub fn full_collect(&mut self, emergency: bool) -> GcResult<()> {
        let previous = self.kind;
        if emergency {
            self.kind = CollectionKind::Emergency;
            self.stats.emergency_collections += 1;
            tracing::warn!(
                target: "lunar::gc",
                heap_bytes = self.total_bytes(),
                "emergency collection"
            );
        }
        let result = self.run_full_cycle();
        self.kind = previous;
        result?;
        self.apply_pause();
        Ok(())
    }

    fn run_full_cycle(&mut self) -> GcResult<()> {
        if self.state.keeps_invariant() {
            // Whiten everything; nothing can be dead yet
            self.enter_sweep();
        }
        self.run_until(GcState::Pause)?;
        self.single_step()?;
        self.run_until(GcState::CallFinalizers)?;
        self.run_until(GcState::Pause)
    }

    /// Run a normal full collection
    pub fn force_full_cycle(&mut self) -> GcResult<()> {
        self.full_collect(false)
    }

    /// Step the collector if allocation debt is due. Call at mutator safe
    /// points.
    pub fn check_debt_and_maybe_step(&mut self) -> GcResult<()> {
        if self.debt > 0 {
            self.step()?;
        }
        Ok(())
    }

    /// Set the debt so the next cycle starts once the heap reaches
    /// `estimate * pause / 100`
    fn apply_pause(&mut self) {
        let estimate = self.estimate / PAUSE_ADJ;
        let threshold = estimate.saturating_mul(self.config.pause as usize);
        let threshold = threshold.min(isize::MAX as usize) as isize;
        self.set_debt((self.total_bytes() as isize).saturating_sub(threshold));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GcConfig;
    use crate::value::Value;

    fn heap() -> Heap {
        Heap::new(GcConfig::default()).unwrap()
    }

    #[test]
    fn test_state_order() {
        assert!(GcState::Propagate.keeps_invariant());
        assert!(GcState::Atomic.keeps_invariant());
        assert!(!GcState::SweepAllGc.keeps_invariant());
        assert!(GcState::SweepEnd.is_sweep_phase());
        assert!(!GcState::CallFinalizers.is_sweep_phase());
        assert!(!GcState::Pause.is_sweep_phase());
    }

    #[test]
    fn test_cycle_visits_every_state() {
        let mut heap = heap();
        let mut seen = vec![heap.state()];
        loop {
            heap.single_step().unwrap();
            if seen.last() != Some(&heap.state()) {
                seen.push(heap.state());
            }
            if heap.state() == GcState::Pause {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                GcState::Pause,
                GcState::Propagate,
                GcState::Atomic,
                GcState::SweepAllGc,
                GcState::SweepFinObj,
                GcState::SweepToBeFnz,
                GcState::SweepEnd,
                GcState::CallFinalizers,
                GcState::Pause,
            ]
        );
        assert_eq!(heap.stats().cycles, 1);
    }

    #[test]
    fn test_current_white_flips_each_cycle() {
        let mut heap = heap();
        let white = heap.current_white();
        heap.full_collect(false).unwrap();
        assert_eq!(heap.current_white(), white.other());
        heap.full_collect(false).unwrap();
        assert_eq!(heap.current_white(), white);
    }

    #[test]
    fn test_step_multiplier_is_clamped() {
        let mut heap = heap();
        assert_eq!(heap.set_step_multiplier(10), 200);
        assert_eq!(heap.config().step_multiplier, MIN_STEP_MULTIPLIER);
        assert_eq!(heap.set_pause(150), 200);
        assert_eq!(heap.config().pause, 150);
    }

    #[test]
    fn test_stopped_collector_only_postpones() {
        let mut heap = heap();
        heap.stop();
        for _ in 0..100 {
            heap.new_table().unwrap();
        }
        heap.step().unwrap();
        assert_eq!(heap.state(), GcState::Pause);
        assert_eq!(heap.debt(), -10 * heap.config().step_size as isize);

        heap.restart();
        assert!(heap.is_running());
        assert_eq!(heap.debt(), 0);
    }

    #[test]
    fn test_step_with_reports_cycle_end() {
        let mut heap = heap();
        let mut finished = false;
        for _ in 0..1000 {
            if heap.step_with(0).unwrap() {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert!(heap.stats().cycles >= 1);
    }

    #[test]
    fn test_large_step_with_finishes_cycle() {
        let mut heap = heap();
        for _ in 0..64 {
            heap.new_table().unwrap();
        }
        assert_eq!(heap.state(), GcState::Pause);
        // A debt far above the heap size pays for a whole cycle at once
        assert!(heap.step_with(1 << 20).unwrap());
        assert_eq!(heap.stats().cycles, 1);
        assert_eq!(heap.state(), GcState::Pause);
    }

    #[test]
    fn test_full_collect_mid_cycle() {
        let mut heap = heap();
        let keep = heap.new_table().unwrap();
        let garbage = heap.new_table().unwrap();
        heap.push(heap.main_thread(), Value::Object(keep)).unwrap();
        heap.single_step().unwrap();
        heap.single_step().unwrap();
        assert!(heap.state().keeps_invariant());

        heap.full_collect(false).unwrap();
        assert_eq!(heap.state(), GcState::Pause);
        assert!(heap.is_alive(keep));
        assert!(!heap.is_alive(garbage));
    }

    #[test]
    fn test_estimate_exact_after_full_cycle() {
        let mut heap = heap();
        for i in 0..50 {
            let t = heap.new_table().unwrap();
            if i % 2 == 0 {
                let registry = heap.registry();
                heap.table_set(registry, Value::Integer(i), Value::Object(t)).unwrap();
            }
        }
        heap.full_collect(false).unwrap();
        assert_eq!(heap.estimated_live_bytes(), heap.total_bytes());
        let estimate = heap.estimated_live_bytes();
        heap.full_collect(false).unwrap();
        assert_eq!(heap.estimated_live_bytes(), estimate);
    }

    #[test]
    fn test_pause_sets_threshold() {
        let mut heap = heap();
        heap.full_collect(false).unwrap();
        let threshold = heap.estimated_live_bytes() / 100 * 200;
        assert_eq!(
            heap.debt(),
            heap.total_bytes() as isize - threshold as isize
        );
        assert!(heap.debt() < 0);
    }

    #[test]
    fn test_emergency_collection_is_counted() {
        let mut heap = heap();
        heap.full_collect(true).unwrap();
        assert_eq!(heap.stats().emergency_collections, 1);
        assert_eq!(heap.kind, CollectionKind::Normal);
    }
}
