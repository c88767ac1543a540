//! Property tests: random mutator programs interleaved with collector steps
//! must keep the heap consistent after every operation.

use lunar_gc::{Capture, GcConfig, GcRef, Heap, Value};
use parking_lot::Mutex;
use proptest::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::Arc;

const POOL: usize = 8;

/// Registry keys below zero hold the harness fixtures
const GC_METATABLE: i64 = -1;
const COROUTINE: i64 = -2;
const PROTO: i64 = -3;

#[derive(Debug, Clone)]
enum Op {
    /// Allocate a table into pool slot
    Alloc(usize),
    /// `pool[from][key] = pool[to]`
    Link { from: usize, to: usize, key: i64 },
    /// `pool[from][key] = nil`
    Unlink { from: usize, key: i64 },
    /// Drop the registry's reference to a pool slot
    Forget(usize),
    /// Store a pool table as a native closure upvalue
    Capture(usize),
    /// Store a pool table as a userdata's user value
    Wrap(usize),
    /// Give a pool table a metatable with `__gc`
    Register(usize),
    /// Store a pair in one of the weak tables (keys, values, both)
    Weak { table: usize, key: usize, value: usize },
    /// Push a pool table on the coroutine and close over that slot
    OpenClosure(usize),
    /// Close over a pool table directly
    ClosedClosure(usize),
    /// Write a pool table through the cell of a rooted closure
    SetUpvalue { closure: usize, value: usize },
    /// Shrink the coroutine's stack, closing cells above the new top
    Truncate(usize),
    SingleStep,
    Step,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..POOL).prop_map(Op::Alloc),
        4 => (0..POOL, 0..POOL, 0i64..4).prop_map(|(from, to, key)| Op::Link { from, to, key }),
        2 => (0..POOL, 0i64..4).prop_map(|(from, key)| Op::Unlink { from, key }),
        2 => (0..POOL).prop_map(Op::Forget),
        1 => (0..POOL).prop_map(Op::Capture),
        1 => (0..POOL).prop_map(Op::Wrap),
        2 => (0..POOL).prop_map(Op::Register),
        2 => (0..3usize, 0..POOL, 0..POOL)
            .prop_map(|(table, key, value)| Op::Weak { table, key, value }),
        1 => (0..POOL).prop_map(Op::OpenClosure),
        1 => (0..POOL).prop_map(Op::ClosedClosure),
        1 => (0..POOL, 0..POOL).prop_map(|(closure, value)| Op::SetUpvalue { closure, value }),
        1 => (0..4usize).prop_map(Op::Truncate),
        4 => Just(Op::SingleStep),
        1 => Just(Op::Step),
    ]
}

/// Pool slots are rooted in the registry under their index, so every live
/// handle in `pool` stays reachable.
struct Harness {
    heap: Heap,
    pool: Vec<Option<GcRef>>,
    weak: Vec<GcRef>,
    finalized: Arc<Mutex<FxHashMap<GcRef, u32>>>,
}

impl Harness {
    fn new() -> Self {
        let mut heap = Heap::new(GcConfig {
            step_size: 128,
            sweep_max: 4,
            ..GcConfig::default()
        })
        .unwrap();

        let finalized = Arc::new(Mutex::new(FxHashMap::default()));
        let sink = finalized.clone();
        let mut calls = 0u32;
        heap.set_finalizer_hook(move |heap, obj, _| {
            *sink.lock().entry(obj).or_insert(0) += 1;
            calls += 1;
            // Finalizers allocate, and some of them collect
            heap.new_table().map_err(|e| e.to_string())?;
            match calls % 3 {
                0 => heap.full_collect(false).map_err(|e| e.to_string()),
                1 => heap.step_with(0).map(|_| ()).map_err(|e| e.to_string()),
                _ => Ok(()),
            }
        });

        let mut harness = Self {
            heap,
            pool: vec![None; POOL],
            weak: Vec::new(),
            finalized,
        };

        let mt = harness.heap.new_table().unwrap();
        let gc = harness.heap.new_str("__gc").unwrap();
        harness
            .heap
            .table_set(mt, Value::Object(gc), Value::Boolean(true))
            .unwrap();
        harness.set_fixture(GC_METATABLE, mt);

        for (i, mode) in ["k", "v", "kv"].into_iter().enumerate() {
            let t = harness.heap.new_table().unwrap();
            harness.set_fixture(-10 - i as i64, t);
            let mt = harness.heap.new_table().unwrap();
            harness.heap.set_metatable(t, Some(mt)).unwrap();
            let name = harness.heap.new_str("__mode").unwrap();
            let mode = harness.heap.new_str(mode).unwrap();
            harness
                .heap
                .table_set(mt, Value::Object(name), Value::Object(mode))
                .unwrap();
            harness.weak.push(t);
        }

        let coroutine = harness.heap.new_thread().unwrap();
        harness.set_fixture(COROUTINE, coroutine);
        let proto = harness.heap.new_proto(vec![0]).unwrap();
        harness.set_fixture(PROTO, proto);
        harness
    }

    fn set_fixture(&mut self, key: i64, r: GcRef) {
        let registry = self.heap.registry();
        self.heap
            .table_set(registry, Value::Integer(key), Value::Object(r))
            .unwrap();
    }

    fn fixture(&self, key: i64) -> GcRef {
        let registry = self.heap.registry();
        self.heap
            .table_get(registry, Value::Integer(key))
            .unwrap()
            .as_object()
            .unwrap()
    }

    fn set_root(&mut self, slot: usize, value: Value) {
        let registry = self.heap.registry();
        self.heap
            .table_set(registry, Value::Integer(slot as i64), value)
            .unwrap();
    }

    fn root_of(&self, slot: usize) -> Option<GcRef> {
        let registry = self.heap.registry();
        self.heap
            .table_get(registry, Value::Integer(slot as i64))
            .unwrap()
            .as_object()
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Alloc(slot) => {
                let t = self.heap.new_table().unwrap();
                self.pool[slot] = Some(t);
                self.set_root(slot, Value::Object(t));
            }
            Op::Link { from, to, key } => {
                if let (Some(a), Some(b)) = (self.pool[from], self.pool[to]) {
                    self.heap
                        .table_set(a, Value::Integer(key), Value::Object(b))
                        .unwrap();
                }
            }
            Op::Unlink { from, key } => {
                if let Some(a) = self.pool[from] {
                    self.heap.table_set(a, Value::Integer(key), Value::Nil).unwrap();
                }
            }
            Op::Forget(slot) => {
                self.pool[slot] = None;
                self.set_root(slot, Value::Nil);
            }
            Op::Capture(slot) => {
                if let Some(t) = self.pool[slot] {
                    let host = self.heap.new_native_closure(0, vec![Value::Nil]).unwrap();
                    self.set_root(POOL + slot, Value::Object(host));
                    self.heap
                        .set_native_upvalue(host, 0, Value::Object(t))
                        .unwrap();
                }
            }
            Op::Wrap(slot) => {
                if let Some(t) = self.pool[slot] {
                    let u = self.heap.new_userdata(8).unwrap();
                    self.set_root(2 * POOL + slot, Value::Object(u));
                    self.heap.set_user_value(u, Value::Object(t)).unwrap();
                }
            }
            Op::Register(slot) => {
                if let Some(t) = self.pool[slot] {
                    let mt = self.fixture(GC_METATABLE);
                    self.heap.set_metatable(t, Some(mt)).unwrap();
                }
            }
            Op::Weak { table, key, value } => {
                if let (Some(k), Some(v)) = (self.pool[key], self.pool[value]) {
                    // A weak-values table with object keys would hold its
                    // keys forever
                    let key = match table {
                        1 => Value::Integer(key as i64),
                        _ => Value::Object(k),
                    };
                    self.heap
                        .table_set(self.weak[table], key, Value::Object(v))
                        .unwrap();
                }
            }
            Op::OpenClosure(slot) => {
                if let Some(t) = self.pool[slot] {
                    let coroutine = self.fixture(COROUTINE);
                    let proto = self.fixture(PROTO);
                    self.heap.push(coroutine, Value::Object(t)).unwrap();
                    let top = self.heap.thread(coroutine).unwrap().stack().len() - 1;
                    let closure = self
                        .heap
                        .new_lua_closure(proto, &[Capture::Open { thread: coroutine, slot: top }])
                        .unwrap();
                    self.set_root(3 * POOL + slot, Value::Object(closure));
                }
            }
            Op::ClosedClosure(slot) => {
                if let Some(t) = self.pool[slot] {
                    let proto = self.fixture(PROTO);
                    let closure = self
                        .heap
                        .new_lua_closure(proto, &[Capture::Closed(Value::Object(t))])
                        .unwrap();
                    self.set_root(3 * POOL + slot, Value::Object(closure));
                }
            }
            Op::SetUpvalue { closure, value } => {
                if let (Some(c), Some(v)) = (self.root_of(3 * POOL + closure), self.pool[value]) {
                    let cell = self.heap.lua_closure(c).unwrap().upvalues()[0];
                    self.heap.upvalue_set(cell, Value::Object(v)).unwrap();
                }
            }
            Op::Truncate(len) => {
                let coroutine = self.fixture(COROUTINE);
                self.heap.truncate(coroutine, len).unwrap();
            }
            Op::SingleStep => {
                self.heap.single_step().unwrap();
            }
            Op::Step => self.heap.step().unwrap(),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_heap_stays_consistent(ops in prop::collection::vec(op(), 1..200)) {
        let mut harness = Harness::new();
        let baseline = harness.heap.object_count();
        for op in &ops {
            harness.apply(op);
            prop_assert!(harness.heap.verify().is_ok(), "verify failed after {:?}", op);
            for r in harness.pool.iter().flatten() {
                prop_assert!(harness.heap.is_alive(*r), "rooted {:?} collected", r);
            }
            for (r, count) in harness.finalized.lock().iter() {
                prop_assert!(*count == 1, "{:?} finalized {} times", r, count);
            }
        }

        let registry = harness.heap.registry();
        for slot in 0..4 * POOL {
            harness.heap
                .table_set(registry, Value::Integer(slot as i64), Value::Nil)
                .unwrap();
        }
        let coroutine = harness.fixture(COROUTINE);
        harness.heap.truncate(coroutine, 0).unwrap();
        // Collections inside finalizers may leave some queued for later
        for _ in 0..32 {
            harness.heap.full_collect(false).unwrap();
            if harness.heap.pending_finalizers().unwrap().is_empty() {
                break;
            }
        }
        harness.heap.full_collect(false).unwrap();
        harness.heap.full_collect(false).unwrap();
        prop_assert!(harness.heap.pending_finalizers().unwrap().is_empty());
        prop_assert_eq!(harness.heap.object_count(), baseline);
        prop_assert_eq!(harness.heap.upvalue_count(), 0);
        harness.heap.verify().unwrap();
    }

    #[test]
    fn prop_strings_are_interned_once(words in prop::collection::vec("[a-z]{1,8}", 1..50)) {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let mut refs = Vec::new();
        for word in &words {
            refs.push(heap.new_str(word).unwrap());
            heap.single_step().unwrap();
        }
        for (word, r) in words.iter().zip(&refs) {
            // Every step may collect the unrooted strings; a rebuilt
            // string must match the live one when there is one
            let again = heap.new_str(word).unwrap();
            if heap.is_alive(*r) {
                prop_assert_eq!(again, *r);
            }
            prop_assert_eq!(heap.string(again).unwrap().as_bytes(), word.as_bytes());
        }
        heap.verify().unwrap();
    }
}
