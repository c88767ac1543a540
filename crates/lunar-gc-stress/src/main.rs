use anyhow::{Context, Result};
use clap::Parser;
use lunar_gc::{
    Capture, GcConfig, GcError, GcRef, Heap, LimitedAllocator, SystemAllocator, Value,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use tracing_subscriber::filter::EnvFilter;

/// Registry slots used as the workload's root set
const ROOTS: i64 = 64;

#[derive(Parser)]
#[command(name = "lunar-gc-stress", version, about = "Drive the Lunar GC with a random mutator")]
struct Cli {
    /// Number of mutator operations
    #[arg(long, default_value_t = 1_000_000)]
    ops: u64,
    /// Workload seed
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Collector pause, in percent
    #[arg(long, default_value_t = 200)]
    pause: u32,
    /// Collector step multiplier, in percent
    #[arg(long, default_value_t = 200)]
    stepmul: u32,
    /// Refuse allocations past this many bytes
    #[arg(long)]
    limit: Option<usize>,
    /// Check heap invariants around every collector step
    #[arg(long)]
    verify: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = GcConfig {
        pause: cli.pause,
        step_multiplier: cli.stepmul,
        verify_steps: cli.verify,
        ..GcConfig::default()
    };
    let heap = match cli.limit {
        Some(limit) => Heap::with_allocator(config, Box::new(LimitedAllocator::new(limit))),
        None => Heap::with_allocator(config, Box::new(SystemAllocator::default())),
    }
    .context("failed to create heap")?;

    let started = Instant::now();
    let mut workload = Workload::new(heap, cli.seed)?;
    let mut refused = 0u64;
    for op in 0..cli.ops {
        match workload.step() {
            Ok(()) => {}
            // Under `--limit` the heap fills up; start over with an empty root set
            Err(err) if is_out_of_memory(&err) => {
                refused += 1;
                tracing::debug!(op, error = %err, "allocation refused, dropping roots");
                workload
                    .drop_roots()
                    .with_context(|| format!("operation {op} failed"))?;
            }
            Err(err) => return Err(err.context(format!("operation {op} failed"))),
        }
    }
    if refused > 0 {
        tracing::info!(refused, "workload hit the allocation limit");
    }
    workload.heap.full_collect(false)?;
    workload.heap.verify().context("heap inconsistent after run")?;
    report(&workload, refused, started.elapsed().as_secs_f64());
    workload.heap.close()?;
    Ok(())
}

fn is_out_of_memory(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<GcError>(),
        Some(GcError::OutOfMemory { .. })
    )
}

struct Workload {
    heap: Heap,
    rng: StdRng,
    finalizable: GcRef,
    weak_keys: GcRef,
    weak_values: GcRef,
    coroutine: GcRef,
    proto: GcRef,
}

impl Workload {
    fn new(mut heap: Heap, seed: u64) -> Result<Self> {
        heap.set_finalizer_hook(|heap, obj, _| {
            // Occasionally resurrect into the registry
            if obj.index() % 7 == 0 {
                let registry = heap.registry();
                let key = Value::Integer(i64::from(obj.index()) % ROOTS);
                heap.table_set(registry, key, Value::Object(obj)).map_err(|e| e.to_string())?;
            }
            Ok(())
        });

        let finalizable = heap.new_table()?;
        let gc = heap.new_str("__gc")?;
        heap.table_set(finalizable, Value::Object(gc), Value::Boolean(true))?;

        let weak_keys = weak_table(&mut heap, "k")?;
        let weak_values = weak_table(&mut heap, "v")?;
        let coroutine = heap.new_thread()?;
        let proto = heap.new_proto(vec![0])?;

        let registry = heap.registry();
        for (key, r) in [finalizable, weak_keys, weak_values, coroutine, proto]
            .into_iter()
            .enumerate()
        {
            heap.table_set(registry, Value::Integer(-1 - key as i64), Value::Object(r))?;
        }

        Ok(Self {
            heap,
            rng: StdRng::seed_from_u64(seed),
            finalizable,
            weak_keys,
            weak_values,
            coroutine,
            proto,
        })
    }

    fn random_root(&mut self) -> Result<Option<GcRef>> {
        let registry = self.heap.registry();
        let key = self.rng.random_range(0..ROOTS);
        Ok(self.heap.table_get(registry, Value::Integer(key))?.as_object())
    }

    fn root(&mut self, value: Value) -> Result<()> {
        let registry = self.heap.registry();
        let key = self.rng.random_range(0..ROOTS);
        self.heap.table_set(registry, Value::Integer(key), value)?;
        Ok(())
    }

    /// Forget every root and empty the coroutine stack
    fn drop_roots(&mut self) -> Result<()> {
        let registry = self.heap.registry();
        for key in 0..ROOTS {
            self.heap.table_set(registry, Value::Integer(key), Value::Nil)?;
        }
        self.heap.truncate(self.coroutine, 0)?;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        match self.rng.random_range(0..100) {
            0..30 => {
                let t = self.heap.new_table()?;
                if self.rng.random_bool(0.2) {
                    self.root(Value::Object(t))?;
                }
            }
            30..45 => {
                if let (Some(a), Some(b)) = (self.random_root()?, self.random_root()?)
                    && self.heap.kind_of(a)? == lunar_gc::ObjectKind::Table
                {
                    let key = Value::Integer(self.rng.random_range(0..8));
                    self.heap.table_set(a, key, Value::Object(b))?;
                }
            }
            45..50 => self.root(Value::Nil)?,
            50..58 => {
                let s = format!("s{}", self.rng.random_range(0..4096));
                let s = self.heap.new_str(&s)?;
                if self.rng.random_bool(0.1) {
                    self.root(Value::Object(s))?;
                }
            }
            58..63 => {
                let t = self.heap.new_table()?;
                self.heap.set_metatable(t, Some(self.finalizable))?;
                if self.rng.random_bool(0.3) {
                    self.root(Value::Object(t))?;
                }
            }
            63..70 => {
                let (table, key) = if self.rng.random_bool(0.5) {
                    (self.weak_keys, None)
                } else {
                    (self.weak_values, Some(self.rng.random_range(0..256)))
                };
                let k = self.heap.new_table()?;
                // `k` is unreachable until stored, and `v` may trigger an
                // emergency collection
                self.heap.with_pinned(Value::Object(k), |heap| {
                    let v = heap.new_table()?;
                    heap.table_set(v, Value::Integer(0), Value::Object(k))?;
                    let key = key.map_or(Value::Object(k), Value::Integer);
                    heap.table_set(table, key, Value::Object(v))
                })?;
                if self.rng.random_bool(0.5) {
                    self.root(Value::Object(k))?;
                }
            }
            70..78 => {
                let t = self.heap.new_table()?;
                self.heap.push(self.coroutine, Value::Object(t))?;
                if self.rng.random_bool(0.5) {
                    let slot = self.heap.thread(self.coroutine)?.stack().len() - 1;
                    let closure = self.heap.new_lua_closure(
                        self.proto,
                        &[Capture::Open {
                            thread: self.coroutine,
                            slot,
                        }],
                    )?;
                    self.root(Value::Object(closure))?;
                }
            }
            78..82 => {
                let len = self.heap.thread(self.coroutine)?.stack().len();
                let keep = self.rng.random_range(0..=len);
                self.heap.truncate(self.coroutine, keep)?;
            }
            82..88 => {
                let u = self.heap.new_userdata(self.rng.random_range(0..256))?;
                if let Some(r) = self.random_root()? {
                    self.heap.set_user_value(u, Value::Object(r))?;
                }
                self.root(Value::Object(u))?;
            }
            _ => {
                let upvalues = vec![Value::Nil; 2];
                let host = self.heap.new_native_closure(0, upvalues)?;
                if let Some(r) = self.random_root()? {
                    self.heap.set_native_upvalue(host, 1, Value::Object(r))?;
                }
                self.root(Value::Object(host))?;
            }
        }
        self.heap.check_debt_and_maybe_step()?;
        for err in self.heap.take_finalizer_errors() {
            tracing::warn!(error = %err, "finalizer failed");
        }
        Ok(())
    }
}

fn weak_table(heap: &mut Heap, mode: &str) -> Result<GcRef> {
    let t = heap.new_table()?;
    let mt = heap.new_table()?;
    let key = heap.new_str("__mode")?;
    let mode = heap.new_str(mode)?;
    heap.table_set(mt, Value::Object(key), Value::Object(mode))?;
    heap.set_metatable(t, Some(mt))?;
    Ok(t)
}

fn report(workload: &Workload, refused: u64, seconds: f64) {
    let heap = &workload.heap;
    let stats = heap.stats();
    let lists = heap.object_count_by_list();
    println!("elapsed:               {seconds:.3}s");
    println!("cycles:                {}", stats.cycles);
    println!("emergency collections: {}", stats.emergency_collections);
    println!("refused allocations:   {refused}");
    println!("objects freed:         {}", stats.total_objects_freed);
    println!("finalizers run:        {}", stats.finalizers_run);
    println!("finalizer errors:      {}", stats.finalizer_errors);
    println!("barriers (fwd/back):   {}/{}", stats.forward_barriers, stats.back_barriers);
    println!("heap bytes:            {}", heap.total_bytes());
    println!("live estimate:         {}", heap.estimated_live_bytes());
    println!(
        "objects:               {} (allgc {}, finobj {}, tobefnz {}, fixed {})",
        heap.object_count(),
        lists.allgc,
        lists.finobj,
        lists.tobefnz,
        lists.fixed
    );
    println!("interned strings:      {}", heap.interned_count());
    println!("upvalue cells:         {}", heap.upvalue_count());
}
