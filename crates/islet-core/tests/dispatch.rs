//! Integration tests for batch dispatch.
//!
//! Exercises ordering, all-or-nothing aggregation, instance lifecycle on
//! every exit path, and parallel speedup over the shared-lock mode.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use islet_core::{
    Codec, DispatchCallback, Dispatcher, DispatcherConfig, EncodedValue, Error, FailureKind,
    InstanceId, JsonCodec, ModuleRegistry, RuntimeConfig, TaskDescriptor, TaskFailure, Value,
};
use islet_core::module::NativeModule;

fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::with_stdlib();
    registry.register(
        NativeModule::new("testing")
            .function("fail", |_cx, _args| anyhow::bail!("deliberate failure"))
            .function("echo", |_cx, args| Ok(Value::List(args.to_vec())))
            .function("first", |_cx, args| Ok(args.first().cloned().unwrap_or_default()))
            .function("nan", |_cx, _args| Ok(Value::Float(f64::NAN))),
    );
    registry
}

fn encode(value: Value) -> EncodedValue {
    JsonCodec.encode(&value).unwrap()
}

fn task(namespace: &str, name: &str, args: Value) -> TaskDescriptor {
    TaskDescriptor::new(namespace, name, encode(args))
}

/// Records lifecycle callbacks per task index.
#[derive(Default, Clone)]
struct Lifecycle {
    created: Arc<Mutex<BTreeMap<usize, usize>>>,
    destroyed: Arc<Mutex<BTreeMap<usize, usize>>>,
    batches: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl Lifecycle {
    fn created(&self, index: usize) -> usize {
        self.created.lock().unwrap().get(&index).copied().unwrap_or(0)
    }

    fn destroyed(&self, index: usize) -> usize {
        self.destroyed.lock().unwrap().get(&index).copied().unwrap_or(0)
    }
}

impl DispatchCallback for Lifecycle {
    fn on_instance_created(&self, index: usize, _instance: InstanceId) {
        *self.created.lock().unwrap().entry(index).or_default() += 1;
    }

    fn on_instance_destroyed(&self, index: usize, _instance: InstanceId) {
        *self.destroyed.lock().unwrap().entry(index).or_default() += 1;
    }

    fn on_batch_completed(&self, batch_size: usize, failed: usize) {
        self.batches.lock().unwrap().push((batch_size, failed));
    }
}

/// JSON codec that refuses to encode the string "poison".
struct PoisonCodec;

impl Codec for PoisonCodec {
    fn encode(&self, value: &Value) -> islet_core::Result<EncodedValue> {
        if value == &Value::Str("poison".into()) {
            return Err(Error::Encode("poisoned value".into()));
        }
        JsonCodec.encode(value)
    }

    fn decode(&self, encoded: &EncodedValue) -> islet_core::Result<Value> {
        JsonCodec.decode(encoded)
    }
}

/// JSON codec whose decoder panics, killing the worker outside invocation.
struct ExplodingCodec;

impl Codec for ExplodingCodec {
    fn encode(&self, value: &Value) -> islet_core::Result<EncodedValue> {
        JsonCodec.encode(value)
    }

    fn decode(&self, _encoded: &EncodedValue) -> islet_core::Result<Value> {
        panic!("codec exploded")
    }
}

#[test]
fn test_empty_batch_returns_empty_success() {
    let lifecycle = Lifecycle::default();
    let mut dispatcher = Dispatcher::new(registry());
    dispatcher.set_callback(lifecycle.clone());

    assert_eq!(dispatcher.run(Vec::new()).unwrap(), Vec::<EncodedValue>::new());
    // Nothing spawned, nothing reported.
    assert!(lifecycle.batches.lock().unwrap().is_empty());
}

#[test]
fn test_square_results_in_order() {
    let dispatcher = Dispatcher::new(registry());
    let results = dispatcher
        .run(vec![
            task("mathlib", "square", Value::Int(4)),
            task("mathlib", "square", Value::Int(5)),
        ])
        .unwrap();
    let decoded: Vec<Value> = results.iter().map(|e| JsonCodec.decode(e).unwrap()).collect();
    assert_eq!(decoded, vec![Value::Int(16), Value::Int(25)]);
}

#[test]
fn test_order_preserved_regardless_of_completion_order() {
    const N: i64 = 5;
    let dispatcher = Dispatcher::new(registry());

    // Task i sleeps longest when i is smallest, so completion order is reversed.
    let results = dispatcher
        .parallel((0..N).map(|i| ("sys", "sleep_ms", Value::Int((N - i) * 20))))
        .unwrap();

    let expected: Vec<Value> = (0..N).map(|i| Value::Int((N - i) * 20)).collect();
    assert_eq!(results, expected);
}

#[test]
fn test_missing_callable_fails_only_its_index() {
    let dispatcher = Dispatcher::new(registry());
    let err = dispatcher
        .run(vec![
            task("mathlib", "square", Value::Int(2)),
            task("mathlib", "missing_fn", Value::Int(2)),
        ])
        .unwrap_err();

    assert_eq!(err.indices(), vec![1]);
    let failure = &err.failures()[0];
    assert_eq!(failure.kind, FailureKind::Resolution);
    assert!(failure.message.contains("missing_fn"));
}

#[test]
fn test_failing_index_set_matches_failing_tasks() {
    let dispatcher = Dispatcher::new(registry());
    let failing = [1usize, 3, 4];
    let batch: Vec<_> = (0..6)
        .map(|i| {
            if failing.contains(&i) {
                task("testing", "fail", Value::None)
            } else {
                task("mathlib", "square", Value::Int(i as i64))
            }
        })
        .collect();

    let err = dispatcher.run(batch).unwrap_err();
    assert_eq!(err.indices(), failing.to_vec());
    for failure in err.failures() {
        assert_eq!(failure.kind, FailureKind::Invocation);
        assert!(failure.message.contains("deliberate failure"));
    }

    let report = err.to_string();
    assert_eq!(report.lines().count(), failing.len());
    assert!(report.starts_with("task 1 failed (invocation):"));
}

#[test]
fn test_all_tasks_fail_when_namespace_missing() {
    let dispatcher = Dispatcher::new(registry());
    let err = dispatcher
        .parallel([
            ("nowhere", "square", Value::Int(1)),
            ("nowhere", "square", Value::Int(2)),
        ])
        .unwrap_err();
    match err {
        Error::Batch(batch) => {
            assert_eq!(batch.indices(), vec![0, 1]);
            assert!(batch
                .failures()
                .iter()
                .all(|f| f.kind == FailureKind::Resolution));
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_codec_round_trip_through_workers() {
    let dispatcher = Dispatcher::new(registry());
    let mut map = BTreeMap::new();
    map.insert("k".to_string(), Value::Bytes(vec![0, 255]));
    let payload = Value::List(vec![
        Value::None,
        Value::Bool(true),
        Value::Float(0.1),
        Value::Str("héllo".into()),
        Value::Map(map),
    ]);

    // A list argument spreads into positional arguments; echo gathers them back.
    let results = dispatcher
        .parallel([("testing", "echo", payload.clone())])
        .unwrap();
    assert_eq!(results, vec![payload]);
}

#[test]
fn test_teardown_exactly_once_on_every_exit_path() {
    let lifecycle = Lifecycle::default();
    let mut dispatcher = Dispatcher::new(registry()).with_codec(PoisonCodec);
    dispatcher.set_callback(lifecycle.clone());

    let batch = vec![
        // 0: success
        task("mathlib", "square", Value::Int(3)),
        // 1: resolution failure
        task("mathlib", "missing_fn", Value::None),
        // 2: decode failure
        TaskDescriptor::new("mathlib", "square", EncodedValue::from_bytes(b"\xffgarbage".to_vec())),
        // 3: invocation failure
        task("testing", "fail", Value::None),
        // 4: encode failure from the codec
        task("testing", "first", Value::Str("poison".into())),
        // 5: encode failure from a non-finite result
        task("testing", "nan", Value::None),
    ];

    let err = dispatcher.run(batch).unwrap_err();
    let kinds: Vec<(usize, FailureKind)> =
        err.failures().iter().map(|f| (f.index, f.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (1, FailureKind::Resolution),
            (2, FailureKind::Decode),
            (3, FailureKind::Invocation),
            (4, FailureKind::Encode),
            (5, FailureKind::Encode),
        ]
    );

    for index in 0..6 {
        assert_eq!(lifecycle.created(index), 1, "task {} created", index);
        assert_eq!(lifecycle.destroyed(index), 1, "task {} destroyed", index);
    }
    assert_eq!(*lifecycle.batches.lock().unwrap(), vec![(6, 5)]);
}

#[test]
fn test_worker_panic_becomes_worker_failure_and_still_tears_down() {
    let lifecycle = Lifecycle::default();
    let mut dispatcher = Dispatcher::new(registry()).with_codec(ExplodingCodec);
    dispatcher.set_callback(lifecycle.clone());

    let err = dispatcher
        .run(vec![
            task("mathlib", "square", Value::Int(2)),
            task("mathlib", "square", Value::Int(3)),
        ])
        .unwrap_err();

    assert_eq!(err.indices(), vec![0, 1]);
    for failure in err.failures() {
        assert_eq!(failure.kind, FailureKind::Worker);
        assert!(
            failure.message.starts_with("worker panicked:"),
            "unexpected message: {}",
            failure.message
        );
        assert!(failure.message.contains("codec exploded"));
    }
    for index in 0..2 {
        assert_eq!(lifecycle.created(index), 1, "task {} created", index);
        assert_eq!(lifecycle.destroyed(index), 1, "task {} destroyed", index);
    }
    assert_eq!(*lifecycle.batches.lock().unwrap(), vec![(2, 2)]);
}

#[test]
fn test_creation_failure_has_no_teardown() {
    let lifecycle = Lifecycle::default();
    let invalid = DispatcherConfig {
        runtime: RuntimeConfig {
            own_isolation_lock: true,
            share_allocator_with_creator: true,
            ..RuntimeConfig::default()
        },
        ..DispatcherConfig::default()
    };
    let mut dispatcher = Dispatcher::new(registry()).with_config(invalid);
    dispatcher.set_callback(lifecycle.clone());

    let err = dispatcher
        .run(vec![task("mathlib", "square", Value::Int(1))])
        .unwrap_err();
    let failures: &[TaskFailure] = err.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].index, 0);
    assert_eq!(failures[0].kind, FailureKind::Creation);
    assert!(failures[0].message.contains("instance creation failed"));
    assert_eq!(lifecycle.created(0), 0);
    assert_eq!(lifecycle.destroyed(0), 0);
}

#[test]
fn test_each_task_gets_its_own_instance() {
    let dispatcher = Dispatcher::new(registry());
    let ids = dispatcher
        .parallel((0..4).map(|_| ("sys", "instance_id", Value::None)))
        .unwrap();

    let mut unique: Vec<i64> = ids.iter().filter_map(Value::as_int).collect();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 4);
}

#[test]
fn test_isolated_mode_runs_in_parallel() {
    const TASKS: i64 = 4;
    const SLEEP_MS: i64 = 100;

    let calls = || (0..TASKS).map(|_| ("sys", "sleep_ms", Value::Int(SLEEP_MS)));

    let isolated = Dispatcher::new(registry());
    let start = Instant::now();
    isolated.parallel(calls()).unwrap();
    let isolated_elapsed = start.elapsed();

    let shared = Dispatcher::new(registry()).with_config(DispatcherConfig {
        runtime: RuntimeConfig::shared(),
        ..DispatcherConfig::default()
    });
    let start = Instant::now();
    shared.parallel(calls()).unwrap();
    let shared_elapsed = start.elapsed();

    // Shared-lock instances serialize; isolated ones overlap.
    assert!(shared_elapsed >= Duration::from_millis((TASKS * SLEEP_MS) as u64));
    assert!(
        isolated_elapsed < shared_elapsed,
        "isolated {:?} should beat shared {:?}",
        isolated_elapsed,
        shared_elapsed
    );
}

#[test]
fn test_cpu_bound_batch_scales_with_cores() {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    if cores < 4 {
        eprintln!("skipping: needs at least 4 cores, found {}", cores);
        return;
    }

    const TASKS: usize = 50;
    let input = |i: usize| Value::Int(1_000_000 + i as i64);
    let calls = || (0..TASKS).map(|i| ("mathlib", "factorial", input(i)));

    let shared = Dispatcher::new(registry()).with_config(DispatcherConfig {
        runtime: RuntimeConfig::shared(),
        ..DispatcherConfig::default()
    });
    let start = Instant::now();
    let serialized = shared.parallel(calls()).unwrap();
    let serialized_elapsed = start.elapsed();

    let isolated = Dispatcher::new(registry());
    let start = Instant::now();
    let parallel = isolated.parallel(calls()).unwrap();
    let parallel_elapsed = start.elapsed();

    assert_eq!(parallel, serialized);
    // Shared mode approximates the sum of task times; isolated mode should
    // land well below it once several cores are available.
    assert!(
        parallel_elapsed.as_secs_f64() < serialized_elapsed.as_secs_f64() * 0.75,
        "isolated {:?} vs serialized {:?} on {} cores",
        parallel_elapsed,
        serialized_elapsed,
        cores
    );

    if cores < TASKS {
        return;
    }
    // With a core per task the batch costs about one task, the largest input.
    let start = Instant::now();
    isolated
        .parallel([("mathlib", "factorial", input(TASKS - 1))])
        .unwrap();
    let single_elapsed = start.elapsed();
    assert!(
        parallel_elapsed.saturating_sub(single_elapsed)
            < serialized_elapsed.saturating_sub(parallel_elapsed),
        "isolated {:?} should be closer to one task {:?} than to serialized {:?}",
        parallel_elapsed,
        single_elapsed,
        serialized_elapsed
    );
}
