//! Built-in modules.
//!
//! - `mathlib` - small numeric functions, including the CPU-bound
//!   `factorial` used by the benchmark
//! - `sys` - introspection of the running instance

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::anyhow;

use crate::module::{ModuleRegistry, NativeModule, expect_arity, int_arg};
use crate::value::Value;

/// Modulus applied at every step of [`factorial_mod`].
pub const FACTORIAL_MODULUS: i64 = 1_000_000_007;

/// `n! mod 1_000_000_007`, computed by a plain loop from `n` down to 2.
///
/// Deliberately naive: its only purpose is to burn CPU for a predictable
/// amount of time.
pub fn factorial_mod(n: i64) -> i64 {
    let mut k: i64 = 1;
    let mut i = n;
    while i > 1 {
        k = (k * (i % FACTORIAL_MODULUS)) % FACTORIAL_MODULUS;
        i -= 1;
    }
    k
}

/// Register every built-in module.
pub fn register_all(registry: &mut ModuleRegistry) {
    registry.register(mathlib());
    registry.register(sys());
}

/// The `mathlib` module.
pub fn mathlib() -> NativeModule {
    NativeModule::new("mathlib")
        .description("Numeric helpers")
        .function("square", |_cx, args| {
            expect_arity("square", args, 1)?;
            match &args[0] {
                Value::Int(i) => i
                    .checked_mul(*i)
                    .map(Value::Int)
                    .ok_or_else(|| anyhow!("square() overflowed for {}", i)),
                Value::Float(f) => Ok(Value::Float(f * f)),
                other => Err(anyhow!(
                    "square() argument must be a number, not {}",
                    other.type_name()
                )),
            }
        })
        .function("add", |_cx, args| {
            expect_arity("add", args, 2)?;
            match (&args[0], &args[1]) {
                (Value::Int(a), Value::Int(b)) => a
                    .checked_add(*b)
                    .map(Value::Int)
                    .ok_or_else(|| anyhow!("add() overflowed")),
                (a, b) => match (a.as_float(), b.as_float()) {
                    (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                    _ => Err(anyhow!(
                        "add() unsupported operand types: {} and {}",
                        a.type_name(),
                        b.type_name()
                    )),
                },
            }
        })
        .function("sum", |_cx, args| {
            let mut total: i64 = 0;
            for (index, _) in args.iter().enumerate() {
                total = total
                    .checked_add(int_arg("sum", args, index)?)
                    .ok_or_else(|| anyhow!("sum() overflowed"))?;
            }
            Ok(Value::Int(total))
        })
        .function("factorial", |_cx, args| {
            expect_arity("factorial", args, 1)?;
            let n = int_arg("factorial", args, 0)?;
            let started = std::time::Instant::now();
            let result = factorial_mod(n);
            tracing::debug!(
                n,
                elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                "factorial computed"
            );
            Ok(Value::Int(result))
        })
}

/// The `sys` module.
pub fn sys() -> NativeModule {
    NativeModule::new("sys")
        .description("Introspection of the running instance")
        .function("instance_id", |cx, _args| {
            Ok(Value::Int(cx.instance_id().as_u64() as i64))
        })
        .function("sleep_ms", |_cx, args| {
            expect_arity("sleep_ms", args, 1)?;
            let ms = int_arg("sleep_ms", args, 0)?;
            let ms = u64::try_from(ms).map_err(|_| anyhow!("sleep_ms() requires ms >= 0"))?;
            std::thread::sleep(Duration::from_millis(ms));
            Ok(Value::Int(ms as i64))
        })
        .function("heap_stats", |cx, _args| {
            let stats = cx.heap_stats();
            let mut map = BTreeMap::new();
            map.insert("live_values".to_string(), Value::Int(stats.live_values as i64));
            map.insert("live_bytes".to_string(), Value::Int(stats.live_bytes as i64));
            map.insert("peak_bytes".to_string(), Value::Int(stats.peak_bytes as i64));
            Ok(Value::Map(map))
        })
        .function("spawn_thread", |cx, _args| {
            let handle = cx.spawn_thread(|| ())?;
            handle
                .join()
                .map_err(|_| anyhow!("spawned thread panicked"))?;
            Ok(Value::Bool(true))
        })
        .function("spawn_daemon_thread", |cx, _args| {
            cx.spawn_daemon_thread(|| ())?;
            Ok(Value::Bool(true))
        })
}
