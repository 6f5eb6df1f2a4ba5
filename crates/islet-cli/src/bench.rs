//! Bench command implementation for islet CLI.
//!
//! Runs the same CPU-bound factorial workload in several modes and reports
//! wall-clock time for each:
//!
//! - `isolated` - one instance per task, each with its own lock
//! - `shared` - one instance per task, all serialized on the shared lock
//! - `native` - plain Rust across the rayon pool, no instances at all
//! - `single` - one task in one instance on the current thread

use std::time::{Duration, Instant};

use anyhow::bail;
use clap::ValueEnum;
use islet_core::stdlib::factorial_mod;
use islet_core::{Dispatcher, DispatcherConfig, Instance, ModuleRegistry, RuntimeConfig, Value};
use rayon::prelude::*;

use crate::colors;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Isolated,
    Shared,
    Native,
    Single,
    All,
}

impl Mode {
    fn label(self) -> &'static str {
        match self {
            Mode::Isolated => "isolated",
            Mode::Shared => "shared",
            Mode::Native => "native",
            Mode::Single => "single",
            Mode::All => "all",
        }
    }

    fn expand(self) -> Vec<Mode> {
        match self {
            Mode::All => vec![Mode::Isolated, Mode::Shared, Mode::Native, Mode::Single],
            mode => vec![mode],
        }
    }
}

pub struct Options {
    pub tasks: usize,
    pub min: i64,
    pub max: i64,
    pub mode: Mode,
}

/// Factorial inputs spread evenly over `[min, max]`.
///
/// Requires `0 <= min <= max`, so `span` fits in an `i64`; the product is
/// taken in `i128` and the quotient never exceeds `span`.
fn inputs(options: &Options) -> Vec<i64> {
    let span = i128::from(options.max - options.min);
    let steps = options.tasks.saturating_sub(1).max(1) as i128;
    (0..options.tasks as i128)
        .map(|i| options.min + (span * i / steps) as i64)
        .collect()
}

/// Execute the benchmark.
pub fn execute(options: &Options, config: DispatcherConfig) -> anyhow::Result<()> {
    if options.tasks == 0 {
        bail!("--tasks must be at least 1");
    }
    if options.min < 0 || options.min > options.max {
        bail!(
            "invalid range: need 0 <= min <= max, got min={} max={}",
            options.min,
            options.max
        );
    }

    let inputs = inputs(options);
    println!(
        "{}Benchmark:{} {} tasks, factorial inputs {}..={}",
        colors::BOLD,
        colors::RESET,
        options.tasks,
        options.min,
        options.max
    );
    println!("{}", "─".repeat(50));

    for mode in options.mode.expand() {
        let start = Instant::now();
        let results = run_mode(mode, &inputs, &config)?;
        let elapsed = start.elapsed();
        tracing::info!(
            mode = mode.label(),
            tasks = results.len(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Benchmark mode finished"
        );
        report(mode, &results, elapsed);
    }

    Ok(())
}

fn run_mode(mode: Mode, inputs: &[i64], config: &DispatcherConfig) -> anyhow::Result<Vec<i64>> {
    match mode {
        Mode::Isolated => dispatch(inputs, config.clone()),
        Mode::Shared => dispatch(
            inputs,
            DispatcherConfig {
                runtime: RuntimeConfig::shared(),
                ..config.clone()
            },
        ),
        Mode::Native => Ok(inputs.par_iter().map(|&n| factorial_mod(n)).collect()),
        Mode::Single => {
            let Some(&n) = inputs.first() else {
                bail!("no benchmark inputs");
            };
            Ok(vec![single(n, &config.runtime)?])
        }
        Mode::All => bail!("mode 'all' must be expanded before running"),
    }
}

fn dispatch(inputs: &[i64], config: DispatcherConfig) -> anyhow::Result<Vec<i64>> {
    let dispatcher = Dispatcher::new(ModuleRegistry::with_stdlib()).with_config(config);
    let values = dispatcher.parallel(
        inputs
            .iter()
            .map(|&n| ("mathlib", "factorial", Value::Int(n))),
    )?;
    values.iter().map(int_result).collect()
}

fn single(n: i64, runtime: &RuntimeConfig) -> anyhow::Result<i64> {
    let registry = ModuleRegistry::with_stdlib();
    let mut instance = Instance::create(runtime)?;
    let value = instance.run_within(|cx| -> islet_core::Result<Value> {
        let factorial = registry.resolve(cx, "mathlib", "factorial")?;
        factorial.invoke(cx, &[Value::Int(n)])
    })?;
    instance.destroy();
    int_result(&value)
}

fn int_result(value: &Value) -> anyhow::Result<i64> {
    value
        .as_int()
        .ok_or_else(|| anyhow::anyhow!("expected int result, got {}", value.type_name()))
}

fn report(mode: Mode, results: &[i64], elapsed: Duration) {
    let shown: Vec<String> = results.iter().take(3).map(i64::to_string).collect();
    let more = if results.len() > shown.len() { ", ..." } else { "" };
    println!(
        "{}{:<9}{} {}{:>8.3}s{} {}{} task(s), results [{}{}]{}",
        colors::CYAN,
        mode.label(),
        colors::RESET,
        colors::GREEN,
        elapsed.as_secs_f64(),
        colors::RESET,
        colors::DIM,
        results.len(),
        shown.join(", "),
        more,
        colors::RESET
    );
}
