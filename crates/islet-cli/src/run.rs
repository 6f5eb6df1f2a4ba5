//! Run command implementation for islet CLI.
//!
//! Parses `namespace.name:<json-args>` calls, dispatches them as one batch
//! and prints the results as a JSON array.

use anyhow::{Context, bail};
use islet_core::{Dispatcher, DispatcherConfig, Error, ModuleRegistry, Value};

use crate::colors;

/// One parsed call from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSpec {
    pub namespace: String,
    pub name: String,
    pub args: Value,
}

/// Parse `namespace.name` or `namespace.name:<json-args>`.
///
/// Without `:<json-args>` the call takes no arguments.
pub fn parse_call(spec: &str) -> anyhow::Result<CallSpec> {
    let (target, json) = match spec.split_once(':') {
        Some((target, json)) => (target, Some(json)),
        None => (spec, None),
    };

    let Some((namespace, name)) = target.rsplit_once('.') else {
        bail!("invalid call '{}': expected namespace.name[:json-args]", spec);
    };
    if namespace.is_empty() || name.is_empty() {
        bail!("invalid call '{}': expected namespace.name[:json-args]", spec);
    }

    let args = match json {
        Some(json) => {
            let parsed: serde_json::Value = serde_json::from_str(json)
                .with_context(|| format!("invalid JSON arguments in '{}'", spec))?;
            Value::from_json(parsed)
        }
        None => Value::List(Vec::new()),
    };

    Ok(CallSpec {
        namespace: namespace.to_string(),
        name: name.to_string(),
        args,
    })
}

/// Execute a batch of calls.
pub fn execute(specs: &[String], config: DispatcherConfig) -> anyhow::Result<()> {
    let calls = specs
        .iter()
        .map(|spec| parse_call(spec))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let dispatcher = Dispatcher::new(ModuleRegistry::with_stdlib()).with_config(config);
    let total = calls.len();
    let results = dispatcher.parallel(
        calls
            .into_iter()
            .map(|call| (call.namespace, call.name, call.args)),
    );

    match results {
        Ok(values) => {
            let json: Vec<serde_json::Value> = values.iter().map(Value::to_json).collect();
            println!("{}", serde_json::to_string(&json)?);
            Ok(())
        }
        Err(Error::Batch(batch)) => {
            for failure in batch.failures() {
                eprintln!("{}{}{}", colors::RED, failure, colors::RESET);
            }
            bail!("{} of {} tasks failed", batch.failures().len(), total)
        }
        Err(e) => Err(e.into()),
    }
}
