//! Module system: resolving callables by namespace and name.
//!
//! A [`ModuleDef`] is registered once, process-wide, in a [`ModuleRegistry`].
//! Each instance imports a namespace at most once and keeps the resulting
//! [`Module`] in its own table, so module state is never shared between
//! instances. [`Callable`]s are `!Send` and stay on the thread that
//! resolved them.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::runtime::Context;
use crate::value::Value;

/// Signature of a native function callable from inside an instance.
pub type NativeFn = dyn Fn(&mut Context<'_>, &[Value]) -> anyhow::Result<Value>;

type SharedFn = dyn Fn(&mut Context<'_>, &[Value]) -> anyhow::Result<Value> + Send + Sync;

/// An invocable handle resolved inside one instance.
#[derive(Clone)]
pub struct Callable {
    name: String,
    func: Rc<NativeFn>,
}

impl Callable {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&mut Context<'_>, &[Value]) -> anyhow::Result<Value> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke with positional arguments.
    ///
    /// Both a returned error and a panic become [`Error::Invocation`],
    /// carrying the error chain or the panic message.
    pub fn invoke(&self, cx: &mut Context<'_>, args: &[Value]) -> Result<Value> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.func)(cx, args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Invocation(format!("{:#}", e))),
            Err(payload) => Err(Error::Invocation(format!(
                "{} panicked: {}",
                self.name,
                panic_message(payload.as_ref())
            ))),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({})", self.name)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A module as imported into one instance.
pub struct Module {
    name: String,
    callables: FxHashMap<String, Callable>,
}

impl Module {
    pub fn new(name: impl Into<String>, callables: FxHashMap<String, Callable>) -> Self {
        Self {
            name: name.into(),
            callables,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.callables.get(name)
    }

    pub fn len(&self) -> usize {
        self.callables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callables.is_empty()
    }
}

/// Definition of a module that instances can import.
pub trait ModuleDef: Send + Sync {
    /// Namespace the module is registered under.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Whether the module may be imported into more than one instance.
    fn supports_multiple_instances(&self) -> bool {
        true
    }

    /// Build this module's callables for one instance.
    ///
    /// Called once per importing instance; anything created here belongs
    /// to that instance alone.
    fn exports(&self, cx: &mut Context<'_>) -> FxHashMap<String, Callable>;
}

/// A module assembled from plain Rust functions.
pub struct NativeModule {
    name: String,
    description: String,
    multi_instance: bool,
    functions: Vec<(String, Arc<SharedFn>)>,
}

impl NativeModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            multi_instance: true,
            functions: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the module as unsafe to import into more than one instance.
    pub fn single_instance(mut self) -> Self {
        self.multi_instance = false;
        self
    }

    /// Add an exported function.
    pub fn function(
        mut self,
        name: impl Into<String>,
        func: impl Fn(&mut Context<'_>, &[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.functions.push((name.into(), Arc::new(func)));
        self
    }
}

impl ModuleDef for NativeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn supports_multiple_instances(&self) -> bool {
        self.multi_instance
    }

    fn exports(&self, _cx: &mut Context<'_>) -> FxHashMap<String, Callable> {
        self.functions
            .iter()
            .map(|(name, func)| {
                let func = Arc::clone(func);
                (
                    name.clone(),
                    Callable::new(name.clone(), move |cx, args| func(cx, args)),
                )
            })
            .collect()
    }
}

/// Process-wide table of importable modules.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: FxHashMap<String, Arc<dyn ModuleDef>>,
}

impl ModuleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in modules.
    pub fn with_stdlib() -> Self {
        let mut registry = Self::new();
        crate::stdlib::register_all(&mut registry);
        registry
    }

    /// Register a module, replacing any module with the same name.
    pub fn register(&mut self, module: impl ModuleDef + 'static) {
        self.modules
            .insert(module.name().to_string(), Arc::new(module));
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.modules.contains_key(namespace)
    }

    /// Registered namespaces, sorted.
    pub fn namespaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve `namespace.name` inside the instance behind `cx`.
    ///
    /// Imports the namespace into the instance on first use. A missing
    /// namespace and a missing name are distinct errors.
    pub fn resolve(&self, cx: &mut Context<'_>, namespace: &str, name: &str) -> Result<Callable> {
        if !cx.modules_mut().contains_key(namespace) {
            let def = self
                .modules
                .get(namespace)
                .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;

            if cx.config().check_multi_instance_modules && !def.supports_multiple_instances() {
                return Err(Error::ModuleUnsupported(namespace.to_string()));
            }

            let exports = def.exports(cx);
            tracing::debug!(
                instance = %cx.instance_id(),
                namespace,
                exports = exports.len(),
                "Module imported"
            );
            cx.modules_mut()
                .insert(namespace.to_string(), Module::new(namespace, exports));
        }

        cx.modules_mut()
            .get(namespace)
            .and_then(|module| module.get(name))
            .cloned()
            .ok_or_else(|| Error::CallableNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}

/// Check the number of positional arguments.
pub fn expect_arity(func: &str, args: &[Value], expected: usize) -> anyhow::Result<()> {
    if args.len() != expected {
        anyhow::bail!(
            "{}() takes {} argument(s) but {} were given",
            func,
            expected,
            args.len()
        );
    }
    Ok(())
}

/// Fetch positional argument `index` as an integer.
pub fn int_arg(func: &str, args: &[Value], index: usize) -> anyhow::Result<i64> {
    match args.get(index) {
        Some(Value::Int(i)) => Ok(*i),
        Some(other) => anyhow::bail!(
            "{}() argument {} must be int, not {}",
            func,
            index,
            other.type_name()
        ),
        None => anyhow::bail!("{}() missing argument {}", func, index),
    }
}
