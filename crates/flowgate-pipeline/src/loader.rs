//! Transformation loader: turns user-supplied source into a row-mapping step.
//!
//! User transformations are written in [Rhai](https://rhai.rs). A fragment must
//! define one single-parameter function; it receives the record as an object
//! map and returns the new record, or `()` to drop it:
//!
//! ```rhai
//! fn double(row) {
//!     row.v = row.v * 2;
//!     row
//! }
//! ```
//!
//! Every step gets its own engine with no module resolver, no `eval`, and no
//! stdout: `print` and `debug` go to tracing under the `flowgate::script`
//! target. Each call runs under a wall-clock budget enforced from the engine's
//! progress callback.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rhai::{CallFnOptions, Dynamic, Engine, Scope, AST};
use serde_json::Value;

use flowgate_types::{FlowgateError, Result};

/// Default per-call time budget for a scripted step.
pub const DEFAULT_STEP_BUDGET: Duration = Duration::from_millis(250);

/// Name preferred when a fragment defines several single-parameter functions.
const ENTRY_POINT: &str = "transform";

/// A single row-mapping step of a cluster's transformation chain.
pub trait ScriptedStep: Send + Sync {
    /// Map one record to its replacement, or `None` to drop it.
    fn apply(&self, record: Value) -> Result<Option<Value>>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Identity step used when a transformation could not be loaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl ScriptedStep for Passthrough {
    fn apply(&self, record: Value) -> Result<Option<Value>> {
        Ok(Some(record))
    }

    fn describe(&self) -> String {
        "passthrough".into()
    }
}

// ---------------------------------------------------------------------------
// Engine setup
// ---------------------------------------------------------------------------

type Deadline = Arc<Mutex<Option<Instant>>>;

fn sandboxed_engine(deadline: Deadline) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(32);
    engine.set_max_string_size(64 * 1024);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);

    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.disable_symbol("eval");

    engine.on_print(|text| tracing::info!(target: "flowgate::script", "{text}"));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "flowgate::script", source = source.unwrap_or(""), %pos, "{text}")
    });

    engine.on_progress(move |_ops| {
        let expired = deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|d| Instant::now() >= d);
        expired.then_some(Dynamic::UNIT)
    });

    engine
}

fn entry_point(ast: &AST) -> std::result::Result<String, String> {
    let candidates: Vec<String> = ast
        .iter_functions()
        .filter(|f| f.params.len() == 1)
        .map(|f| f.name.to_string())
        .collect();
    match candidates.as_slice() {
        [] => Err("no single-parameter function defined".into()),
        [only] => Ok(only.clone()),
        many if many.iter().any(|n| n == ENTRY_POINT) => Ok(ENTRY_POINT.to_string()),
        many => Err(format!(
            "ambiguous entry point, candidates: {} (name one '{ENTRY_POINT}')",
            many.join(", ")
        )),
    }
}

// ---------------------------------------------------------------------------
// RhaiStep
// ---------------------------------------------------------------------------

/// A compiled Rhai transformation.
pub struct RhaiStep {
    engine: Engine,
    ast: AST,
    function: String,
    budget: Duration,
    deadline: Deadline,
}

impl RhaiStep {
    pub fn compile(source: &str, budget: Duration) -> Result<Self> {
        let deadline: Deadline = Arc::new(Mutex::new(None));
        let engine = sandboxed_engine(deadline.clone());
        let ast = engine
            .compile(source)
            .map_err(|e| FlowgateError::Load(format!("compile error: {e}")))?;
        let function = entry_point(&ast).map_err(FlowgateError::Load)?;

        // Top-level statements run once, under the same budget as a call.
        *deadline.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + budget);
        let top_level = engine.run_ast(&ast);
        *deadline.lock().unwrap_or_else(PoisonError::into_inner) = None;
        top_level.map_err(|e| FlowgateError::Load(format!("top-level statements failed: {e}")))?;

        Ok(Self {
            engine,
            ast,
            function,
            budget,
            deadline,
        })
    }

    pub fn function_name(&self) -> &str {
        &self.function
    }
}

impl ScriptedStep for RhaiStep {
    fn apply(&self, record: Value) -> Result<Option<Value>> {
        let arg = rhai::serde::to_dynamic(&record)
            .map_err(|e| FlowgateError::Script(format!("{}: cannot convert record: {e}", self.function)))?;

        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Instant::now() + self.budget);
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let mut scope = Scope::new();
        let outcome = self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut scope,
            &self.ast,
            &self.function,
            (arg,),
        );
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let result = outcome.map_err(|e| match *e {
            rhai::EvalAltResult::ErrorTerminated(..) => FlowgateError::Script(format!(
                "{} exceeded its time budget of {:?}",
                self.function, self.budget
            )),
            other => FlowgateError::Script(format!("{}: {other}", self.function)),
        })?;

        if result.is_unit() {
            return Ok(None);
        }
        let value: Value = rhai::serde::from_dynamic(&result)
            .map_err(|e| FlowgateError::Script(format!("{}: cannot convert result: {e}", self.function)))?;
        Ok((!value.is_null()).then_some(value))
    }

    fn describe(&self) -> String {
        format!("rhai fn {}", self.function)
    }
}

// ---------------------------------------------------------------------------
// TransformationLoader
// ---------------------------------------------------------------------------

/// Builds [`ScriptedStep`]s from transformation source text.
#[derive(Debug, Clone)]
pub struct TransformationLoader {
    budget: Duration,
}

impl Default for TransformationLoader {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_BUDGET)
    }
}

impl TransformationLoader {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// Compile `source`, reporting any failure.
    pub fn try_load(&self, source: &str) -> Result<Arc<dyn ScriptedStep>> {
        Ok(Arc::new(RhaiStep::compile(source, self.budget)?))
    }

    /// Compile `source`, falling back to [`Passthrough`] on failure.
    pub fn load(&self, source: &str) -> Arc<dyn ScriptedStep> {
        match self.try_load(source) {
            Ok(step) => {
                tracing::debug!(step = %step.describe(), "Transformation loaded");
                step
            }
            Err(e) => {
                tracing::error!(error = %e, "Transformation failed to load, passing records through");
                Arc::new(Passthrough)
            }
        }
    }
}

/// Whether `source` would load; used by validation to warn about fallbacks.
pub fn check_source(source: &str) -> Result<()> {
    TransformationLoader::default().try_load(source).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loader() -> TransformationLoader {
        TransformationLoader::new(Duration::from_millis(200))
    }

    #[test]
    fn doubles_a_field() {
        let step = loader()
            .try_load("fn double(row) { row.v = row.v * 2; row }")
            .unwrap();
        assert_eq!(step.apply(json!({"v": 2})).unwrap(), Some(json!({"v": 4})));
    }

    #[test]
    fn unit_result_drops_the_record() {
        let step = loader()
            .try_load("fn keep_big(row) { if row.v > 10 { row } }")
            .unwrap();
        assert_eq!(step.apply(json!({"v": 3})).unwrap(), None);
        assert_eq!(step.apply(json!({"v": 30})).unwrap(), Some(json!({"v": 30})));
    }

    #[test]
    fn helper_functions_are_allowed_with_named_entry_point() {
        let source = r#"
            fn scale(x, k) { x * k }
            fn clamp(x) { if x > 100 { 100 } else { x } }
            fn transform(row) { row.v = clamp(scale(row.v, 10)); row }
        "#;
        let step = loader().try_load(source).unwrap();
        assert_eq!(step.apply(json!({"v": 50})).unwrap(), Some(json!({"v": 100})));
    }

    #[test]
    fn no_function_falls_back_to_passthrough() {
        assert!(matches!(
            loader().try_load("let x = 1;"),
            Err(FlowgateError::Load(_))
        ));
        let step = loader().load("let x = 1;");
        assert_eq!(step.describe(), "passthrough");
        assert_eq!(step.apply(json!({"a": 1})).unwrap(), Some(json!({"a": 1})));
    }

    #[test]
    fn syntax_error_falls_back_to_passthrough() {
        let step = loader().load("fn broken(row) { row +");
        assert_eq!(step.describe(), "passthrough");
        assert!(check_source("fn broken(row) { row +").is_err());
    }

    #[test]
    fn runtime_error_is_a_script_error() {
        let step = loader()
            .try_load(r#"fn boom(row) { throw "bad row"; }"#)
            .unwrap();
        let err = step.apply(json!({})).unwrap_err();
        assert!(matches!(err, FlowgateError::Script(ref m) if m.contains("bad row")));
    }

    #[test]
    fn runaway_script_hits_time_budget() {
        let step = TransformationLoader::new(Duration::from_millis(50))
            .try_load("fn spin(row) { loop { } }")
            .unwrap();
        let started = Instant::now();
        let err = step.apply(json!({})).unwrap_err();
        assert!(matches!(err, FlowgateError::Script(ref m) if m.contains("time budget")));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn eval_and_imports_are_unavailable() {
        match loader().try_load(r#"fn t(row) { eval("40 + 2") }"#) {
            Err(_) => {}
            Ok(step) => assert!(step.apply(json!({})).is_err()),
        }
        let step = loader()
            .try_load(r#"fn t(row) { import "os" as os; row }"#)
            .unwrap();
        assert!(step.apply(json!({})).is_err());
    }

    #[test]
    fn calls_are_independent() {
        let step = loader()
            .try_load("fn tag(row) { row.seen = true; row }")
            .unwrap();
        assert_eq!(
            step.apply(json!({"n": 1})).unwrap(),
            Some(json!({"n": 1, "seen": true}))
        );
        assert_eq!(
            step.apply(json!({"n": 2})).unwrap(),
            Some(json!({"n": 2, "seen": true}))
        );
    }
}
