use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use parking_lot::Mutex;
use rquickjs::{Context, Ctx, Error as JsError, Function, Runtime, Value};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use super::BindHandler;

/// One line written through the page's `console`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleMessage {
    pub level: String,
    pub text: String,
}

/// Bounded console history shared between the loop thread and callers.
#[derive(Clone)]
pub(crate) struct ConsoleLog {
    entries: Arc<Mutex<VecDeque<ConsoleMessage>>>,
    capacity: usize,
}

impl ConsoleLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, level: String, text: String) {
        match level.as_str() {
            "error" => tracing::error!(target: "quickjs", message = %text),
            "warn" => tracing::warn!(target: "quickjs", message = %text),
            "debug" => tracing::debug!(target: "quickjs", message = %text),
            _ => tracing::info!(target: "quickjs", message = %text),
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(ConsoleMessage { level, text });
    }

    pub(crate) fn snapshot(&self) -> Vec<ConsoleMessage> {
        self.entries.lock().iter().cloned().collect()
    }
}

pub(crate) type Bindings = Arc<Mutex<HashMap<String, BindHandler>>>;

#[derive(Deserialize)]
struct EvalSlot {
    done: bool,
    #[serde(default)]
    value: JsonValue,
    #[serde(default)]
    error: Option<String>,
}

/// QuickJS runtime hosting one page at a time.
///
/// Loading a page replaces the context, so globals from the previous page
/// never leak into the next. Bound host functions survive page loads.
pub(crate) struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
    console: ConsoleLog,
    bindings: Bindings,
    next_call: Arc<AtomicU64>,
}

impl QuickJsEngine {
    pub(crate) fn new(console: ConsoleLog, bindings: Bindings) -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        let engine = Self {
            runtime,
            context,
            console,
            bindings,
            next_call: Arc::new(AtomicU64::new(1)),
        };
        engine.install_globals()?;
        Ok(engine)
    }

    /// Drop the current page and start an empty one.
    pub(crate) fn new_page(&mut self) -> Result<()> {
        self.context = Context::full(&self.runtime).context("failed to create QuickJS context")?;
        self.install_globals()?;
        let names: Vec<String> = self.bindings.lock().keys().cloned().collect();
        for name in names {
            self.expose(&name)?;
        }
        Ok(())
    }

    /// Evaluate a script and discard the result.
    pub(crate) fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.eval_with::<()>(source, filename)
    }

    /// Evaluate a script and convert the result into `V`.
    pub(crate) fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let script = Self::with_source_url(source, filename);
        let eval_result = self.context.with(|ctx| ctx.eval::<V, _>(script));

        let value = match eval_result {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => {
                let message = self
                    .context
                    .with(|ctx| capture_exception_message(&ctx))
                    .unwrap_or_else(|| "QuickJS exception".to_string());
                Err(anyhow::anyhow!(message))
            }
            Err(err) => Err(anyhow::Error::from(err)),
        }?;

        // Promise continuations queued by the script only run when drained.
        self.execute_pending_jobs();

        Ok(value)
    }

    /// Evaluate an expression, settle it if it is a promise, and return
    /// its JSON form.
    pub(crate) fn evaluate_json(&self, expression: &str) -> Result<JsonValue> {
        let settle = format!(
            "(() => {{ const slot = {{ done: false }}; globalThis.__bridgeEvalSlot = slot; \
             Promise.resolve(({expression})).then(\
             (value) => {{ slot.done = true; slot.value = value; }}, \
             (err) => {{ slot.done = true; slot.error = String(err && err.message !== undefined ? err.message : err); }}); }})();"
        );
        self.eval(&settle, "bridge://evaluate")?;
        let raw: String = self.eval_with(
            "JSON.stringify(globalThis.__bridgeEvalSlot)",
            "bridge://evaluate-result",
        )?;
        let slot: EvalSlot =
            serde_json::from_str(&raw).context("evaluation result was not serialisable")?;
        match (slot.done, slot.error) {
            (false, _) => Err(anyhow::anyhow!("promise did not settle")),
            (true, Some(error)) => Err(anyhow::anyhow!(error)),
            (true, None) => Ok(slot.value),
        }
    }

    /// Make the bound handler `name` callable from the current page.
    pub(crate) fn expose(&self, name: &str) -> Result<()> {
        let quoted = JsonValue::String(name.to_string()).to_string();
        self.eval(&format!("globalThis.__bridgeExpose({quoted});"), "bridge://bind")
    }

    pub(crate) fn conceal(&self, name: &str) -> Result<()> {
        let quoted = JsonValue::String(name.to_string()).to_string();
        self.eval(&format!("delete globalThis[{quoted}];"), "bridge://unbind")
    }

    fn execute_pending_jobs(&self) {
        let mut job_count = 0;
        const MAX_JOBS: usize = 1000;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    job_count += 1;
                    if job_count >= MAX_JOBS {
                        tracing::warn!(
                            target: "quickjs",
                            "Stopped processing jobs after {} iterations (possible infinite loop)",
                            MAX_JOBS
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(job_exception) => {
                    tracing::error!(
                        target: "quickjs",
                        "Job execution error: {:?}",
                        job_exception
                    );
                    break;
                }
            }
        }

        if job_count > 0 {
            tracing::trace!(target: "quickjs", "Executed {} pending jobs", job_count);
        }
    }

    fn install_globals(&self) -> Result<()> {
        let console = self.console.clone();
        let bindings = Arc::clone(&self.bindings);
        let next_call = Arc::clone(&self.next_call);
        self.context
            .with(|ctx| {
                let global = ctx.globals();
                let log_fn = Function::new(ctx.clone(), move |level: String, text: String| {
                    console.push(level, text);
                })?
                .with_name("__bridge_console")?;
                global.set("__bridge_console", log_fn)?;

                let host_fn = Function::new(ctx.clone(), move |name: String, args: String| {
                    call_host(&bindings, &next_call, &name, &args)
                })?
                .with_name("__bridge_host")?;
                global.set("__bridge_host", host_fn)?;

                ctx.eval::<(), _>(PAGE_BOOTSTRAP.as_bytes())
            })
            .map_err(anyhow::Error::from)
    }

    fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
        let mut script = String::with_capacity(source.len() + filename.len() + 32);
        script.push_str(source);
        if !source.ends_with('\n') {
            script.push('\n');
        }
        script.push_str("//# sourceURL=");
        script.push_str(filename);
        script.push('\n');
        script.into_bytes()
    }
}

/// Run the handler bound under `name` and wrap its answer in the envelope
/// the page-side wrapper unpacks.
fn call_host(bindings: &Bindings, next_call: &AtomicU64, name: &str, args: &str) -> String {
    let seq = next_call.fetch_add(1, Ordering::Relaxed);
    let handler = bindings.lock().get(name).cloned();
    let reply = match handler {
        Some(handler) => catch_unwind(AssertUnwindSafe(|| handler(args)))
            .unwrap_or_else(|_| Err(format!("handler for {name} panicked"))),
        None => Err(format!("{name} is not bound")),
    };
    tracing::trace!(target: "quickjs", seq, %name, ok = reply.is_ok(), "host call returned");
    match reply {
        Ok(result) => json!({ "ok": true, "result": result }).to_string(),
        Err(error) => json!({ "ok": false, "error": error }).to_string(),
    }
}

fn capture_exception_message(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            if let Ok(stack) = obj.get::<_, String>("stack") {
                return Some(format!("Error: {}\nStack: {}", message, stack));
            }
            return Some(format!("Error: {}", message));
        }
    }

    Some(format!("{:?}", exception))
}

const PAGE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    global.window = global;
    if (typeof global.self === 'undefined') {
        global.self = global;
    }

    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            if (value instanceof Error) {
                return String(value);
            }
            if (typeof value === 'object') {
                return JSON.stringify(value);
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const forward = (level) => (...args) => {
        try {
            global.__bridge_console(level, args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    global.console = {
        log: forward('log'),
        info: forward('info'),
        warn: forward('warn'),
        error: forward('error'),
        debug: forward('debug'),
    };

    const host = global.__bridge_host;
    Object.defineProperty(global, '__bridgeExpose', {
        value: (name) => {
            global[name] = (...args) => new Promise((resolve, reject) => {
                const reply = JSON.parse(host(name, JSON.stringify(args)));
                if (reply.ok) {
                    resolve(reply.result === null ? null : JSON.parse(reply.result));
                } else {
                    reject(new Error(reply.error));
                }
            });
        },
    });
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> QuickJsEngine {
        QuickJsEngine::new(ConsoleLog::new(8), Arc::new(Mutex::new(HashMap::new()))).unwrap()
    }

    #[test]
    fn console_is_captured() {
        let console = ConsoleLog::new(8);
        let engine =
            QuickJsEngine::new(console.clone(), Arc::new(Mutex::new(HashMap::new()))).unwrap();
        engine
            .eval("console.warn('low battery', 5, { a: 1 });", "test.js")
            .unwrap();
        assert_eq!(
            console.snapshot(),
            vec![ConsoleMessage {
                level: "warn".into(),
                text: r#"low battery 5 {"a":1}"#.into()
            }]
        );
    }

    #[test]
    fn console_history_is_bounded() {
        let console = ConsoleLog::new(2);
        for n in 0..5 {
            console.push("log".into(), n.to_string());
        }
        let texts: Vec<_> = console.snapshot().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["3", "4"]);
    }

    #[test]
    fn evaluate_settles_promises() {
        let engine = engine();
        assert_eq!(
            engine.evaluate_json("Promise.resolve(41).then((n) => n + 1)").unwrap(),
            json!(42)
        );
        let err = engine
            .evaluate_json("Promise.reject(new Error('nope'))")
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn exposed_binding_round_trips_through_envelope() {
        let bindings: Bindings = Arc::new(Mutex::new(HashMap::new()));
        let handler: BindHandler = Arc::new(|raw: &str| -> Result<Option<String>, String> {
            let args: Vec<i64> = serde_json::from_str(raw).map_err(|e| e.to_string())?;
            match args.iter().sum::<i64>() {
                0 => Err("empty sum".to_string()),
                sum => Ok(Some(sum.to_string())),
            }
        });
        bindings.lock().insert("add".into(), handler);
        let engine = QuickJsEngine::new(ConsoleLog::new(8), Arc::clone(&bindings)).unwrap();
        engine.expose("add").unwrap();

        assert_eq!(engine.evaluate_json("add(2, 3)").unwrap(), json!(5));
        assert_eq!(engine.evaluate_json("add()").unwrap_err().to_string(), "empty sum");
    }

    #[test]
    fn new_page_drops_globals_but_keeps_bindings() {
        let bindings: Bindings = Arc::new(Mutex::new(HashMap::new()));
        let handler: BindHandler = Arc::new(|_: &str| -> Result<Option<String>, String> { Ok(None) });
        bindings.lock().insert("ping".into(), handler);
        let mut engine = QuickJsEngine::new(ConsoleLog::new(8), Arc::clone(&bindings)).unwrap();
        engine.eval("globalThis.leftover = 1;", "test.js").unwrap();
        engine.new_page().unwrap();
        assert_eq!(engine.evaluate_json("typeof leftover").unwrap(), json!("undefined"));
        assert_eq!(engine.evaluate_json("typeof window.ping").unwrap(), json!("function"));
    }
}
