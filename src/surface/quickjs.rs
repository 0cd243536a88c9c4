use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::engine::{Bindings, ConsoleLog, QuickJsEngine};
use super::scripts::inline_classic_scripts;
use super::{BindHandler, SurfaceError, WebviewSurface};

pub use super::engine::ConsoleMessage;

const BLANK_PAGE: &str = "about:blank";

enum Command {
    Navigate(Url),
    SetHtml(String),
    SetInitScript(String),
    Eval(String),
    Bind(String),
    Unbind(String),
    Evaluate {
        expression: String,
        respond_to: oneshot::Sender<Result<JsonValue, String>>,
    },
    Close,
}

/// Headless webview backed by QuickJS.
///
/// The engine lives on a dedicated loop thread. Every operation is queued
/// onto that thread and returns immediately; bound handlers are called on
/// it, synchronously, while the calling script waits.
pub struct QuickJsSurface {
    commands: mpsc::UnboundedSender<Command>,
    console: ConsoleLog,
    bindings: Bindings,
    current_url: Arc<Mutex<Url>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl QuickJsSurface {
    /// Start the loop thread with an empty page.
    ///
    /// Resolves once the engine is up on the loop thread.
    pub async fn start(console_capacity: usize) -> Result<Self, SurfaceError> {
        let console = ConsoleLog::new(console_capacity);
        let bindings: Bindings = Arc::new(Mutex::new(HashMap::new()));
        let current_url = Arc::new(Mutex::new(Url::parse(BLANK_PAGE)?));
        let (commands, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = spawn_loop(
            console.clone(),
            Arc::clone(&bindings),
            Arc::clone(&current_url),
            rx,
            ready_tx,
        )?;
        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(SurfaceError::Engine(message)),
            Err(_) => {
                return Err(SurfaceError::Engine(
                    "surface loop exited during startup".into(),
                ))
            }
        }

        Ok(Self {
            commands,
            console,
            bindings,
            current_url,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Evaluate `expression` on the loop thread and return its JSON value.
    ///
    /// Promises are settled before the value is read. Must not be awaited
    /// from inside a bound handler, which already runs on the loop thread.
    pub async fn evaluate(&self, expression: &str) -> Result<JsonValue, SurfaceError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::Evaluate {
            expression: expression.to_string(),
            respond_to,
        })?;
        match rx.await {
            Ok(result) => result.map_err(SurfaceError::Engine),
            Err(_) => Err(SurfaceError::Closed),
        }
    }

    /// Console output of every page loaded so far, oldest first.
    pub fn console_messages(&self) -> Vec<ConsoleMessage> {
        self.console.snapshot()
    }

    pub fn current_url(&self) -> Url {
        self.current_url.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send(&self, command: Command) -> Result<(), SurfaceError> {
        if self.is_closed() {
            return Err(SurfaceError::Closed);
        }
        self.commands.send(command).map_err(|_| SurfaceError::Closed)
    }
}

impl WebviewSurface for QuickJsSurface {
    fn navigate(&self, url: &str) -> Result<(), SurfaceError> {
        let url = Url::parse(url)?;
        self.send(Command::Navigate(url))
    }

    fn set_html(&self, html: &str) -> Result<(), SurfaceError> {
        self.send(Command::SetHtml(html.to_string()))
    }

    fn set_init_script(&self, script: &str) -> Result<(), SurfaceError> {
        self.send(Command::SetInitScript(script.to_string()))
    }

    fn eval(&self, script: &str) -> Result<(), SurfaceError> {
        self.send(Command::Eval(script.to_string()))
    }

    fn bind(&self, name: &str, handler: BindHandler) -> Result<(), SurfaceError> {
        if self.is_closed() {
            return Err(SurfaceError::Closed);
        }
        self.bindings.lock().insert(name.to_string(), handler);
        self.send(Command::Bind(name.to_string()))
    }

    fn unbind(&self, name: &str) -> Result<(), SurfaceError> {
        self.bindings.lock().remove(name);
        if self.is_closed() {
            return Ok(());
        }
        self.send(Command::Unbind(name.to_string()))
    }

    fn run(&self) -> Result<(), SurfaceError> {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| SurfaceError::Engine("surface loop panicked".into()))?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), SurfaceError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // The loop may already be gone; closing twice is not an error.
        let _ = self.commands.send(Command::Close);
        Ok(())
    }
}

impl Drop for QuickJsSurface {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn spawn_loop(
    console: ConsoleLog,
    bindings: Bindings,
    current_url: Arc<Mutex<Url>>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<(), String>>,
) -> Result<thread::JoinHandle<()>, SurfaceError> {
    thread::Builder::new()
        .name("webview-surface".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready.send(Err(format!("surface loop runtime: {err}")));
                    return;
                }
            };
            let engine = match QuickJsEngine::new(console, bindings) {
                Ok(engine) => engine,
                Err(err) => {
                    let _ = ready.send(Err(format!("{err:#}")));
                    return;
                }
            };
            let _ = ready.send(Ok(()));

            runtime.block_on(async move {
                let mut page = Page {
                    engine,
                    init_script: None,
                    current_url,
                };
                while let Some(command) = rx.recv().await {
                    if !page.handle(command) {
                        break;
                    }
                }
                tracing::debug!(target: "surface", "surface loop stopped");
            });
        })
        .map_err(|err| SurfaceError::Engine(format!("failed to spawn surface loop: {err}")))
}

struct Page {
    engine: QuickJsEngine,
    init_script: Option<String>,
    current_url: Arc<Mutex<Url>>,
}

impl Page {
    /// Returns `false` once the loop should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Navigate(url) => {
                tracing::info!(target: "surface", %url, "navigating");
                self.load(Some(url));
            }
            Command::SetHtml(html) => {
                // Inline documents keep the current URL.
                self.load(None);
                self.run_inline_scripts(&html);
            }
            Command::SetInitScript(script) => {
                self.init_script = Some(script);
            }
            Command::Eval(script) => {
                if let Err(err) = self.engine.eval(&script, "bridge://eval") {
                    tracing::warn!(target: "surface", error = %err, "eval failed");
                }
            }
            Command::Bind(name) => {
                if let Err(err) = self.engine.expose(&name) {
                    tracing::warn!(target: "surface", %name, error = %err, "bind failed");
                }
            }
            Command::Unbind(name) => {
                if let Err(err) = self.engine.conceal(&name) {
                    tracing::warn!(target: "surface", %name, error = %err, "unbind failed");
                }
            }
            Command::Evaluate {
                expression,
                respond_to,
            } => {
                let result = self
                    .engine
                    .evaluate_json(&expression)
                    .map_err(|err| format!("{err:#}"));
                let _ = respond_to.send(result);
            }
            Command::Close => return false,
        }
        true
    }

    /// Fresh page with the init script already run.
    fn load(&mut self, url: Option<Url>) {
        if let Err(err) = self.engine.new_page() {
            tracing::error!(target: "surface", error = %err, "failed to start page");
            return;
        }
        if let Some(url) = url {
            *self.current_url.lock() = url;
        }
        if let Some(script) = &self.init_script {
            if let Err(err) = self.engine.eval(script, "bridge://init-script") {
                tracing::error!(target: "surface", error = %err, "init script failed");
            }
        }
    }

    fn run_inline_scripts(&self, html: &str) {
        let scripts = match inline_classic_scripts(html) {
            Ok(scripts) => scripts,
            Err(err) => {
                tracing::warn!(target: "surface", error = %err, "could not parse page");
                return;
            }
        };
        let mut executed = 0usize;
        for script in &scripts {
            let filename = script.filename();
            match self.engine.eval(&script.code, &filename) {
                Ok(()) => executed += 1,
                Err(err) => {
                    tracing::error!(target: "surface", %filename, error = %err, "inline script execution failed");
                }
            }
        }
        tracing::debug!(target: "surface", executed, total = scripts.len(), "ran inline scripts");
    }
}
