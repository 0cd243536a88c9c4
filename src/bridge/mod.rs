//! Host objects exposed to scripts running in a webview.
//!
//! A [`WebviewBridge`] owns one registry of exposed objects and keeps the
//! page's stub graph in step with it: every registration is compiled into
//! the init script, replayed against the current page, and answered through
//! a single bound transport function.

mod compiler;
mod descriptor;
mod error;
mod registry;
mod router;
mod value;
mod watcher;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;

pub use compiler::{CompiledScript, InitScriptCompiler, BRIDGE_BOOTSTRAP};
pub use descriptor::{
    ChildDescriptor, DescriptorBuilder, ExposedObject, FunctionDescriptor, Instance,
    ObjectDescriptor, ObjectRef, PropertyDescriptor, ValueFlags,
};
pub use error::{BridgeError, ErrorKind, Operation};
pub use registry::{BoundObject, ObjectId, ObjectRegistry, Registration};
pub use router::{DispatchRouter, Message};
pub use value::{coerce, Fingerprint, FunctionArgs, ValueCell};
pub use watcher::{BroadcastSink, MutationWatcher, WatchHandle};

use crate::config::BridgeConfig;
use crate::surface::{BindHandler, WebviewSurface};

/// What an `INIT` message re-issues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitPolicy {
    /// Re-walk every root, picking up swapped children.
    #[default]
    Roots,
    /// Re-issue every registered path as it stands. INIT does not walk, so
    /// swapped children are only picked up by the next define or remove.
    All,
}

/// Sends broadcasts through the surface's eval queue.
struct SurfaceSink {
    surface: Arc<dyn WebviewSurface>,
}

impl BroadcastSink for SurfaceSink {
    fn broadcast(&self, channel: &str, data: &JsonValue) {
        if let Err(err) = self.surface.eval(&compiler::broadcast(channel, data)) {
            tracing::debug!(target: "bridge", %channel, error = %err, "broadcast dropped");
        }
    }
}

/// State shared by the facade and the router.
pub(crate) struct BridgeCore {
    registry: ObjectRegistry,
    compiler: InitScriptCompiler,
    surface: Arc<dyn WebviewSurface>,
    sink: Arc<SurfaceSink>,
    watcher: MutationWatcher,
    watches: Mutex<Vec<WatchHandle>>,
    policy: InitPolicy,
}

impl BridgeCore {
    pub(crate) fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Start watchers for new records and stop those of released ones.
    fn apply(&self, registration: &Registration) {
        let mut watches = self.watches.lock();
        if !registration.released.is_empty() {
            let released: HashSet<&ObjectId> =
                registration.released.iter().map(|bound| bound.id()).collect();
            watches.retain(|handle| {
                if released.contains(handle.object_id()) {
                    handle.stop();
                    false
                } else {
                    true
                }
            });
        }
        watches.retain(|handle| !handle.is_finished());
        for bound in registration.bound.iter().filter(|bound| bound.is_live()) {
            watches.extend(self.watcher.watch(bound));
        }
    }

    /// Compile the init script and install it for future page loads.
    ///
    /// Returns the registry changes of the compile pass; only a walking
    /// pass can have any.
    fn install_init_script(&self, walk: bool) -> Result<Registration, BridgeError> {
        let CompiledScript {
            script,
            registration,
        } = if walk {
            self.compiler.compile(&self.registry)
        } else {
            self.compiler.compile_registered(&self.registry)
        };
        self.apply(&registration);
        self.surface.set_init_script(&script)?;
        Ok(registration)
    }

    /// Apply an explicit registry change to the page, then recompile.
    ///
    /// When the recompile's walk changed the registry too, its statements
    /// are replayed so the page matches the registry again.
    fn publish(&self, registration: Registration) -> Result<(), BridgeError> {
        self.apply(&registration);
        for statement in &registration.statements {
            self.surface.eval(statement)?;
        }
        let resync = self.install_init_script(true)?;
        if !resync.bound.is_empty() || !resync.released.is_empty() {
            tracing::debug!(
                target: "bridge",
                bound = resync.bound.len(),
                released = resync.released.len(),
                "walk changed the registry; replaying stubs"
            );
            for statement in &resync.statements {
                self.surface.eval(statement)?;
            }
        }
        Ok(())
    }

    /// Handle `INIT`: refresh the init script and replay the stubs against
    /// the page that sent it.
    pub(crate) fn reinitialize(&self) -> Result<(), BridgeError> {
        let walk = self.policy == InitPolicy::Roots;
        let statements = self.install_init_script(walk)?.statements;
        tracing::debug!(
            target: "bridge",
            policy = ?self.policy,
            statements = statements.len(),
            "initializing page"
        );
        for statement in &statements {
            self.surface.eval(statement)?;
        }
        self.surface
            .eval(&compiler::console_log("Bridge init completed."))?;
        Ok(())
    }

    fn stop_watchers(&self) {
        for handle in self.watches.lock().drain(..) {
            handle.stop();
        }
    }
}

/// Exposes host objects to the page loaded in a [`WebviewSurface`].
pub struct WebviewBridge {
    core: Arc<BridgeCore>,
    router: Arc<DispatchRouter>,
    binding_name: String,
    closed: AtomicBool,
}

impl WebviewBridge {
    /// Bind the transport on `surface` and install the bootstrap script.
    ///
    /// Mutation watchers run on the current tokio runtime; outside one this
    /// fails with [`BridgeError::NoRuntime`].
    pub fn new(
        surface: Arc<dyn WebviewSurface>,
        config: &BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let handle = Handle::try_current()?;
        Self::with_handle(surface, config, handle)
    }

    pub fn with_handle(
        surface: Arc<dyn WebviewSurface>,
        config: &BridgeConfig,
        handle: Handle,
    ) -> Result<Self, BridgeError> {
        let sink = Arc::new(SurfaceSink {
            surface: Arc::clone(&surface),
        });
        let watcher = MutationWatcher::new(
            handle,
            Duration::from_millis(config.poll_interval_ms),
            Arc::clone(&sink) as Arc<dyn BroadcastSink>,
        );
        let core = Arc::new(BridgeCore {
            registry: ObjectRegistry::new(),
            compiler: InitScriptCompiler::new(config.binding_name.clone()),
            surface: Arc::clone(&surface),
            sink,
            watcher,
            watches: Mutex::new(Vec::new()),
            policy: config.init_policy,
        });
        let router = Arc::new(DispatchRouter::new(Arc::clone(&core)));

        let weak: Weak<DispatchRouter> = Arc::downgrade(&router);
        let handler: BindHandler = Arc::new(move |raw: &str| -> Result<Option<String>, String> {
            let router = weak
                .upgrade()
                .ok_or_else(|| "bridge has been closed".to_string())?;
            router.dispatch(raw).map_err(|err| err.to_script_message())
        });
        surface.bind(&config.binding_name, handler)?;
        core.install_init_script(true)?;
        // The current page may have loaded before the init script was set.
        surface.eval(&core.compiler.bootstrap())?;

        tracing::info!(
            target: "bridge",
            binding = %config.binding_name,
            poll_interval_ms = config.poll_interval_ms,
            policy = ?config.init_policy,
            "bridge attached"
        );

        Ok(Self {
            core,
            router,
            binding_name: config.binding_name.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Expose `object` at `path` and declare it on the current page.
    ///
    /// A path already in use is replaced, together with everything below it.
    /// A path some registered parent exposes as a child is refused with
    /// [`BridgeError::DeclaredChild`].
    pub fn define_object<T: ExposedObject>(
        &self,
        path: &str,
        object: Arc<T>,
    ) -> Result<ObjectId, BridgeError> {
        let registration = self.core.registry.register(path, ObjectRef::new(object))?;
        self.core.publish(registration)?;
        self.core
            .registry
            .lookup_path(path)
            .map(|bound| bound.id().clone())
            .ok_or_else(|| BridgeError::InvalidPath {
                path: path.to_string(),
            })
    }

    /// Remove `path` and its subtree from the registry and the page.
    pub fn remove_object(&self, path: &str) -> Result<(), BridgeError> {
        let registration = self.core.registry.unregister(path)?;
        self.core.publish(registration)
    }

    /// Send `data` to script listeners of `channel`.
    pub fn emit<D: Serialize>(&self, channel: &str, data: &D) -> Result<(), BridgeError> {
        let data = serde_json::to_value(data).map_err(|err| BridgeError::host(err.into()))?;
        self.core.sink.broadcast(channel, &data);
        Ok(())
    }

    /// Feed one raw transport message through the router, as the surface would.
    pub fn dispatch(&self, raw: &str) -> Result<Option<String>, BridgeError> {
        self.router.dispatch(raw)
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.core.registry
    }

    pub fn router(&self) -> &DispatchRouter {
        &self.router
    }

    pub fn init_policy(&self) -> InitPolicy {
        self.core.policy
    }

    /// Number of running mutation watchers.
    pub fn active_watchers(&self) -> usize {
        let mut watches = self.core.watches.lock();
        watches.retain(|handle| !handle.is_finished());
        watches.len()
    }

    /// Unbind the transport, drop every registration and stop watchers.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.core.surface.unbind(&self.binding_name) {
            tracing::debug!(target: "bridge", error = %err, "unbind during close failed");
        }
        let registration = self.core.registry.clear();
        self.core.apply(&registration);
        self.core.stop_watchers();
        tracing::info!(target: "bridge", "bridge closed");
    }
}

impl Drop for WebviewBridge {
    fn drop(&mut self) {
        self.close();
    }
}
