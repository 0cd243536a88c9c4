use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use serde_json::Value as JsonValue;

use super::{BindHandler, SurfaceError, WebviewSurface};

const BROADCAST_PREFIX: &str = "window.Bridge.__internal.broadcast(";

/// Surface that executes nothing and records everything.
///
/// Inbound calls are simulated with [`RecordingSurface::invoke`].
#[derive(Default)]
pub struct RecordingSurface {
    evals: Mutex<Vec<String>>,
    init_script: Mutex<Option<String>>,
    pages: Mutex<Vec<String>>,
    handlers: Mutex<HashMap<String, BindHandler>>,
    closed: AtomicBool,
    closed_signal: Condvar,
    closed_lock: Mutex<()>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `raw` to the handler bound under `name`.
    pub fn invoke(&self, name: &str, raw: &str) -> Result<Option<String>, String> {
        let handler = self
            .handlers
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| format!("nothing bound under {name}"))?;
        handler(raw)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.handlers.lock().contains_key(name)
    }

    pub fn evals(&self) -> Vec<String> {
        self.evals.lock().clone()
    }

    pub fn take_evals(&self) -> Vec<String> {
        std::mem::take(&mut *self.evals.lock())
    }

    pub fn init_script(&self) -> Option<String> {
        self.init_script.lock().clone()
    }

    /// URLs and HTML documents loaded so far, in order.
    pub fn pages(&self) -> Vec<String> {
        self.pages.lock().clone()
    }

    /// Broadcasts found among the recorded evals, decoded.
    pub fn broadcasts(&self) -> Vec<(String, JsonValue)> {
        self.evals
            .lock()
            .iter()
            .filter_map(|script| parse_broadcast(script))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), SurfaceError> {
        if self.is_closed() {
            Err(SurfaceError::Closed)
        } else {
            Ok(())
        }
    }
}

fn parse_broadcast(script: &str) -> Option<(String, JsonValue)> {
    let args = script.strip_prefix(BROADCAST_PREFIX)?.strip_suffix(");")?;
    let parsed: (String, JsonValue) = serde_json::from_str(&format!("[{args}]")).ok()?;
    Some(parsed)
}

impl WebviewSurface for RecordingSurface {
    fn navigate(&self, url: &str) -> Result<(), SurfaceError> {
        self.ensure_open()?;
        url::Url::parse(url)?;
        self.pages.lock().push(url.to_string());
        Ok(())
    }

    fn set_html(&self, html: &str) -> Result<(), SurfaceError> {
        self.ensure_open()?;
        self.pages.lock().push(html.to_string());
        Ok(())
    }

    fn set_init_script(&self, script: &str) -> Result<(), SurfaceError> {
        self.ensure_open()?;
        *self.init_script.lock() = Some(script.to_string());
        Ok(())
    }

    fn eval(&self, script: &str) -> Result<(), SurfaceError> {
        self.ensure_open()?;
        self.evals.lock().push(script.to_string());
        Ok(())
    }

    fn bind(&self, name: &str, handler: BindHandler) -> Result<(), SurfaceError> {
        self.ensure_open()?;
        self.handlers.lock().insert(name.to_string(), handler);
        Ok(())
    }

    fn unbind(&self, name: &str) -> Result<(), SurfaceError> {
        self.handlers.lock().remove(name);
        Ok(())
    }

    fn run(&self) -> Result<(), SurfaceError> {
        let mut guard = self.closed_lock.lock();
        while !self.is_closed() {
            self.closed_signal.wait(&mut guard);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), SurfaceError> {
        let _guard = self.closed_lock.lock();
        self.closed.store(true, Ordering::Release);
        self.closed_signal.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn decodes_recorded_broadcasts() {
        let surface = RecordingSurface::new();
        surface
            .eval(r#"window.Bridge.__internal.broadcast("count",{"n":2});"#)
            .unwrap();
        surface.eval("console.log('unrelated');").unwrap();
        assert_eq!(surface.broadcasts(), vec![("count".to_string(), json!({"n": 2}))]);
    }

    #[test]
    fn closed_surface_rejects_work() {
        let surface = RecordingSurface::new();
        surface.close().unwrap();
        surface.run().unwrap();
        assert!(matches!(surface.eval("1"), Err(SurfaceError::Closed)));
    }

    #[test]
    fn records_loaded_pages_in_order() {
        let surface = RecordingSurface::new();
        surface.navigate("https://example.com/").unwrap();
        surface.set_html("<p>hi</p>").unwrap();
        assert!(matches!(
            surface.navigate("not a url"),
            Err(SurfaceError::InvalidUrl(_))
        ));
        assert_eq!(
            surface.pages(),
            vec!["https://example.com/".to_string(), "<p>hi</p>".to_string()]
        );
    }

    #[test]
    fn invoke_reaches_bound_handler() {
        let surface = RecordingSurface::new();
        let handler: BindHandler =
            Arc::new(|raw: &str| -> Result<Option<String>, String> { Ok(Some(raw.len().to_string())) });
        surface.bind("echo", handler).unwrap();
        assert_eq!(surface.invoke("echo", "[1,2]"), Ok(Some("5".to_string())));
        surface.unbind("echo").unwrap();
        assert!(surface.invoke("echo", "[]").is_err());
    }
}
