//! The embedded browser surface the bridge drives.
//!
//! The bridge only needs the handful of operations below; the QuickJS
//! surface implements them headlessly and the recording surface captures
//! them for tests.

mod engine;
pub mod quickjs;
pub mod recording;
mod scripts;

use std::sync::Arc;

use thiserror::Error;

pub use quickjs::{ConsoleMessage, QuickJsSurface};
pub use recording::RecordingSurface;

/// Handler behind a bound transport name.
///
/// Receives the JSON array of script-side arguments and returns the encoded
/// result (`None` for `null`) or the rejection message.
pub type BindHandler = Arc<dyn Fn(&str) -> Result<Option<String>, String> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("webview surface is closed")]
    Closed,
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("script engine error: {0}")]
    Engine(String),
}

/// Operations consumed from the host webview.
///
/// Every method may be called from any thread. Implementations hop onto
/// their own loop thread and return without waiting for the work to run.
pub trait WebviewSurface: Send + Sync {
    fn navigate(&self, url: &str) -> Result<(), SurfaceError>;

    fn set_html(&self, html: &str) -> Result<(), SurfaceError>;

    /// Script that runs before every subsequent page load.
    fn set_init_script(&self, script: &str) -> Result<(), SurfaceError>;

    fn eval(&self, script: &str) -> Result<(), SurfaceError>;

    fn bind(&self, name: &str, handler: BindHandler) -> Result<(), SurfaceError>;

    fn unbind(&self, name: &str) -> Result<(), SurfaceError>;

    /// Block until the surface is closed.
    fn run(&self) -> Result<(), SurfaceError>;

    fn close(&self) -> Result<(), SurfaceError>;
}
