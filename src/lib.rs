// Library exports for the bridge, its surfaces and configuration

pub mod bridge;
pub mod config;
pub mod surface;

// Re-export commonly used types
pub use bridge::{
    BridgeError, DescriptorBuilder, ExposedObject, InitPolicy, ValueCell, ValueFlags,
    WebviewBridge,
};
pub use config::BridgeConfig;
pub use surface::{QuickJsSurface, WebviewSurface};
