//! Configuration model, validation, and hot reload.

pub mod loader;
pub mod model;
pub mod reload;

pub use loader::{default_config_path, load_default_or_builtin, load_from_path, validate};
pub use model::{
    AuthConfig, BackendTransportConfig, BackendValidationConfig, GatewayConfig, GatewaySettings,
    LogFormat, LoggingConfig, PoliciesConfig, ServerConfig, SessionMode, SsrfProtection,
    VirtualToolConfig, VirtualToolOp, RESERVED_SERVER_ID, VIRTUAL_SERVER_ID,
};
pub use reload::{ConfigDiff, ConfigReloader, ReloadHook};
