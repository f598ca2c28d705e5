//! Process exit codes (§6). Stable across releases — scripts and container
//! healthchecks key off these numbers, not the accompanying message.

/// Command completed successfully.
pub const SUCCESS: i32 = 0;
/// Arguments failed clap's own parsing/validation (clap already exits with
/// its own code before reaching us in most cases; this covers the rest).
pub const INVALID_ARGUMENTS: i32 = 2;
/// Config file missing (on an explicit path), malformed, or failed
/// validation.
pub const CONFIG_ERROR: i32 = 3;
/// The configured bind address was already in use.
pub const PORT_IN_USE: i32 = 4;
/// Anything else unexpected.
pub const INTERNAL_ERROR: i32 = 1;

/// Map a [`GatewayError`](crate::error::GatewayError) to a process exit code.
pub fn from_gateway_error(err: &crate::error::GatewayError) -> i32 {
    use crate::error::GatewayError;
    match err {
        GatewayError::Config { .. } => CONFIG_ERROR,
        GatewayError::InvalidParams { .. } => INVALID_ARGUMENTS,
        GatewayError::Io(e) if e.kind() == std::io::ErrorKind::AddrInUse => PORT_IN_USE,
        _ => INTERNAL_ERROR,
    }
}
