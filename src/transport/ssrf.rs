//! SSRF validation for HTTP-ish upstream URLs.
//!
//! `config::model::BackendValidationConfig`/`SsrfProtection` describe the
//! policy; this module is what actually enforces it before the Transport
//! pool opens a connection to an `http`/`sse`/`streamable-http` upstream.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use url::Url;

use crate::config::model::{BackendValidationConfig, SsrfProtection};
use crate::error::{GatewayError, GatewayResult};

/// Default private/loopback/link-local ranges blocked under `Strict` and
/// (unless overridden) `Balanced`.
fn default_blocked_networks() -> Vec<IpNetwork> {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "0.0.0.0/8",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|s| s.parse().expect("static CIDR literal"))
    .collect()
}

/// Validate an upstream URL against the configured SSRF policy. Called once
/// per connect attempt, not per request — the pool re-validates on every
/// reconnect since DNS can change between attempts.
pub fn validate_backend_url(url_str: &str, cfg: &BackendValidationConfig) -> GatewayResult<()> {
    let url = Url::parse(url_str)
        .map_err(|e| GatewayError::config(format!("invalid backend URL '{url_str}': {e}")))?;

    if !cfg.allowed_schemes.iter().any(|s| s == url.scheme()) {
        return Err(GatewayError::policy_violation(format!(
            "scheme '{}' is not in the allowed list {:?}",
            url.scheme(),
            cfg.allowed_schemes
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| GatewayError::config(format!("backend URL '{url_str}' has no host")))?;

    if cfg.blocked_hosts.iter().any(|h| h == host) {
        return Err(GatewayError::policy_violation(format!(
            "host '{host}' is explicitly blocked"
        )));
    }

    if matches!(cfg.ssrf_protection, SsrfProtection::Disabled) {
        return Ok(());
    }

    // A literal IP can be checked directly; a hostname is checked after
    // resolution by the caller (the transport pool), since this module has
    // no event loop to do async DNS on its own.
    if let Ok(ip) = host.parse::<IpAddr>() {
        validate_ip(ip, cfg)?;
    }

    Ok(())
}

/// Validate a resolved IP address against the policy. Used both for
/// literal-IP hosts (synchronously, from `validate_backend_url`) and for
/// each address a hostname resolves to (by the pool, post-DNS).
pub fn validate_ip(ip: IpAddr, cfg: &BackendValidationConfig) -> GatewayResult<()> {
    let allowed_private = match &cfg.ssrf_protection {
        SsrfProtection::Disabled => return Ok(()),
        SsrfProtection::Strict => &[],
        SsrfProtection::Balanced {
            allowed_private_networks,
        } => allowed_private_networks.as_slice(),
    };

    if allowed_private.iter().any(|net| net.contains(ip)) {
        return Ok(());
    }

    if default_blocked_networks().iter().any(|net| net.contains(ip)) {
        return Err(GatewayError::policy_violation(format!(
            "address {ip} resolves into a private/loopback/link-local range blocked by SSRF protection"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn strict() -> BackendValidationConfig {
        BackendValidationConfig {
            ssrf_protection: SsrfProtection::Strict,
            allowed_schemes: vec!["http".into(), "https".into()],
            blocked_hosts: vec![],
        }
    }

    #[test]
    fn rejects_loopback_under_strict() {
        let err = validate_backend_url("http://127.0.0.1:9000/mcp", &strict());
        assert!(err.is_err());
    }

    #[test]
    fn rejects_private_range_under_strict() {
        let err = validate_backend_url("http://10.1.2.3/mcp", &strict());
        assert!(err.is_err());
    }

    #[test]
    fn allows_public_address_under_strict() {
        let ok = validate_backend_url("https://93.184.216.34/mcp", &strict());
        assert!(ok.is_ok());
    }

    #[test]
    fn disallowed_scheme_is_rejected() {
        let err = validate_backend_url("ftp://example.com/mcp", &strict());
        assert!(err.is_err());
    }

    #[test]
    fn explicit_blocked_host_is_rejected_even_if_public() {
        let cfg = BackendValidationConfig {
            blocked_hosts: vec!["example.com".into()],
            ..strict()
        };
        let err = validate_backend_url("https://example.com/mcp", &cfg);
        assert!(err.is_err());
    }

    #[test]
    fn balanced_allows_a_specific_private_range() {
        let cfg = BackendValidationConfig {
            ssrf_protection: SsrfProtection::Balanced {
                allowed_private_networks: vec![IpNetwork::from_str("10.0.0.0/8").unwrap()],
            },
            ..strict()
        };
        assert!(validate_backend_url("http://10.1.2.3/mcp", &cfg).is_ok());
        assert!(validate_backend_url("http://172.16.0.1/mcp", &cfg).is_err());
    }

    #[test]
    fn disabled_allows_anything_with_an_allowed_scheme() {
        let cfg = BackendValidationConfig {
            ssrf_protection: SsrfProtection::Disabled,
            ..strict()
        };
        assert!(validate_backend_url("http://127.0.0.1/mcp", &cfg).is_ok());
    }
}
