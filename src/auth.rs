//! A simple API-key gate for the operational and wire HTTP surfaces.
//!
//! The gateway's Non-goals explicitly exclude an authz policy engine: this is
//! a single shared-secret check, not OAuth, not per-tool scopes. Keys are
//! short-lived signed tokens (HS256 via `jsonwebtoken`) rather than a bare
//! string compare, so a leaked request log doesn't hand out a permanent
//! credential — but there is exactly one tier of access, "in" or "out".

use std::time::{SystemTime, UNIX_EPOCH};

use secrecy::{ExposeSecret, SecretString};

use crate::error::{GatewayError, GatewayResult};

/// Validates bearer tokens against a single shared signing key.
///
/// Constructed once at startup from `AuthConfig::signing_key_path`; absence
/// of a configured gate (`auth: None` in the config) means every request is
/// allowed, matching the Non-goal that there is no authz engine by default.
#[derive(Clone)]
pub struct ApiKeyGate {
    secret: SecretString,
    ttl_secs: u64,
}

impl std::fmt::Debug for ApiKeyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyGate")
            .field("secret", &"<redacted>")
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

impl ApiKeyGate {
    pub fn new(secret: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            secret: SecretString::from(secret.into()),
            ttl_secs,
        }
    }

    /// Load from the path named in `AuthConfig::signing_key_path`. The file
    /// holds the raw shared secret, trimmed of trailing whitespace.
    pub fn load(path: &str, ttl_secs: u64) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::config_with_key(format!("failed to read signing key: {e}"), path))?;
        Ok(Self::new(raw.trim().to_string(), ttl_secs))
    }

    /// Mint a fresh bearer token for an operator-facing CLI command
    /// (`health-check` against a gate-protected `/health`).
    pub fn issue(&self, subject: &str) -> GatewayResult<String> {
        let now = Self::now()?;
        let claims = Claims {
            sub: subject.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&claims, self.secret.expose_secret())
    }

    /// Validate a bearer token extracted from an `Authorization` header.
    /// Returns the subject on success.
    pub fn authenticate(&self, bearer_token: &str) -> GatewayResult<String> {
        let claims = decode(bearer_token, self.secret.expose_secret())?;
        let now = Self::now()?;
        if claims.exp < now {
            return Err(GatewayError::PolicyViolation {
                message: "API key expired".to_string(),
            });
        }
        Ok(claims.sub)
    }

    fn now() -> GatewayResult<u64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|e| GatewayError::internal(format!("system clock before epoch: {e}")))
    }
}

#[cfg(feature = "auth")]
#[derive(serde::Serialize, serde::Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    exp: u64,
}

#[cfg(feature = "auth")]
fn encode(claims: &Claims, secret: &str) -> GatewayResult<String> {
    use jsonwebtoken::{EncodingKey, Header, Algorithm};
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| GatewayError::internal(format!("token signing failed: {e}")))
}

#[cfg(feature = "auth")]
fn decode(token: &str, secret: &str) -> GatewayResult<Claims> {
    use jsonwebtoken::{Algorithm, DecodingKey, Validation};
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|e| GatewayError::PolicyViolation {
        message: format!("invalid API key: {e}"),
    })
}

#[cfg(not(feature = "auth"))]
#[derive(serde::Serialize, serde::Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    exp: u64,
}

#[cfg(not(feature = "auth"))]
fn encode(_claims: &Claims, _secret: &str) -> GatewayResult<String> {
    Err(GatewayError::internal("auth feature not enabled"))
}

#[cfg(not(feature = "auth"))]
fn decode(_token: &str, _secret: &str) -> GatewayResult<Claims> {
    Err(GatewayError::internal("auth feature not enabled"))
}

/// Extract the bearer token from an `Authorization` header value, if present.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ").map(str::trim)
}

#[cfg(all(test, feature = "auth"))]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_valid_token() {
        let gate = ApiKeyGate::new("shared-secret", 3600);
        let token = gate.issue("agent-1").unwrap();
        let subject = gate.authenticate(&token).unwrap();
        assert_eq!(subject, "agent-1");
    }

    #[test]
    fn rejects_token_signed_with_a_different_secret() {
        let gate_a = ApiKeyGate::new("secret-a", 3600);
        let gate_b = ApiKeyGate::new("secret-b", 3600);
        let token = gate_a.issue("agent-1").unwrap();
        assert!(gate_b.authenticate(&token).is_err());
    }

    #[test]
    fn rejects_an_expired_token() {
        let gate = ApiKeyGate::new("shared-secret", 0);
        let token = gate.issue("agent-1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(gate.authenticate(&token).is_err());
    }

    #[test]
    fn bearer_token_strips_prefix() {
        assert_eq!(bearer_token("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
