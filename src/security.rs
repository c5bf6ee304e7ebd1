//! `SecurityGate`: bearer-token + IP allowlist check per mode.

use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use tracing::debug;

use crate::config::{SecurityConfig, SecurityMode};
use crate::error::ProxyError;

/// The two headers and the peer address `SecurityGate` needs. Deliberately
/// decoupled from any particular HTTP framework type so it can be unit
/// tested without standing up an Axum request.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub authorization_header: Option<String>,
    pub forwarded_for: Option<String>,
    pub peer_addr: Option<IpAddr>,
}

impl RequestIdentity {
    /// Strips an optional case-insensitive `Bearer ` prefix.
    fn bearer_token(&self) -> Option<&str> {
        let header = self.authorization_header.as_deref()?;
        let trimmed = header.trim();
        if trimmed.len() >= 7 && trimmed[..7].eq_ignore_ascii_case("bearer ") {
            Some(trimmed[7..].trim())
        } else {
            Some(trimmed)
        }
    }

    /// First hop of `X-Forwarded-For`, else the peer address, else loopback.
    fn effective_ip(&self) -> IpAddr {
        if let Some(xff) = &self.forwarded_for {
            if let Some(first) = xff.split(',').next() {
                if let Ok(ip) = IpAddr::from_str(first.trim()) {
                    return ip;
                }
            }
        }
        self.peer_addr.unwrap_or(IpAddr::from([127, 0, 0, 1]))
    }
}

/// Validate a request against the configured security mode.
///
/// # Errors
/// Returns `ProxyError::Unauthorized` for a missing/invalid token, or
/// `ProxyError::Forbidden` for a disallowed client IP.
pub fn check(identity: &RequestIdentity, config: &SecurityConfig) -> Result<(), ProxyError> {
    let ip = identity.effective_ip();

    match config.mode {
        SecurityMode::Lax => {
            if !ip.is_loopback() {
                debug!(%ip, "lax mode rejected non-loopback client");
                return Err(ProxyError::forbidden("lax mode only allows loopback clients"));
            }
            Ok(())
        }
        SecurityMode::Relaxed => {
            check_token(identity, config)?;
            Ok(())
        }
        SecurityMode::Strict => {
            check_token(identity, config)?;
            check_ip(ip, config)?;
            Ok(())
        }
    }
}

fn check_token(identity: &RequestIdentity, config: &SecurityConfig) -> Result<(), ProxyError> {
    if config.api_keys.is_empty() {
        return Err(ProxyError::unauthorized("no api keys configured"));
    }
    match identity.bearer_token() {
        Some(token) if config.api_keys.iter().any(|k| k == token) => Ok(()),
        _ => Err(ProxyError::unauthorized("missing or invalid bearer token")),
    }
}

fn check_ip(ip: IpAddr, config: &SecurityConfig) -> Result<(), ProxyError> {
    if ip.is_loopback() {
        return Ok(());
    }
    let allowed = config.allowed_ips.iter().any(|entry| {
        IpNetwork::from_str(entry)
            .map(|net| net.contains(ip))
            .unwrap_or_else(|_| IpAddr::from_str(entry).map(|a| a == ip).unwrap_or(false))
    });
    if allowed {
        Ok(())
    } else {
        Err(ProxyError::forbidden(format!("{ip} is not in the allowlist")))
    }
}
