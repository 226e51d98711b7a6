//! Host authorisation and credential checks for logging in nodes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[cfg(test)]
#[path = "security.test.rs"]
mod tests;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Host {0} is not authorized")]
    HostNotAuthorized(String),

    #[error("Authentication protocol mismatch, expected {expected}, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },

    #[error("Malformed credentials: {0}")]
    Malformed(String),
}

impl AuthError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuthError::ProtocolMismatch { .. })
    }
}

/// Who is on the other end of a link once its credentials were verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub protocol: String,
    pub name: String,
    pub host: String,
    pub groups: Option<String>,
}

/// Turns opaque login credentials into an [`Identity`].
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &[u8], host: &str) -> Result<Identity, AuthError>;
}

/// Credentials of the form `unix\0user[ group]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixAuthenticator;

impl UnixAuthenticator {
    const PROTOCOL: &'static str = "unix";
}

impl Authenticator for UnixAuthenticator {
    fn authenticate(&self, credentials: &[u8], host: &str) -> Result<Identity, AuthError> {
        // Too short to carry anything, fall back to the host itself.
        if credentials.len() < 5 {
            return Ok(Identity {
                protocol: "host".to_string(),
                name: "?".to_string(),
                host: host.to_string(),
                groups: None,
            });
        }

        let text = std::str::from_utf8(credentials)
            .map_err(|err| AuthError::Malformed(err.to_string()))?;
        let (protocol, rest) = text.split_once('\0').unwrap_or((text, ""));
        if protocol != Self::PROTOCOL {
            return Err(AuthError::ProtocolMismatch {
                expected: Self::PROTOCOL.to_string(),
                actual: protocol.to_string(),
            });
        }

        let rest = rest.trim_end_matches('\0').trim();
        let (name, groups) = match rest.split_once(' ') {
            Some((name, groups)) => (name, Some(groups.trim().to_string())),
            None => (rest, None),
        };
        if name.is_empty() {
            return Err(AuthError::Malformed("missing user name".to_string()));
        }

        Ok(Identity {
            protocol: Self::PROTOCOL.to_string(),
            name: name.to_string(),
            host: host.to_string(),
            groups: groups.filter(|g| !g.is_empty()),
        })
    }
}

/// Allow list of host names and glob patterns. Positive answers are cached
/// per address for `lifetime`.
pub struct HostAuthorizer {
    patterns: Vec<glob::Pattern>,
    lifetime: Duration,
    cache: Mutex<HashMap<IpAddr, (String, Instant)>>,
}

impl HostAuthorizer {
    /// Build an authorizer from host names or patterns. Invalid patterns are
    /// logged and skipped. An empty list allows every host.
    pub fn new<S: AsRef<str>>(hosts: &[S], lifetime: Duration) -> Self {
        let patterns = hosts
            .iter()
            .filter_map(|host| match glob::Pattern::new(host.as_ref()) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    tracing::warn!(pattern = host.as_ref(), error=%err, "Ignoring invalid host pattern");
                    None
                }
            })
            .collect();
        HostAuthorizer {
            patterns,
            lifetime,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow_all(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Check a login arriving over a connection from `peer` (at `addr`).
    /// With an allow list in force the host named in the login must be the
    /// peer itself.
    pub fn authorize_login(
        &self,
        claimed: &str,
        peer: &str,
        addr: Option<IpAddr>,
    ) -> Result<(), AuthError> {
        self.authorize(peer, addr)?;
        if !self.allow_all() && !claimed.eq_ignore_ascii_case(peer) {
            tracing::warn!(claimed, peer, ?addr, "Login names a different host");
            return Err(AuthError::HostNotAuthorized(claimed.to_string()));
        }
        Ok(())
    }

    /// Check `host` (seen at `addr`) against the allow list.
    pub fn authorize(&self, host: &str, addr: Option<IpAddr>) -> Result<(), AuthError> {
        if self.allow_all() {
            return Ok(());
        }

        if let Some(addr) = addr {
            let mut cache = self.cache.lock();
            match cache.get(&addr) {
                Some((cached, at)) if cached == host && at.elapsed() < self.lifetime => {
                    return Ok(());
                }
                Some(_) => {
                    cache.remove(&addr);
                }
                None => {}
            }
        }

        let host_lc = host.to_ascii_lowercase();
        if !self.patterns.iter().any(|p| p.matches(&host_lc)) {
            tracing::warn!(host, ?addr, "Unauthorized host");
            return Err(AuthError::HostNotAuthorized(host.to_string()));
        }

        if let Some(addr) = addr {
            self.cache
                .lock()
                .insert(addr, (host.to_string(), Instant::now()));
        }
        Ok(())
    }

    /// Take over the patterns of `other`, keeping the shorter lifetime.
    pub fn merge(&mut self, other: HostAuthorizer) {
        for pattern in other.patterns {
            if !self.patterns.contains(&pattern) {
                self.patterns.push(pattern);
            }
        }
        self.lifetime = self.lifetime.min(other.lifetime);
        self.cache.lock().clear();
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}
