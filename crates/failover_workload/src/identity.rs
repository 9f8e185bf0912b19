//! Serving-node attribution derived from session-level identity metadata.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use serde::Serialize;

/// Role the serving node reported for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Writer,
    Reader,
    Unknown,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::Unknown => "unknown",
        }
    }
}

/// Raw identity row as read from the session: hostname plus read-only flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub hostname: Option<String>,
    pub read_only: bool,
}

/// The physical node that served a request.
///
/// Equality and hashing only look at `short_hostname`; the role is carried
/// for diagnostics (a write landing on a `reader` is a routing defect).
#[derive(Debug, Clone, Serialize)]
pub struct NodeIdentity {
    pub short_hostname: String,
    pub role: Role,
}

impl NodeIdentity {
    /// Identity used when the lookup failed or returned nothing usable.
    pub fn unknown() -> Self {
        Self {
            short_hostname: "unknown".to_string(),
            role: Role::Unknown,
        }
    }

    /// Classifies a raw `(hostname, read_only)` pair. The result only depends
    /// on its inputs, so the same pair always yields an equal identity.
    pub fn from_session(hostname: Option<&str>, read_only: bool) -> Self {
        let hostname = match hostname.map(str::trim) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Self::unknown(),
        };
        let role = if read_only { Role::Reader } else { Role::Writer };
        Self {
            short_hostname: short_hostname(hostname).to_string(),
            role,
        }
    }

    pub fn is_known(&self) -> bool {
        self.role != Role::Unknown
    }
}

impl From<SessionIdentity> for NodeIdentity {
    fn from(session: SessionIdentity) -> Self {
        NodeIdentity::from_session(session.hostname.as_deref(), session.read_only)
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.short_hostname == other.short_hostname
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.short_hostname.hash(state);
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "{} ({})", self.short_hostname, self.role.as_str())
        } else {
            f.write_str(&self.short_hostname)
        }
    }
}

/// First DNS label of `hostname`; IP literals are kept whole.
fn short_hostname(hostname: &str) -> &str {
    if hostname.parse::<IpAddr>().is_ok() {
        return hostname;
    }
    match hostname.find('.') {
        Some(idx) if idx > 0 => &hostname[..idx],
        _ => hostname,
    }
}
