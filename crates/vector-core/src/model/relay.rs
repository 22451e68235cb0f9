use serde::{Deserialize, Serialize};
use url::Url;

/// The role(s) under which a relay was declared for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayRole {
    InboxOnly,
    OutboxOnly,
    Both,
    DmRelay,
}

impl RelayRole {
    pub fn is_inbox(self) -> bool {
        matches!(self, RelayRole::InboxOnly | RelayRole::Both)
    }

    pub fn is_outbox(self) -> bool {
        matches!(self, RelayRole::OutboxOnly | RelayRole::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub uri: String,
    pub role: RelayRole,
}

/// A relay URI is valid iff it's `ws://` or `wss://` with a non-empty host.
/// Anything else is rejected at ingress (§3).
pub fn is_valid_relay_uri(uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => matches!(url.scheme(), "ws" | "wss") && url.host_str().is_some_and(|h| !h.is_empty()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_wss_with_host() {
        assert!(is_valid_relay_uri("wss://relay.example.com"));
    }

    #[test]
    fn rejects_http_scheme() {
        assert!(!is_valid_relay_uri("https://relay.example.com"));
    }

    #[test]
    fn rejects_empty_host() {
        assert!(!is_valid_relay_uri("wss:///path"));
    }
}
