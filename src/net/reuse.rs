//! Connection pooling tag.

/// Marks a socket as reusable for later requests to the same origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReuseTag {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Set while a request is in flight on the socket.
    pub is_busy: bool,
}

impl ReuseTag {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            is_busy: false,
        }
    }

    /// Whether the tag names the given origin, regardless of busyness.
    pub fn matches(&self, host: &str, port: u16, tls: bool) -> bool {
        self.port == port && self.tls == tls && self.host == host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_full_origin() {
        let tag = ReuseTag::new("example.com", 443, true);
        assert!(tag.matches("example.com", 443, true));
        assert!(!tag.matches("example.com", 443, false));
        assert!(!tag.matches("example.com", 80, true));
        assert!(!tag.matches("example.org", 443, true));
    }
}
