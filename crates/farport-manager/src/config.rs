//! Manager configuration

/// Settings shared by every session the manager starts.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Relay host used when a command carries no relay URL
    pub relay_host: String,

    /// Pre-shared relay token, forwarded into every bind handshake
    pub auth_token: Option<String>,

    /// Address session listeners bind on
    pub bind_addr: String,

    /// Verify relay certificates on TLS connections
    pub tls_verify: bool,

    /// Outbound HTTP proxy URL for relay dials
    pub proxy_url: Option<String>,

    /// Carry each session's streams over one multiplexed connection
    pub multiplex: bool,
}

impl ManagerConfig {
    pub fn new(relay_host: impl Into<String>) -> Self {
        Self {
            relay_host: relay_host.into(),
            auth_token: None,
            bind_addr: "127.0.0.1".to_string(),
            tls_verify: false,
            proxy_url: None,
            multiplex: true,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    pub fn with_proxy_url(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    pub fn with_multiplex(mut self, multiplex: bool) -> Self {
        self.multiplex = multiplex;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new("localhost")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::new("relay.internal");
        assert_eq!(config.relay_host, "relay.internal");
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.auth_token, None);
        assert_eq!(config.proxy_url, None);
        assert!(!config.tls_verify);
        assert!(config.multiplex);
    }

    #[test]
    fn test_builders() {
        let config = ManagerConfig::new("relay.internal")
            .with_auth_token("token-123")
            .with_bind_addr("0.0.0.0")
            .with_tls_verify(true)
            .with_proxy_url("http://proxy.internal:3128")
            .with_multiplex(false);
        assert_eq!(config.auth_token.as_deref(), Some("token-123"));
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.proxy_url.as_deref(), Some("http://proxy.internal:3128"));
        assert!(config.tls_verify);
        assert!(!config.multiplex);
    }
}
