//! Relay session configuration

/// Configuration for one relay session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session name, unique within the orchestrator (e.g. "db-visitor")
    pub session_name: String,

    /// Remote service identifier announced to the relay
    pub service_name: String,

    /// Shared secret authorizing access to the service
    pub secret_key: String,

    /// Optional pre-shared relay token
    pub auth_token: Option<String>,

    /// Local bind address (defaults to "127.0.0.1")
    pub bind_addr: String,

    /// Local bind port; 0 picks an ephemeral port
    pub bind_port: u16,
}

impl SessionConfig {
    pub fn new(
        session_name: impl Into<String>,
        service_name: impl Into<String>,
        secret_key: impl Into<String>,
        bind_port: u16,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            service_name: service_name.into(),
            secret_key: secret_key.into(),
            auth_token: None,
            bind_addr: "127.0.0.1".to_string(),
            bind_port,
        }
    }

    /// Set the relay authentication token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the local bind address
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }
}
