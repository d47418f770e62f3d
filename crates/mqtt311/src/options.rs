//! Connection configuration, immutable for the lifetime of one connect
//! attempt.

use std::time::Duration;

/// Certificate-trust policy for TLS connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Validate the chain against the bundled webpki roots.
    #[default]
    Strict,
    /// Accept any server certificate. Intended for exercising brokers
    /// with self-signed certificates from a test harness.
    AcceptInvalidCertificates,
}

/// TLS parameters for a connection.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub trust: TrustPolicy,
    /// SNI / verification name; defaults to the connection host.
    pub server_name: Option<String>,
}

impl TlsOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn permissive() -> Self {
        Self {
            trust: TrustPolicy::AcceptInvalidCertificates,
            server_name: None,
        }
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Acknowledgement retry policy for `QoS` > 0 publish legs.
///
/// The wrapped library the original tester app sat on never exposed its
/// retry constants, so both knobs are public here and harnesses routinely
/// shrink them to force timeouts quickly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for the acknowledgement of one leg.
    pub ack_timeout: Duration,
    /// How many re-sends (DUP set) are attempted before the operation
    /// fails with an acknowledgement timeout.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }
}

/// Everything needed for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    /// Keep-alive interval; zero disables the ping schedule.
    pub keep_alive: Duration,
    /// Bounds both the transport open and the CONNACK wait.
    pub connect_timeout: Duration,
    pub tls: Option<TlsOptions>,
    pub retry: RetryPolicy,
}

impl ConnectOptions {
    /// Options for `host:port` with a process-derived client identifier
    /// and library defaults everywhere else.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("mqtt311-{}", std::process::id()),
            username: None,
            password: None,
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            tls: None,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Keep-alive in whole seconds as carried by CONNECT, saturating at
    /// the field's 16-bit range.
    #[must_use]
    pub fn keep_alive_secs(&self) -> u16 {
        self.keep_alive.as_secs().try_into().unwrap_or(u16::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ConnectOptions::new("broker.local", 1883);
        assert_eq!(options.port, 1883);
        assert!(options.client_id.starts_with("mqtt311-"));
        assert!(options.clean_session);
        assert!(options.tls.is_none());
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.keep_alive_secs(), 60);
    }

    #[test]
    fn builders_compose() {
        let options = ConnectOptions::new("broker.local", 8883)
            .with_client_id("bench-1")
            .with_credentials("user", "pass")
            .with_keep_alive(Duration::from_secs(15))
            .with_tls(TlsOptions::permissive().with_server_name("broker.local"));

        assert_eq!(options.client_id, "bench-1");
        assert_eq!(options.username.as_deref(), Some("user"));
        let tls = options.tls.unwrap();
        assert_eq!(tls.trust, TrustPolicy::AcceptInvalidCertificates);
        assert_eq!(tls.server_name.as_deref(), Some("broker.local"));
    }

    #[test]
    fn keep_alive_saturates_at_u16() {
        let options =
            ConnectOptions::new("h", 1883).with_keep_alive(Duration::from_secs(u64::from(u16::MAX) + 10));
        assert_eq!(options.keep_alive_secs(), u16::MAX);
    }
}
