//! Session configuration
//!
//! [`SessionConfig`] bundles everything the manager needs at construction:
//! the account credentials, the endpoint settings handed to the protocol
//! engine, and the default event-loop poll interval.
//!
//! Defaults follow a single-user desktop softphone: UDP on port 5060, at most
//! two simultaneous calls, echo cancellation with a 200 ms tail, 20 ms packet
//! time, and opus/PCMU/PCMA at the highest codec priority.
//!
//! ```rust
//! use sipdesk_call_session::config::SessionConfig;
//!
//! let config = SessionConfig::new("alice", "secret", "pbx.example.com")
//!     .with_transport_port(5070)
//!     .with_max_calls(4);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.account_uri(), "sip:alice@pbx.example.com");
//! assert_eq!(config.registrar_uri(), "sip:pbx.example.com");
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SessionError, SessionResult};

/// Highest codec priority understood by the engine
pub const CODEC_PRIORITY_HIGHEST: u8 = 255;

/// Default interval the event pump waits for protocol events
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 20;

/// SIP account credentials
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AccountCredentials {
    pub user: String,
    pub password: String,
    pub domain: String,
}

impl AccountCredentials {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            domain: domain.into(),
        }
    }
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Digest credential entry handed to the engine
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredential {
    pub scheme: String,
    pub realm: String,
    pub username: String,
    /// 0 = plain-text password
    pub data_type: u8,
    pub data: String,
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("scheme", &self.scheme)
            .field("realm", &self.realm)
            .field("username", &self.username)
            .field("data_type", &self.data_type)
            .field("data", &"<redacted>")
            .finish()
    }
}

/// Account configuration derived from [`AccountCredentials`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id_uri: String,
    pub registrar_uri: String,
    pub auth_credentials: Vec<AuthCredential>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Udp,
            port: 5060,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoCancellerConfig {
    pub enabled: bool,
    pub tail_ms: u32,
}

impl Default for EchoCancellerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tail_ms: 200,
        }
    }
}

/// Media settings passed through to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub echo_canceller: EchoCancellerConfig,
    /// Resampling/codec quality, 1 (fastest) to 10 (best)
    pub quality: u8,
    /// Packet time in milliseconds
    pub ptime_ms: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            echo_canceller: EchoCancellerConfig::default(),
            quality: 10,
            ptime_ms: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecPriority {
    /// Codec id as `name/clock-rate/channels`, e.g. `PCMU/8000/1`
    pub codec: String,
    pub priority: u8,
}

impl CodecPriority {
    pub fn highest(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            priority: CODEC_PRIORITY_HIGHEST,
        }
    }
}

/// Settings for one protocol-engine endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub max_calls: u32,
    /// Internal worker threads of the engine. The session core polls events
    /// itself, so one is enough.
    pub worker_threads: u32,
    /// Verbosity of the engine's own log, 0-6
    pub log_level: u8,
    pub transport: TransportConfig,
    pub media: MediaConfig,
    pub codec_priorities: Vec<CodecPriority>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_calls: 2,
            worker_threads: 1,
            log_level: 3,
            transport: TransportConfig::default(),
            media: MediaConfig::default(),
            codec_priorities: vec![
                CodecPriority::highest("opus/48000/2"),
                CodecPriority::highest("PCMU/8000/1"),
                CodecPriority::highest("PCMA/8000/1"),
            ],
        }
    }
}

/// Complete configuration of a [`SessionManager`](crate::SessionManager)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub credentials: AccountCredentials,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// Stored in whole milliseconds on the wire
    #[serde(
        rename = "poll_interval_ms",
        with = "duration_ms",
        default = "default_poll_interval"
    )]
    pub poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("", "", "")
    }
}

impl SessionConfig {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            credentials: AccountCredentials::new(user, password, domain),
            endpoint: EndpointConfig::default(),
            poll_interval: default_poll_interval(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_transport_port(mut self, port: u16) -> Self {
        self.endpoint.transport.port = port;
        self
    }

    pub fn with_max_calls(mut self, max_calls: u32) -> Self {
        self.endpoint.max_calls = max_calls;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// `sip:<user>@<domain>`
    pub fn account_uri(&self) -> String {
        format!("sip:{}@{}", self.credentials.user, self.credentials.domain)
    }

    /// `sip:<domain>`
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}", self.credentials.domain)
    }

    /// Account configuration with a digest credential valid for any realm
    pub fn account_config(&self) -> AccountConfig {
        AccountConfig {
            id_uri: self.account_uri(),
            registrar_uri: self.registrar_uri(),
            auth_credentials: vec![AuthCredential {
                scheme: "digest".to_string(),
                realm: "*".to_string(),
                username: self.credentials.user.clone(),
                data_type: 0,
                data: self.credentials.password.clone(),
            }],
        }
    }

    /// Check the configuration before any engine resource is created
    pub fn validate(&self) -> SessionResult<()> {
        let credentials = &self.credentials;
        if credentials.user.trim().is_empty() {
            return Err(SessionError::configuration("credentials.user", "must not be empty"));
        }
        if credentials.domain.trim().is_empty() {
            return Err(SessionError::configuration("credentials.domain", "must not be empty"));
        }
        if credentials.user.contains(char::is_whitespace)
            || credentials.domain.contains(char::is_whitespace)
        {
            return Err(SessionError::configuration(
                "credentials",
                "user and domain must not contain whitespace",
            ));
        }
        for uri in [self.account_uri(), self.registrar_uri()] {
            Url::parse(&uri).map_err(|e| {
                SessionError::configuration("credentials", format!("invalid SIP URI {}: {}", uri, e))
            })?;
        }

        let endpoint = &self.endpoint;
        if endpoint.max_calls == 0 {
            return Err(SessionError::configuration("endpoint.max_calls", "must be at least 1"));
        }
        if endpoint.worker_threads == 0 {
            return Err(SessionError::configuration("endpoint.worker_threads", "must be at least 1"));
        }
        if endpoint.log_level > 6 {
            return Err(SessionError::configuration("endpoint.log_level", "must be between 0 and 6"));
        }
        if endpoint.transport.port == 0 {
            return Err(SessionError::configuration("endpoint.transport.port", "must not be 0"));
        }
        if !(1..=10).contains(&endpoint.media.quality) {
            return Err(SessionError::configuration("endpoint.media.quality", "must be between 1 and 10"));
        }
        if endpoint.media.ptime_ms == 0 {
            return Err(SessionError::configuration("endpoint.media.ptime_ms", "must not be 0"));
        }
        if self.poll_interval < Duration::from_millis(1) {
            return Err(SessionError::configuration(
                "poll_interval_ms",
                format!("must be at least 1 ms, got {:?}", self.poll_interval),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> SessionResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SessionError::configuration("json", e.to_string()))
    }

    pub fn to_json_string(&self) -> SessionResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SessionError::configuration("json", e.to_string()))
    }
}
