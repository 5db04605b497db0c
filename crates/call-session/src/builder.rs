//! Fluent construction of a [`SessionManager`]
//!
//! ```rust
//! use std::sync::Arc;
//! use sipdesk_call_session::{MemoryEngine, SessionManagerBuilder};
//!
//! let manager = SessionManagerBuilder::new()
//!     .credentials("alice", "secret", "example.com")
//!     .transport_port(5070)
//!     .engine(Arc::new(MemoryEngine::new()))
//!     .on_incoming_call(|call_id| println!("ringing: {}", call_id))
//!     .start_event_loop(true)
//!     .build()?;
//!
//! assert!(manager.is_event_loop_running());
//! # Ok::<(), sipdesk_call_session::SessionError>(())
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::call::CallId;
use crate::config::{EndpointConfig, SessionConfig};
use crate::engine::ProtocolEngine;
use crate::error::{ErrorReport, SessionError, SessionResult};
use crate::events::NotificationSinks;
use crate::manager::SessionManager;
use crate::media::{AudioDeviceBinder, EngineAudioBinder};

/// Builder for [`SessionManager`]
///
/// A protocol engine is required; everything else has a default.
pub struct SessionManagerBuilder {
    config: SessionConfig,
    engine: Option<Arc<dyn ProtocolEngine>>,
    sinks: NotificationSinks,
    binder: Arc<dyn AudioDeviceBinder>,
    start_event_loop: bool,
}

impl Default for SessionManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            engine: None,
            sinks: NotificationSinks::new(),
            binder: Arc::new(EngineAudioBinder),
            start_event_loop: false,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        self.config.credentials.user = user.into();
        self.config.credentials.password = password.into();
        self.config.credentials.domain = domain.into();
        self
    }

    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    pub fn transport_port(mut self, port: u16) -> Self {
        self.config.endpoint.transport.port = port;
        self
    }

    pub fn max_calls(mut self, max_calls: u32) -> Self {
        self.config.endpoint.max_calls = max_calls;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ProtocolEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn audio_binder(mut self, binder: Arc<dyn AudioDeviceBinder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn sinks(mut self, sinks: NotificationSinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn on_incoming_call<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallId) + Send + Sync + 'static,
    {
        self.sinks = self.sinks.on_incoming_call(f);
        self
    }

    pub fn on_registration<F>(mut self, f: F) -> Self
    where
        F: Fn(u16, &str, &str) + Send + Sync + 'static,
    {
        self.sinks = self.sinks.on_registration(f);
        self
    }

    pub fn on_call_state<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.sinks = self.sinks.on_call_state(f);
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.sinks = self.sinks.on_error(f);
        self
    }

    /// Start the event loop with the configured poll interval after
    /// construction
    pub fn start_event_loop(mut self, start: bool) -> Self {
        self.start_event_loop = start;
        self
    }

    pub fn build(self) -> SessionResult<SessionManager> {
        let engine = self
            .engine
            .ok_or_else(|| SessionError::configuration("engine", "no protocol engine supplied"))?;
        let manager = SessionManager::with_binder(self.config, engine, self.sinks, self.binder)?;
        if self.start_event_loop {
            manager.start_default_event_loop()?;
        }
        Ok(manager)
    }
}

impl std::fmt::Debug for SessionManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManagerBuilder")
            .field("config", &self.config)
            .field("has_engine", &self.engine.is_some())
            .field("sinks", &self.sinks)
            .field("start_event_loop", &self.start_event_loop)
            .finish()
    }
}
