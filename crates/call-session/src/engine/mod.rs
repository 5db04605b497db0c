//! Protocol engine boundary
//!
//! The SIP/media stack is treated as a black box behind three traits:
//!
//! - [`ProtocolEngine`] - one endpoint: lifecycle, account registration,
//!   outgoing calls and event dispatch.
//! - [`ProtocolCall`] - one call object owned by the engine: live info and the
//!   accept/terminate/audio commands.
//! - [`ProtocolEventSink`] - the callbacks the engine invokes while
//!   [`ProtocolEngine::poll_events`] runs. The session core implements it in
//!   [`TransitionEngine`](crate::transition::TransitionEngine).
//!
//! ```text
//! ┌──────────────────┐ poll_events  ┌──────────────────┐
//! │    EventPump     │─────────────►│  ProtocolEngine  │
//! └──────────────────┘              └────────┬─────────┘
//!                                            │ on_* callbacks
//!                                   ┌────────▼─────────┐
//!                                   │ TransitionEngine │──► CallRegistry
//!                                   └──────────────────┘
//! ```
//!
//! [`MemoryEngine`] is an in-process implementation that can be scripted from
//! tests and demos.

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::call::{CallId, CallInfo, HangupCode};
use crate::config::{AccountConfig, EndpointConfig};
use crate::error::EngineResult;

pub use memory::{EngineCommand, FailurePoint, MemoryCall, MemoryEngine};

/// Handle to an account registered with the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountHandle {
    pub id: u32,
    pub uri: String,
}

/// Registration state change reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEvent {
    /// Last SIP status code of the REGISTER transaction
    pub code: u16,
    /// Reason phrase of that response
    pub reason: String,
    /// Whether the registration is currently valid
    pub is_active: bool,
}

impl RegistrationEvent {
    pub fn status_text(&self) -> &'static str {
        if self.is_active {
            "Active"
        } else {
            "Inactive"
        }
    }
}

/// One endpoint of the SIP/media stack
///
/// Only one endpoint may be alive per engine instance; `create_endpoint` must
/// fail while a previous endpoint has not been destroyed.
pub trait ProtocolEngine: Send + Sync {
    fn create_endpoint(&self) -> EngineResult<()>;

    fn init(&self, config: &EndpointConfig) -> EngineResult<()>;

    fn start(&self) -> EngineResult<()>;

    /// Tear the endpoint down. Must tolerate being called on a partially
    /// initialised endpoint.
    fn destroy(&self);

    /// Register the callbacks invoked while events are dispatched
    fn set_event_sink(&self, sink: Arc<dyn ProtocolEventSink>);

    fn register_account(&self, account: &AccountConfig) -> EngineResult<AccountHandle>;

    /// Create a call object and send the initial INVITE
    fn make_call(&self, account: &AccountHandle, uri: &str) -> EngineResult<Arc<dyn ProtocolCall>>;

    /// Dispatch every ready event, waiting at most `timeout` for the first one.
    /// Callbacks run synchronously on the calling thread. Returns the number of
    /// events dispatched.
    fn poll_events(&self, timeout: Duration) -> EngineResult<usize>;
}

/// A call object living inside the engine
pub trait ProtocolCall: Send + Sync {
    fn call_id(&self) -> CallId;

    /// Read the current call information
    fn info(&self) -> EngineResult<CallInfo>;

    /// Answer with 200 OK
    fn accept(&self) -> EngineResult<()>;

    fn terminate(&self, code: HangupCode) -> EngineResult<()>;

    /// Connect the call's audio to the playback and capture devices
    fn connect_audio_device(&self) -> EngineResult<()>;
}

impl fmt::Debug for dyn ProtocolCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolCall")
            .field("call_id", &self.call_id())
            .finish()
    }
}

/// Callbacks invoked by the engine during [`ProtocolEngine::poll_events`]
pub trait ProtocolEventSink: Send + Sync {
    fn on_registration_state(&self, event: RegistrationEvent);

    fn on_incoming_call(&self, call: Arc<dyn ProtocolCall>);

    fn on_call_state(&self, call: &dyn ProtocolCall);

    fn on_media_ready(&self, call: &dyn ProtocolCall);
}
