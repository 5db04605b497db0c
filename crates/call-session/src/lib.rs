//! Call-session core for a desktop SIP softphone
//!
//! This crate sits between a SIP/media protocol stack and an event-driven host
//! application (typically a UI). It keeps track of every call the stack knows
//! about, moves calls between lifecycle partitions as protocol events arrive,
//! and tells the host what happened.
//!
//! ## Layering
//! ```text
//! host application
//!       │ commands                      ▲ notifications
//!       ▼                               │
//! SessionManager ── CallRegistry ── TransitionEngine
//!       │                               ▲
//!       ▼                               │ callbacks
//! ProtocolEngine ◄──── poll ──── EventPump
//! ```
//!
//! Calls live in exactly one of three partitions:
//!
//! - **pending-inbound**: received, not answered yet
//! - **pending-outbound**: placed, remote has not answered
//! - **active**: answered on either side
//!
//! A call enters a pending partition when it is received or placed, is
//! promoted to active when the stack reports `CONNECTING`, and is removed
//! when the stack reports `DISCONNCTD`.
//!
//! The SIP stack itself is behind the [`ProtocolEngine`] trait.
//! [`MemoryEngine`] is a scriptable in-process implementation used by the
//! tests and handy for UI development without a network.

pub mod boundary;
pub mod builder;
pub mod call;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod media;
pub mod pump;
pub mod registry;
pub mod transition;

pub use builder::SessionManagerBuilder;
pub use call::{
    CallData, CallDirection, CallId, CallInfo, CallRecord, CallState, HangupCode, MediaKind,
    Partition,
};
pub use config::{AccountCredentials, EndpointConfig, SessionConfig};
pub use engine::{
    AccountHandle, MemoryEngine, ProtocolCall, ProtocolEngine, ProtocolEventSink,
    RegistrationEvent,
};
pub use error::{EngineError, ErrorReport, SessionError, SessionResult};
pub use events::{NotificationSinks, SessionEvent};
pub use manager::SessionManager;
pub use media::{AudioDeviceBinder, EngineAudioBinder};
pub use registry::{CallRegistry, RegistryStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
