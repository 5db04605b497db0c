//! Call identity, state and snapshot types

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::ProtocolCall;

/// Opaque call identifier assigned by the protocol engine
///
/// Stable for the whole life of one signaling session. For SIP stacks this is
/// usually the `Call-ID` header value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for CallId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Call progress as reported by the protocol engine
///
/// The registry only ever reads this value; the engine owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Session object exists but no INVITE has been sent or received
    Null,
    /// Outgoing INVITE sent
    Calling,
    /// Incoming INVITE received, not yet answered
    Incoming,
    /// Provisional response with tag (ringing, session progress)
    Early,
    /// 2xx sent or received, waiting for ACK
    Connecting,
    /// ACK exchanged, session established
    Confirmed,
    /// Session terminated
    Disconnected,
}

impl CallState {
    /// Textual state as SIP stacks usually print it
    pub fn state_text(&self) -> &'static str {
        match self {
            CallState::Null => "NULL",
            CallState::Calling => "CALLING",
            CallState::Incoming => "INCOMING",
            CallState::Early => "EARLY",
            CallState::Connecting => "CONNECTING",
            CallState::Confirmed => "CONFIRMED",
            CallState::Disconnected => "DISCONNCTD",
        }
    }

    /// Whether the call has not been answered yet
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            CallState::Null | CallState::Calling | CallState::Incoming | CallState::Early
        )
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, CallState::Disconnected)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_text())
    }
}

/// Direction of a call from the local user's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// The three disjoint collections a call can live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// Received, waiting for the local user to answer
    PendingInbound,
    /// Placed, waiting for the remote party to answer
    PendingOutbound,
    /// Answered on either side
    Active,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Partition::PendingInbound => "pending-inbound",
            Partition::PendingOutbound => "pending-outbound",
            Partition::Active => "active",
        };
        f.write_str(name)
    }
}

/// SIP status used when terminating a call
///
/// Chosen from the call's state at the moment of hang-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HangupCode {
    /// 200 OK - BYE on an established call
    Normal,
    /// 487 Request Terminated - CANCEL on an unanswered outgoing call
    Cancel,
    /// 603 Decline - reject an unanswered incoming call
    Decline,
    /// 486 Busy Here - anything else
    Busy,
}

impl HangupCode {
    /// Select the termination code for a call currently in `state`
    ///
    /// Early maps to Cancel, same as Calling.
    pub fn for_state(state: CallState) -> Self {
        match state {
            CallState::Confirmed => HangupCode::Normal,
            CallState::Calling | CallState::Early => HangupCode::Cancel,
            CallState::Incoming => HangupCode::Decline,
            _ => HangupCode::Busy,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            HangupCode::Normal => 200,
            HangupCode::Cancel => 487,
            HangupCode::Decline => 603,
            HangupCode::Busy => 486,
        }
    }
}

/// Live call information read from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub call_id: CallId,
    pub remote_uri: String,
    pub local_uri: String,
    pub state: CallState,
    pub state_text: String,
    pub media: Vec<MediaKind>,
}

impl CallInfo {
    pub fn has_audio(&self) -> bool {
        self.media.iter().any(|m| *m == MediaKind::Audio)
    }
}

/// Kind of a negotiated media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Host-facing snapshot of one call
///
/// An all-empty value (`CallData::default()`) means the call was not found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallData {
    pub call_id: String,
    pub remote_uri: String,
    pub local_uri: String,
    pub actual_state: String,
}

impl CallData {
    pub fn is_empty(&self) -> bool {
        self.call_id.is_empty()
    }
}

impl From<&CallInfo> for CallData {
    fn from(info: &CallInfo) -> Self {
        Self {
            call_id: info.call_id.to_string(),
            remote_uri: info.remote_uri.clone(),
            local_uri: info.local_uri.clone(),
            actual_state: info.state_text.clone(),
        }
    }
}

/// One call owned by the registry
///
/// Address strings and state are deliberately not stored here: they are read
/// from the engine's call object each time because they change while the
/// session is negotiated.
pub struct CallRecord {
    call_id: CallId,
    direction: CallDirection,
    call: Arc<dyn ProtocolCall>,
    created_at: DateTime<Utc>,
    promoted_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    pub fn new(direction: CallDirection, call: Arc<dyn ProtocolCall>) -> Self {
        Self {
            call_id: call.call_id(),
            direction,
            call,
            created_at: Utc::now(),
            promoted_at: None,
        }
    }

    pub fn inbound(call: Arc<dyn ProtocolCall>) -> Self {
        Self::new(CallDirection::Inbound, call)
    }

    pub fn outbound(call: Arc<dyn ProtocolCall>) -> Self {
        Self::new(CallDirection::Outbound, call)
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn call(&self) -> &Arc<dyn ProtocolCall> {
        &self.call
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn promoted_at(&self) -> Option<DateTime<Utc>> {
        self.promoted_at
    }

    pub(crate) fn mark_promoted(&mut self) {
        if self.promoted_at.is_none() {
            self.promoted_at = Some(Utc::now());
        }
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("call_id", &self.call_id)
            .field("direction", &self.direction)
            .field("call", &"<protocol call>")
            .field("created_at", &self.created_at)
            .field("promoted_at", &self.promoted_at)
            .finish()
    }
}
