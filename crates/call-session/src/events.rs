//! Host notifications
//!
//! The session core reports four kinds of notifications to the application:
//!
//! | Notification | Payload |
//! |---|---|
//! | incoming call | call id |
//! | registration state | SIP code, `"Active"`/`"Inactive"`, reason phrase |
//! | call state | remote URI, state text |
//! | error | [`ErrorReport`] |
//!
//! Each one can be delivered to an optional closure registered in
//! [`NotificationSinks`]. When no closure is registered the notification is
//! written to the `tracing` log instead, so nothing is silently dropped.
//!
//! Independently of the sinks, every notification is also published as a
//! [`SessionEvent`] on a `tokio::sync::broadcast` channel. Any number of
//! consumers can [`subscribe`](Notifier::subscribe); a lagging receiver only
//! loses its own backlog.
//!
//! # Threading
//!
//! Sinks are invoked on the event-pump thread, one at a time, in the order
//! the protocol engine delivered the underlying events. A sink must not block
//! for long: while it runs no other protocol event is dispatched.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use sipdesk_call_session::events::NotificationSinks;
//!
//! let states = Arc::new(Mutex::new(Vec::new()));
//! let recorder = states.clone();
//! let sinks = NotificationSinks::new()
//!     .on_call_state(move |remote_uri, state| {
//!         recorder.lock().unwrap().push(format!("{} {}", remote_uri, state));
//!     })
//!     .on_error(|report| eprintln!("call error: {}", report));
//!
//! assert!(sinks.has_call_state_sink());
//! assert!(!sinks.has_incoming_call_sink());
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::call::CallId;
use crate::engine::RegistrationEvent;
use crate::error::ErrorReport;

/// Capacity of the broadcast channel carrying [`SessionEvent`]s
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub type IncomingCallSink = Arc<dyn Fn(&CallId) + Send + Sync>;
pub type RegistrationSink = Arc<dyn Fn(u16, &str, &str) + Send + Sync>;
pub type CallStateSink = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type ErrorSink = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// The four optional host callbacks
#[derive(Clone, Default)]
pub struct NotificationSinks {
    incoming_call: Option<IncomingCallSink>,
    registration: Option<RegistrationSink>,
    call_state: Option<CallStateSink>,
    error: Option<ErrorSink>,
}

impl NotificationSinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the id of every newly received call
    pub fn on_incoming_call<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallId) + Send + Sync + 'static,
    {
        self.incoming_call = Some(Arc::new(f));
        self
    }

    /// Called with `(code, status_text, reason)` on registration changes
    pub fn on_registration<F>(mut self, f: F) -> Self
    where
        F: Fn(u16, &str, &str) + Send + Sync + 'static,
    {
        self.registration = Some(Arc::new(f));
        self
    }

    /// Called with `(remote_uri, state_text)` on every call state change
    pub fn on_call_state<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.call_state = Some(Arc::new(f));
        self
    }

    /// Called with asynchronous failures that have no caller to return to
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn has_incoming_call_sink(&self) -> bool {
        self.incoming_call.is_some()
    }

    pub fn has_registration_sink(&self) -> bool {
        self.registration.is_some()
    }

    pub fn has_call_state_sink(&self) -> bool {
        self.call_state.is_some()
    }

    pub fn has_error_sink(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Debug for NotificationSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSinks")
            .field("incoming_call", &self.has_incoming_call_sink())
            .field("registration", &self.has_registration_sink())
            .field("call_state", &self.has_call_state_sink())
            .field("error", &self.has_error_sink())
            .finish()
    }
}

/// Notification published on the broadcast channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    IncomingCall {
        call_id: CallId,
    },
    RegistrationState {
        code: u16,
        status: String,
        reason: String,
    },
    CallState {
        call_id: CallId,
        remote_uri: String,
        state_text: String,
    },
    Error(ErrorReport),
}

impl SessionEvent {
    /// Call id the event refers to, if any
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            SessionEvent::IncomingCall { call_id } => Some(call_id),
            SessionEvent::CallState { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// Delivers notifications to the sinks and the broadcast channel
pub struct Notifier {
    sinks: NotificationSinks,
    events: broadcast::Sender<SessionEvent>,
}

impl Notifier {
    pub fn new(sinks: NotificationSinks) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sinks, events }
    }

    /// Receive every notification published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn incoming_call(&self, call_id: &CallId) {
        match &self.sinks.incoming_call {
            Some(sink) => sink(call_id),
            None => tracing::info!("Incoming call {}", call_id),
        }
        self.publish(SessionEvent::IncomingCall {
            call_id: call_id.clone(),
        });
    }

    pub fn registration_state(&self, event: &RegistrationEvent) {
        let status = event.status_text();
        match &self.sinks.registration {
            Some(sink) => sink(event.code, status, &event.reason),
            None => tracing::info!(
                "Registration {}: {} {}",
                status,
                event.code,
                event.reason
            ),
        }
        self.publish(SessionEvent::RegistrationState {
            code: event.code,
            status: status.to_string(),
            reason: event.reason.clone(),
        });
    }

    pub fn call_state(&self, call_id: &CallId, remote_uri: &str, state_text: &str) {
        match &self.sinks.call_state {
            Some(sink) => sink(remote_uri, state_text),
            None => tracing::info!("Call {} with {} is {}", call_id, remote_uri, state_text),
        }
        self.publish(SessionEvent::CallState {
            call_id: call_id.clone(),
            remote_uri: remote_uri.to_string(),
            state_text: state_text.to_string(),
        });
    }

    pub fn error(&self, report: ErrorReport) {
        match &self.sinks.error {
            Some(sink) => sink(&report),
            None => tracing::error!("{}", report),
        }
        self.publish(SessionEvent::Error(report));
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("sinks", &self.sinks)
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    #[test]
    fn test_sinks_receive_payloads() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let (a, b, c, d) = (seen.clone(), seen.clone(), seen.clone(), seen.clone());
        let notifier = Notifier::new(
            NotificationSinks::new()
                .on_incoming_call(move |id| a.lock().push(format!("incoming {}", id)))
                .on_registration(move |code, status, reason| {
                    b.lock().push(format!("reg {} {} {}", code, status, reason))
                })
                .on_call_state(move |uri, state| c.lock().push(format!("state {} {}", uri, state)))
                .on_error(move |report| d.lock().push(format!("error {}", report.title))),
        );

        notifier.incoming_call(&CallId::from("c1"));
        notifier.registration_state(&RegistrationEvent {
            code: 200,
            reason: "OK".to_string(),
            is_active: true,
        });
        notifier.call_state(&CallId::from("c1"), "sip:bob@example.com", "CONFIRMED");
        notifier.error(ErrorReport::new("call.answer", "INVALID_ARGUMENT"));

        assert_eq!(
            *seen.lock(),
            vec![
                "incoming c1",
                "reg 200 Active OK",
                "state sip:bob@example.com CONFIRMED",
                "error call.answer",
            ]
        );
    }

    #[test]
    #[traced_test]
    fn test_missing_sinks_fall_back_to_log() {
        let notifier = Notifier::new(NotificationSinks::new());
        notifier.incoming_call(&CallId::from("lonely-call"));
        notifier.registration_state(&RegistrationEvent {
            code: 408,
            reason: "Request Timeout".to_string(),
            is_active: false,
        });
        notifier.call_state(&CallId::from("lonely-call"), "sip:carol@example.com", "EARLY");
        notifier.error(ErrorReport::new("call.connect_audio", "NO_SOUND_DEVICE"));

        assert!(logs_contain("Incoming call lonely-call"));
        assert!(logs_contain("Registration Inactive: 408 Request Timeout"));
        assert!(logs_contain("sip:carol@example.com is EARLY"));
        assert!(logs_contain("NO_SOUND_DEVICE"));
    }

    #[test]
    fn test_events_are_broadcast() {
        let notifier = Notifier::new(NotificationSinks::new());
        let mut rx = notifier.subscribe();
        notifier.incoming_call(&CallId::from("c9"));
        notifier.call_state(&CallId::from("c9"), "sip:dave@example.com", "INCOMING");

        let first = rx.try_recv().unwrap();
        assert_eq!(first, SessionEvent::IncomingCall { call_id: CallId::from("c9") });
        let second = rx.try_recv().unwrap();
        assert_eq!(second.call_id(), Some(&CallId::from("c9")));
        assert!(rx.try_recv().is_err());
    }
}
