//! Protocol event handling
//!
//! [`TransitionEngine`] is the [`ProtocolEventSink`] the session core hands to
//! the protocol engine. It translates each callback into a registry mutation
//! followed by a host notification:
//!
//! | Reported state | Registry | Notification |
//! |---|---|---|
//! | Null, Calling, Incoming, Early, Confirmed | unchanged | call state |
//! | Connecting | promote to active | call state |
//! | Disconnected | remove | call state |
//!
//! The registry is always updated before the host hears about the change, so
//! a host that queries the manager from inside its callback already sees the
//! new partition.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::call::{CallRecord, CallState};
use crate::engine::{ProtocolCall, ProtocolEventSink, RegistrationEvent};
use crate::error::{ErrorReport, SessionError};
use crate::events::Notifier;
use crate::media::AudioDeviceBinder;
use crate::registry::CallRegistry;

pub struct TransitionEngine {
    registry: Arc<CallRegistry>,
    notifier: Arc<Notifier>,
    binder: Arc<dyn AudioDeviceBinder>,
}

impl TransitionEngine {
    pub fn new(
        registry: Arc<CallRegistry>,
        notifier: Arc<Notifier>,
        binder: Arc<dyn AudioDeviceBinder>,
    ) -> Self {
        Self {
            registry,
            notifier,
            binder,
        }
    }

    /// Apply the registry side of a state change
    pub(crate) fn apply_state(registry: &CallRegistry, call: &dyn ProtocolCall, state: CallState) {
        match state {
            CallState::Connecting => {
                registry.promote_to_active(&call.call_id());
            }
            CallState::Disconnected => {
                registry.remove(&call.call_id());
            }
            _ => {}
        }
    }
}

impl ProtocolEventSink for TransitionEngine {
    fn on_registration_state(&self, event: RegistrationEvent) {
        debug!(
            "Registration state {} ({} {})",
            event.status_text(),
            event.code,
            event.reason
        );
        self.notifier.registration_state(&event);
    }

    fn on_incoming_call(&self, call: Arc<dyn ProtocolCall>) {
        let call_id = call.call_id();
        match self.registry.insert_inbound(CallRecord::inbound(call)) {
            Ok(()) => self.notifier.incoming_call(&call_id),
            Err(err) => warn!("Ignoring incoming call {}: {}", call_id, err),
        }
    }

    fn on_call_state(&self, call: &dyn ProtocolCall) {
        let info = match call.info() {
            Ok(info) => info,
            Err(err) => {
                warn!("Cannot read state of call {}: {}", call.call_id(), err);
                self.notifier.error(ErrorReport::from(&err));
                return;
            }
        };
        debug!("Call {} is now {}", info.call_id, info.state_text);

        Self::apply_state(&self.registry, call, info.state);
        self.notifier
            .call_state(&info.call_id, &info.remote_uri, &info.state_text);
    }

    fn on_media_ready(&self, call: &dyn ProtocolCall) {
        let info = match call.info() {
            Ok(info) => info,
            Err(err) => {
                self.notifier.error(ErrorReport::from(&err));
                return;
            }
        };
        if !info.has_audio() {
            debug!("Call {} has no audio stream, nothing to bind", info.call_id);
            return;
        }
        if let Err(err) = self.binder.bind(call) {
            warn!("Audio binding failed for call {}: {}", info.call_id, err);
            let failure = SessionError::media_binding(info.call_id.clone(), err.to_string());
            self.notifier.error(ErrorReport::from(&failure));
        }
    }
}

impl std::fmt::Debug for TransitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionEngine")
            .field("registry", &self.registry.stats())
            .finish()
    }
}
