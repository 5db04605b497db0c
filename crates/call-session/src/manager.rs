//! Session manager façade
//!
//! [`SessionManager`] is the single object a host application talks to. It
//! owns one protocol endpoint with one registered account, the call registry,
//! the event pump and the notifier, and exposes the call commands on top of
//! them.
//!
//! # Lifecycle
//!
//! ```text
//! new() ── create_endpoint ── init ── set_event_sink ── start ── register_account
//!   │                                                                   │
//!   └──── any step fails: report, destroy endpoint, Err(Configuration) ◄┘
//!
//! drop() ── stop pump ── release all calls ── destroy endpoint
//! ```
//!
//! Commands may be issued from any thread. They look the call up in the
//! registry, pin the engine call object, release the registry and only then
//! talk to the engine, so an engine callback running concurrently on the pump
//! thread never waits on a command.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sipdesk_call_session::{MemoryEngine, NotificationSinks, SessionConfig, SessionManager};
//!
//! let engine = MemoryEngine::new();
//! let config = SessionConfig::new("alice", "secret", "example.com");
//! let manager = SessionManager::new(config, Arc::new(engine.clone()), NotificationSinks::new())?;
//!
//! let call_id = manager.place_call("sip:bob@example.com")?;
//! assert_eq!(manager.get_info(&call_id).actual_state, "CALLING");
//!
//! manager.start_event_loop(Duration::from_millis(10))?;
//! manager.hang_up(&call_id)?;
//! manager.stop_event_loop();
//! # Ok::<(), sipdesk_call_session::SessionError>(())
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::call::{CallData, CallId, CallRecord, CallState, HangupCode, Partition};
use crate::config::SessionConfig;
use crate::engine::{AccountHandle, ProtocolCall, ProtocolEngine};
use crate::error::{EngineError, ErrorReport, SessionError, SessionResult};
use crate::events::{NotificationSinks, Notifier, SessionEvent};
use crate::media::{AudioDeviceBinder, EngineAudioBinder};
use crate::pump::EventPump;
use crate::registry::{CallRegistry, RegistryStats};
use crate::transition::TransitionEngine;

/// Lookup order for [`SessionManager::hang_up`]
const HANG_UP_ORDER: [Partition; 3] = [
    Partition::PendingInbound,
    Partition::PendingOutbound,
    Partition::Active,
];

pub struct SessionManager {
    config: SessionConfig,
    engine: Arc<dyn ProtocolEngine>,
    account: AccountHandle,
    registry: Arc<CallRegistry>,
    notifier: Arc<Notifier>,
    pump: EventPump,
}

impl SessionManager {
    /// Create the endpoint, register the account and return a ready manager
    ///
    /// The event loop is not started; call
    /// [`start_event_loop`](Self::start_event_loop) once the host is ready to
    /// receive notifications.
    pub fn new(
        config: SessionConfig,
        engine: Arc<dyn ProtocolEngine>,
        sinks: NotificationSinks,
    ) -> SessionResult<Self> {
        Self::with_binder(config, engine, sinks, Arc::new(EngineAudioBinder))
    }

    /// Like [`new`](Self::new) with a custom audio device binder
    pub fn with_binder(
        config: SessionConfig,
        engine: Arc<dyn ProtocolEngine>,
        sinks: NotificationSinks,
        binder: Arc<dyn AudioDeviceBinder>,
    ) -> SessionResult<Self> {
        config.validate()?;

        let notifier = Arc::new(Notifier::new(sinks));
        let registry = Arc::new(CallRegistry::new());

        engine
            .create_endpoint()
            .map_err(|e| setup_failed(&notifier, None, "endpoint", e))?;

        let account = match Self::bring_up(&config, engine.as_ref(), &registry, &notifier, binder) {
            Ok(account) => account,
            Err((step, err)) => return Err(setup_failed(&notifier, Some(engine.as_ref()), step, err)),
        };

        info!(
            "Session manager ready for {} on {:?} port {}",
            account.uri, config.endpoint.transport.kind, config.endpoint.transport.port
        );
        let pump = EventPump::new(engine.clone(), notifier.clone());
        Ok(Self {
            config,
            engine,
            account,
            registry,
            notifier,
            pump,
        })
    }

    fn bring_up(
        config: &SessionConfig,
        engine: &dyn ProtocolEngine,
        registry: &Arc<CallRegistry>,
        notifier: &Arc<Notifier>,
        binder: Arc<dyn AudioDeviceBinder>,
    ) -> Result<AccountHandle, (&'static str, EngineError)> {
        engine.init(&config.endpoint).map_err(|e| ("endpoint.init", e))?;
        engine.set_event_sink(Arc::new(TransitionEngine::new(
            registry.clone(),
            notifier.clone(),
            binder,
        )));
        engine.start().map_err(|e| ("endpoint.start", e))?;
        engine
            .register_account(&config.account_config())
            .map_err(|e| ("account", e))
    }

    /// Place an outgoing call and return its id
    pub fn place_call(&self, remote_uri: &str) -> SessionResult<CallId> {
        let call = self.engine.make_call(&self.account, remote_uri).map_err(|e| {
            warn!("Cannot call {}: {}", remote_uri, e);
            SessionError::protocol("make_call", e)
        })?;
        let call_id = call.call_id();
        self.registry
            .insert_outbound(CallRecord::outbound(call.clone()))?;
        self.reconcile(call.as_ref());

        info!("Placed call {} to {}", call_id, remote_uri);
        Ok(call_id)
    }

    /// Catch up with state events the pump dispatched before the call was
    /// registered
    fn reconcile(&self, call: &dyn ProtocolCall) {
        let call_id = call.call_id();
        match call.info().map(|info| info.state) {
            Ok(state) if state.is_pending() => {}
            Ok(state) if !state.is_terminated() => {
                self.registry.promote_to_active(&call_id);
            }
            Ok(_) | Err(_) => {
                self.registry.remove(&call_id);
            }
        }
    }

    /// Drop the record of a call the engine has already torn down
    ///
    /// No Disconnected event follows a teardown, so nothing else would.
    fn forget_if_gone(&self, call_id: &CallId, err: &EngineError) {
        if err.is_session_terminated() && self.registry.remove(call_id).is_some() {
            debug!("Released call {}, gone from the engine", call_id);
        }
    }

    /// Accept a pending incoming call
    ///
    /// Unknown ids, and calls that are no longer pending, are ignored.
    pub fn answer(&self, call_id: &CallId) -> SessionResult<()> {
        let Some(entry) = self
            .registry
            .find_in(&[Partition::PendingInbound], call_id)
        else {
            debug!("No pending incoming call {} to answer", call_id);
            return Ok(());
        };
        entry.call.accept().map_err(|e| {
            warn!("Cannot answer call {}: {}", call_id, e);
            SessionError::protocol("answer", e)
        })?;
        info!("Answered call {}", call_id);
        Ok(())
    }

    /// Terminate a call in whatever partition it is
    ///
    /// The SIP status depends on the live state: 200 for an established
    /// call, 487 for an unanswered outgoing one, 603 for an unanswered
    /// incoming one, 486 otherwise.
    pub fn hang_up(&self, call_id: &CallId) -> SessionResult<()> {
        let Some(entry) = self.registry.find_in(&HANG_UP_ORDER, call_id) else {
            debug!("No call {} to hang up", call_id);
            return Ok(());
        };
        let state = match entry.call.info() {
            Ok(info) => info.state,
            Err(err) if err.is_session_terminated() => {
                self.forget_if_gone(call_id, &err);
                return Ok(());
            }
            Err(_) => CallState::Null,
        };
        let code = HangupCode::for_state(state);
        entry.call.terminate(code).map_err(|e| {
            warn!("Cannot hang up call {}: {}", call_id, e);
            self.forget_if_gone(call_id, &e);
            SessionError::protocol("hang_up", e)
        })?;
        info!(
            "Hung up call {} in {} with {}",
            call_id,
            entry.partition,
            code.status_code()
        );
        Ok(())
    }

    /// Snapshot of a call, or an all-empty record if it is unknown or gone
    pub fn get_info(&self, call_id: &CallId) -> CallData {
        let Some(entry) = self.registry.find(call_id) else {
            return CallData::default();
        };
        match entry.call.info() {
            Ok(info) => CallData::from(&info),
            Err(err) => {
                self.forget_if_gone(call_id, &err);
                CallData::default()
            }
        }
    }

    /// Snapshots of every registered call, active calls first
    pub fn list_calls(&self) -> Vec<CallData> {
        self.registry
            .entries()
            .into_iter()
            .filter_map(|entry| match entry.call.info() {
                Ok(info) => Some(CallData::from(&info)),
                Err(err) => {
                    self.forget_if_gone(&entry.call_id, &err);
                    None
                }
            })
            .collect()
    }

    /// Partition currently holding the call
    pub fn partition_of(&self, call_id: &CallId) -> Option<Partition> {
        self.registry.locate(call_id)
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.notifier.subscribe()
    }

    pub fn account_uri(&self) -> &str {
        &self.account.uri
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn start_event_loop(&self, poll_interval: Duration) -> SessionResult<()> {
        self.pump.start(poll_interval).map_err(|e| {
            self.notifier.error(ErrorReport::from(&e));
            e
        })
    }

    /// Start the event loop with the configured poll interval
    pub fn start_default_event_loop(&self) -> SessionResult<()> {
        self.start_event_loop(self.config.poll_interval())
    }

    pub fn stop_event_loop(&self) {
        self.pump.stop();
    }

    pub fn is_event_loop_running(&self) -> bool {
        self.pump.is_running()
    }
}

fn setup_failed(
    notifier: &Notifier,
    engine: Option<&dyn ProtocolEngine>,
    step: &str,
    err: EngineError,
) -> SessionError {
    warn!("Session setup failed at {}: {}", step, err);
    notifier.error(ErrorReport::from(&err));
    if let Some(engine) = engine {
        engine.destroy();
    }
    SessionError::configuration(step, err.to_string())
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.pump.stop();
        let released = self.registry.drain();
        self.engine.destroy();
        info!(
            "Session manager for {} shut down, released {} calls",
            self.account.uri,
            released.len()
        );
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("account", &self.account.uri)
            .field("calls", &self.registry.stats())
            .field("pump", &self.pump)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCommand, MemoryEngine};

    fn manager() -> (SessionManager, MemoryEngine) {
        let engine = MemoryEngine::new();
        let config = SessionConfig::new("alice", "secret", "example.com");
        let manager =
            SessionManager::new(config, Arc::new(engine.clone()), NotificationSinks::new()).unwrap();
        (manager, engine)
    }

    /// Dispatch queued events synchronously, without the pump
    fn pump_once(engine: &MemoryEngine) {
        engine.poll_events(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn test_place_call_registers_outbound() {
        let (manager, _engine) = manager();
        let id = manager.place_call("sip:bob@example.com").unwrap();
        assert_eq!(manager.partition_of(&id), Some(Partition::PendingOutbound));
        let data = manager.get_info(&id);
        assert_eq!(data.remote_uri, "sip:bob@example.com");
        assert_eq!(data.local_uri, "sip:alice@example.com");
        assert_eq!(data.actual_state, "CALLING");
    }

    #[test]
    fn test_place_call_reconciles_early_events() {
        let (manager, engine) = manager();
        let id = manager.place_call("sip:bob@example.com").unwrap();
        // Remote answers and the state is read back before any dispatch
        engine.set_call_state(&id, CallState::Connecting);
        manager.reconcile(engine.call(&id).unwrap().as_ref());
        assert_eq!(manager.partition_of(&id), Some(Partition::Active));
    }

    #[test]
    fn test_answer_unknown_call_is_noop() {
        let (manager, engine) = manager();
        manager.answer(&CallId::from("nope")).unwrap();
        manager.hang_up(&CallId::from("nope")).unwrap();
        assert!(engine.commands().is_empty());
        assert!(manager.get_info(&CallId::from("nope")).is_empty());
    }

    #[test]
    fn test_answer_only_touches_pending_inbound() {
        let (manager, engine) = manager();
        let id = manager.place_call("sip:bob@example.com").unwrap();
        engine.clear_commands();
        manager.answer(&id).unwrap();
        assert!(engine.commands().is_empty());
    }

    #[test]
    fn test_rejected_answer_leaves_registry_unchanged() {
        let (manager, engine) = manager();
        let id = engine.inject_incoming_call("sip:carol@example.com");
        pump_once(&engine);
        assert_eq!(manager.partition_of(&id), Some(Partition::PendingInbound));

        // Remote cancelled, event not dispatched yet
        engine.set_call_state(&id, CallState::Disconnected);
        let err = manager.answer(&id).unwrap_err();
        assert!(matches!(err, SessionError::Protocol { ref operation, .. } if operation == "answer"));
        assert_eq!(manager.partition_of(&id), Some(Partition::PendingInbound));

        pump_once(&engine);
        assert_eq!(manager.partition_of(&id), None);
    }

    #[test]
    fn test_hang_up_outgoing_uses_cancel() {
        let (manager, engine) = manager();
        let id = manager.place_call("sip:bob@example.com").unwrap();
        manager.hang_up(&id).unwrap();
        assert!(engine
            .commands()
            .contains(&EngineCommand::Terminate(id, HangupCode::Cancel)));
    }

    #[test]
    fn test_torn_down_call_reads_as_empty() {
        let (manager, engine) = manager();
        let id = manager.place_call("sip:bob@example.com").unwrap();
        engine.tear_down_call(&id);
        assert!(manager.get_info(&id).is_empty());
        assert_eq!(manager.partition_of(&id), None);
        assert_eq!(manager.stats().total_removed, 1);
    }

    #[test]
    fn test_list_calls_releases_torn_down_calls() {
        let (manager, engine) = manager();
        let gone = manager.place_call("sip:bob@example.com").unwrap();
        let kept = manager.place_call("sip:carol@example.com").unwrap();
        engine.tear_down_call(&gone);

        let calls = manager.list_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, kept.as_str());
        assert_eq!(manager.partition_of(&gone), None);
        assert_eq!(manager.partition_of(&kept), Some(Partition::PendingOutbound));
    }

    #[test]
    fn test_hang_up_torn_down_call_releases_it() {
        let (manager, engine) = manager();
        let id = engine.inject_incoming_call("sip:dave@example.com");
        pump_once(&engine);
        manager.answer(&id).unwrap();
        pump_once(&engine);
        assert_eq!(manager.partition_of(&id), Some(Partition::Active));

        engine.tear_down_call(&id);
        engine.clear_commands();
        manager.hang_up(&id).unwrap();

        assert!(engine.commands().is_empty());
        assert_eq!(manager.partition_of(&id), None);
        assert_eq!(manager.stats().total(), 0);
    }

    #[test]
    fn test_drop_releases_calls_and_endpoint() {
        let (manager, engine) = manager();
        let id = manager.place_call("sip:bob@example.com").unwrap();
        let call = engine.call(&id).unwrap();
        manager.start_event_loop(Duration::from_millis(5)).unwrap();
        drop(manager);

        assert!(!engine.is_endpoint_alive());
        assert!(call.is_torn_down());
        assert!(engine.create_endpoint().is_ok());
    }
}
