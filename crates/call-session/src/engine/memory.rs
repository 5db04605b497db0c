//! In-process protocol engine
//!
//! [`MemoryEngine`] keeps its calls in memory and never touches the network.
//! Tests and demos script it from the outside (inject an incoming call, move a
//! call to another state, report media or registration changes) and the
//! resulting events are dispatched to the registered sink the next time
//! [`ProtocolEngine::poll_events`] runs, exactly like a real stack would do
//! from its event loop.
//!
//! Every command the session core issues is recorded and can be inspected
//! with [`MemoryEngine::commands`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace};
use url::Url;
use uuid::Uuid;

use super::{AccountHandle, ProtocolCall, ProtocolEngine, ProtocolEventSink, RegistrationEvent};
use crate::call::{CallId, CallInfo, CallState, HangupCode, MediaKind};
use crate::config::{AccountConfig, EndpointConfig};
use crate::error::{EngineError, EngineResult, SESSION_TERMINATED};

/// A command issued to the engine, in the order it was received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    MakeCall { uri: String },
    Accept(CallId),
    Terminate(CallId, HangupCode),
    ConnectAudio(CallId),
}

/// Engine operations that can be made to fail on their next invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Init,
    Start,
    RegisterAccount,
    MakeCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Absent,
    Created,
    Initialised,
    Started,
}

#[derive(Debug)]
enum QueuedEvent {
    Registration(RegistrationEvent),
    Incoming(CallId),
    CallState(CallId),
    MediaReady(CallId),
}

struct Shared {
    endpoint: Mutex<EndpointState>,
    calls: DashMap<CallId, Arc<MemoryCall>>,
    queue: Mutex<VecDeque<QueuedEvent>>,
    ready: Condvar,
    sink: RwLock<Option<Arc<dyn ProtocolEventSink>>>,
    failures: DashMap<FailurePoint, EngineError>,
    account_uri: RwLock<Option<String>>,
    next_account_id: AtomicU32,
    audio_device_available: AtomicBool,
    commands: Mutex<Vec<EngineCommand>>,
}

impl Shared {
    fn enqueue(&self, event: QueuedEvent) {
        trace!("Queueing engine event {:?}", event);
        self.queue.lock().push_back(event);
        self.ready.notify_all();
    }

    fn record(&self, command: EngineCommand) {
        self.commands.lock().push(command);
    }

    fn take_failure(&self, point: FailurePoint) -> EngineResult<()> {
        match self.failures.remove(&point) {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    fn require_started(&self, title: &str) -> EngineResult<()> {
        if *self.endpoint.lock() == EndpointState::Started {
            Ok(())
        } else {
            Err(EngineError::new(title, "INVALID_STATE").with_detail("endpoint is not running"))
        }
    }
}

/// Scriptable, in-memory [`ProtocolEngine`]
///
/// Cloning yields another handle to the same engine, so a test can keep one
/// clone for scripting while the manager owns another.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint: Mutex::new(EndpointState::Absent),
                calls: DashMap::new(),
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                sink: RwLock::new(None),
                failures: DashMap::new(),
                account_uri: RwLock::new(None),
                next_account_id: AtomicU32::new(0),
                audio_device_available: AtomicBool::new(true),
                commands: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make the next invocation of `point` fail with `error`
    pub fn inject_failure(&self, point: FailurePoint, error: EngineError) {
        self.shared.failures.insert(point, error);
    }

    /// Toggle whether a sound device is present for audio binding
    pub fn set_audio_device_available(&self, available: bool) {
        self.shared
            .audio_device_available
            .store(available, Ordering::SeqCst);
    }

    pub fn is_endpoint_alive(&self) -> bool {
        *self.shared.endpoint.lock() != EndpointState::Absent
    }

    pub fn is_registered(&self) -> bool {
        self.shared.account_uri.read().is_some()
    }

    /// Simulate an INVITE from `remote_uri`
    pub fn inject_incoming_call(&self, remote_uri: &str) -> CallId {
        let local_uri = self
            .shared
            .account_uri
            .read()
            .clone()
            .unwrap_or_default();
        let call = MemoryCall::new(
            &self.shared,
            remote_uri.to_string(),
            local_uri,
            CallState::Incoming,
        );
        let call_id = call.id.clone();
        self.shared.calls.insert(call_id.clone(), call);
        debug!("Injected incoming call {} from {}", call_id, remote_uri);
        self.shared.enqueue(QueuedEvent::Incoming(call_id.clone()));
        call_id
    }

    /// Move a call to `state` and queue a state notification
    ///
    /// Returns `false` if the engine has no such call.
    pub fn set_call_state(&self, call_id: &CallId, state: CallState) -> bool {
        let Some(call) = self.call(call_id) else {
            return false;
        };
        *call.state.lock() = state;
        self.shared.enqueue(QueuedEvent::CallState(call_id.clone()));
        true
    }

    /// Report negotiated media for a call and queue a media-ready notification
    pub fn report_media_ready(&self, call_id: &CallId, media: &[MediaKind]) -> bool {
        let Some(call) = self.call(call_id) else {
            return false;
        };
        *call.media.lock() = media.to_vec();
        self.shared.enqueue(QueuedEvent::MediaReady(call_id.clone()));
        true
    }

    pub fn report_registration(&self, code: u16, reason: &str, is_active: bool) {
        self.shared.enqueue(QueuedEvent::Registration(RegistrationEvent {
            code,
            reason: reason.to_string(),
            is_active,
        }));
    }

    /// Tear a call object down without a state notification, as a stack does
    /// when it garbage-collects a session
    pub fn tear_down_call(&self, call_id: &CallId) -> bool {
        match self.shared.calls.remove(call_id) {
            Some((_, call)) => {
                call.torn_down.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn call(&self, call_id: &CallId) -> Option<Arc<MemoryCall>> {
        self.shared.calls.get(call_id).map(|c| c.value().clone())
    }

    pub fn call_state(&self, call_id: &CallId) -> Option<CallState> {
        self.call(call_id).map(|c| *c.state.lock())
    }

    pub fn pending_events(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Commands received so far
    pub fn commands(&self) -> Vec<EngineCommand> {
        self.shared.commands.lock().clone()
    }

    pub fn clear_commands(&self) {
        self.shared.commands.lock().clear();
    }

    fn dispatch(&self, sink: &dyn ProtocolEventSink, event: QueuedEvent) {
        match event {
            QueuedEvent::Registration(event) => sink.on_registration_state(event),
            QueuedEvent::Incoming(call_id) => {
                if let Some(call) = self.call(&call_id) {
                    sink.on_incoming_call(call);
                }
            }
            QueuedEvent::CallState(call_id) => {
                if let Some(call) = self.call(&call_id) {
                    sink.on_call_state(call.as_ref());
                }
            }
            QueuedEvent::MediaReady(call_id) => {
                if let Some(call) = self.call(&call_id) {
                    sink.on_media_ready(call.as_ref());
                }
            }
        }
    }
}

impl ProtocolEngine for MemoryEngine {
    fn create_endpoint(&self) -> EngineResult<()> {
        let mut endpoint = self.shared.endpoint.lock();
        if *endpoint != EndpointState::Absent {
            return Err(EngineError::new("endpoint.create", "ALREADY_EXISTS")
                .with_detail("an endpoint is already alive in this process"));
        }
        *endpoint = EndpointState::Created;
        debug!("Memory endpoint created");
        Ok(())
    }

    fn init(&self, config: &EndpointConfig) -> EngineResult<()> {
        self.shared.take_failure(FailurePoint::Init)?;
        let mut endpoint = self.shared.endpoint.lock();
        if *endpoint != EndpointState::Created {
            return Err(EngineError::new("endpoint.init", "INVALID_STATE")
                .with_detail("endpoint must be created before init"));
        }
        *endpoint = EndpointState::Initialised;
        debug!(
            "Memory endpoint initialised: {:?} port {}, max {} calls",
            config.transport.kind, config.transport.port, config.max_calls
        );
        Ok(())
    }

    fn start(&self) -> EngineResult<()> {
        self.shared.take_failure(FailurePoint::Start)?;
        let mut endpoint = self.shared.endpoint.lock();
        if *endpoint != EndpointState::Initialised {
            return Err(EngineError::new("endpoint.start", "INVALID_STATE")
                .with_detail("endpoint must be initialised before start"));
        }
        *endpoint = EndpointState::Started;
        Ok(())
    }

    fn destroy(&self) {
        *self.shared.endpoint.lock() = EndpointState::Absent;
        *self.shared.account_uri.write() = None;
        *self.shared.sink.write() = None;
        self.shared.queue.lock().clear();
        for entry in self.shared.calls.iter() {
            entry.value().torn_down.store(true, Ordering::SeqCst);
        }
        self.shared.calls.clear();
        debug!("Memory endpoint destroyed");
    }

    fn set_event_sink(&self, sink: Arc<dyn ProtocolEventSink>) {
        *self.shared.sink.write() = Some(sink);
    }

    fn register_account(&self, account: &AccountConfig) -> EngineResult<AccountHandle> {
        self.shared.require_started("account.register")?;
        self.shared.take_failure(FailurePoint::RegisterAccount)?;
        let id = self.shared.next_account_id.fetch_add(1, Ordering::SeqCst);
        *self.shared.account_uri.write() = Some(account.id_uri.clone());
        self.report_registration(200, "OK", true);
        Ok(AccountHandle {
            id,
            uri: account.id_uri.clone(),
        })
    }

    fn make_call(&self, account: &AccountHandle, uri: &str) -> EngineResult<Arc<dyn ProtocolCall>> {
        self.shared.require_started("call.make")?;
        if self.shared.account_uri.read().as_deref() != Some(account.uri.as_str()) {
            return Err(EngineError::new("call.make", "NOT_REGISTERED")
                .with_detail(format!("account {} is not registered", account.uri)));
        }
        validate_sip_uri(uri)?;
        self.shared.take_failure(FailurePoint::MakeCall)?;

        let call = MemoryCall::new(&self.shared, uri.to_string(), account.uri.clone(), CallState::Calling);
        self.shared.calls.insert(call.id.clone(), call.clone());
        self.shared.record(EngineCommand::MakeCall {
            uri: uri.to_string(),
        });
        self.shared.enqueue(QueuedEvent::CallState(call.id.clone()));
        Ok(call)
    }

    fn poll_events(&self, timeout: Duration) -> EngineResult<usize> {
        self.shared.require_started("endpoint.poll")?;
        {
            let mut queue = self.shared.queue.lock();
            if queue.is_empty() {
                self.shared.ready.wait_for(&mut queue, timeout);
            }
        }
        let Some(sink) = self.shared.sink.read().clone() else {
            return Ok(0);
        };
        // Pop one at a time so a panicking callback leaves the rest queued
        let mut dispatched = 0;
        loop {
            let next = self.shared.queue.lock().pop_front();
            let Some(event) = next else {
                break;
            };
            self.dispatch(sink.as_ref(), event);
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

fn validate_sip_uri(uri: &str) -> EngineResult<()> {
    let invalid = |detail: String| {
        EngineError::new("call.make", "INVALID_URI").with_detail(detail)
    };
    let parsed = Url::parse(uri).map_err(|e| invalid(format!("{}: {}", uri, e)))?;
    if !matches!(parsed.scheme(), "sip" | "sips") {
        return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
    }
    let target = parsed.path();
    if target.is_empty() || target.contains(char::is_whitespace) || target.ends_with('@') {
        return Err(invalid(format!("{} has no target host", uri)));
    }
    Ok(())
}

/// Call object owned by [`MemoryEngine`]
pub struct MemoryCall {
    id: CallId,
    remote_uri: String,
    local_uri: String,
    state: Mutex<CallState>,
    media: Mutex<Vec<MediaKind>>,
    torn_down: AtomicBool,
    engine: Weak<Shared>,
}

impl MemoryCall {
    fn new(shared: &Arc<Shared>, remote_uri: String, local_uri: String, state: CallState) -> Arc<Self> {
        Arc::new(Self {
            id: CallId::new(Uuid::new_v4().simple().to_string()),
            remote_uri,
            local_uri,
            state: Mutex::new(state),
            media: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            engine: Arc::downgrade(shared),
        })
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn engine(&self, title: &str) -> EngineResult<Arc<Shared>> {
        if self.is_torn_down() {
            return Err(EngineError::new(title, SESSION_TERMINATED)
                .with_detail(format!("call {} no longer exists", self.id)));
        }
        self.engine
            .upgrade()
            .ok_or_else(|| EngineError::new(title, "ENGINE_GONE").with_detail("engine dropped"))
    }
}

impl ProtocolCall for MemoryCall {
    fn call_id(&self) -> CallId {
        self.id.clone()
    }

    fn info(&self) -> EngineResult<CallInfo> {
        self.engine("call.info")?;
        let state = self.state();
        Ok(CallInfo {
            call_id: self.id.clone(),
            remote_uri: self.remote_uri.clone(),
            local_uri: self.local_uri.clone(),
            state,
            state_text: state.state_text().to_string(),
            media: self.media.lock().clone(),
        })
    }

    fn accept(&self) -> EngineResult<()> {
        let shared = self.engine("call.answer")?;
        {
            let mut state = self.state.lock();
            if !matches!(*state, CallState::Incoming | CallState::Early) {
                return Err(EngineError::new("call.answer", "INVALID_STATE")
                    .with_detail(format!("cannot answer a call in state {}", *state)));
            }
            *state = CallState::Connecting;
        }
        shared.record(EngineCommand::Accept(self.id.clone()));
        shared.enqueue(QueuedEvent::CallState(self.id.clone()));
        Ok(())
    }

    fn terminate(&self, code: HangupCode) -> EngineResult<()> {
        let shared = self.engine("call.hangup")?;
        {
            let mut state = self.state.lock();
            if *state == CallState::Disconnected {
                return Err(EngineError::new("call.hangup", SESSION_TERMINATED)
                    .with_detail("INVITE session already terminated"));
            }
            *state = CallState::Disconnected;
        }
        shared.record(EngineCommand::Terminate(self.id.clone(), code));
        shared.enqueue(QueuedEvent::CallState(self.id.clone()));
        Ok(())
    }

    fn connect_audio_device(&self) -> EngineResult<()> {
        let shared = self.engine("call.connect_audio")?;
        if !self.media.lock().contains(&MediaKind::Audio) {
            return Err(EngineError::new("call.audio_stream", "NO_AUDIO_STREAM")
                .with_detail("call has no active audio stream"));
        }
        if !shared.audio_device_available.load(Ordering::SeqCst) {
            return Err(EngineError::new("call.connect_audio", "NO_SOUND_DEVICE")
                .with_detail("no default sound device"));
        }
        shared.record(EngineCommand::ConnectAudio(self.id.clone()));
        Ok(())
    }
}
