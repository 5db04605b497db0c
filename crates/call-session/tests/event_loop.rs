//! Session manager driven by the background event pump

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use sipdesk_call_session::engine::{EngineCommand, FailurePoint};
use sipdesk_call_session::{
    CallId, CallState, EngineError, HangupCode, MemoryEngine, NotificationSinks, Partition, SessionConfig,
    SessionError, SessionEvent, SessionManager, SessionManagerBuilder,
};

const POLL: Duration = Duration::from_millis(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("sipdesk_call_session=debug")
        .try_init();
}

fn config() -> SessionConfig {
    SessionConfig::new("alice", "secret", "example.com")
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn test_incoming_call_with_running_pump() {
    init_tracing();
    let engine = MemoryEngine::new();
    let incoming = Arc::new(Mutex::new(Vec::<CallId>::new()));
    let recorder = incoming.clone();
    let manager = SessionManager::new(
        config(),
        Arc::new(engine.clone()),
        NotificationSinks::new().on_incoming_call(move |id| recorder.lock().push(id.clone())),
    )
    .unwrap();
    manager.start_event_loop(POLL).unwrap();

    let x = engine.inject_incoming_call("sip:bob@example.com");
    assert!(wait_until(|| incoming.lock().contains(&x)));
    assert_eq!(manager.partition_of(&x), Some(Partition::PendingInbound));

    manager.answer(&x).unwrap();
    assert!(wait_until(|| manager.partition_of(&x) == Some(Partition::Active)));

    manager.hang_up(&x).unwrap();
    assert!(wait_until(|| manager.partition_of(&x).is_none()));
    // Answered but never confirmed, so the generic busy code is used
    assert!(engine
        .commands()
        .contains(&EngineCommand::Terminate(x, HangupCode::Busy)));

    manager.stop_event_loop();
}

#[test]
fn test_stop_event_loop_is_idempotent() {
    init_tracing();
    let manager = SessionManager::new(config(), Arc::new(MemoryEngine::new()), NotificationSinks::new()).unwrap();

    manager.stop_event_loop();
    assert!(!manager.is_event_loop_running());

    manager.start_event_loop(POLL).unwrap();
    manager.start_event_loop(POLL).unwrap();
    assert!(manager.is_event_loop_running());

    manager.stop_event_loop();
    manager.stop_event_loop();
    assert!(!manager.is_event_loop_running());

    manager.start_default_event_loop().unwrap();
    assert!(manager.is_event_loop_running());
}

#[test]
fn test_no_callback_after_stop_returns() {
    init_tracing();
    let engine = MemoryEngine::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let manager = SessionManager::new(
        config(),
        Arc::new(engine.clone()),
        NotificationSinks::new().on_incoming_call(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();
    manager.start_event_loop(POLL).unwrap();
    assert!(wait_until(|| engine.pending_events() == 0));
    manager.stop_event_loop();

    engine.inject_incoming_call("sip:bob@example.com");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(engine.pending_events(), 1);
}

#[test]
fn test_second_manager_on_live_endpoint_fails() {
    init_tracing();
    let engine = MemoryEngine::new();
    let first = SessionManager::new(config(), Arc::new(engine.clone()), NotificationSinks::new()).unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    let err = SessionManager::new(
        config(),
        Arc::new(engine.clone()),
        NotificationSinks::new().on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap_err();

    assert!(matches!(err, SessionError::Configuration { .. }));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    // The first manager's endpoint survives
    assert!(engine.is_endpoint_alive());
    assert!(first.place_call("sip:bob@example.com").is_ok());
}

#[test]
fn test_setup_failure_destroys_endpoint() {
    init_tracing();
    let engine = MemoryEngine::new();
    engine.inject_failure(
        FailurePoint::RegisterAccount,
        EngineError::new("account.register", "AUTH_FAILED"),
    );
    let reports = Arc::new(Mutex::new(Vec::new()));
    let recorder = reports.clone();

    let err = SessionManager::new(
        config(),
        Arc::new(engine.clone()),
        NotificationSinks::new().on_error(move |report| recorder.lock().push(report.clone())),
    )
    .unwrap_err();

    assert!(matches!(err, SessionError::Configuration { ref field, .. } if field == "account"));
    assert!(!engine.is_endpoint_alive());
    assert_eq!(reports.lock()[0].title, "account.register");

    // Nothing left behind: a fresh manager can be built on the same engine
    assert!(SessionManager::new(config(), Arc::new(engine), NotificationSinks::new()).is_ok());
}

#[test]
fn test_drop_stops_pump_and_releases_calls() {
    init_tracing();
    let engine = MemoryEngine::new();
    let manager = SessionManagerBuilder::new()
        .config(config())
        .engine(Arc::new(engine.clone()))
        .start_event_loop(true)
        .build()
        .unwrap();

    let outbound = manager.place_call("sip:bob@example.com").unwrap();
    let inbound = engine.inject_incoming_call("sip:carol@example.com");
    assert!(wait_until(|| manager.stats().total() == 2));
    let calls = [engine.call(&outbound).unwrap(), engine.call(&inbound).unwrap()];

    drop(manager);

    assert!(!engine.is_endpoint_alive());
    assert!(calls.iter().all(|c| c.is_torn_down()));
}

#[test]
fn test_concurrent_commands_keep_partitions_disjoint() {
    init_tracing();
    let engine = MemoryEngine::new();
    let manager = Arc::new(
        SessionManager::new(config(), Arc::new(engine.clone()), NotificationSinks::new()).unwrap(),
    );
    manager.start_event_loop(Duration::from_millis(1)).unwrap();

    let callers: Vec<_> = (0..4)
        .map(|n| {
            let manager = manager.clone();
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let id = manager
                        .place_call(&format!("sip:peer{}-{}@example.com", n, i))
                        .unwrap();
                    if i % 2 == 0 {
                        engine.set_call_state(&id, CallState::Connecting);
                    }
                    let _ = manager.get_info(&id);
                    if i % 3 == 0 {
                        manager.hang_up(&id).unwrap();
                    }
                }
            })
        })
        .collect();
    let answerer = {
        let manager = manager.clone();
        let engine = engine.clone();
        thread::spawn(move || {
            for _ in 0..25 {
                let id = engine.inject_incoming_call("sip:caller@example.com");
                // Not registered yet, or already registered: both are fine
                let _ = manager.answer(&id);
            }
        })
    };
    for caller in callers {
        caller.join().unwrap();
    }
    answerer.join().unwrap();
    assert!(wait_until(|| engine.pending_events() == 0));
    manager.stop_event_loop();

    let stats = manager.stats();
    let listed = manager.list_calls();
    assert_eq!(listed.len(), stats.total());
    let mut ids: Vec<&str> = listed.iter().map(|c| c.call_id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), stats.total());
    // Hung-up calls are gone for good
    assert_eq!(stats.total_removed as usize, 4 * 9);
}

#[tokio::test]
async fn test_subscribe_receives_session_events() {
    init_tracing();
    let engine = MemoryEngine::new();
    let manager = SessionManager::new(config(), Arc::new(engine.clone()), NotificationSinks::new()).unwrap();
    let mut events = manager.subscribe();
    manager.start_event_loop(POLL).unwrap();

    let x = engine.inject_incoming_call("sip:bob@example.com");
    let mut saw_registration = false;
    let mut saw_incoming = false;
    while !(saw_registration && saw_incoming) {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for session events")
            .unwrap();
        match event {
            SessionEvent::RegistrationState { code, ref status, .. } => {
                assert_eq!(code, 200);
                assert_eq!(status, "Active");
                saw_registration = true;
            }
            SessionEvent::IncomingCall { ref call_id } => {
                assert_eq!(call_id, &x);
                saw_incoming = true;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    manager.stop_event_loop();
}
