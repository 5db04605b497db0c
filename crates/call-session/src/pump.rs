//! Background event pump
//!
//! The protocol engine only delivers events while someone asks it to. The
//! [`EventPump`] owns one named OS thread that keeps calling
//! [`ProtocolEngine::poll_events`] until its cancellation token fires. Every
//! engine callback, and therefore every host notification, runs on that
//! thread.
//!
//! Failures never end the loop: a poll error is reported once per failure
//! streak through the error sink, and a panic raised by a host callback is
//! caught, reported and the loop carries on.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::ProtocolEngine;
use crate::error::{ErrorReport, SessionError, SessionResult};
use crate::events::Notifier;

const PUMP_THREAD_NAME: &str = "call-session-pump";

static NEXT_PUMP_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the pump owning the current thread, 0 elsewhere
    static CURRENT_PUMP: Cell<usize> = const { Cell::new(0) };
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_alive(&self) -> bool {
        !self.token.is_cancelled() && !self.handle.is_finished()
    }
}

/// Drives protocol event dispatch on a dedicated thread
pub struct EventPump {
    id: usize,
    engine: Arc<dyn ProtocolEngine>,
    notifier: Arc<Notifier>,
    /// Serialises start/stop from outside the pump thread
    control: Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl EventPump {
    pub fn new(engine: Arc<dyn ProtocolEngine>, notifier: Arc<Notifier>) -> Self {
        Self {
            id: NEXT_PUMP_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            notifier,
            control: Mutex::new(()),
            worker: Mutex::new(None),
        }
    }

    fn on_pump_thread(&self) -> bool {
        CURRENT_PUMP.with(|current| current.get() == self.id)
    }

    /// Spawn the worker thread if it is not already running
    ///
    /// Called from the pump thread itself this does nothing.
    pub fn start(&self, poll_interval: Duration) -> SessionResult<()> {
        if self.on_pump_thread() {
            return Ok(());
        }
        let _control = self.control.lock();

        let stale = {
            let mut worker = self.worker.lock();
            if worker.as_ref().is_some_and(Worker::is_alive) {
                return Ok(());
            }
            worker.take()
        };
        if let Some(stale) = stale {
            stale.token.cancel();
            if stale.handle.join().is_err() {
                warn!("Previous event pump thread ended with a panic");
            }
        }

        let token = CancellationToken::new();
        let handle = {
            let id = self.id;
            let engine = self.engine.clone();
            let notifier = self.notifier.clone();
            let token = token.clone();
            thread::Builder::new()
                .name(PUMP_THREAD_NAME.to_string())
                .spawn(move || run(id, engine, notifier, token, poll_interval))
                .map_err(|e| SessionError::internal(format!("failed to spawn event pump: {}", e)))?
        };

        *self.worker.lock() = Some(Worker { token, handle });
        info!("Event pump started, polling every {:?}", poll_interval);
        Ok(())
    }

    /// Stop the worker and wait for it to exit
    ///
    /// No engine callback runs once this returns. Safe to call when the pump
    /// never started and safe to call twice. Called from a callback on the pump
    /// thread it only requests the stop; the loop ends after the current
    /// dispatch.
    pub fn stop(&self) {
        if self.on_pump_thread() {
            if let Some(worker) = self.worker.lock().as_ref() {
                worker.token.cancel();
            }
            debug!("Event pump stop requested from the pump thread");
            return;
        }
        let _control = self.control.lock();

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.token.cancel();
        if worker.handle.join().is_err() {
            error!("Event pump thread ended with a panic");
        }
        info!("Event pump stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(Worker::is_alive)
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EventPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPump")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run(
    id: usize,
    engine: Arc<dyn ProtocolEngine>,
    notifier: Arc<Notifier>,
    token: CancellationToken,
    poll_interval: Duration,
) {
    CURRENT_PUMP.with(|current| current.set(id));
    let mut failing = false;

    while !token.is_cancelled() {
        match panic::catch_unwind(AssertUnwindSafe(|| engine.poll_events(poll_interval))) {
            Ok(Ok(_)) => failing = false,
            Ok(Err(err)) => {
                if !failing {
                    error!("Event polling failed: {}", err);
                    notifier.error(ErrorReport::from(&err));
                    failing = true;
                }
                thread::sleep(poll_interval);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Event callback panicked: {}", message);
                let report = ErrorReport::new("Event callback panicked", message)
                    .with_detail("event pump recovered and keeps polling");
                // A panicking error sink must not take the pump down either
                if panic::catch_unwind(AssertUnwindSafe(|| notifier.error(report))).is_err() {
                    error!("Error sink panicked while reporting a callback panic");
                }
            }
        }
    }

    CURRENT_PUMP.with(|current| current.set(0));
    debug!("Event pump loop exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
