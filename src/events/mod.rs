use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::queue::Lane;

pub const QUEUE_COUNT_CHANGED_EVENT: &str = "queue.count_changed";
pub const QUEUE_STATE_CHANGED_EVENT: &str = "queue.state_changed";
pub const CONNECTION_STATE_CHANGED_EVENT: &str = "connection.state_changed";

pub type ListenerResult = Result<(), String>;

type SyncListener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;
type AsyncListener = Arc<dyn Fn(Event) -> ListenerResult + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStateKind {
    UdpBan,
    HttpBan,
    InvalidSession,
    AwaitingResponse,
    OverloadBackoff,
}

impl ConnectionStateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UdpBan => "udp_ban",
            Self::HttpBan => "http_ban",
            Self::InvalidSession => "invalid_session",
            Self::AwaitingResponse => "awaiting_response",
            Self::OverloadBackoff => "overload_backoff",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionStateChange {
    pub kind: ConnectionStateKind,
    pub value: bool,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConnectionStateChange {
    pub fn new(kind: ConnectionStateKind, value: bool, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            value,
            at,
            pause_seconds: None,
            message: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStateKind {
    Idle,
    Paused,
    Executing,
    WaitingForConnection,
    Stopped,
}

impl QueueStateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Paused => "paused",
            Self::Executing => "executing",
            Self::WaitingForConnection => "waiting_for_connection",
            Self::Stopped => "stopped",
        }
    }
}

/// Everything the core reports to outside observers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    QueueCountChanged {
        lane: Lane,
        count: usize,
    },
    QueueStateChanged {
        lane: Lane,
        state: QueueStateKind,
        message: String,
        params: Vec<String>,
    },
    ConnectionStateChanged(ConnectionStateChange),
}

impl Notification {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::QueueCountChanged { .. } => QUEUE_COUNT_CHANGED_EVENT,
            Self::QueueStateChanged { .. } => QUEUE_STATE_CHANGED_EVENT,
            Self::ConnectionStateChanged(_) => CONNECTION_STATE_CHANGED_EVENT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub notification: Notification,
}

impl Event {
    pub fn new(notification: Notification) -> Self {
        Self {
            name: notification.event_name().to_owned(),
            notification,
        }
    }
}

#[derive(Debug)]
pub enum EmitError {
    ListenerFailed {
        event: String,
        listener_index: usize,
        message: String,
    },
    ListenerPanicked {
        event: String,
        listener_index: usize,
    },
    ShuttingDown {
        event: String,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailed {
                event,
                listener_index,
                message,
            } => write!(
                f,
                "sync listener #{listener_index} failed for event '{event}': {message}"
            ),
            Self::ListenerPanicked {
                event,
                listener_index,
            } => write!(
                f,
                "sync listener #{listener_index} panicked for event '{event}'"
            ),
            Self::ShuttingDown { event } => {
                write!(f, "event '{event}' dropped: emitter is shutting down")
            }
        }
    }
}

impl Error for EmitError {}

#[derive(Default)]
pub struct EventEmitter {
    sync_listeners: RwLock<HashMap<String, Vec<SyncListener>>>,
    async_listeners: RwLock<HashMap<String, Vec<AsyncListener>>>,
    shutting_down: AtomicBool,
    running_async: Arc<AtomicUsize>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener that runs inline on the emitting thread.
    pub fn on<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        let mut listeners = self
            .sync_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Registers a listener that runs on its own thread; failures never reach the emitter.
    pub fn on_async<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(Event) -> ListenerResult + Send + Sync + 'static,
    {
        let mut listeners = self
            .async_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn emit(&self, notification: Notification) -> Result<(), EmitError> {
        let event = Event::new(notification);
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EmitError::ShuttingDown { event: event.name });
        }
        self.run_sync(&event)?;
        self.dispatch_async(event);
        Ok(())
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Waits until no async listener is running. Returns `false` on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let started_at = Instant::now();
        while self.running_async.load(Ordering::SeqCst) > 0 {
            if started_at.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    fn run_sync(&self, event: &Event) -> Result<(), EmitError> {
        let listeners = self
            .sync_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(handlers) = listeners.get(&event.name) else {
            return Ok(());
        };

        for (idx, handler) in handlers.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    return Err(EmitError::ListenerFailed {
                        event: event.name.clone(),
                        listener_index: idx,
                        message,
                    });
                }
                Err(_) => {
                    return Err(EmitError::ListenerPanicked {
                        event: event.name.clone(),
                        listener_index: idx,
                    });
                }
            }
        }

        Ok(())
    }

    fn dispatch_async(&self, event: Event) {
        let listeners = self
            .async_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(handlers) = listeners.get(&event.name) else {
            return;
        };

        for (idx, handler) in handlers.iter().enumerate() {
            let listener = Arc::clone(handler);
            let event_for_listener = event.clone();
            let event_name = event.name.clone();
            let running = Arc::clone(&self.running_async);
            running.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| listener(event_for_listener)));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => {
                        eprintln!("async listener #{idx} failed for event '{event_name}': {message}");
                    }
                    Err(_) => {
                        eprintln!("async listener #{idx} panicked for event '{event_name}'");
                    }
                }
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;

    use crate::queue::Lane;

    use super::{
        ConnectionStateChange, ConnectionStateKind, EmitError, EventEmitter, Notification,
        CONNECTION_STATE_CHANGED_EVENT, QUEUE_COUNT_CHANGED_EVENT, QUEUE_STATE_CHANGED_EVENT,
    };

    /// Records every notification published on the three core events.
    pub(crate) fn recording_emitter() -> (Arc<EventEmitter>, Arc<Mutex<Vec<Notification>>>) {
        let emitter = Arc::new(EventEmitter::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in [
            QUEUE_COUNT_CHANGED_EVENT,
            QUEUE_STATE_CHANGED_EVENT,
            CONNECTION_STATE_CHANGED_EVENT,
        ] {
            let seen = Arc::clone(&seen);
            emitter.on(name, move |event| {
                seen.lock()
                    .map_err(|_| "recording mutex poisoned".to_owned())?
                    .push(event.notification.clone());
                Ok(())
            });
        }
        (emitter, seen)
    }

    #[test]
    fn sync_listener_receives_count_notification() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        emitter.on(QUEUE_COUNT_CHANGED_EVENT, move |event| {
            if event.notification
                == (Notification::QueueCountChanged {
                    lane: Lane::Hashing,
                    count: 3,
                })
            {
                calls_clone.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        });

        let result = emitter.emit(Notification::QueueCountChanged {
            lane: Lane::Hashing,
            count: 3,
        });
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn notifications_route_by_event_name() {
        let (emitter, seen) = recording_emitter();
        let change = ConnectionStateChange::new(ConnectionStateKind::UdpBan, true, Utc::now());

        emitter
            .emit(Notification::ConnectionStateChanged(change.clone()))
            .expect("emit should pass");

        let seen = seen.lock().expect("recording mutex poisoned");
        assert_eq!(seen.as_slice(), &[Notification::ConnectionStateChanged(change)]);
    }

    #[test]
    fn sync_listener_error_bubbles_up() {
        let emitter = EventEmitter::new();
        emitter.on(QUEUE_STATE_CHANGED_EVENT, |_event| {
            Err("sync listener failure".to_owned())
        });

        let result = emitter.emit(Notification::QueueStateChanged {
            lane: Lane::General,
            state: super::QueueStateKind::Idle,
            message: String::new(),
            params: Vec::new(),
        });
        assert!(matches!(
            result,
            Err(EmitError::ListenerFailed {
                listener_index: 0,
                ..
            })
        ));
    }

    #[test]
    fn sync_listener_panic_is_recovered_and_returned() {
        let emitter = EventEmitter::new();
        emitter.on(QUEUE_COUNT_CHANGED_EVENT, |_event| panic!("boom"));

        let result = emitter.emit(Notification::QueueCountChanged {
            lane: Lane::Image,
            count: 0,
        });
        assert!(matches!(
            result,
            Err(EmitError::ListenerPanicked {
                listener_index: 0,
                ..
            })
        ));
    }

    #[test]
    fn async_listener_executes_in_isolation_and_drains() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        emitter.on_async(QUEUE_COUNT_CHANGED_EVENT, move |_event| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        emitter.on_async(QUEUE_COUNT_CHANGED_EVENT, |_event| {
            Err("non-fatal async error".to_owned())
        });

        let result = emitter.emit(Notification::QueueCountChanged {
            lane: Lane::General,
            count: 1,
        });
        assert!(result.is_ok());

        assert!(emitter.wait_for_idle(Duration::from_secs(2)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn emit_after_shutdown_is_rejected() {
        let emitter = EventEmitter::new();
        emitter.begin_shutdown();

        let result = emitter.emit(Notification::QueueCountChanged {
            lane: Lane::General,
            count: 0,
        });
        assert!(matches!(result, Err(EmitError::ShuttingDown { .. })));
    }
}
