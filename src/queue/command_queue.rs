use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::commands::{CommandRecord, CommandRegistry, ConnectionRequirement};
use crate::connection::{ConnectionHandler, Protocol};
use crate::events::{EventEmitter, Notification, QueueStateKind};
use crate::logging::{LogLevel, Logger};
use crate::storage::StorageFacade;
use crate::utils::timing::measure_execution;

use super::{IdlePolicy, Lane, QueueError, QueueSettings, QueueStatus, StepOutcome};

/// Collaborators shared by every lane.
#[derive(Clone)]
pub struct QueueDependencies {
    pub storage: Arc<StorageFacade>,
    pub registry: Arc<CommandRegistry>,
    pub emitter: Arc<EventEmitter>,
    pub logger: Arc<Logger>,
    pub udp_gate: Option<Arc<ConnectionHandler>>,
    pub http_gate: Option<Arc<ConnectionHandler>>,
}

impl QueueDependencies {
    pub fn new(
        storage: Arc<StorageFacade>,
        registry: Arc<CommandRegistry>,
        emitter: Arc<EventEmitter>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            storage,
            registry,
            emitter,
            logger,
            udp_gate: None,
            http_gate: None,
        }
    }

    pub fn with_udp_gate(mut self, handler: Arc<ConnectionHandler>) -> Self {
        self.udp_gate = Some(handler);
        self
    }

    pub fn with_http_gate(mut self, handler: Arc<ConnectionHandler>) -> Self {
        self.http_gate = Some(handler);
        self
    }

    fn gate_for(&self, requirement: ConnectionRequirement) -> Option<&Arc<ConnectionHandler>> {
        match requirement.protocol()? {
            Protocol::Udp => self.udp_gate.as_ref(),
            Protocol::Http => self.http_gate.as_ref(),
        }
    }
}

#[derive(Debug)]
struct LaneStatus {
    state: QueueStateKind,
    current_description: String,
}

struct LaneShared {
    lane: Lane,
    deps: QueueDependencies,
    settings: QueueSettings,
    paused: AtomicBool,
    cancelled: AtomicBool,
    status: RwLock<LaneStatus>,
    /// Held for a whole step so a record is dispatched by one caller only.
    step: Mutex<()>,
    /// Executed records whose delete failed; never dispatched again.
    undeleted: Mutex<HashSet<String>>,
    wake_pending: Mutex<bool>,
    wakeup: Condvar,
}

/// One lane's persistent backlog and its single worker.
///
/// At most one command of the lane is in flight at any time. Pause and
/// cancel are cooperative and observed before each dequeue; a running
/// command is never interrupted.
pub struct CommandQueue {
    shared: Arc<LaneShared>,
    worker: Option<JoinHandle<()>>,
}

impl CommandQueue {
    /// Restores the persisted pause flag of `lane`.
    pub fn new(
        lane: Lane,
        deps: QueueDependencies,
        settings: QueueSettings,
    ) -> Result<Self, QueueError> {
        let paused = deps.storage.load_lane_paused(lane)?.unwrap_or(false);
        let depth = deps.storage.count(lane)?;
        deps.logger.log(
            LogLevel::Info,
            Some(lane.log_context()),
            "Command lane loaded",
            Some(json!({
                "lane": lane.as_str(),
                "depth": depth,
                "paused": paused
            })),
        );

        let initial_state = if paused {
            QueueStateKind::Paused
        } else {
            QueueStateKind::Idle
        };
        Ok(Self {
            shared: Arc::new(LaneShared {
                lane,
                deps,
                settings,
                paused: AtomicBool::new(paused),
                cancelled: AtomicBool::new(false),
                status: RwLock::new(LaneStatus {
                    state: initial_state,
                    current_description: String::new(),
                }),
                step: Mutex::new(()),
                undeleted: Mutex::new(HashSet::new()),
                wake_pending: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
            worker: None,
        })
    }

    pub fn lane(&self) -> Lane {
        self.shared.lane
    }

    /// Persists `record` unless its id is already queued. Returns whether it
    /// was inserted.
    pub fn enqueue(&self, record: &CommandRecord) -> Result<bool, QueueError> {
        self.shared.enqueue(record)
    }

    /// Runs one iteration of the worker loop on the calling thread. Blocks
    /// while the worker is in the middle of a step.
    pub fn process_next(&self) -> Result<StepOutcome, QueueError> {
        self.shared.process_next()
    }

    pub fn start(&mut self) -> Result<(), QueueError> {
        if self.worker.is_some() {
            return Err(QueueError::AlreadyRunning {
                lane: self.shared.lane,
            });
        }

        self.shared.cancelled.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("lane-{}", self.shared.lane))
            .spawn(move || shared.run())
            .map_err(|source| QueueError::WorkerSpawn {
                lane: self.shared.lane,
                source,
            })?;
        self.worker = Some(handle);
        self.shared.deps.logger.info(
            Some(self.shared.lane.log_context()),
            "Command lane worker started",
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn pause(&self) -> Result<(), QueueError> {
        self.shared.set_paused(true)
    }

    pub fn resume(&self) -> Result<(), QueueError> {
        self.shared.set_paused(false)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Asks the worker to stop before its next dequeue.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.wake();
    }

    /// Waits for the worker to exit. Does not cancel it.
    pub fn join(&mut self) -> Result<(), QueueError> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        handle.join().map_err(|_| QueueError::JoinFailed {
            lane: self.shared.lane,
        })
    }

    /// Deletes every pending record of the lane.
    pub fn clear(&self) -> Result<usize, QueueError> {
        let removed = self.shared.deps.storage.delete_lane(self.shared.lane)?;
        self.shared.deps.logger.log(
            LogLevel::Info,
            Some(self.shared.lane.log_context()),
            "Command lane cleared",
            Some(json!({ "removed": removed })),
        );
        self.shared.publish_count()?;
        Ok(removed)
    }

    pub fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.shared.deps.storage.count(self.shared.lane)?)
    }

    pub fn current_description(&self) -> String {
        self.shared
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current_description
            .clone()
    }

    pub fn state(&self) -> QueueStateKind {
        self.shared
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn status(&self) -> Result<QueueStatus, QueueError> {
        let status = self
            .shared
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(QueueStatus {
            lane: self.shared.lane,
            depth: self.shared.deps.storage.count(self.shared.lane)?,
            paused: self.is_paused(),
            current_description: status.current_description.clone(),
            state: status.state,
        })
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl LaneShared {
    fn context(&self) -> Option<&'static str> {
        Some(self.lane.log_context())
    }

    fn run(&self) {
        loop {
            match self.process_next() {
                Ok(StepOutcome::Cancelled) => break,
                Ok(StepOutcome::Executed { .. }) => {}
                Ok(StepOutcome::Paused) => self.wait_for_work(self.settings.pause_poll_interval),
                Ok(StepOutcome::Idle) => {
                    if self.settings.idle_policy == IdlePolicy::ExitWhenEmpty {
                        break;
                    }
                    self.wait_for_work(self.settings.idle_interval);
                }
                Ok(StepOutcome::WaitingForConnection) => {
                    self.wait_for_work(self.settings.idle_interval)
                }
                Err(error) => {
                    self.deps.logger.error(
                        self.context(),
                        &format!("lane iteration failed: {error}"),
                    );
                    self.wait_for_work(self.settings.idle_interval);
                }
            }
        }

        self.set_state(QueueStateKind::Stopped, "Stopped", Vec::new());
        self.deps
            .logger
            .info(self.context(), "Command lane worker stopped");
    }

    fn process_next(&self) -> Result<StepOutcome, QueueError> {
        let _step = self.step.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(StepOutcome::Cancelled);
        }
        if self.paused.load(Ordering::SeqCst) {
            self.set_state(QueueStateKind::Paused, "Paused", Vec::new());
            return Ok(StepOutcome::Paused);
        }

        let undeleted = self.retry_undeleted();
        let eligible = |record: &CommandRecord| {
            !undeleted.contains(&record.command_id) && self.connection_available(record)
        };
        let Some(record) = self
            .deps
            .storage
            .fetch_next_matching(self.lane, &eligible)?
        else {
            return self.no_eligible_record(undeleted.len());
        };

        let succeeded = self.execute(&record);

        if let Err(error) = self.deps.storage.delete(&record.command_id) {
            self.deps.logger.log(
                LogLevel::Error,
                self.context(),
                "Executed command could not be deleted; it will not run again",
                Some(json!({
                    "command_id": record.command_id,
                    "error": error.to_string()
                })),
            );
            self.undeleted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(record.command_id.clone());
        }
        {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            status.current_description.clear();
        }
        self.publish_count()?;
        self.set_state(QueueStateKind::Idle, "Idle", Vec::new());

        Ok(StepOutcome::Executed {
            command_id: record.command_id,
            succeeded,
        })
    }

    /// Retries deletes that failed earlier and returns the ids still stuck.
    fn retry_undeleted(&self) -> HashSet<String> {
        let mut undeleted = self.undeleted.lock().unwrap_or_else(PoisonError::into_inner);
        undeleted.retain(|command_id| match self.deps.storage.delete(command_id) {
            Ok(_) => false,
            Err(error) => {
                self.deps.logger.debug(
                    self.context(),
                    &format!("delete of '{command_id}' still failing: {error}"),
                );
                true
            }
        });
        undeleted.clone()
    }

    fn no_eligible_record(&self, undeleted: usize) -> Result<StepOutcome, QueueError> {
        if self.deps.storage.count(self.lane)?.saturating_sub(undeleted) == 0 {
            self.set_state(QueueStateKind::Idle, "Idle", Vec::new());
            return Ok(StepOutcome::Idle);
        }

        let banned = [&self.deps.udp_gate, &self.deps.http_gate]
            .into_iter()
            .flatten()
            .filter(|handler| handler.is_banned())
            .map(|handler| handler.protocol().as_str().to_owned())
            .collect::<Vec<_>>();
        self.set_state(
            QueueStateKind::WaitingForConnection,
            "Waiting for banned connection",
            banned,
        );
        Ok(StepOutcome::WaitingForConnection)
    }

    /// Resolves and runs one record. Never fails: every problem is logged and
    /// reported as an unsuccessful execution.
    fn execute(&self, record: &CommandRecord) -> bool {
        let mut command = match self.deps.registry.resolve(record) {
            Ok(command) => command,
            Err(error) => {
                self.deps.logger.log(
                    LogLevel::Error,
                    self.context(),
                    "Command could not be resolved; dropping record",
                    Some(json!({
                        "command_id": record.command_id,
                        "command_type": record.command_type.as_str(),
                        "error": error.to_string()
                    })),
                );
                return false;
            }
        };

        let description = command.describe();
        {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            status.current_description = description.clone();
        }
        self.set_state(
            QueueStateKind::Executing,
            &description,
            vec![
                record.command_id.clone(),
                record.command_type.as_str().to_owned(),
            ],
        );

        let (outcome, elapsed) =
            measure_execution(&description, self.context(), &self.deps.logger, || {
                catch_unwind(AssertUnwindSafe(|| command.execute()))
            });

        if elapsed >= self.settings.slow_command_warn {
            self.deps.logger.log(
                LogLevel::Warn,
                self.context(),
                "Command execution was slow",
                Some(json!({
                    "command_id": record.command_id,
                    "elapsed_ms": elapsed.as_millis() as u64,
                    "threshold_ms": self.settings.slow_command_warn.as_millis() as u64
                })),
            );
        }

        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                self.deps.logger.log(
                    LogLevel::Error,
                    self.context(),
                    "Command failed",
                    Some(json!({
                        "command_id": record.command_id,
                        "command_type": record.command_type.as_str(),
                        "error": error.to_string()
                    })),
                );
                false
            }
            Err(_) => {
                self.deps.logger.log(
                    LogLevel::Error,
                    self.context(),
                    "Command panicked",
                    Some(json!({
                        "command_id": record.command_id,
                        "command_type": record.command_type.as_str()
                    })),
                );
                false
            }
        }
    }

    fn connection_available(&self, record: &CommandRecord) -> bool {
        let Some(requirement) = self.deps.registry.requirement_of(&record.command_type) else {
            return true;
        };
        self.deps
            .gate_for(requirement)
            .map(|handler| !handler.is_banned())
            .unwrap_or(true)
    }

    fn enqueue(&self, record: &CommandRecord) -> Result<bool, QueueError> {
        if record.lane != self.lane {
            return Err(QueueError::WrongLane {
                command_id: record.command_id.clone(),
                expected: self.lane,
                actual: record.lane,
            });
        }

        let inserted = self.deps.storage.save(record)?;
        if !inserted {
            self.deps.logger.debug(
                self.context(),
                &format!("command '{}' is already queued", record.command_id),
            );
            return Ok(false);
        }

        self.deps.logger.log(
            LogLevel::Debug,
            self.context(),
            "Command queued",
            Some(json!({
                "command_id": record.command_id,
                "command_type": record.command_type.as_str(),
                "priority": record.priority
            })),
        );
        self.publish_count()?;
        self.wake();
        Ok(true)
    }

    fn set_paused(&self, paused: bool) -> Result<(), QueueError> {
        self.deps.storage.save_lane_paused(self.lane, paused)?;
        let was_paused = self.paused.swap(paused, Ordering::SeqCst);
        if was_paused != paused {
            self.deps.logger.info(
                self.context(),
                if paused {
                    "Command lane paused"
                } else {
                    "Command lane resumed"
                },
            );
        }
        self.wake();
        Ok(())
    }

    fn publish_count(&self) -> Result<(), QueueError> {
        let count = self.deps.storage.count(self.lane)?;
        self.publish(Notification::QueueCountChanged {
            lane: self.lane,
            count,
        });
        Ok(())
    }

    /// Records the new state; notifies on transitions and on every new
    /// execution.
    fn set_state(&self, state: QueueStateKind, message: &str, params: Vec<String>) {
        let changed = {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            let changed = status.state != state || state == QueueStateKind::Executing;
            status.state = state;
            changed
        };
        if !changed {
            return;
        }
        self.publish(Notification::QueueStateChanged {
            lane: self.lane,
            state,
            message: message.to_owned(),
            params,
        });
    }

    fn publish(&self, notification: Notification) {
        if let Err(error) = self.deps.emitter.emit(notification) {
            self.deps.logger.warn(
                self.context(),
                &format!("lane notification failed: {error}"),
            );
        }
    }

    fn wake(&self) {
        let mut pending = self
            .wake_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.wakeup.notify_all();
    }

    fn wait_for_work(&self, timeout: Duration) {
        let pending = self
            .wake_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut pending, _) = self
            .wakeup
            .wait_timeout_while(pending, timeout, |pending| !*pending)
            .unwrap_or_else(PoisonError::into_inner);
        *pending = false;
    }
}
