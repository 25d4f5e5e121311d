//! Execution sessions.
//!
//! A [`Session`] is a handle to an actor task that owns one kernel and one
//! [`KernelStateMachine`]. All requests reach the actor as commands over a
//! channel, so the kernel only ever sees one execute request at a time no
//! matter how many clients hold the handle.
//!
//! The actor loop waits on three things at once: the next command, the
//! next message from the kernel for the unit in flight, and the deadline
//! for that unit (interrupt grace or per-message timeout). Each wakeup is
//! turned into a state machine input and the resulting actions are
//! applied in order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kernel_exec::{
    select_units, Action, ClientEvent, CodeUnit, ErrorPolicy, KernelMessage, KernelStateMachine,
    LineRange, LossReason, Splitter, UnitRef, UnitResult,
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::kernel::{KernelError, KernelProcess, KernelStream};

/// What happens to a script submitted while another one is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Answer `Busy` right away.
    #[default]
    RejectWhenBusy,
    /// Wait in a bounded FIFO queue.
    Queue,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub concurrency: ConcurrencyPolicy,
    pub error_policy: ErrorPolicy,
    /// Maximum waiting scripts under [`ConcurrencyPolicy::Queue`].
    pub queue_capacity: usize,
    /// How long an interrupted kernel has to reach idle before it is restarted.
    pub interrupt_grace: Duration,
    /// Longest silence from the kernel while a unit runs. `None` waits forever.
    pub message_timeout: Option<Duration>,
    /// Capacity of each client's event channel. Events that do not fit wait
    /// in the session, with stream updates merged.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyPolicy::default(),
            error_policy: ErrorPolicy::default(),
            queue_capacity: 16,
            interrupt_grace: Duration::from_secs(5),
            message_timeout: Some(Duration::from_secs(300)),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Unknown execution: {0}")]
    UnknownExecution(String),

    #[error("Kernel error: {0}")]
    Kernel(String),
}

/// A script to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub execution_id: String,
    pub script: String,
    /// Only run units overlapping these lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_range: Option<LineRange>,
    /// Restart the kernel before running.
    #[serde(default)]
    pub reset: bool,
}

impl ExecuteRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            script: script.into(),
            line_range: None,
            reset: false,
        }
    }

    pub fn with_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn with_line_range(mut self, from: usize, to: usize) -> Self {
        self.line_range = Some(LineRange::new(from, to));
        self
    }

    pub fn with_reset(mut self) -> Self {
        self.reset = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
    Rejected,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

/// What happened to one execution, kept for `get_state` after it ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub units: Vec<UnitRef>,
    pub results: Vec<UnitResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    fn new(execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Pending,
            units: Vec::new(),
            results: Vec::new(),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    fn record(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::Started { units, .. } => {
                self.units = units.clone();
                self.status = ExecutionStatus::Running;
            }
            ClientEvent::StreamUpdate { .. } => {}
            ClientEvent::UnitResult(result) => self.results.push(result.clone()),
            ClientEvent::Cancelled { .. } => self.finish(ExecutionStatus::Cancelled),
            ClientEvent::Complete { .. } => self.finish(ExecutionStatus::Completed),
            ClientEvent::Error { message, .. } => {
                self.error_message = Some(message.clone());
                self.finish(ExecutionStatus::Failed);
            }
            ClientEvent::Busy { .. } => self.finish(ExecutionStatus::Rejected),
        }
    }
}

enum SessionCommand {
    Execute {
        request: ExecuteRequest,
        events: mpsc::Sender<ClientEvent>,
    },
    Interrupt {
        reply: oneshot::Sender<bool>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Cancel {
        execution_id: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    GetState {
        execution_id: String,
        reply: oneshot::Sender<Option<ExecutionRecord>>,
    },
    PruneHistory {
        max_age: Duration,
        reply: oneshot::Sender<usize>,
    },
}

enum ActorMessage {
    Command(SessionCommand),
    Shutdown { reply: oneshot::Sender<()> },
}

/// Liveness shared between the actor and its handle, read by the sweeper.
#[derive(Debug)]
struct SessionActivity {
    busy: AtomicBool,
    last_active: StdMutex<Instant>,
}

impl SessionActivity {
    fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            last_active: StdMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

/// Handle to a running session.
pub struct Session {
    id: String,
    commands: mpsc::Sender<ActorMessage>,
    activity: Arc<SessionActivity>,
    task: StdMutex<Option<JoinHandle<()>>>,
    event_buffer: usize,
}

impl Session {
    /// Spawn the session actor. The kernel is started in the background.
    pub fn spawn<K: KernelProcess>(
        id: &str,
        kernel: K,
        splitter: Arc<dyn Splitter>,
        config: SessionConfig,
    ) -> Session {
        let (commands, command_rx) = mpsc::channel(64);
        let activity = Arc::new(SessionActivity::new());
        let event_buffer = config.event_buffer.max(1);

        let actor = SessionActor {
            id: id.to_string(),
            kernel,
            splitter,
            machine: KernelStateMachine::new(config.error_policy),
            config,
            queue: VecDeque::new(),
            current: None,
            history: HashMap::new(),
            activity: activity.clone(),
        };
        let task = tokio::spawn(actor.run(command_rx));

        Session {
            id: id.to_string(),
            commands,
            activity,
            task: StdMutex::new(Some(task)),
            event_buffer,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A script is running or waiting.
    pub fn is_busy(&self) -> bool {
        self.activity.busy.load(Ordering::SeqCst)
    }

    /// Time since the last command or event.
    pub fn idle_for(&self) -> Duration {
        self.activity
            .last_active
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Submit a script. Events for it arrive on the returned receiver and
    /// end with exactly one terminal event.
    pub async fn execute_script(
        &self,
        request: ExecuteRequest,
    ) -> Result<mpsc::Receiver<ClientEvent>, SessionError> {
        self.activity.touch();
        let (events, rx) = mpsc::channel(self.event_buffer);
        self.commands
            .send(ActorMessage::Command(SessionCommand::Execute {
                request,
                events,
            }))
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(rx)
    }

    /// Interrupt the running script. Returns `false` when nothing was running.
    pub async fn interrupt(&self) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::Interrupt { reply })
            .await
    }

    /// Cancel the running script and restart the kernel with fresh state.
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Reset { reply })
            .await?
    }

    /// Cancel a running or queued execution.
    pub async fn cancel(&self, execution_id: &str) -> Result<(), SessionError> {
        let execution_id = execution_id.to_string();
        self.request(|reply| SessionCommand::Cancel {
            execution_id,
            reply,
        })
        .await?
    }

    pub async fn get_state(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, SessionError> {
        let execution_id = execution_id.to_string();
        self.request(|reply| SessionCommand::GetState {
            execution_id,
            reply,
        })
        .await
    }

    /// Drop finished records older than `max_age`. Returns how many were removed.
    pub async fn prune_history(&self, max_age: Duration) -> Result<usize, SessionError> {
        self.request(|reply| SessionCommand::PruneHistory { max_age, reply })
            .await
    }

    /// Stop the actor and its kernel. Running and queued scripts end with
    /// an `Error` event. The actor is aborted if it does not stop in time.
    pub async fn shutdown(&self, timeout: Duration) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(ActorMessage::Shutdown { reply })
            .await
            .is_ok()
            && tokio::time::timeout(timeout, done).await.is_err()
        {
            warn!(
                "[session] {} did not shut down within {:?}, aborting",
                self.id, timeout
            );
        }

        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        self.activity.touch();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ActorMessage::Command(command(reply)))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

struct Queued {
    request: ExecuteRequest,
    events: mpsc::Sender<ClientEvent>,
}

/// The execution whose units are going through the kernel.
struct ActiveExecution {
    execution_id: String,
    events: mpsc::Sender<ClientEvent>,
    /// Receiver dropped; events are recorded but no longer delivered.
    client_gone: bool,
    /// Events that did not fit in the channel, oldest first.
    backlog: VecDeque<ClientEvent>,
    stream: Option<KernelStream>,
    last_message_at: Instant,
    interrupt_deadline: Option<Instant>,
}

impl ActiveExecution {
    /// Hand an event to the client without waiting for it.
    /// Returns true when the client turns out to be gone.
    fn deliver(&mut self, event: ClientEvent) -> bool {
        let event = match self.backlog.back_mut() {
            Some(last) => match last.merge_update(event) {
                Ok(()) => return self.flush(),
                Err(event) => event,
            },
            None => event,
        };
        self.backlog.push_back(event);
        self.flush()
    }

    /// Move backlogged events into the channel while there is room.
    fn flush(&mut self) -> bool {
        while let Some(event) = self.backlog.pop_front() {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    return false;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    self.client_gone = true;
                    return true;
                }
            }
        }
        false
    }
}

enum Wakeup {
    Output(Option<Result<KernelMessage, KernelError>>),
    /// A backlogged event went out; more may fit.
    Delivered,
    ClientGone,
}

/// Wait for the next thing the active execution needs handled.
async fn next_wakeup(current: &mut Option<ActiveExecution>) -> Wakeup {
    let Some(active) = current.as_mut() else {
        return std::future::pending().await;
    };
    let ActiveExecution {
        stream,
        events,
        client_gone,
        backlog,
        ..
    } = active;
    let watch_client = !*client_gone;
    let has_backlog = watch_client && !backlog.is_empty();
    tokio::select! {
        next = async move {
            match stream.as_mut() {
                Some(stream) => stream.next().await,
                None => std::future::pending().await,
            }
        } => Wakeup::Output(next),
        permit = events.reserve(), if has_backlog => match permit {
            Ok(permit) => {
                if let Some(event) = backlog.pop_front() {
                    permit.send(event);
                }
                Wakeup::Delivered
            }
            Err(_) => Wakeup::ClientGone,
        },
        _ = events.closed(), if watch_client => Wakeup::ClientGone,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct SessionActor<K: KernelProcess> {
    id: String,
    kernel: K,
    splitter: Arc<dyn Splitter>,
    config: SessionConfig,
    machine: KernelStateMachine,
    queue: VecDeque<Queued>,
    current: Option<ActiveExecution>,
    history: HashMap<String, ExecutionRecord>,
    activity: Arc<SessionActivity>,
}

impl<K: KernelProcess> SessionActor<K> {
    async fn run(mut self, mut commands: mpsc::Receiver<ActorMessage>) {
        info!("[session] {} started", self.id);
        if let Err(e) = self.kernel.start().await {
            error!("[session] {}: kernel failed to start: {}", self.id, e);
        }

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                message = commands.recv() => match message {
                    Some(ActorMessage::Command(command)) => self.handle_command(command).await,
                    Some(ActorMessage::Shutdown { reply }) => {
                        self.close().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.close().await;
                        break;
                    }
                },
                wakeup = next_wakeup(&mut self.current) => match wakeup {
                    Wakeup::Output(next) => self.on_kernel_output(next).await,
                    Wakeup::Delivered => self.flush_backlog().await,
                    Wakeup::ClientGone => self.on_client_gone().await,
                },
                _ = sleep_until(deadline) => self.on_deadline().await,
            }
            self.settle().await;
        }

        info!("[session] {} stopped", self.id);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        self.activity.touch();
        match command {
            SessionCommand::Execute { request, events } => self.enqueue(request, events).await,
            SessionCommand::Interrupt { reply } => {
                let running = !self.machine.state().is_idle();
                if running {
                    info!("[session] {}: interrupt requested", self.id);
                }
                let actions = self.machine.on_interrupt();
                self.apply(actions).await;
                let _ = reply.send(running);
            }
            SessionCommand::Reset { reply } => {
                info!("[session] {}: reset", self.id);
                self.detach_stream();
                let actions = self.machine.on_abort();
                self.apply(actions).await;
                let result = self
                    .kernel
                    .restart()
                    .await
                    .map_err(|e| SessionError::Kernel(e.to_string()));
                if let Err(e) = &result {
                    error!("[session] {}: restart failed: {}", self.id, e);
                }
                let _ = reply.send(result);
            }
            SessionCommand::Cancel {
                execution_id,
                reply,
            } => {
                let result = self.cancel(execution_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::GetState {
                execution_id,
                reply,
            } => {
                let _ = reply.send(self.history.get(&execution_id).cloned());
            }
            SessionCommand::PruneHistory { max_age, reply } => {
                let _ = reply.send(self.prune_history(max_age));
            }
        }
    }

    async fn enqueue(&mut self, request: ExecuteRequest, events: mpsc::Sender<ClientEvent>) {
        let execution_id = request.execution_id.clone();
        let mut record = ExecutionRecord::new(&execution_id);

        let idle = self.current.is_none() && self.queue.is_empty();
        let accept = idle
            || (self.config.concurrency == ConcurrencyPolicy::Queue
                && self.queue.len() < self.config.queue_capacity);

        if !accept {
            info!(
                "[session] {}: rejecting {}, session busy",
                self.id, execution_id
            );
            let event = ClientEvent::Busy {
                execution_id: execution_id.clone(),
            };
            record.record(&event);
            self.history.insert(execution_id, record);
            let _ = events.try_send(event);
            return;
        }

        if !idle {
            debug!(
                "[session] {}: queued {} behind {} others",
                self.id,
                execution_id,
                self.queue.len()
            );
        }
        self.history.insert(execution_id, record);
        self.queue.push_back(Queued { request, events });
        self.activity.set_busy(true);
    }

    async fn cancel(&mut self, execution_id: String) -> Result<(), SessionError> {
        let is_current = self
            .current
            .as_ref()
            .is_some_and(|c| c.execution_id == execution_id);
        if is_current {
            info!("[session] {}: cancelling {}", self.id, execution_id);
            let actions = self.machine.on_cancel();
            self.apply(actions).await;
            return Ok(());
        }

        let position = self
            .queue
            .iter()
            .position(|q| q.request.execution_id == execution_id);
        let Some(queued) = position.and_then(|p| self.queue.remove(p)) else {
            return Err(SessionError::UnknownExecution(execution_id));
        };
        info!(
            "[session] {}: cancelled queued {}",
            self.id, execution_id
        );
        let event = ClientEvent::Cancelled {
            execution_id: execution_id.clone(),
            remaining: Vec::new(),
        };
        if let Some(record) = self.history.get_mut(&execution_id) {
            record.record(&event);
        }
        let _ = queued.events.try_send(event);
        Ok(())
    }

    fn prune_history(&mut self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - max_age;
        let before = self.history.len();
        self.history.retain(|_, record| match record.completed_at {
            Some(completed_at) => completed_at > cutoff,
            None => true,
        });
        let removed = before - self.history.len();
        if removed > 0 {
            debug!(
                "[session] {}: pruned {} finished executions",
                self.id, removed
            );
        }
        removed
    }

    /// Start queued work once nothing is in flight.
    async fn settle(&mut self) {
        loop {
            if self.current.is_some() && self.machine.state().is_idle() {
                self.finish_current();
            }
            if self.current.is_some() {
                return;
            }
            match self.queue.pop_front() {
                Some(next) => self.begin(next).await,
                None => {
                    self.activity.set_busy(false);
                    return;
                }
            }
        }
    }

    async fn begin(&mut self, queued: Queued) {
        let Queued { request, events } = queued;
        let execution_id = request.execution_id.clone();
        info!("[session] {}: executing {}", self.id, execution_id);

        self.activity.set_busy(true);
        self.current = Some(ActiveExecution {
            execution_id: execution_id.clone(),
            events,
            client_gone: false,
            backlog: VecDeque::new(),
            stream: None,
            last_message_at: Instant::now(),
            interrupt_deadline: None,
        });
        if let Some(record) = self.history.get_mut(&execution_id) {
            record.status = ExecutionStatus::Running;
            record.started_at = Some(Utc::now());
        }

        if request.reset {
            info!("[session] {}: restarting kernel before {}", self.id, execution_id);
            self.restart_kernel().await;
        }
        if !self.kernel.is_alive() {
            if let Err(e) = self.kernel.start().await {
                error!("[session] {}: kernel unavailable: {}", self.id, e);
                self.emit(ClientEvent::Error {
                    execution_id,
                    message: format!("Kernel unavailable: {}", e),
                });
                return;
            }
        }

        let units = match self.splitter.split(&request.script) {
            Ok(units) => select_units(units, request.line_range),
            Err(e) => {
                debug!("[session] {}: script does not parse: {}", self.id, e);
                vec![CodeUnit::from_syntax_error(&request.script, &e)]
            }
        };
        let actions = self.machine.on_execute_script(&execution_id, units);
        self.apply(actions).await;
    }

    fn finish_current(&mut self) {
        let Some(active) = self.current.take() else {
            return;
        };
        debug!(
            "[session] {}: execution {} finished",
            self.id, active.execution_id
        );

        if !active.client_gone && !active.backlog.is_empty() {
            let ActiveExecution {
                events, backlog, ..
            } = active;
            tokio::spawn(async move {
                for event in backlog {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    /// Perform state machine actions in order, feeding back any follow-up
    /// inputs they cause.
    async fn apply(&mut self, actions: Vec<Action>) {
        let mut work: VecDeque<Action> = actions.into();
        let mut needs_restart = false;

        while let Some(action) = work.pop_front() {
            match action {
                Action::SendToClient(event) => {
                    if self.emit(event) {
                        work.extend(self.machine.on_cancel());
                    }
                }
                Action::ExecuteCode { code, silent } => {
                    match self.kernel.execute(&code, silent).await {
                        Ok(stream) => {
                            if let Some(active) = self.current.as_mut() {
                                active.stream = Some(stream);
                                active.last_message_at = Instant::now();
                                active.interrupt_deadline = None;
                            }
                        }
                        Err(e) => {
                            error!("[session] {}: failed to send code: {}", self.id, e);
                            work.extend(
                                self.machine
                                    .on_kernel_lost(LossReason::Crashed, format!("Kernel error: {}", e)),
                            );
                            needs_restart = true;
                        }
                    }
                }
                Action::InterruptKernel => {
                    if let Err(e) = self.kernel.interrupt().await {
                        warn!("[session] {}: interrupt failed: {}", self.id, e);
                    }
                    if let Some(active) = self.current.as_mut() {
                        active.interrupt_deadline = Some(Instant::now() + self.config.interrupt_grace);
                    }
                }
            }
        }

        if needs_restart {
            self.restart_kernel().await;
        }
    }

    /// Record an event and deliver it to the current client. Never waits
    /// on the client. Returns true when the client turns out to be gone.
    fn emit(&mut self, event: ClientEvent) -> bool {
        self.activity.touch();
        if let Some(record) = self.history.get_mut(event.execution_id()) {
            record.record(&event);
        }
        let Some(active) = self.current.as_mut() else {
            return false;
        };
        if active.client_gone {
            return false;
        }
        let gone = active.deliver(event);
        if gone {
            warn!(
                "[session] {}: client for {} went away",
                self.id, active.execution_id
            );
        }
        gone
    }

    async fn flush_backlog(&mut self) {
        let gone = self.current.as_mut().is_some_and(ActiveExecution::flush);
        if gone {
            self.on_client_gone().await;
        }
    }

    async fn on_client_gone(&mut self) {
        if let Some(active) = self.current.as_mut() {
            warn!(
                "[session] {}: client for {} disconnected, cancelling",
                self.id, active.execution_id
            );
            active.client_gone = true;
            active.backlog.clear();
        }
        let actions = self.machine.on_cancel();
        self.apply(actions).await;
    }

    async fn on_kernel_output(&mut self, next: Option<Result<KernelMessage, KernelError>>) {
        match next {
            Some(Ok(message)) => {
                if let Some(active) = self.current.as_mut() {
                    active.last_message_at = Instant::now();
                    if message.is_idle() {
                        active.stream = None;
                        active.interrupt_deadline = None;
                    }
                }
                let actions = self.machine.on_kernel_message(message);
                self.apply(actions).await;
            }
            Some(Err(e)) => {
                warn!("[session] {}: kernel lost: {}", self.id, e);
                self.kernel_lost(LossReason::Crashed, format!("Kernel died: {}", e))
                    .await;
            }
            None => {
                warn!("[session] {}: kernel output ended before idle", self.id);
                self.kernel_lost(
                    LossReason::Crashed,
                    "Kernel connection closed before execution finished".to_string(),
                )
                .await;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let active = self.current.as_ref()?;
        active.stream.as_ref()?;
        let message_deadline = self
            .config
            .message_timeout
            .map(|timeout| active.last_message_at + timeout);
        match (active.interrupt_deadline, message_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn on_deadline(&mut self) {
        let interrupt_expired = self
            .current
            .as_ref()
            .and_then(|active| active.interrupt_deadline)
            .is_some_and(|deadline| deadline <= Instant::now());

        if interrupt_expired {
            warn!(
                "[session] {}: kernel still busy {:?} after interrupt, restarting",
                self.id, self.config.interrupt_grace
            );
            self.kernel_lost(
                LossReason::Unresponsive,
                "Kernel did not respond to interrupt and was restarted".to_string(),
            )
            .await;
        } else if let Some(timeout) = self.config.message_timeout {
            warn!(
                "[session] {}: no kernel output for {:?}, restarting",
                self.id, timeout
            );
            self.kernel_lost(
                LossReason::TimedOut,
                format!(
                    "Execution timed out after {}s without output; kernel restarted",
                    timeout.as_secs_f64()
                ),
            )
            .await;
        }
    }

    async fn kernel_lost(&mut self, reason: LossReason, message: String) {
        self.detach_stream();
        let actions = self.machine.on_kernel_lost(reason, message);
        self.apply(actions).await;
        if reason != LossReason::Closed {
            self.restart_kernel().await;
        }
    }

    fn detach_stream(&mut self) {
        if let Some(active) = self.current.as_mut() {
            active.stream = None;
            active.interrupt_deadline = None;
        }
    }

    async fn restart_kernel(&mut self) -> bool {
        info!("[session] {}: restarting kernel", self.id);
        match self.kernel.restart().await {
            Ok(()) => true,
            Err(e) => {
                error!("[session] {}: kernel restart failed: {}", self.id, e);
                false
            }
        }
    }

    async fn close(&mut self) {
        info!("[session] {}: closing", self.id);

        for queued in std::mem::take(&mut self.queue) {
            let event = ClientEvent::Error {
                execution_id: queued.request.execution_id.clone(),
                message: "Session closed before execution started".to_string(),
            };
            if let Some(record) = self.history.get_mut(&queued.request.execution_id) {
                record.record(&event);
            }
            let _ = queued.events.try_send(event);
        }

        self.detach_stream();
        let actions = self
            .machine
            .on_kernel_lost(LossReason::Closed, "Session closed");
        self.apply(actions).await;
        self.finish_current();

        self.kernel.shutdown().await;
        self.activity.set_busy(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_kernel::{FakeKernel, KernelLedger};
    use kernel_exec::PythonSplitter;

    fn spawn_with(config: SessionConfig) -> (Session, KernelLedger) {
        let kernel = FakeKernel::new();
        let ledger = kernel.ledger();
        let session = Session::spawn("test", kernel, Arc::new(PythonSplitter), config);
        (session, ledger)
    }

    fn spawn() -> (Session, KernelLedger) {
        spawn_with(SessionConfig::default())
    }

    /// Collect events up to and including the terminal one.
    async fn collect(rx: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed before terminal event");
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    async fn run(session: &Session, script: &str) -> Vec<ClientEvent> {
        let mut rx = session
            .execute_script(ExecuteRequest::new(script))
            .await
            .unwrap();
        collect(&mut rx).await
    }

    fn results(events: &[ClientEvent]) -> Vec<&UnitResult> {
        events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::UnitResult(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_execute_streams_events_in_order() {
        let (session, _ledger) = spawn();
        let events = run(&session, "x = 1\nprint('hi')\nx").await;

        assert!(matches!(&events[0], ClientEvent::Started { units, .. } if units.len() == 3));
        let results = results(&events);
        assert_eq!(results.len(), 3);
        assert!(results[0].invisible);
        assert_eq!(results[1].output[0].kind, "stdout");
        assert_eq!(results[1].output[0].content, "hi\n");
        assert_eq!(results[2].output[0].kind, "text/plain");
        assert_eq!(results[2].output[0].content, "1");
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::StreamUpdate { index: 1, .. })));
        assert!(matches!(events.last(), Some(ClientEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_state_persists_across_executions() {
        let (session, _ledger) = spawn();
        run(&session, "x = 20").await;
        let events = run(&session, "x + 22").await;
        assert_eq!(results(&events)[0].output[0].content, "42");
    }

    #[tokio::test]
    async fn test_busy_rejection() {
        let (session, ledger) = spawn();
        let mut first = session
            .execute_script(ExecuteRequest::new("sleep(300)"))
            .await
            .unwrap();
        let mut second = session
            .execute_script(ExecuteRequest::new("x = 1").with_id("second"))
            .await
            .unwrap();

        let events = collect(&mut second).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ClientEvent::Busy { execution_id } if execution_id == "second"));

        let events = collect(&mut first).await;
        assert!(matches!(events.last(), Some(ClientEvent::Complete { .. })));

        let record = session.get_state("second").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Rejected);
        assert_eq!(ledger.lock().unwrap().executed, vec!["sleep(300)"]);
    }

    #[tokio::test]
    async fn test_queue_policy_runs_in_order() {
        let (session, ledger) = spawn_with(SessionConfig {
            concurrency: ConcurrencyPolicy::Queue,
            ..Default::default()
        });
        let mut first = session
            .execute_script(ExecuteRequest::new("sleep(100)\nx = 1"))
            .await
            .unwrap();
        let mut second = session
            .execute_script(ExecuteRequest::new("x"))
            .await
            .unwrap();

        let events = collect(&mut first).await;
        assert!(matches!(events.last(), Some(ClientEvent::Complete { .. })));
        let events = collect(&mut second).await;
        assert_eq!(results(&events)[0].output[0].content, "1");

        let state = ledger.lock().unwrap();
        assert_eq!(state.executed, vec!["sleep(100)", "x = 1", "x"]);
        assert_eq!(state.overlapping_executes, 0);
    }

    #[tokio::test]
    async fn test_queue_full_rejects() {
        let (session, _ledger) = spawn_with(SessionConfig {
            concurrency: ConcurrencyPolicy::Queue,
            queue_capacity: 1,
            ..Default::default()
        });
        let _running = session
            .execute_script(ExecuteRequest::new("sleep(200)"))
            .await
            .unwrap();
        let _queued = session
            .execute_script(ExecuteRequest::new("x = 1"))
            .await
            .unwrap();
        let mut rejected = session
            .execute_script(ExecuteRequest::new("x = 2"))
            .await
            .unwrap();
        let events = collect(&mut rejected).await;
        assert!(matches!(&events[0], ClientEvent::Busy { .. }));
    }

    #[tokio::test]
    async fn test_halt_on_error() {
        let (session, ledger) = spawn();
        let events = run(&session, "x = 1\nfail('boom')\ny = 2").await;

        let results = results(&events);
        assert_eq!(results.len(), 2);
        assert!(results[1].has_error());
        assert!(results[1].output[0].content.contains("boom"));
        match events.last() {
            Some(ClientEvent::Cancelled { remaining, .. }) => {
                assert_eq!(remaining.len(), 1);
                assert_eq!(remaining[0].line_start, 3);
            }
            other => panic!("unexpected terminal {:?}", other),
        }
        assert_eq!(ledger.lock().unwrap().executed.len(), 2);

        // The kernel survived the error.
        let events = run(&session, "2").await;
        assert_eq!(self::results(&events)[0].output[0].content, "2");
        assert!(matches!(events.last(), Some(ClientEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let (session, _ledger) = spawn_with(SessionConfig {
            error_policy: ErrorPolicy::ContinueOnError,
            ..Default::default()
        });
        let events = run(&session, "fail('boom')\ny = 2").await;
        assert_eq!(results(&events).len(), 2);
        assert!(matches!(events.last(), Some(ClientEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_markdown_and_syntax_errors_skip_kernel() {
        let (session, ledger) = spawn();
        let events = run(&session, "'''# Notes'''\n").await;
        assert_eq!(results(&events)[0].output[0].kind, "text/markdown");
        assert_eq!(results(&events)[0].output[0].content, "# Notes");

        let events = run(&session, "x = 1\ny = (\n").await;
        assert!(matches!(&events[0], ClientEvent::Started { units, .. } if units.len() == 1));
        let result = results(&events)[0];
        assert!(result.has_error());
        assert_eq!(result.line_start, 2);
        assert!(matches!(events.last(), Some(ClientEvent::Complete { .. })));

        let events = run(&session, "x = 1\ny = = 2\nz = 3").await;
        assert!(matches!(&events[0], ClientEvent::Started { units, .. } if units.len() == 1));
        assert!(results(&events)[0].has_error());
        assert_eq!(results(&events)[0].line_start, 2);

        assert!(ledger.lock().unwrap().executed.is_empty());
    }

    #[tokio::test]
    async fn test_line_range_runs_overlapping_units() {
        let (session, ledger) = spawn();
        let mut rx = session
            .execute_script(ExecuteRequest::new("a = 1\nb = 2\nc = 3\nd = 4").with_line_range(2, 3))
            .await
            .unwrap();
        let events = collect(&mut rx).await;

        match &events[0] {
            ClientEvent::Started { units, .. } => {
                assert_eq!(units.len(), 2);
                assert_eq!(units[0].index, 0);
                assert_eq!(units[0].line_start, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(ledger.lock().unwrap().executed, vec!["b = 2", "c = 3"]);
    }

    #[tokio::test]
    async fn test_interrupt_cancels_remaining() {
        let (session, _ledger) = spawn();
        let mut rx = session
            .execute_script(ExecuteRequest::new("sleep(60000)\nx = 1"))
            .await
            .unwrap();
        assert!(session.interrupt().await.unwrap());

        let events = collect(&mut rx).await;
        let results = results(&events);
        assert!(results[0].output[0].content.contains("KeyboardInterrupt"));
        assert!(matches!(events.last(), Some(ClientEvent::Cancelled { remaining, .. }) if remaining.len() == 1));

        assert!(!session.interrupt().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_running_single_unit() {
        let (session, ledger) = spawn();
        let mut rx = session
            .execute_script(ExecuteRequest::new("sleep(60000)").with_id("c1"))
            .await
            .unwrap();
        session.cancel("c1").await.unwrap();

        let events = collect(&mut rx).await;
        assert!(matches!(
            events.last(),
            Some(ClientEvent::Cancelled { remaining, .. }) if remaining.is_empty()
        ));
        let record = session.get_state("c1").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(ledger.lock().unwrap().interrupts, 1);
    }

    #[tokio::test]
    async fn test_unread_events_do_not_block_interrupt() {
        let (session, _ledger) = spawn_with(SessionConfig {
            event_buffer: 4,
            ..Default::default()
        });
        let mut script = String::from("if True:\n");
        for _ in 0..2000 {
            script.push_str("    print('line')\n");
        }
        script.push_str("    sleep(60000)\n");

        let mut rx = session
            .execute_script(ExecuteRequest::new(script))
            .await
            .unwrap();
        // Nobody reads `rx` while the kernel floods it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let running = tokio::time::timeout(Duration::from_secs(3), session.interrupt())
            .await
            .expect("interrupt blocked behind unread events")
            .unwrap();
        assert!(running);

        let events = collect(&mut rx).await;
        let mut live = Vec::new();
        let mut updates = 0;
        for event in &events {
            if let ClientEvent::StreamUpdate { output, .. } = event {
                updates += 1;
                kernel_exec::extend_output(&mut live, output.clone());
            }
        }
        let result = results(&events)[0];
        assert_eq!(live[0], result.output[0]);
        assert_eq!(result.output[0].content, "line\n".repeat(2000));
        assert!(updates < 2000, "updates were not merged: {}", updates);
    }

    #[test]
    fn test_default_config_bounds_kernel_silence() {
        let config = SessionConfig::default();
        assert_eq!(config.message_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.concurrency, ConcurrencyPolicy::RejectWhenBusy);
    }

    #[tokio::test]
    async fn test_unresponsive_kernel_is_restarted() {
        let (session, ledger) = spawn_with(SessionConfig {
            interrupt_grace: Duration::from_millis(100),
            ..Default::default()
        });
        let mut rx = session
            .execute_script(ExecuteRequest::new("x = 1\nhang()\ny = 2"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.interrupt().await.unwrap();

        let events = collect(&mut rx).await;
        let last_result = *results(&events).last().unwrap();
        assert!(last_result.has_error());
        assert!(matches!(events.last(), Some(ClientEvent::Cancelled { remaining, .. }) if remaining.len() == 1));

        assert_eq!(ledger.lock().unwrap().starts, 2);
        // Fresh interpreter after the restart.
        let events = run(&session, "x").await;
        assert!(results(&events)[0].has_error());
    }

    #[tokio::test]
    async fn test_crash_reports_error_and_recovers() {
        let (session, ledger) = spawn();
        let events = run(&session, "crash()").await;
        assert!(matches!(events.last(), Some(ClientEvent::Error { message, .. }) if message.contains("died")));

        let events = run(&session, "1 + 1").await;
        assert_eq!(results(&events)[0].output[0].content, "2");
        assert_eq!(ledger.lock().unwrap().starts, 2);
    }

    #[tokio::test]
    async fn test_message_timeout() {
        let (session, _ledger) = spawn_with(SessionConfig {
            message_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let events = run(&session, "hang()").await;
        assert!(matches!(events.last(), Some(ClientEvent::Error { message, .. }) if message.contains("timed out")));
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let (session, _ledger) = spawn();
        run(&session, "x = 5").await;
        session.reset().await.unwrap();
        let events = run(&session, "x").await;
        assert!(results(&events)[0].output[0].content.contains("NameError"));

        run(&session, "y = 1").await;
        let mut rx = session
            .execute_script(ExecuteRequest::new("y").with_reset())
            .await
            .unwrap();
        let events = collect(&mut rx).await;
        assert!(results(&events)[0].has_error());
    }

    #[tokio::test]
    async fn test_reset_cancels_running_execution() {
        let (session, _ledger) = spawn();
        let mut rx = session
            .execute_script(ExecuteRequest::new("sleep(60000)\nx = 1"))
            .await
            .unwrap();
        session.reset().await.unwrap();
        let events = collect(&mut rx).await;
        assert!(matches!(events.last(), Some(ClientEvent::Cancelled { remaining, .. }) if remaining.len() == 2));
    }

    #[tokio::test]
    async fn test_cancel_queued_and_unknown() {
        let (session, _ledger) = spawn_with(SessionConfig {
            concurrency: ConcurrencyPolicy::Queue,
            ..Default::default()
        });
        let mut running = session
            .execute_script(ExecuteRequest::new("sleep(100)"))
            .await
            .unwrap();
        let mut queued = session
            .execute_script(ExecuteRequest::new("x = 1").with_id("queued"))
            .await
            .unwrap();

        session.cancel("queued").await.unwrap();
        let events = collect(&mut queued).await;
        assert!(matches!(&events[0], ClientEvent::Cancelled { remaining, .. } if remaining.is_empty()));

        assert_eq!(
            session.cancel("nope").await,
            Err(SessionError::UnknownExecution("nope".to_string()))
        );
        collect(&mut running).await;
    }

    #[tokio::test]
    async fn test_get_state_and_prune() {
        let (session, _ledger) = spawn();
        let mut rx = session
            .execute_script(ExecuteRequest::new("x = 1\nx").with_id("exec-1"))
            .await
            .unwrap();
        collect(&mut rx).await;

        let record = session.get_state("exec-1").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.units.len(), 2);
        assert_eq!(record.results.len(), 2);
        assert!(record.completed_at.is_some());

        assert_eq!(session.prune_history(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(session.prune_history(Duration::ZERO).await.unwrap(), 1);
        assert!(session.get_state("exec-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_fails_running_execution() {
        let (session, ledger) = spawn();
        let mut rx = session
            .execute_script(ExecuteRequest::new("sleep(60000)"))
            .await
            .unwrap();
        // Let the unit reach the kernel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.shutdown(Duration::from_secs(2)).await;

        let events = collect(&mut rx).await;
        assert!(matches!(events.last(), Some(ClientEvent::Error { .. })));
        assert_eq!(ledger.lock().unwrap().shutdowns, 1);

        assert!(matches!(
            session.execute_script(ExecuteRequest::new("x")).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_client_disconnect_interrupts() {
        let (session, ledger) = spawn();
        let mut rx = session
            .execute_script(ExecuteRequest::new("sleep(60000)").with_id("gone"))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ClientEvent::Started { .. })));
        drop(rx);

        let mut status = ExecutionStatus::Running;
        for _ in 0..100 {
            status = session.get_state("gone").await.unwrap().unwrap().status;
            if status.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, ExecutionStatus::Cancelled);
        assert_eq!(ledger.lock().unwrap().interrupts, 1);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_kernel_start_failure_reports_error() {
        let session = Session::spawn(
            "broken",
            FakeKernel::failing(),
            Arc::new(PythonSplitter),
            SessionConfig::default(),
        );
        let events = run(&session, "x = 1").await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ClientEvent::Error { message, .. } if message.contains("Kernel unavailable")));
    }
}
