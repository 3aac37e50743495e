//! Tokio driver: one actor task owns the [`Supervisor`]; everything else
//! talks to it through channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keepalive_events::Bus;
use keepalive_protocol::{
    EnvDelta, EnvironmentSnapshot, LogRecord, LogStats, RestartBudget, Status,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::HealthReport;
use crate::config::Config;
use crate::env::{EnvCoalescer, ENV_DEBOUNCE};
use crate::error::KeepAliveError;
use crate::host::{
    Clock, Host, Mailbox, NetworkSink, PermissionProbe, Persistence, Signal, TimerId,
    TimerToken, UplinkDispatch, UplinkOutcome, UplinkTicket, WorkerHandle,
};
use crate::memory::TrimSignal;
use crate::supervisor::Supervisor;

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    KeepAlive(#[from] KeepAliveError),
    #[error("supervisor task has shut down")]
    Closed,
}

/// Clock backed by tokio time. Each timer is a sleeping task guarded by its
/// own cancellation token.
pub struct TokioClock {
    origin: Instant,
    next_token: AtomicU64,
    timers: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    mailbox: Mailbox,
    handle: Handle,
}

impl TokioClock {
    pub fn new(mailbox: Mailbox, handle: Handle) -> Self {
        Self {
            origin: Instant::now(),
            next_token: AtomicU64::new(0),
            timers: Arc::new(Mutex::new(HashMap::new())),
            mailbox,
            handle,
        }
    }

    pub fn armed(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Clock for TokioClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule_once(&self, delay: Duration, timer: TimerId) -> TimerToken {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let token = TimerToken(id);
        let cancel = CancellationToken::new();
        if let Ok(mut timers) = self.timers.lock() {
            timers.insert(id, cancel.clone());
        }
        let timers = self.timers.clone();
        let mailbox = self.mailbox.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Ok(mut timers) = timers.lock() {
                        timers.remove(&id);
                    }
                    mailbox.post(Signal::TimerFired { timer, token });
                }
            }
        });
        token
    }

    fn cancel(&self, token: TimerToken) {
        let cancel = self
            .timers
            .lock()
            .ok()
            .and_then(|mut timers| timers.remove(&token.0));
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }
}

/// Runs an async [`NetworkSink`] per dispatch and reports back through the
/// mailbox. Sends that outlive `timeout` count as transient failures.
pub struct SinkDispatch {
    sink: Arc<dyn NetworkSink>,
    timeout: Duration,
    mailbox: Mailbox,
    handle: Handle,
}

impl SinkDispatch {
    pub fn new(sink: Arc<dyn NetworkSink>, timeout: Duration, mailbox: Mailbox, handle: Handle) -> Self {
        Self {
            sink,
            timeout,
            mailbox,
            handle,
        }
    }
}

impl UplinkDispatch for SinkDispatch {
    fn dispatch(&mut self, ticket: UplinkTicket, record: LogRecord) {
        let sink = self.sink.clone();
        let timeout = self.timeout;
        let mailbox = self.mailbox.clone();
        self.handle.spawn(async move {
            let outcome = match tokio::time::timeout(timeout, sink.send(&record)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        target: "keepalive::runtime",
                        seq = record.seq,
                        timeout_ms = timeout.as_millis() as u64,
                        "uplink send timed out"
                    );
                    UplinkOutcome::TransientFailure("uplink timed out".into())
                }
            };
            mailbox.post(Signal::UplinkCompleted { ticket, outcome });
        });
    }
}

/// Host parts the runtime cannot build itself.
pub struct RuntimeHost {
    pub worker: Box<dyn WorkerHandle>,
    pub persistence: Arc<dyn Persistence>,
    pub sink: Option<Arc<dyn NetworkSink>>,
    pub permissions: Option<Box<dyn PermissionProbe>>,
    pub bus: Option<Bus>,
}

impl RuntimeHost {
    pub fn new(worker: Box<dyn WorkerHandle>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            worker,
            persistence,
            sink: None,
            permissions: None,
            bus: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NetworkSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_permissions(mut self, probe: Box<dyn PermissionProbe>) -> Self {
        self.permissions = Some(probe);
        self
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start(Reply<Result<(), KeepAliveError>>),
    Stop(Reply<Result<(), KeepAliveError>>),
    Status(Reply<Status>),
    Trigger(Reply<LogRecord>),
    SetNotification {
        title: String,
        body: String,
        reply: Reply<Result<(), KeepAliveError>>,
    },
    GetLogs {
        limit: Option<usize>,
        reply: Reply<Vec<LogRecord>>,
    },
    ClearLogs(Reply<Result<(), KeepAliveError>>),
    Stats(Reply<LogStats>),
    Analyze(Reply<HealthReport>),
    RestartStats(Reply<RestartBudget>),
    WorkerDied,
}

/// Cloneable handle to the supervisor actor.
#[derive(Clone, Debug)]
pub struct SupervisorClient {
    commands: mpsc::Sender<Command>,
    mailbox: Mailbox,
    env: mpsc::UnboundedSender<EnvDelta>,
}

impl SupervisorClient {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| RuntimeError::Closed)?;
        rx.await.map_err(|_| RuntimeError::Closed)
    }

    pub async fn start(&self) -> Result<(), RuntimeError> {
        Ok(self.request(Command::Start).await??)
    }

    pub async fn stop(&self) -> Result<(), RuntimeError> {
        Ok(self.request(Command::Stop).await??)
    }

    pub async fn status(&self) -> Result<Status, RuntimeError> {
        self.request(Command::Status).await
    }

    pub async fn trigger_heartbeat(&self) -> Result<LogRecord, RuntimeError> {
        self.request(Command::Trigger).await
    }

    pub async fn set_notification(
        &self,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let (title, body) = (title.into(), body.into());
        Ok(self
            .request(|reply| Command::SetNotification { title, body, reply })
            .await??)
    }

    pub async fn get_logs(&self, limit: Option<usize>) -> Result<Vec<LogRecord>, RuntimeError> {
        self.request(|reply| Command::GetLogs { limit, reply }).await
    }

    pub async fn clear_logs(&self) -> Result<(), RuntimeError> {
        Ok(self.request(Command::ClearLogs).await??)
    }

    pub async fn get_stats(&self) -> Result<LogStats, RuntimeError> {
        self.request(Command::Stats).await
    }

    pub async fn analyze_logs(&self) -> Result<HealthReport, RuntimeError> {
        self.request(Command::Analyze).await
    }

    pub async fn restart_stats(&self) -> Result<RestartBudget, RuntimeError> {
        self.request(Command::RestartStats).await
    }

    /// Reports the death of the current worker from outside its notifier.
    pub async fn worker_died(&self) -> Result<(), RuntimeError> {
        self.commands
            .send(Command::WorkerDied)
            .await
            .map_err(|_| RuntimeError::Closed)
    }

    /// Full snapshot, already debounced by the host.
    pub fn push_snapshot(&self, snapshot: EnvironmentSnapshot) -> bool {
        self.mailbox.post(Signal::Env(snapshot))
    }

    /// Raw delta; coalesced over a short window before delivery.
    pub fn push_env(&self, delta: EnvDelta) -> bool {
        self.env.send(delta).is_ok()
    }

    pub fn push_memory_trim(&self, trim: TrimSignal) -> bool {
        self.mailbox.post(Signal::MemoryTrim(trim))
    }

    pub fn push_free_memory(&self, available_bytes: u64, low: bool) -> bool {
        self.mailbox.post(Signal::FreeMemory {
            available_bytes,
            low,
        })
    }
}

/// Running actor plus its client. Dropping it leaves the task running until
/// `shutdown` or the cancellation token fires.
#[derive(Debug)]
pub struct SupervisorRuntime {
    client: SupervisorClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    debouncer: JoinHandle<()>,
}

impl SupervisorRuntime {
    pub fn client(&self) -> SupervisorClient {
        self.client.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the supervisor, flushes persistence and joins the tasks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(target: "keepalive::runtime", error = %err, "supervisor task join failed");
        }
        if let Err(err) = self.debouncer.await {
            warn!(target: "keepalive::runtime", error = %err, "env debouncer join failed");
        }
    }
}

/// Builds the supervisor on the current tokio runtime and spawns its actor.
pub fn spawn_supervisor(config: Config, parts: RuntimeHost) -> Result<SupervisorRuntime, KeepAliveError> {
    let handle = Handle::current();
    let (mailbox, signals) = Mailbox::channel();
    let clock = Arc::new(TokioClock::new(mailbox.clone(), handle.clone()));
    let config = config.normalized();
    let uplink_timeout = config.uplink_timeout();

    let RuntimeHost {
        worker,
        persistence,
        sink,
        permissions,
        bus,
    } = parts;
    let mut host = Host::new(clock, worker, persistence, mailbox.clone());
    if let Some(sink) = sink {
        host = host.with_uplink(Box::new(SinkDispatch::new(
            sink,
            uplink_timeout,
            mailbox.clone(),
            handle.clone(),
        )));
    }
    if let Some(probe) = permissions {
        host = host.with_permissions(probe);
    }
    if let Some(bus) = bus {
        host = host.with_bus(bus);
    }
    let supervisor = Supervisor::init(config, host)?;

    let cancel = CancellationToken::new();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (env_tx, env_rx) = mpsc::unbounded_channel();

    let task = handle.spawn(run_actor(supervisor, signals, cmd_rx, cancel.clone()));
    let debouncer = handle.spawn(debounce_env(
        env_rx,
        mailbox.clone(),
        ENV_DEBOUNCE,
        cancel.clone(),
    ));
    info!(target: "keepalive::runtime", "supervisor actor spawned");

    Ok(SupervisorRuntime {
        client: SupervisorClient {
            commands: cmd_tx,
            mailbox,
            env: env_tx,
        },
        cancel,
        task,
        debouncer,
    })
}

async fn run_actor(
    mut supervisor: Supervisor,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => supervisor.handle(signal),
                None => break,
            },
            command = commands.recv() => match command {
                Some(command) => apply(&mut supervisor, command),
                None => break,
            },
        }
    }
    if let Err(err) = supervisor.stop() {
        warn!(target: "keepalive::runtime", error = %err, "stop during shutdown failed");
    }
    supervisor.flush_persistence();
    info!(target: "keepalive::runtime", "supervisor actor stopped");
}

fn apply(supervisor: &mut Supervisor, command: Command) {
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        Command::Start(reply) => {
            let _ = reply.send(supervisor.start());
        }
        Command::Stop(reply) => {
            let _ = reply.send(supervisor.stop());
        }
        Command::Status(reply) => {
            let _ = reply.send(supervisor.status());
        }
        Command::Trigger(reply) => {
            let _ = reply.send(supervisor.trigger_heartbeat());
        }
        Command::SetNotification { title, body, reply } => {
            let _ = reply.send(supervisor.set_notification(&title, &body));
        }
        Command::GetLogs { limit, reply } => {
            let _ = reply.send(supervisor.get_logs(limit));
        }
        Command::ClearLogs(reply) => {
            let _ = reply.send(supervisor.clear_logs());
        }
        Command::Stats(reply) => {
            let _ = reply.send(supervisor.get_stats());
        }
        Command::Analyze(reply) => {
            let _ = reply.send(supervisor.analyze_logs());
        }
        Command::RestartStats(reply) => {
            let _ = reply.send(supervisor.restart_stats());
        }
        Command::WorkerDied => supervisor.on_worker_died(),
    }
}

async fn debounce_env(
    mut rx: mpsc::UnboundedReceiver<EnvDelta>,
    mailbox: Mailbox,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut coalescer = EnvCoalescer::new();
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            delta = rx.recv() => match delta {
                Some(delta) => delta,
                None => break,
            },
        };
        coalescer.push(first);
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        let mut closed = false;
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                delta = rx.recv() => match delta {
                    Some(delta) => {
                        coalescer.push(delta);
                    }
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }
        if let Some(merged) = coalescer.take() {
            debug!(target: "keepalive::runtime", "delivering coalesced env delta");
            if !mailbox.post(Signal::EnvDelta(merged)) {
                break;
            }
        }
        if closed {
            break;
        }
    }
}
