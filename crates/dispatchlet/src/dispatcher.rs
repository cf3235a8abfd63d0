//! Dispatcher control plane.
//!
//! Owns the worker pool and the two background tasks that move every request:
//! the drain task pulls queued payloads and writes them to the least-busy
//! worker, and the event task routes worker responses back to their waiters.
//!
//! Flow per call: `dispatch` validates the task, allocates a payload id,
//! registers a waiter, and enqueues. The drainer picks a Ready worker with
//! the smallest task count, reserves it (task count + 1), and sends. The
//! matching `Response`/`Error` frame releases the reservation and completes
//! the waiter.

use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::protocol::{IpcPayload, LogLevel, LogRecord};
use crate::correlation::CorrelationRegistry;
use crate::correlation::UidGenerator;
use crate::endpoint::{WorkerEndpoint, WorkerEvent, WorkerState};
use crate::error::DispatcherError;
use crate::options::DispatcherOptions;
use crate::pending::{PENDING_CAPACITY, PendingQueue};
use crate::proxy::ServiceProxy;

/// Cadence of the pending-queue drainer.
const DRAIN_INTERVAL: Duration = Duration::from_millis(5);

/// Worker event fan-in buffer, shared by all endpoints.
const EVENT_BUFFER: usize = 1024;

/// Compile-time service identity used by [`DispatchTask::new`] and
/// [`Dispatcher::get`].
pub trait ServiceDescriptor {
    const SERVICE_NAME: &'static str;
}

/// One RPC invocation: which service, which method, which arguments.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub service_name: String,
    pub service_scope_name: Option<String>,
    pub method_name: String,
    pub method_arguments: Vec<Value>,
}

impl DispatchTask {
    pub fn new<S: ServiceDescriptor>(method_name: impl Into<String>) -> Self {
        Self::named(S::SERVICE_NAME, method_name)
    }

    pub fn named(service_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_scope_name: None,
            method_name: method_name.into(),
            method_arguments: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.service_scope_name = Some(scope.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.method_arguments = arguments;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Idle,
    Starting,
    Started,
    Stopped,
}

pub struct Dispatcher {
    options: DispatcherOptions,
    lifecycle: StdMutex<LifecycleState>,
    start_lock: tokio::sync::Mutex<()>,
    workers: StdMutex<Vec<Arc<WorkerEndpoint>>>,
    pending: PendingQueue,
    correlation: CorrelationRegistry,
    uid: UidGenerator,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<WorkerEvent>>>,
}

impl Dispatcher {
    /// Build a dispatcher. Fails fast when the service initializer path does
    /// not exist; nothing is spawned until [`start`](Self::start).
    pub fn create_instance(options: DispatcherOptions) -> Result<Arc<Self>, DispatcherError> {
        options.validate()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Ok(Arc::new(Self {
            options,
            lifecycle: StdMutex::new(LifecycleState::Idle),
            start_lock: tokio::sync::Mutex::new(()),
            workers: StdMutex::new(Vec::new()),
            pending: PendingQueue::new(PENDING_CAPACITY),
            correlation: CorrelationRegistry::new(),
            uid: UidGenerator::new(),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        }))
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    pub fn process_count(&self) -> usize {
        self.options.process_count()
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle_state() == LifecycleState::Started
    }

    fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle
            .lock()
            .map(|state| *state)
            .unwrap_or(LifecycleState::Stopped)
    }

    fn set_lifecycle(&self, next: LifecycleState) {
        if let Ok(mut state) = self.lifecycle.lock() {
            *state = next;
        }
    }

    /// Spawn the worker pool and begin accepting dispatches.
    ///
    /// Not re-entrant: concurrent and repeated calls observe the committed
    /// state and return without side effects. On any spawn failure the
    /// already-spawned workers are killed and the dispatcher reverts to
    /// Idle with the error surfaced.
    pub async fn start(self: &Arc<Self>) -> Result<(), DispatcherError> {
        let _guard = self.start_lock.lock().await;
        if self.lifecycle_state() != LifecycleState::Idle {
            return Ok(());
        }
        self.set_lifecycle(LifecycleState::Starting);

        let spawns = (0..self.options.process_count())
            .map(|i| WorkerEndpoint::spawn(i, &self.options, self.events_tx.clone()));
        let results = futures::future::join_all(spawns).await;

        let mut spawned = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(worker) => spawned.push(worker),
                Err(error) => failure = failure.or(Some(error)),
            }
        }
        if let Some(error) = failure {
            for worker in &spawned {
                worker.kill();
            }
            self.set_lifecycle(LifecycleState::Idle);
            return Err(error);
        }

        if let Ok(mut workers) = self.workers.lock() {
            *workers = spawned;
        }
        self.set_lifecycle(LifecycleState::Started);

        if let Ok(mut slot) = self.events_rx.lock()
            && let Some(events_rx) = slot.take()
        {
            tokio::spawn(Arc::clone(self).run_event_loop(events_rx));
        }
        tokio::spawn(Arc::clone(self).run_drain_loop());

        tracing::info!(
            process_count = self.options.process_count(),
            "Dispatcher started"
        );
        Ok(())
    }

    /// Stop accepting dispatches. The drain task notices on its next tick
    /// and exits; in-flight requests still complete through the routing
    /// task. Workers are not torn down — see [`shutdown`](Self::shutdown).
    pub fn stop(&self) {
        self.set_lifecycle(LifecycleState::Stopped);
        tracing::info!("Dispatcher stopped");
    }

    /// Stop, wait up to `grace` for in-flight requests to finish, then fail
    /// whatever remains and kill the workers.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop();

        let deadline = tokio::time::Instant::now() + grace;
        while !self.correlation.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        self.correlation
            .fail_all(|| DispatcherError::Communication("dispatcher shut down".to_string()));
        for worker in self.workers_snapshot() {
            worker.kill();
        }
        tracing::info!("Dispatcher shut down");
    }

    /// Execute one task on some worker and return its result.
    pub async fn dispatch(&self, task: DispatchTask) -> Result<Value, DispatcherError> {
        if !self.is_started() {
            return Err(DispatcherError::NotStarted);
        }
        if task.service_name.trim().is_empty() {
            return Err(DispatcherError::InvalidService);
        }
        let method_name = task.method_name.trim();
        if method_name.is_empty() {
            return Err(DispatcherError::InvalidMethod);
        }

        let payload_id = self.uid.next();
        let receiver = self.correlation.register(payload_id.clone());
        let _cleanup = WaiterGuard {
            correlation: &self.correlation,
            payload_id: payload_id.clone(),
        };

        let payload = IpcPayload::request(
            payload_id,
            task.service_name,
            task.service_scope_name,
            method_name,
            task.method_arguments,
        );
        if !self.pending.push(payload) {
            return Err(DispatcherError::Communication(
                "pending queue is full".to_string(),
            ));
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(DispatcherError::Communication(
                "dispatcher shut down before the response arrived".to_string(),
            )),
        }
    }

    /// Typed stub for one service: every `proxy.invoke(method, args)` is a
    /// `dispatch` with the method name and verbatim argument order.
    pub fn get<S: ServiceDescriptor>(self: &Arc<Self>, scope: Option<&str>) -> ServiceProxy {
        ServiceProxy::new(Arc::clone(self), S::SERVICE_NAME, scope.map(String::from))
    }

    pub(crate) fn workers_snapshot(&self) -> Vec<Arc<WorkerEndpoint>> {
        self.workers
            .lock()
            .map(|workers| workers.clone())
            .unwrap_or_default()
    }

    /// Pick the least-busy Ready worker and reserve one slot on it.
    fn select_worker(&self) -> Option<Arc<WorkerEndpoint>> {
        let workers = self.workers.lock().ok()?;
        let counts: Vec<(WorkerState, usize)> = workers
            .iter()
            .map(|worker| (worker.state(), worker.task_count()))
            .collect();
        let index = least_busy_index(&counts)?;
        let worker = Arc::clone(&workers[index]);
        drop(workers);

        worker.increment_task_count(1);
        Some(worker)
    }

    fn release_worker(&self, process_id: usize) {
        if let Ok(workers) = self.workers.lock()
            && let Some(worker) = workers.get(process_id)
        {
            worker.decrement_task_count(1);
        }
    }

    async fn run_drain_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(DRAIN_INTERVAL);
        loop {
            interval.tick().await;
            if !self.is_started() {
                tracing::debug!("Drain loop exiting");
                return;
            }
            self.drain_one().await;
        }
    }

    /// Move one queued payload to a worker, or put it back for the next tick.
    async fn drain_one(&self) {
        let Some(payload) = self.pending.pop() else {
            return;
        };
        let Some(worker) = self.select_worker() else {
            self.pending.push_front(payload);
            return;
        };

        let payload_id = payload.payload_id().map(str::to_string);
        let payload = payload.with_process_id(worker.process_id());
        if let Some(id) = &payload_id {
            self.correlation.assign(id, worker.process_id());
        }

        if !worker.send(payload).await {
            // Roll back the reservation and fail the caller.
            worker.decrement_task_count(1);
            if let Some(id) = &payload_id {
                self.correlation.resolve(
                    id,
                    Err(DispatcherError::Communication(format!(
                        "worker {} rejected the write",
                        worker.process_id()
                    ))),
                );
            }
        }
    }

    async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<WorkerEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                WorkerEvent::Spawned { process_id } => {
                    tracing::debug!(process_id, "Worker reported spawned");
                }
                WorkerEvent::Data {
                    process_id,
                    payload,
                } => {
                    self.handle_payload(process_id, payload);
                }
                WorkerEvent::Error {
                    process_id,
                    message,
                } => {
                    tracing::error!(process_id, %message, "Worker error");
                }
                WorkerEvent::Disconnected { process_id } => {
                    self.handle_worker_down(process_id, "disconnected");
                }
                WorkerEvent::Exited {
                    process_id,
                    exit_code,
                    signal,
                } => {
                    tracing::warn!(process_id, ?exit_code, ?signal, "Worker exited");
                    self.handle_worker_down(process_id, "exited");
                }
                WorkerEvent::Closed { process_id } => {
                    tracing::debug!(process_id, "Worker stream closed");
                    if self
                        .workers_snapshot()
                        .get(process_id)
                        .is_some_and(|worker| worker.state().is_terminal())
                    {
                        self.handle_worker_down(process_id, "closed its stream");
                    }
                }
            }
        }
        tracing::debug!("Event loop exiting");
    }

    pub(crate) fn handle_payload(&self, from_process: usize, payload: IpcPayload) {
        match payload {
            IpcPayload::Log { process_id, record } => {
                emit_worker_log(process_id, &record);
            }
            IpcPayload::Response {
                payload_id,
                process_id,
                result,
            } => match self.correlation.resolve(&payload_id, Ok(result)) {
                Some(assigned) => self.release_worker(assigned.unwrap_or(process_id)),
                None => {
                    // Caller gave up; the reservation still stood until now.
                    tracing::trace!(%payload_id, "Dropping late response");
                    self.release_worker(process_id);
                }
            },
            IpcPayload::Error {
                payload_id: Some(payload_id),
                process_id,
                error,
            } => {
                let failure = DispatcherError::from_remote(error);
                match self.correlation.resolve(&payload_id, Err(failure)) {
                    Some(assigned) => self.release_worker(assigned.unwrap_or(process_id)),
                    None => {
                        tracing::trace!(%payload_id, "Dropping late error response");
                        self.release_worker(process_id);
                    }
                }
            }
            IpcPayload::Error {
                payload_id: None,
                process_id,
                error,
            } => {
                tracing::error!(
                    target: "dispatchlet::worker",
                    "[Process {process_id}] {}",
                    error.message
                );
            }
            IpcPayload::Available { process_id } => {
                // Reserved for the busy-bit scheduling variant; the
                // least-busy scheduler has nothing to clear.
                tracing::debug!(process_id, "Ignoring availability signal");
            }
            IpcPayload::Request { .. } => {
                tracing::warn!(
                    process_id = from_process,
                    "Ignoring request payload from worker"
                );
            }
        }
    }

    fn handle_worker_down(&self, process_id: usize, reason: &str) {
        let failed = self.correlation.fail_for_process(process_id, || {
            DispatcherError::Communication(format!("worker {process_id} {reason}"))
        });
        if failed > 0 {
            // A request failed by worker death is terminal; its reservation
            // is released like any other completed response.
            if let Ok(workers) = self.workers.lock()
                && let Some(worker) = workers.get(process_id)
            {
                worker.decrement_task_count(failed);
            }
            tracing::warn!(
                process_id,
                failed,
                "Failed in-flight requests for dead worker"
            );
        }
    }
}

/// Least-busy selection over (state, task count) pairs: candidate starts at
/// worker 0, a strictly smaller count replaces it, ties keep the earlier
/// index. Workers not in Ready are skipped.
fn least_busy_index(counts: &[(WorkerState, usize)]) -> Option<usize> {
    let mut candidate: Option<(usize, usize)> = None;
    for (index, (state, task_count)) in counts.iter().enumerate() {
        if *state != WorkerState::Ready {
            continue;
        }
        match candidate {
            None => candidate = Some((index, *task_count)),
            Some((_, best)) if *task_count < best => candidate = Some((index, *task_count)),
            _ => {}
        }
    }
    candidate.map(|(index, _)| index)
}

fn emit_worker_log(process_id: usize, record: &LogRecord) {
    let message = record
        .parameters
        .iter()
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");

    match record.log_level {
        LogLevel::Trace => {
            tracing::trace!(target: "dispatchlet::worker", "[Process {process_id}] {message}")
        }
        LogLevel::Debug => {
            tracing::debug!(target: "dispatchlet::worker", "[Process {process_id}] {message}")
        }
        LogLevel::Info => {
            tracing::info!(target: "dispatchlet::worker", "[Process {process_id}] {message}")
        }
        LogLevel::Warn => {
            tracing::warn!(target: "dispatchlet::worker", "[Process {process_id}] {message}")
        }
        LogLevel::Error => {
            tracing::error!(target: "dispatchlet::worker", "[Process {process_id}] {message}")
        }
    }
}

struct WaiterGuard<'a> {
    correlation: &'a CorrelationRegistry,
    payload_id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        // No-op after normal resolution; removes the waiter when the caller
        // abandoned the dispatch (timeout wrapper, cancellation).
        self.correlation.remove(&self.payload_id);
    }
}
