//! Parent-side handle to one worker child process.
//!
//! The endpoint owns the child's stdin/stdout, frames payloads through the
//! bridge codec, and reports everything that happens to the worker as typed
//! [`WorkerEvent`]s on a channel the dispatcher consumes.

use std::io;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::PayloadCodec;
use crate::bridge::protocol::IpcPayload;
use crate::error::DispatcherError;
use crate::options::DispatcherOptions;

/// Worker lifecycle as the parent sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unspawned,
    Spawning,
    Ready,
    /// Writes to the worker's stdin started failing.
    Disconnected,
    /// The OS process terminated.
    Exited,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Exited)
    }
}

/// Lifecycle and data notifications emitted by an endpoint.
#[derive(Debug)]
pub enum WorkerEvent {
    Spawned {
        process_id: usize,
    },
    Data {
        process_id: usize,
        payload: IpcPayload,
    },
    Error {
        process_id: usize,
        message: String,
    },
    Disconnected {
        process_id: usize,
    },
    Exited {
        process_id: usize,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    Closed {
        process_id: usize,
    },
}

/// Context handed to a [`WorkerSpawner`].
#[derive(Debug, Clone)]
pub struct SpawnContext {
    pub process_id: usize,
    /// The worker command line built from the dispatcher options.
    pub args: Vec<String>,
}

type WorkerReader = Box<dyn AsyncRead + Send + Unpin>;
type WorkerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A spawned worker's transport, handed from a [`WorkerSpawner`] to the
/// endpoint: the write side feeding the worker, the read side carrying its
/// frames back, and the OS child (when there is one) for reaping.
pub struct SpawnedWorker {
    child: Option<Child>,
    stdin: WorkerWriter,
    stdout: WorkerReader,
}

impl SpawnedWorker {
    /// Take over a child process's piped stdin/stdout.
    pub fn from_child(mut child: Child) -> io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stdout not captured"))?;
        Ok(Self {
            child: Some(child),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }

    /// Wrap an in-memory transport (tests, in-process workers). `reader`
    /// carries frames from the worker, `writer` frames to it; termination
    /// only comes from `kill`.
    pub fn from_io(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            child: None,
            stdin: Box::new(writer),
            stdout: Box::new(reader),
        }
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, ctx: &SpawnContext) -> io::Result<SpawnedWorker>;
}

/// Default spawner: re-execute the current binary with the worker command
/// line. Single-binary embedders branch on [`crate::WorkerArgs::from_env`].
pub struct CurrentExeSpawner;

impl WorkerSpawner for CurrentExeSpawner {
    fn spawn(&self, ctx: &SpawnContext) -> io::Result<SpawnedWorker> {
        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .args(&ctx.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        SpawnedWorker::from_child(child)
    }
}

pub struct WorkerEndpoint {
    process_id: usize,
    task_count: AtomicUsize,
    state: StdMutex<WorkerState>,
    writer: tokio::sync::Mutex<FramedWrite<WorkerWriter, PayloadCodec>>,
    events: mpsc::Sender<WorkerEvent>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl WorkerEndpoint {
    /// Launch the worker and wire up its streams.
    ///
    /// A successful OS spawn is the platform's "spawned" signal: the endpoint
    /// transitions Spawning → Ready and emits [`WorkerEvent::Spawned`] before
    /// returning.
    pub(crate) async fn spawn(
        process_id: usize,
        options: &DispatcherOptions,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<Arc<Self>, DispatcherError> {
        let ctx = SpawnContext {
            process_id,
            args: options.worker_command_args(process_id),
        };
        let SpawnedWorker {
            child,
            stdin,
            stdout,
        } = options.spawner().spawn(&ctx).map_err(|e| {
            DispatcherError::Communication(format!("failed to spawn worker {process_id}: {e}"))
        })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let endpoint = Arc::new(Self {
            process_id,
            task_count: AtomicUsize::new(0),
            state: StdMutex::new(WorkerState::Spawning),
            writer: tokio::sync::Mutex::new(FramedWrite::new(stdin, PayloadCodec::new())),
            events,
            kill_tx: StdMutex::new(Some(kill_tx)),
        });

        let reader = FramedRead::new(stdout, PayloadCodec::new());
        tokio::spawn(Arc::clone(&endpoint).run_reader(reader));
        tokio::spawn(Arc::clone(&endpoint).run_wait(child, kill_rx));

        endpoint.set_state(WorkerState::Ready);
        let _ = endpoint
            .events
            .send(WorkerEvent::Spawned { process_id })
            .await;

        tracing::debug!(process_id, "Worker spawned");
        Ok(endpoint)
    }

    pub fn process_id(&self) -> usize {
        self.process_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(WorkerState::Disconnected)
    }

    fn set_state(&self, next: WorkerState) {
        if let Ok(mut state) = self.state.lock() {
            // Exited is final; a late stream teardown must not mask it.
            if *state == WorkerState::Exited && next != WorkerState::Exited {
                return;
            }
            *state = next;
        }
    }

    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::Acquire)
    }

    /// Reserve `step` inflight slots. Steps below one count as one.
    pub fn increment_task_count(&self, step: usize) {
        self.task_count.fetch_add(step.max(1), Ordering::AcqRel);
    }

    /// Release `step` inflight slots, clamping at zero.
    pub fn decrement_task_count(&self, step: usize) {
        let step = step.max(1);
        let _ = self
            .task_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(step))
            });
    }

    /// Frame and write one payload to the worker's stdin.
    ///
    /// Returns whether the write was accepted; never waits for a response.
    /// The feed/flush bracket coalesces the frame into one pipe write.
    pub async fn send(&self, payload: IpcPayload) -> bool {
        if self.state() != WorkerState::Ready {
            return false;
        }

        let result = {
            let mut writer = self.writer.lock().await;
            match writer.feed(payload).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    process_id = self.process_id,
                    %error,
                    "Worker stdin write failed"
                );
                self.set_state(WorkerState::Disconnected);
                let _ = self
                    .events
                    .send(WorkerEvent::Error {
                        process_id: self.process_id,
                        message: error.to_string(),
                    })
                    .await;
                let _ = self
                    .events
                    .send(WorkerEvent::Disconnected {
                        process_id: self.process_id,
                    })
                    .await;
                false
            }
        }
    }

    /// Terminate the child. Idempotent.
    pub(crate) fn kill(&self) {
        if let Ok(mut kill_tx) = self.kill_tx.lock()
            && let Some(tx) = kill_tx.take()
        {
            let _ = tx.send(());
        }
    }

    async fn run_reader(self: Arc<Self>, mut reader: FramedRead<WorkerReader, PayloadCodec>) {
        while let Some(item) = reader.next().await {
            match item {
                Ok(payload) => {
                    let event = WorkerEvent::Data {
                        process_id: self.process_id,
                        payload,
                    };
                    if self.events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    tracing::error!(
                        process_id = self.process_id,
                        %error,
                        "Worker stdout read failed"
                    );
                    let _ = self
                        .events
                        .send(WorkerEvent::Error {
                            process_id: self.process_id,
                            message: error.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }

        if self.state() == WorkerState::Ready {
            self.set_state(WorkerState::Disconnected);
        }
        let _ = self
            .events
            .send(WorkerEvent::Closed {
                process_id: self.process_id,
            })
            .await;
        tracing::debug!(process_id = self.process_id, "Worker stdout closed");
    }

    async fn run_wait(self: Arc<Self>, child: Option<Child>, kill_rx: oneshot::Receiver<()>) {
        let status = match child {
            Some(mut child) => {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill_rx => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                Some(status)
            }
            None => {
                // In-memory transport: no OS process to reap.
                let _ = kill_rx.await;
                None
            }
        };

        self.set_state(WorkerState::Exited);
        let (exit_code, signal) = match status {
            Some(Ok(status)) => (status.code(), exit_signal(&status)),
            Some(Err(error)) => {
                tracing::error!(
                    process_id = self.process_id,
                    %error,
                    "Failed to reap worker"
                );
                (None, None)
            }
            None => (None, None),
        };
        let _ = self
            .events
            .send(WorkerEvent::Exited {
                process_id: self.process_id,
                exit_code,
                signal,
            })
            .await;
        tracing::debug!(
            process_id = self.process_id,
            ?exit_code,
            ?signal,
            "Worker exited"
        );
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    /// Spawns `cat`, which echoes framed payloads straight back.
    struct CatSpawner;

    impl WorkerSpawner for CatSpawner {
        fn spawn(&self, _ctx: &SpawnContext) -> io::Result<SpawnedWorker> {
            let child = Command::new("cat")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;
            SpawnedWorker::from_child(child)
        }
    }

    fn cat_options() -> DispatcherOptions {
        DispatcherOptions::new("/tmp").with_spawner(Arc::new(CatSpawner))
    }

    async fn expect_event(
        rx: &mut mpsc::Receiver<WorkerEvent>,
        matcher: impl Fn(&WorkerEvent) -> bool,
    ) -> WorkerEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for worker event")
                .expect("event channel closed");
            if matcher(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn spawn_reports_ready_and_spawned_event() {
        let (tx, mut rx) = mpsc::channel(64);
        let endpoint = WorkerEndpoint::spawn(0, &cat_options(), tx).await.unwrap();

        assert_eq!(endpoint.state(), WorkerState::Ready);
        expect_event(&mut rx, |e| matches!(e, WorkerEvent::Spawned { process_id: 0 })).await;

        endpoint.kill();
    }

    #[tokio::test]
    async fn send_roundtrips_through_the_child() {
        let (tx, mut rx) = mpsc::channel(64);
        let endpoint = WorkerEndpoint::spawn(1, &cat_options(), tx).await.unwrap();

        let payload = IpcPayload::request("rt-1", "echo", None, "echo", vec![json!("hi")]);
        assert!(endpoint.send(payload.clone()).await);

        let event = expect_event(&mut rx, |e| matches!(e, WorkerEvent::Data { .. })).await;
        match event {
            WorkerEvent::Data {
                process_id,
                payload: received,
            } => {
                assert_eq!(process_id, 1);
                // cat echoes the frame byte-for-byte; decode restores it.
                assert_eq!(received.payload_id(), payload.payload_id());
            }
            other => panic!("expected Data, got {other:?}"),
        }

        endpoint.kill();
    }

    #[tokio::test]
    async fn killed_worker_reaches_exited_and_rejects_sends() {
        let (tx, mut rx) = mpsc::channel(64);
        let endpoint = WorkerEndpoint::spawn(2, &cat_options(), tx).await.unwrap();

        endpoint.kill();
        expect_event(&mut rx, |e| matches!(e, WorkerEvent::Exited { process_id: 2, .. })).await;

        assert_eq!(endpoint.state(), WorkerState::Exited);
        assert!(!endpoint.send(IpcPayload::Available { process_id: 2 }).await);
    }

    #[tokio::test]
    async fn task_count_clamps_at_zero_and_steps_are_at_least_one() {
        let (tx, _rx) = mpsc::channel(64);
        let endpoint = WorkerEndpoint::spawn(3, &cat_options(), tx).await.unwrap();

        assert_eq!(endpoint.task_count(), 0);
        endpoint.increment_task_count(0); // coerced to 1
        endpoint.increment_task_count(2);
        assert_eq!(endpoint.task_count(), 3);

        endpoint.decrement_task_count(1);
        assert_eq!(endpoint.task_count(), 2);
        endpoint.decrement_task_count(10);
        assert_eq!(endpoint.task_count(), 0);

        endpoint.kill();
    }
}
