//! Worker-side request loop.
//!
//! Runs inside each child process: decode requests from stdin, resolve the
//! named service and method, invoke, and frame the result or error back to
//! stdout. Requests are processed one at a time, so responses leave the
//! worker in request order.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::PayloadCodec;
use crate::bridge::protocol::{IpcPayload, RemoteError};
use crate::error::DispatcherError;
use crate::options::WorkerArgs;
use crate::provider::{ServiceInitializer, ServiceProvider};
use crate::worker_log::init_worker_logging;

const OUTBOUND_BUFFER: usize = 256;

/// Grace period for flushing queued outbound frames after stdin closes. The
/// log layer keeps a sender alive for the process lifetime, so the writer
/// channel never closes on its own.
const WRITER_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// The worker request loop, generic over its transport.
///
/// [`run_worker`] binds it to stdin/stdout; tests drive it over in-memory
/// duplex pipes.
pub struct WorkerLoop<I> {
    args: WorkerArgs,
    initializer: I,
    out_tx: mpsc::Sender<IpcPayload>,
    out_rx: mpsc::Receiver<IpcPayload>,
}

impl<I: ServiceInitializer> WorkerLoop<I> {
    pub fn new(args: WorkerArgs, initializer: I) -> Self {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        Self {
            args,
            initializer,
            out_tx,
            out_rx,
        }
    }

    pub fn process_id(&self) -> usize {
        self.args.process_id
    }

    /// Sender for out-of-band outbound payloads (log redirection, panic
    /// reporting). Everything funnels through one writer task, so log frames
    /// never tear response frames.
    pub fn log_sender(&self) -> mpsc::Sender<IpcPayload> {
        self.out_tx.clone()
    }

    /// Process requests until the inbound stream closes.
    pub async fn run<R, W>(self, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            args,
            initializer,
            out_tx,
            mut out_rx,
        } = self;
        let process_id = args.process_id;

        let writer_task = tokio::spawn(async move {
            let mut framed = FramedWrite::new(writer, PayloadCodec::new());
            while let Some(payload) = out_rx.recv().await {
                if framed.send(payload).await.is_err() {
                    break;
                }
            }
        });

        let mut inbound = FramedRead::new(reader, PayloadCodec::new());
        let mut provider = ServiceProvider::new();
        let mut initialized = false;

        while let Some(item) = inbound.next().await {
            match item {
                Ok(IpcPayload::Request {
                    payload_id,
                    service_name,
                    service_scope_name,
                    method_name,
                    method_arguments,
                    ..
                }) => {
                    let reply = process_request(
                        &initializer,
                        &mut provider,
                        &mut initialized,
                        process_id,
                        payload_id,
                        &service_name,
                        service_scope_name.as_deref(),
                        &method_name,
                        method_arguments,
                    )
                    .await;
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(other) => {
                    tracing::warn!(?other, "Ignoring non-request payload");
                }
                Err(error) => {
                    tracing::error!(%error, "Inbound stream failed");
                    break;
                }
            }
        }

        drop(out_tx);
        let _ = tokio::time::timeout(WRITER_DRAIN_GRACE, writer_task).await;
        tracing::debug!(process_id, "Worker loop exiting");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_request<I: ServiceInitializer>(
    initializer: &I,
    provider: &mut ServiceProvider,
    initialized: &mut bool,
    process_id: usize,
    payload_id: String,
    service_name: &str,
    service_scope_name: Option<&str>,
    method_name: &str,
    method_arguments: Vec<Value>,
) -> IpcPayload {
    // Lazy, at-most-once initialization. A failure is reported to the request
    // that triggered it and the flag stays unset so a later request retries.
    if !*initialized {
        match initializer.initialize(provider).await {
            Ok(()) => *initialized = true,
            Err(error) => {
                tracing::error!(%error, "Service initialization failed");
                return IpcPayload::error(
                    Some(payload_id),
                    process_id,
                    RemoteError::new(
                        DispatcherError::Initializer(error.to_string()).to_string(),
                    ),
                );
            }
        }
    }

    let Some(service) = provider.get_by_name(service_name, service_scope_name) else {
        return IpcPayload::error(
            Some(payload_id),
            process_id,
            RemoteError::new(
                DispatcherError::ServiceNotRegistered {
                    service: service_name.to_string(),
                }
                .to_string(),
            ),
        );
    };

    match service.invoke(method_name, method_arguments).await {
        Ok(result) => IpcPayload::response(payload_id, process_id, result),
        Err(error) => {
            tracing::debug!(%error, service_name, method_name, "Method invocation failed");
            IpcPayload::error(Some(payload_id), process_id, error.into_remote())
        }
    }
}

/// Install a panic hook that reports the panic over IPC before aborting.
///
/// A panic in the worker is an invariant violation; the best-effort `Error`
/// payload lets the parent log the reason instead of only seeing the exit.
fn install_panic_hook(process_id: usize, tx: mpsc::Sender<IpcPayload>) {
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        prev(info);

        let msg = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "<unknown>".to_string()
        };
        let reason = match info.location() {
            Some(loc) => format!("worker panic at {}:{}: {}", loc.file(), loc.line(), msg),
            None => format!("worker panic: {}", msg),
        };

        let _ = tx.try_send(IpcPayload::error(None, process_id, RemoteError::new(reason)));
        std::process::abort();
    }));
}

/// Entry point for a worker process: bind the loop to stdin/stdout, redirect
/// logging over IPC, and contain panics.
pub async fn run_worker<I: ServiceInitializer>(args: WorkerArgs, initializer: I) -> io::Result<()> {
    let worker = WorkerLoop::new(args, initializer);
    init_worker_logging(worker.process_id(), worker.log_sender());
    install_panic_hook(worker.process_id(), worker.log_sender());
    worker.run(tokio::io::stdin(), tokio::io::stdout()).await
}
