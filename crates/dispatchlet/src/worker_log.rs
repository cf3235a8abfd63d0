//! Worker-side log redirection.
//!
//! Inside a worker, every tracing event is re-emitted as a framed `Log`
//! payload on the outbound channel instead of being written to stdout, which
//! belongs to the response stream. The parent prints received log payloads
//! with a `[Process N]` prefix at the original level.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::{IpcPayload, LogLevel};

pub(crate) struct WorkerLogLayer {
    process_id: usize,
    tx: mpsc::Sender<IpcPayload>,
}

impl WorkerLogLayer {
    pub fn new(process_id: usize, tx: mpsc::Sender<IpcPayload>) -> Self {
        Self { process_id, tx }
    }
}

fn level_to_wire(level: &Level) -> LogLevel {
    match *level {
        Level::TRACE => LogLevel::Trace,
        Level::DEBUG => LogLevel::Debug,
        Level::INFO => LogLevel::Info,
        Level::WARN => LogLevel::Warn,
        Level::ERROR => LogLevel::Error,
    }
}

impl<S> Layer<S> for WorkerLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let payload = IpcPayload::log(
            self.process_id,
            level_to_wire(event.metadata().level()),
            vec![Value::String(visitor.message)],
        );
        // Logging must never block the worker; drop on backpressure.
        let _ = self.tx.try_send(payload);
    }
}

/// Install the IPC log layer as the process-wide subscriber.
///
/// `RUST_LOG` controls the filter; the default keeps `info` and above. A
/// subscriber installed earlier (tests) wins silently.
pub(crate) fn init_worker_logging(process_id: usize, tx: mpsc::Sender<IpcPayload>) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(WorkerLogLayer::new(process_id, tx));
    let _ = subscriber.try_init();
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[tokio::test]
    async fn events_become_log_payloads() {
        let (tx, mut rx) = mpsc::channel(16);
        let subscriber = tracing_subscriber::registry().with(WorkerLogLayer::new(4, tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("cache miss on {}", "alpha");
        });

        match rx.recv().await.unwrap() {
            IpcPayload::Log { process_id, record } => {
                assert_eq!(process_id, 4);
                assert_eq!(record.log_level, LogLevel::Warn);
                assert_eq!(
                    record.parameters,
                    vec![Value::String("cache miss on alpha".to_string())]
                );
            }
            other => panic!("expected Log payload, got {other:?}"),
        }
    }
}
