//! Wire protocol shared by the dispatcher and its workers.
//!
//! Every frame in either direction carries one flat JSON record whose `flag`
//! field (a positive integer) says what the rest of the record means. The
//! typed [`IpcPayload`] enum is the in-process representation; conversion to
//! and from the flat record happens here so that a payload whose flag
//! disagrees with its body cannot be constructed anywhere else.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric wire flags. Non-positive or unknown values are invalid and the
/// receiving side drops the whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadFlag {
    /// Request from parent to worker, or success response back.
    Dispatch,
    /// Worker-initiated availability signal. Reserved; the least-busy
    /// scheduler does not consume it.
    Available,
    /// Failure response, or an out-of-band worker failure when `payloadId`
    /// is absent.
    Error,
    /// Redirected worker log output.
    Log,
}

impl PayloadFlag {
    pub fn as_wire(self) -> i64 {
        match self {
            Self::Dispatch => 1,
            Self::Available => 2,
            Self::Error => 3,
            Self::Log => 4,
        }
    }

    pub fn from_wire(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(Self::Dispatch),
            2 => Some(Self::Available),
            3 => Some(Self::Error),
            4 => Some(Self::Log),
            _ => None,
        }
    }
}

/// Failure descriptor carried by `Error` payloads.
///
/// Holding only strings makes the record serialisable by construction: the
/// worker flattens whatever its method threw into `message` and `stack`
/// before the value ever reaches the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Log levels a worker can redirect to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Log record carried in the `result` field of a `Log` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub log_level: LogLevel,
    pub parameters: Vec<Value>,
}

/// One IPC record, typed by direction and meaning.
///
/// `Request` and `Response` share the `Dispatch` flag on the wire and are
/// told apart by shape: a request carries `methodName`, a response carries
/// `result`.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcPayload {
    Request {
        payload_id: String,
        process_id: usize,
        service_name: String,
        service_scope_name: Option<String>,
        method_name: String,
        method_arguments: Vec<Value>,
    },
    Response {
        payload_id: String,
        process_id: usize,
        result: Value,
    },
    Available {
        process_id: usize,
    },
    Error {
        payload_id: Option<String>,
        process_id: usize,
        error: RemoteError,
    },
    Log {
        process_id: usize,
        record: LogRecord,
    },
}

impl IpcPayload {
    /// Build a request. The worker index is assigned at drain time, once a
    /// worker has been selected.
    pub fn request(
        payload_id: impl Into<String>,
        service_name: impl Into<String>,
        service_scope_name: Option<String>,
        method_name: impl Into<String>,
        method_arguments: Vec<Value>,
    ) -> Self {
        Self::Request {
            payload_id: payload_id.into(),
            process_id: 0,
            service_name: service_name.into(),
            service_scope_name,
            method_name: method_name.into(),
            method_arguments,
        }
    }

    pub fn response(payload_id: impl Into<String>, process_id: usize, result: Value) -> Self {
        Self::Response {
            payload_id: payload_id.into(),
            process_id,
            result,
        }
    }

    pub fn error(payload_id: Option<String>, process_id: usize, error: RemoteError) -> Self {
        Self::Error {
            payload_id,
            process_id,
            error,
        }
    }

    pub fn log(process_id: usize, log_level: LogLevel, parameters: Vec<Value>) -> Self {
        Self::Log {
            process_id,
            record: LogRecord {
                log_level,
                parameters,
            },
        }
    }

    pub fn flag(&self) -> PayloadFlag {
        match self {
            Self::Request { .. } | Self::Response { .. } => PayloadFlag::Dispatch,
            Self::Available { .. } => PayloadFlag::Available,
            Self::Error { .. } => PayloadFlag::Error,
            Self::Log { .. } => PayloadFlag::Log,
        }
    }

    pub fn payload_id(&self) -> Option<&str> {
        match self {
            Self::Request { payload_id, .. } | Self::Response { payload_id, .. } => {
                Some(payload_id)
            }
            Self::Error { payload_id, .. } => payload_id.as_deref(),
            Self::Available { .. } | Self::Log { .. } => None,
        }
    }

    pub fn process_id(&self) -> usize {
        match self {
            Self::Request { process_id, .. }
            | Self::Response { process_id, .. }
            | Self::Available { process_id }
            | Self::Error { process_id, .. }
            | Self::Log { process_id, .. } => *process_id,
        }
    }

    /// Stamp the target worker index onto the payload.
    pub fn with_process_id(mut self, id: usize) -> Self {
        match &mut self {
            Self::Request { process_id, .. }
            | Self::Response { process_id, .. }
            | Self::Available { process_id }
            | Self::Error { process_id, .. }
            | Self::Log { process_id, .. } => *process_id = id,
        }
        self
    }
}

/// The flat record every payload kind serialises to.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireRecord {
    flag: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    process_id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_scope_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method_arguments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum PayloadShapeError {
    #[error("unknown or non-positive flag {0}")]
    UnknownFlag(i64),
    #[error("payload is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("payload result does not match its flag: {0}")]
    InvalidResult(serde_json::Error),
}

impl IpcPayload {
    fn to_wire(&self) -> WireRecord {
        let mut record = WireRecord {
            flag: self.flag().as_wire(),
            process_id: Some(self.process_id()),
            ..WireRecord::default()
        };
        match self {
            Self::Request {
                payload_id,
                service_name,
                service_scope_name,
                method_name,
                method_arguments,
                ..
            } => {
                record.payload_id = Some(payload_id.clone());
                record.service_name = Some(service_name.clone());
                record.service_scope_name = service_scope_name.clone();
                record.method_name = Some(method_name.clone());
                record.method_arguments = Some(method_arguments.clone());
            }
            Self::Response {
                payload_id, result, ..
            } => {
                record.payload_id = Some(payload_id.clone());
                record.result = Some(result.clone());
            }
            Self::Available { .. } => {}
            Self::Error {
                payload_id, error, ..
            } => {
                record.payload_id = payload_id.clone();
                record.result = serde_json::to_value(error).ok();
            }
            Self::Log { record: log, .. } => {
                record.result = serde_json::to_value(log).ok();
            }
        }
        record
    }

    fn from_wire(record: WireRecord) -> Result<Self, PayloadShapeError> {
        let flag = PayloadFlag::from_wire(record.flag)
            .ok_or(PayloadShapeError::UnknownFlag(record.flag))?;
        let process_id = record
            .process_id
            .ok_or(PayloadShapeError::MissingField("processId"))?;

        match flag {
            PayloadFlag::Dispatch => {
                let payload_id = record
                    .payload_id
                    .ok_or(PayloadShapeError::MissingField("payloadId"))?;
                if let Some(method_name) = record.method_name {
                    Ok(Self::Request {
                        payload_id,
                        process_id,
                        service_name: record
                            .service_name
                            .ok_or(PayloadShapeError::MissingField("serviceName"))?,
                        service_scope_name: record.service_scope_name,
                        method_name,
                        method_arguments: record.method_arguments.unwrap_or_default(),
                    })
                } else {
                    Ok(Self::Response {
                        payload_id,
                        process_id,
                        result: record.result.unwrap_or(Value::Null),
                    })
                }
            }
            PayloadFlag::Available => Ok(Self::Available { process_id }),
            PayloadFlag::Error => {
                let raw = record
                    .result
                    .ok_or(PayloadShapeError::MissingField("result"))?;
                let error =
                    serde_json::from_value(raw).map_err(PayloadShapeError::InvalidResult)?;
                Ok(Self::Error {
                    payload_id: record.payload_id.filter(|id| !id.trim().is_empty()),
                    process_id,
                    error,
                })
            }
            PayloadFlag::Log => {
                let raw = record
                    .result
                    .ok_or(PayloadShapeError::MissingField("result"))?;
                let log = serde_json::from_value(raw).map_err(PayloadShapeError::InvalidResult)?;
                Ok(Self::Log {
                    process_id,
                    record: log,
                })
            }
        }
    }
}

impl Serialize for IpcPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IpcPayload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = WireRecord::deserialize(deserializer)?;
        Self::from_wire(record).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrips_with_camel_case_fields() {
        let payload = IpcPayload::request(
            "id-1",
            "echo",
            Some("scope-a".to_string()),
            "run",
            vec![json!("hello"), json!(2)],
        )
        .with_process_id(3);

        let text = serde_json::to_string(&payload).unwrap();
        assert!(text.contains("\"flag\":1"));
        assert!(text.contains("\"payloadId\":\"id-1\""));
        assert!(text.contains("\"processId\":3"));
        assert!(text.contains("\"serviceName\":\"echo\""));
        assert!(text.contains("\"serviceScopeName\":\"scope-a\""));
        assert!(text.contains("\"methodName\":\"run\""));
        assert!(text.contains("\"methodArguments\":[\"hello\",2]"));

        let parsed: IpcPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn response_roundtrips() {
        let payload = IpcPayload::response("id-2", 1, json!({"value": 42}));
        let text = serde_json::to_string(&payload).unwrap();
        let parsed: IpcPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn dispatch_flag_classifies_by_shape() {
        // methodName present: request. result present: response.
        let request: IpcPayload = serde_json::from_value(json!({
            "flag": 1,
            "payloadId": "p",
            "processId": 0,
            "serviceName": "svc",
            "methodName": "m",
        }))
        .unwrap();
        assert!(matches!(request, IpcPayload::Request { method_arguments, .. } if method_arguments.is_empty()));

        let response: IpcPayload = serde_json::from_value(json!({
            "flag": 1,
            "payloadId": "p",
            "processId": 0,
            "result": "done",
        }))
        .unwrap();
        assert!(matches!(response, IpcPayload::Response { .. }));
    }

    #[test]
    fn error_payload_preserves_message_and_stack() {
        let payload = IpcPayload::error(
            Some("id-3".to_string()),
            2,
            RemoteError::new("boom").with_stack("at worker.rs:10"),
        );
        let text = serde_json::to_string(&payload).unwrap();
        assert!(text.contains("\"flag\":3"));

        match serde_json::from_str::<IpcPayload>(&text).unwrap() {
            IpcPayload::Error {
                payload_id, error, ..
            } => {
                assert_eq!(payload_id.as_deref(), Some("id-3"));
                assert_eq!(error.message, "boom");
                assert_eq!(error.stack.as_deref(), Some("at worker.rs:10"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn blank_error_payload_id_reads_as_none() {
        let parsed: IpcPayload = serde_json::from_value(json!({
            "flag": 3,
            "payloadId": "  ",
            "processId": 0,
            "result": {"message": "lost"},
        }))
        .unwrap();
        assert!(matches!(
            parsed,
            IpcPayload::Error {
                payload_id: None,
                ..
            }
        ));
    }

    #[test]
    fn log_payload_carries_level_and_parameters() {
        let payload = IpcPayload::log(1, LogLevel::Warn, vec![json!("disk almost full")]);
        let text = serde_json::to_string(&payload).unwrap();
        assert!(text.contains("\"flag\":4"));
        assert!(text.contains("\"logLevel\":\"warn\""));

        let parsed: IpcPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn unknown_and_non_positive_flags_are_rejected() {
        for flag in [0, -1, 5, 99] {
            let result: Result<IpcPayload, _> = serde_json::from_value(json!({
                "flag": flag,
                "processId": 0,
            }));
            assert!(result.is_err(), "flag {flag} should not parse");
        }
    }

    #[test]
    fn available_payload_is_minimal() {
        let payload = IpcPayload::Available { process_id: 7 };
        let text = serde_json::to_string(&payload).unwrap();
        assert_eq!(text, "{\"flag\":2,\"processId\":7}");

        let parsed: IpcPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, payload);
    }
}
