//! IPC bridge between the dispatcher and its worker processes.
//!
//! - **protocol**: the shared wire record ([`protocol::IpcPayload`]) and flag
//!   numbering
//! - **codec**: sentinel-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
