//! Sentinel-delimited frame codec for dispatcher-worker communication.
//!
//! Every payload is emitted as `JSON || "<--- END OF DATA --->" || "\n"`.
//! The multi-character sentinel cannot appear inside serialised JSON text,
//! which makes framing unambiguous over arbitrary chunking. Works over any
//! AsyncRead/AsyncWrite via `FramedRead`/`FramedWrite`.

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::bridge::protocol::IpcPayload;

/// Frame boundary marker. The trailing newline written after it is cosmetic;
/// the decoder treats it as inter-frame whitespace.
pub const FRAME_DELIMITER: &[u8] = b"<--- END OF DATA --->";

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame is not a valid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Decode one complete frame body strictly.
///
/// The streaming decoder uses this and drops frames that fail; tests use it
/// to assert the failure itself.
pub fn decode_frame(body: &[u8]) -> Result<IpcPayload, FrameDecodeError> {
    Ok(serde_json::from_slice(body)?)
}

/// Codec over the sentinel framing.
///
/// The decoder buffers partial frames and never discards leading bytes of an
/// incomplete frame. A complete frame that fails to parse is logged and
/// skipped; the buffer advances past its delimiter so every following frame
/// still parses.
pub struct PayloadCodec {
    // Scan resume point: everything before it is known not to end a delimiter.
    next_index: usize,
}

impl PayloadCodec {
    pub fn new() -> Self {
        Self { next_index: 0 }
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_delimiter(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < FRAME_DELIMITER.len() {
        return None;
    }
    let start = from.min(buf.len() - FRAME_DELIMITER.len() + 1);
    buf[start..]
        .windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
        .map(|pos| start + pos)
}

impl Decoder for PayloadCodec {
    type Item = IpcPayload;
    type Error = FrameDecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = find_delimiter(src, self.next_index) else {
                // No complete frame yet. Remember where to resume scanning:
                // a delimiter may still straddle the buffer tail.
                self.next_index = src
                    .len()
                    .saturating_sub(FRAME_DELIMITER.len().saturating_sub(1));
                return Ok(None);
            };

            let frame = src.split_to(pos + FRAME_DELIMITER.len());
            self.next_index = 0;
            let body = &frame[..pos];

            match decode_frame(body) {
                Ok(payload) => return Ok(Some(payload)),
                Err(error) => {
                    tracing::warn!(%error, frame_len = body.len(), "Dropping malformed frame");
                    continue;
                }
            }
        }
    }
}

impl Encoder<IpcPayload> for PayloadCodec {
    type Error = FrameDecodeError;

    fn encode(&mut self, item: IpcPayload, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + FRAME_DELIMITER.len() + 1);
        dst.put_slice(&json);
        dst.put_slice(FRAME_DELIMITER);
        dst.put_u8(b'\n');
        Ok(())
    }
}
