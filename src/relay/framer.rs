//! # Session Framing
//!
//! Binary layout of an audio chunk sent to a worker:
//!
//! ```text
//! [u32 BE id length][session id, UTF-8][u32 BE audio length][audio bytes]
//! ```
//!
//! The worker reads the id prefix to find the recognizer that owns the chunk, so
//! audio for many devices can share one worker connection. Control and result
//! messages are plain JSON text frames carrying the id in `session_id`.
//!
//! The relay only ever encodes; the decoder is compiled for tests, which play
//! the worker's side of the link.

use crate::error::{RelayError, RelayResult};
use byteorder::{BigEndian, WriteBytesExt};
use serde_json::Value;

#[cfg(test)]
use byteorder::ReadBytesExt;
#[cfg(test)]
use std::io::Cursor;

/// JSON field that carries the session id on control and result messages.
pub const SESSION_ID_FIELD: &str = "session_id";

/// Size of each length prefix.
const LENGTH_PREFIX_BYTES: usize = 4;

/// Pre-encoded `[id length][id]` prefix for one session.
///
/// A session sends many chunks with the same id, so the prefix is built once
/// and only the audio length and payload are appended per chunk.
#[derive(Debug, Clone)]
pub struct AudioFrameEncoder {
    prefix: Vec<u8>,
}

impl AudioFrameEncoder {
    pub fn new(session_id: &str) -> RelayResult<Self> {
        let id = session_id.as_bytes();
        let mut prefix = Vec::with_capacity(LENGTH_PREFIX_BYTES + id.len());
        write_length(&mut prefix, id.len())?;
        prefix.extend_from_slice(id);
        Ok(Self { prefix })
    }

    /// Build one contiguous frame for `audio`.
    pub fn encode(&self, audio: &[u8]) -> RelayResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(self.prefix.len() + LENGTH_PREFIX_BYTES + audio.len());
        frame.extend_from_slice(&self.prefix);
        write_length(&mut frame, audio.len())?;
        frame.extend_from_slice(audio);
        Ok(frame)
    }
}

/// A decoded audio frame borrowing from the wire buffer.
#[cfg(test)]
#[derive(Debug, PartialEq, Eq)]
pub struct AudioFrame<'a> {
    pub session_id: &'a str,
    pub audio: &'a [u8],
}

/// Encode a single audio chunk for `session_id`.
#[cfg(test)]
pub fn encode_audio_frame(session_id: &str, audio: &[u8]) -> RelayResult<Vec<u8>> {
    AudioFrameEncoder::new(session_id)?.encode(audio)
}

/// Decode a frame produced by [`encode_audio_frame`].
///
/// Trailing bytes after the declared audio length are rejected so that a
/// misaligned stream is caught instead of silently truncated.
#[cfg(test)]
pub fn decode_audio_frame(frame: &[u8]) -> RelayResult<AudioFrame<'_>> {
    let mut cursor = Cursor::new(frame);

    let id_len = read_length(&mut cursor, "session id length")?;
    let id_start = cursor.position() as usize;
    let id_bytes = take(frame, id_start, id_len, "session id")?;
    let session_id = std::str::from_utf8(id_bytes)
        .map_err(|e| RelayError::Frame(format!("session id is not UTF-8: {}", e)))?;
    cursor.set_position((id_start + id_len) as u64);

    let audio_len = read_length(&mut cursor, "audio length")?;
    let audio_start = cursor.position() as usize;
    let audio = take(frame, audio_start, audio_len, "audio payload")?;

    let trailing = frame.len() - (audio_start + audio_len);
    if trailing > 0 {
        return Err(RelayError::Frame(format!("{} trailing bytes after audio payload", trailing)));
    }

    Ok(AudioFrame { session_id, audio })
}

/// Write `session_id` into a JSON control object, replacing any id the sender put there.
pub fn tag_session(message: &mut Value, session_id: &str) -> RelayResult<()> {
    match message.as_object_mut() {
        Some(object) => {
            object.insert(SESSION_ID_FIELD.to_string(), Value::String(session_id.to_string()));
            Ok(())
        }
        None => Err(RelayError::InvalidMessage(
            "control message must be a JSON object".to_string(),
        )),
    }
}

fn write_length(buf: &mut Vec<u8>, len: usize) -> RelayResult<()> {
    let len = u32::try_from(len)
        .map_err(|_| RelayError::Frame(format!("field of {} bytes exceeds u32 length prefix", len)))?;
    buf.write_u32::<BigEndian>(len)
        .map_err(|e| RelayError::Frame(e.to_string()))
}

#[cfg(test)]
fn read_length(cursor: &mut Cursor<&[u8]>, what: &str) -> RelayResult<usize> {
    cursor
        .read_u32::<BigEndian>()
        .map(|len| len as usize)
        .map_err(|_| RelayError::Frame(format!("truncated {}", what)))
}

#[cfg(test)]
fn take<'a>(frame: &'a [u8], start: usize, len: usize, what: &str) -> RelayResult<&'a [u8]> {
    start
        .checked_add(len)
        .and_then(|end| frame.get(start..end))
        .ok_or_else(|| RelayError::Frame(format!("truncated {}", what)))
}
