//! Shared envelope model and zlib codec for the realtime board wire protocol.
//!
//! This crate owns the wire representation exchanged between browsers and the
//! collaboration hub, and the byte form published on the backplane. Payloads
//! stay flexible (`serde_json::Value`) while the frame itself travels as
//! zlib-compressed UTF-8 JSON inside a binary websocket message.
//!
//! WIRE SHAPES
//! ===========
//! - client → server: `{"type": "...", "id": "...", "data": {...}}`
//! - server → client: `{"reply_to": "..." | "event": "...", "data": {...}}`

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound on the inflated size of one inbound frame.
pub const MAX_INFLATED_BYTES: u64 = 64 * 1024;

/// Error returned by the encode/decode helpers.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The bytes are not a valid zlib stream.
    #[error("unknown compression method: {0}")]
    Compression(#[source] std::io::Error),
    /// The stream inflated past [`MAX_INFLATED_BYTES`].
    #[error("inflated frame exceeds {MAX_INFLATED_BYTES} bytes")]
    TooLarge,
    /// The inflated bytes are not the expected JSON shape.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

/// A command sent by a browser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Command name, e.g. `"join"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id echoed back as `reply_to`. Empty when the sender omitted it.
    #[serde(default)]
    pub id: String,
    /// Command payload; decoded per command kind by the server.
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), id: id.into(), data }
    }
}

/// A reply or event sent by the server. Exactly one of `reply_to` / `event` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: Value,
}

impl ServerFrame {
    /// Answer to the client command carrying correlation id `id`.
    pub fn reply(id: impl Into<String>, data: Value) -> Self {
        Self { reply_to: Some(id.into()), event: None, data }
    }

    /// Unsolicited board event.
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self { reply_to: None, event: Some(name.into()), data }
    }

    /// Build a `data` object holding a single key.
    #[must_use]
    pub fn single(key: &str, value: Value) -> Value {
        let mut map = Map::new();
        map.insert(key.to_owned(), value);
        Value::Object(map)
    }
}

/// Deflate raw bytes into a zlib stream.
///
/// # Errors
///
/// Returns [`CodecError::Compression`] if the encoder fails.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2 + 16), Compression::default());
    encoder.write_all(bytes).map_err(CodecError::Compression)?;
    encoder.finish().map_err(CodecError::Compression)
}

/// Inflate a zlib stream, refusing output larger than [`MAX_INFLATED_BYTES`].
///
/// # Errors
///
/// Returns [`CodecError::Compression`] for bytes that are not zlib and
/// [`CodecError::TooLarge`] when the limit is hit.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .take(MAX_INFLATED_BYTES + 1)
        .read_to_end(&mut out)
        .map_err(CodecError::Compression)?;

    if u64::try_from(out.len()).map_or(true, |n| n > MAX_INFLATED_BYTES) {
        return Err(CodecError::TooLarge);
    }
    Ok(out)
}

/// Serialize a frame to JSON and compress it.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(frame)?;
    compress(&json)
}

/// Decompress and parse one frame.
///
/// # Errors
///
/// Returns [`CodecError::Compression`] / [`CodecError::TooLarge`] for bad
/// streams and [`CodecError::Json`] for malformed JSON.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let json = decompress(bytes)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
