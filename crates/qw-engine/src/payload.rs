//! Canonical payload codec: the serialized scenarios + config of a run
//!
//! The blob starts with a two-byte marker distinguishing raw JSON from
//! zlib-compressed JSON; compression kicks in above 256 KiB.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use qw_domain::RunPayload;

/// Marker for raw JSON: `Q0`
pub const MARKER_RAW: [u8; 2] = *b"Q0";
/// Marker for zlib-compressed JSON: `Q1`
pub const MARKER_ZLIB: [u8; 2] = *b"Q1";

/// Payloads above this size are stored compressed.
pub const COMPRESSION_THRESHOLD: usize = 256 * 1024;

/// Payload codec failures
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Payload blob is too short")]
    TooShort,

    #[error("Unknown payload marker {0:02x?}")]
    UnknownMarker([u8; 2]),

    #[error("Compression error: {message}")]
    Compression { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

/// Serialize a payload to its stored blob form.
pub fn encode_payload(payload: &RunPayload) -> Result<Vec<u8>, PayloadError> {
    let json = serde_json::to_vec(payload).map_err(|e| PayloadError::Serialization {
        message: e.to_string(),
    })?;

    if json.len() > COMPRESSION_THRESHOLD {
        let mut encoder = ZlibEncoder::new(Vec::from(MARKER_ZLIB), Compression::default());
        encoder
            .write_all(&json)
            .and_then(|()| encoder.finish())
            .map_err(|e| PayloadError::Compression {
                message: e.to_string(),
            })
    } else {
        let mut blob = Vec::with_capacity(2 + json.len());
        blob.extend_from_slice(&MARKER_RAW);
        blob.extend_from_slice(&json);
        Ok(blob)
    }
}

/// Decode a stored blob back to the payload.
pub fn decode_payload(blob: &[u8]) -> Result<RunPayload, PayloadError> {
    if blob.len() < 2 {
        return Err(PayloadError::TooShort);
    }
    let marker = [blob[0], blob[1]];
    let body = &blob[2..];

    let json: Vec<u8> = match marker {
        MARKER_RAW => body.to_vec(),
        MARKER_ZLIB => {
            let mut decoder = ZlibDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| PayloadError::Compression {
                    message: e.to_string(),
                })?;
            out
        }
        other => return Err(PayloadError::UnknownMarker(other)),
    };

    serde_json::from_slice(&json).map_err(|e| PayloadError::Serialization {
        message: e.to_string(),
    })
}
