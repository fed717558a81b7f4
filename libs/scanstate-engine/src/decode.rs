//! Envelope decoding: raw message bytes → [`Observation`].
//!
//! Pure: no I/O, no clock, no shared state. The same input bytes always
//! produce the same `Ok` value or the same `Err` value.

use base64::Engine;
use serde::Deserialize;

use scanstate_api::{DecodeError, EntityKey, Observation};

/// Payload container layout, selected by the envelope's `data_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataVersion {
    /// `{"response_bytes_utf8": "<base64>"}`
    V1 = 1,
    /// `{"response_str": "<string>"}`
    V2 = 2,
}

impl TryFrom<i64> for DataVersion {
    type Error = DecodeError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(DataVersion::V1),
            2 => Ok(DataVersion::V2),
            other => Err(DecodeError::UnsupportedVersion(other)),
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    ip: String,
    port: u32,
    service: String,
    timestamp: i64,
    data_version: i64,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct V1Data {
    response_bytes_utf8: String,
}

#[derive(Deserialize)]
struct V2Data {
    response_str: String,
}

/// Decode one envelope.
///
/// Version 1 payloads are standard base64; the decoded bytes are read as
/// UTF-8, with invalid sequences replaced by U+FFFD.
pub fn decode_envelope(bytes: &[u8]) -> Result<Observation, DecodeError> {
    let raw: RawEnvelope =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Envelope(e.to_string()))?;

    let payload = match DataVersion::try_from(raw.data_version)? {
        DataVersion::V1 => {
            let data: V1Data = serde_json::from_value(raw.data)
                .map_err(|e| DecodeError::Data { version: 1, detail: e.to_string() })?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data.response_bytes_utf8.as_bytes())
                .map_err(|e| DecodeError::Base64(e.to_string()))?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
        DataVersion::V2 => {
            let data: V2Data = serde_json::from_value(raw.data)
                .map_err(|e| DecodeError::Data { version: 2, detail: e.to_string() })?;
            data.response_str
        }
    };

    Ok(Observation::new(
        EntityKey::new(raw.ip, raw.port, raw.service),
        raw.timestamp,
        payload,
    ))
}
