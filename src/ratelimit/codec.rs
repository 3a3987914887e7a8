//! Encodings of [`CounterState`] for the shared store.
//!
//! Both codecs round-trip every finite state exactly. Anything that does not
//! decode cleanly is reported as corruption, never treated as a fresh counter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::counter::CounterState;

/// Size of a packed-binary state: two little-endian IEEE-754 doubles.
pub const PACKED_LEN: usize = 16;

/// Errors produced while decoding stored state.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("expected {expected} bytes of packed state, found {found}")]
    InvalidLength { expected: usize, found: usize },

    #[error("malformed JSON state: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state contains a non-finite number")]
    NonFinite,

    /// The store itself refused to decode the state (server-side evaluation).
    #[error("store rejected encoded state: {0}")]
    Rejected(String),
}

/// Selectable state encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Codec {
    /// `timestamp` then `value` as little-endian f64, 16 bytes, no framing.
    #[default]
    PackedBinary,
    /// `{"timestamp":…,"value":…}` as UTF-8 JSON.
    Text,
}

#[derive(Serialize, Deserialize)]
struct TextState {
    timestamp: f64,
    value: f64,
}

impl Codec {
    /// Name used in configuration and passed to server-side scripts.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::PackedBinary => "packed-binary",
            Codec::Text => "text",
        }
    }

    pub fn encode(&self, state: &CounterState) -> Vec<u8> {
        match self {
            Codec::PackedBinary => {
                let mut out = Vec::with_capacity(PACKED_LEN);
                out.extend_from_slice(&state.timestamp.to_le_bytes());
                out.extend_from_slice(&state.value.to_le_bytes());
                out
            }
            Codec::Text => {
                let text = TextState {
                    timestamp: state.timestamp,
                    value: state.value,
                };
                // Serializing two plain f64 fields cannot fail.
                serde_json::to_vec(&text).unwrap_or_default()
            }
        }
    }

    pub fn decode(&self, raw: &[u8]) -> Result<CounterState, CodecError> {
        let state = match self {
            Codec::PackedBinary => {
                if raw.len() != PACKED_LEN {
                    return Err(CodecError::InvalidLength {
                        expected: PACKED_LEN,
                        found: raw.len(),
                    });
                }
                let (timestamp, value) = raw.split_at(8);
                CounterState::new(f64_le(value), f64_le(timestamp))
            }
            Codec::Text => {
                let text: TextState = serde_json::from_slice(raw)?;
                CounterState::new(text.value, text.timestamp)
            }
        };

        if !state.value.is_finite() || !state.timestamp.is_finite() {
            return Err(CodecError::NonFinite);
        }
        Ok(state)
    }
}

fn f64_le(bytes: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    f64::from_le_bytes(buf)
}
