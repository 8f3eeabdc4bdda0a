//! Wire types for the remote agent channel
//!
//! Every call opens with a JSON [`CallEnvelope`] naming the method and
//! carrying the per-call authentication tag. The server answers with a
//! stream of JSON [`StreamEvent`] lines. Firmware uploads follow the
//! envelope as fixed-size binary chunks terminated by an empty chunk.
//!
//! The authentication tag pairs the pre-shared key with the method name
//! reversed. This is a request-tagging convention carried over from earlier
//! deployments, not a cryptographic signature; do not rely on it for more
//! than trivial call identification.

use serde::{Deserialize, Serialize};

/// Firmware images are uploaded in chunks of this size
pub const CHUNK_SIZE: usize = 2048;

/// Remote method names
pub const PROGRAM_DEVICE: &str = "program_device";
pub const RESET_DEVICE: &str = "reset_device";
pub const LOG_STREAM_CREATE: &str = "log_stream_create";
pub const START_DEBUG: &str = "start_debug";
pub const STOP_DEBUG: &str = "stop_debug";

/// Opening frame of every remote call
#[derive(Debug, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub method: String,
    /// Pre-shared key; empty on plaintext channels
    #[serde(default)]
    pub auth_key: String,
    /// Per-call tag: the method name reversed
    #[serde(default)]
    pub signature: String,
    /// Target filename for calls that take one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl CallEnvelope {
    pub fn new(method: &str, auth_key: &str) -> Self {
        Self {
            method: method.to_string(),
            auth_key: auth_key.to_string(),
            signature: method_signature(method),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }
}

/// Per-call tag derived from the method name
pub fn method_signature(method: &str) -> String {
    method.chars().rev().collect()
}

/// One server-pushed message on a call stream
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Progress or log line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Set on the final message of a bounded stream
    #[serde(default)]
    pub done: bool,
    /// Server-side failure; terminates the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    pub fn line(data: &str) -> Self {
        Self {
            data: Some(data.to_string()),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}
