//! Failure envelope returned to synchronous callers.
//!
//! Every surface renders errors the same way:
//!
//! ```json
//! {"status": {"code": 400, "reason": "MICROSERVICE_BAD_DATA", "message": "...", "status": "FAILURE"}}
//! ```

use serde::{Deserialize, Serialize};

/// Outer wrapper so the status object sits under a `status` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    pub status: FailureStatus,
}

/// Body of the failure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureStatus {
    /// Component-supplied code when present, otherwise the HTTP status.
    pub code: i32,

    /// Machine-readable reason, e.g. `MICROSERVICE_BAD_DATA`.
    pub reason: String,

    /// Human-readable message.
    pub message: String,

    pub status: StatusFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusFlag {
    Success,
    Failure,
}
