//! Error handling for the gateway.
//!
//! Every failure that can reach a caller is a [`GatewayError`]. Each variant
//! maps to an HTTP status, a stable reason string, and the failure envelope
//! defined in [`status`].

pub mod status;

pub use status::{FailureStatus, StatusEnvelope, StatusFlag};

use thiserror::Error;

/// All error types that can occur while serving inference traffic.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    // Payload errors
    /// The request body could not be decoded into a wire envelope.
    #[error("Malformed payload: {details}")]
    MalformedPayload {
        /// Description of what is wrong with the payload
        details: String,
    },

    /// A datatype string outside the supported table.
    #[error("Unsupported datatype '{datatype}'")]
    UnsupportedDatatype { datatype: String },

    /// A required key was absent.
    #[error("Missing required field '{field}'")]
    MissingRequiredField { field: String },

    // Dispatch errors
    /// The component has not finished loading.
    #[error("Component '{component}' is not ready")]
    ComponentNotReady { component: String },

    /// The component does not implement the requested verb.
    #[error("Component does not implement '{capability}'")]
    CapabilityNotImplemented { capability: &'static str },

    /// A router returned a branch outside `[0, n_branches)`.
    #[error("Router returned branch {branch} but only {n_branches} branches exist")]
    RoutingContractViolation { branch: i64, n_branches: usize },

    /// User code failed or panicked.
    #[error("{message}")]
    ComponentError {
        /// Optional code supplied by the component
        code: Option<i32>,
        message: String,
    },

    /// Component metadata does not have the expected shape.
    #[error("Invalid metadata: {details}")]
    InvalidMetadata { details: String },

    // Metrics protocol errors
    /// A metric record failed validation.
    #[error("Invalid metric record: {details}")]
    InvalidMetricRecord { details: String },

    // Delivery errors
    /// Could not connect to the reply target.
    #[error("Cannot deliver reply to '{url}': {reason}")]
    DeliveryFailed { url: String, reason: String },

    /// Reply target did not answer in time.
    #[error("Reply target '{url}' did not respond within {timeout_secs}s")]
    DeliveryTimeout { url: String, timeout_secs: u64 },

    /// Reply target answered with a non-success status.
    #[error("Reply target rejected event with HTTP {status}")]
    DeliveryRejected { status: u16 },

    // Operational errors
    /// Service is draining or not yet started.
    #[error("Service temporarily unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    /// Internal error that should not happen.
    #[error("Internal error: {details}")]
    InternalError { details: String },
}

/// Convenience alias used throughout the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Shorthand for the most common payload error.
    pub fn malformed(details: impl Into<String>) -> Self {
        Self::MalformedPayload {
            details: details.into(),
        }
    }

    /// Shorthand for an absent key.
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
        }
    }

    /// Maps error to the HTTP status code used by synchronous surfaces.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MalformedPayload { .. }
            | Self::UnsupportedDatatype { .. }
            | Self::MissingRequiredField { .. }
            | Self::InvalidMetricRecord { .. } => 400,
            Self::CapabilityNotImplemented { .. } => 501,
            Self::ComponentNotReady { .. } | Self::ServiceUnavailable { .. } => 503,
            Self::RoutingContractViolation { .. }
            | Self::ComponentError { .. }
            | Self::InvalidMetadata { .. }
            | Self::InternalError { .. } => 500,
            Self::DeliveryFailed { .. } | Self::DeliveryRejected { .. } => 502,
            Self::DeliveryTimeout { .. } => 504,
        }
    }

    /// Machine-readable reason placed in the failure envelope.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MalformedPayload { .. } => "MICROSERVICE_BAD_DATA",
            Self::UnsupportedDatatype { .. } => "MICROSERVICE_UNSUPPORTED_DATATYPE",
            Self::MissingRequiredField { .. } => "MICROSERVICE_MISSING_FIELD",
            Self::ComponentNotReady { .. } => "MICROSERVICE_NOT_READY",
            Self::CapabilityNotImplemented { .. } => "MICROSERVICE_NOT_IMPLEMENTED",
            Self::RoutingContractViolation { .. } => "MICROSERVICE_BAD_ROUTING",
            Self::ComponentError { .. } => "MICROSERVICE_INTERNAL_ERROR",
            Self::InvalidMetadata { .. } => "MICROSERVICE_BAD_METADATA",
            Self::InvalidMetricRecord { .. } => "MICROSERVICE_BAD_METRIC",
            Self::DeliveryFailed { .. } => "DELIVERY_FAILED",
            Self::DeliveryTimeout { .. } => "DELIVERY_TIMEOUT",
            Self::DeliveryRejected { .. } => "DELIVERY_REJECTED",
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    /// Returns the error type name for metrics and logging.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::UnsupportedDatatype { .. } => "unsupported_datatype",
            Self::MissingRequiredField { .. } => "missing_required_field",
            Self::ComponentNotReady { .. } => "component_not_ready",
            Self::CapabilityNotImplemented { .. } => "capability_not_implemented",
            Self::RoutingContractViolation { .. } => "routing_contract_violation",
            Self::ComponentError { .. } => "component_error",
            Self::InvalidMetadata { .. } => "invalid_metadata",
            Self::InvalidMetricRecord { .. } => "invalid_metric_record",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::DeliveryTimeout { .. } => "delivery_timeout",
            Self::DeliveryRejected { .. } => "delivery_rejected",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::InternalError { .. } => "internal_error",
        }
    }

    /// Whether a delivery attempt that failed with this error may be retried.
    ///
    /// Connect failures, timeouts, 5xx and 429 are transient. Everything else
    /// is permanent.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::DeliveryFailed { .. } | Self::DeliveryTimeout { .. } => true,
            Self::DeliveryRejected { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Code carried in the envelope. A non-zero component code wins.
    pub fn envelope_code(&self) -> i32 {
        match self {
            Self::ComponentError {
                code: Some(code), ..
            } if *code != 0 => *code,
            _ => i32::from(self.status_code()),
        }
    }

    /// Converts error to the failure envelope.
    pub fn to_status(&self) -> StatusEnvelope {
        StatusEnvelope {
            status: FailureStatus {
                code: self.envelope_code(),
                reason: self.reason().to_string(),
                message: self.to_string(),
                status: StatusFlag::Failure,
            },
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedPayload {
            details: err.to_string(),
        }
    }
}
