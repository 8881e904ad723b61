// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Failure classification for the call chain.
//!
//! Every error carries a stable numeric code, a stable type tag and a
//! retryable flag. `retryable() == true` tells upstream load-balancing logic
//! that the same request may safely be retried against another node or
//! replica; non-retryable errors must surface to the original caller
//! untouched.

use faststr::FastStr;
use serde_json::{json, Value};
use thiserror::Error;

/// Error raised anywhere along a call chain.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum StarError {
    /// The transporter connection is gone. Retryable once it is reestablished.
    #[error("The transporter has disconnected. Please try again when a connection is reestablished.")]
    TransporterDisconnected,

    /// Generic remote-side failure.
    #[error("{message}")]
    ServerError {
        /// Human-readable failure description.
        message: String,
    },

    /// The requested action is not registered anywhere.
    #[error("Service '{action}' is not found on '{node_id}' node.")]
    ServiceNotFound {
        /// Requested action name.
        action: FastStr,
        /// Node the lookup ran on.
        node_id: FastStr,
    },

    /// The action exists but no live endpoint can serve it right now.
    #[error("Service '{action}' is not available on '{node_id}' node.")]
    ServiceNotAvailable {
        /// Requested action name.
        action: FastStr,
        /// Node the lookup ran on.
        node_id: FastStr,
    },

    /// The dispatched request did not settle within its timeout.
    #[error("Request is timed out when call '{action}' action on '{node_id}' node.")]
    RequestTimeout {
        /// Called action name.
        action: FastStr,
        /// Calling node.
        node_id: FastStr,
    },

    /// The callee refused the request (permissions, resources, bad state).
    #[error("Request is rejected when call '{action}' action on '{node_id}' node.")]
    RequestRejected {
        /// Called action name.
        action: FastStr,
        /// Calling node.
        node_id: FastStr,
    },

    /// The callee's request queue is full.
    #[error("Queue is full. Request '{action}' action on '{node_id}' node is rejected.")]
    QueueIsFull {
        /// Called action name.
        action: FastStr,
        /// Calling node.
        node_id: FastStr,
    },

    /// Parameter validation failed. Client error, never retried.
    #[error("{message}")]
    Validation {
        /// Validation failure description.
        message: String,
    },

    /// The call was never dispatched because the caller's timeout budget was
    /// already exhausted. Retrying with the same budget is pointless.
    #[error("Calling '{action}' is skipped because timeout reached on '{node_id}' node.")]
    RequestSkipped {
        /// Action (or joined action list) that was about to be called.
        action: FastStr,
        /// Node that skipped the dispatch.
        node_id: FastStr,
    },

    /// The call chain hit the configured nesting limit, most likely a
    /// recursion bug between services. Retrying would repeat it.
    #[error("Request level has reached the limit ({level}) on '{node_id}' node.")]
    MaxCallLevel {
        /// Node that rejected the call.
        node_id: FastStr,
        /// Depth the chain had reached.
        level: u32,
    },

    /// A service schema is malformed.
    #[error("{message}")]
    ServiceSchema {
        /// Schema failure description.
        message: String,
    },

    /// Broker options are invalid.
    #[error("{message}")]
    BrokerOptions {
        /// Option failure description.
        message: String,
    },

    /// A service did not stop within the graceful-shutdown window.
    #[error("Unable to stop '{service}' service gracefully.")]
    GracefulStopTimeout {
        /// Full name of the stuck service.
        service: FastStr,
    },

    /// Two nodes speak different protocol versions.
    #[error("Protocol version mismatch.")]
    ProtocolVersionMismatch {
        /// Remote node id.
        node_id: FastStr,
        /// Version this node speaks.
        actual: FastStr,
        /// Version the remote sent.
        received: FastStr,
    },

    /// A packet arrived that cannot be decoded.
    #[error("Invalid packet data.")]
    InvalidPacketData,
}

impl StarError {
    /// Stable numeric code, HTTP-flavored.
    pub fn code(&self) -> u16 {
        match self {
            StarError::TransporterDisconnected => 502,
            StarError::ServerError { .. } => 500,
            StarError::ServiceNotFound { .. } => 404,
            StarError::ServiceNotAvailable { .. } => 404,
            StarError::RequestTimeout { .. } => 504,
            StarError::RequestRejected { .. } => 503,
            StarError::QueueIsFull { .. } => 429,
            StarError::Validation { .. } => 422,
            StarError::RequestSkipped { .. } => 514,
            StarError::MaxCallLevel { .. } => 500,
            StarError::ServiceSchema { .. } => 500,
            StarError::BrokerOptions { .. } => 500,
            StarError::GracefulStopTimeout { .. } => 500,
            StarError::ProtocolVersionMismatch { .. } => 500,
            StarError::InvalidPacketData => 500,
        }
    }

    /// Stable type tag, independent of the message text.
    pub fn error_type(&self) -> &'static str {
        match self {
            StarError::TransporterDisconnected => "BAD_GATEWAY",
            StarError::ServerError { .. } => "SERVER_ERROR",
            StarError::ServiceNotFound { .. } => "SERVICE_NOT_FOUND",
            StarError::ServiceNotAvailable { .. } => "SERVICE_NOT_AVAILABLE",
            StarError::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            StarError::RequestRejected { .. } => "REQUEST_REJECTED",
            StarError::QueueIsFull { .. } => "QUEUE_FULL",
            StarError::Validation { .. } => "VALIDATION_ERROR",
            StarError::RequestSkipped { .. } => "REQUEST_SKIPPED",
            StarError::MaxCallLevel { .. } => "MAX_CALL_LEVEL",
            StarError::ServiceSchema { .. } => "SERVICE_SCHEMA_ERROR",
            StarError::BrokerOptions { .. } => "BROKER_OPTIONS_ERROR",
            StarError::GracefulStopTimeout { .. } => "GRACEFUL_STOP_TIMEOUT",
            StarError::ProtocolVersionMismatch { .. } => "PROTOCOL_VERSION_MISMATCH",
            StarError::InvalidPacketData => "INVALID_PACKET_DATA",
        }
    }

    /// Whether the same request may be retried against another node/replica.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            StarError::TransporterDisconnected
                | StarError::ServerError { .. }
                | StarError::ServiceNotFound { .. }
                | StarError::ServiceNotAvailable { .. }
                | StarError::RequestTimeout { .. }
                | StarError::RequestRejected { .. }
                | StarError::QueueIsFull { .. }
        )
    }

    /// Structured data attached to the error, for projections and exporters.
    pub fn data(&self) -> Value {
        match self {
            StarError::ServiceNotFound { action, node_id }
            | StarError::ServiceNotAvailable { action, node_id }
            | StarError::RequestTimeout { action, node_id }
            | StarError::RequestRejected { action, node_id }
            | StarError::QueueIsFull { action, node_id }
            | StarError::RequestSkipped { action, node_id } => {
                json!({ "action": action.as_str(), "node_id": node_id.as_str() })
            }
            StarError::MaxCallLevel { node_id, level } => {
                json!({ "node_id": node_id.as_str(), "level": level })
            }
            StarError::GracefulStopTimeout { service } => {
                json!({ "service": service.as_str() })
            }
            StarError::ProtocolVersionMismatch {
                node_id,
                actual,
                received,
            } => json!({
                "node_id": node_id.as_str(),
                "actual": actual.as_str(),
                "received": received.as_str(),
            }),
            _ => Value::Null,
        }
    }
}
