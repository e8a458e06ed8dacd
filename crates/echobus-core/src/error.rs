//! Error types for bus connections, registration, and call completion.
//!
//! # Error Classification
//!
//! - **Connection errors**: the bus endpoint is unreachable or shut down.
//!   Fatal at startup; the process exits nonzero.
//! - **Registration errors**: the bus rejected an object registration. The
//!   process continues degraded.
//! - **Call-scoped errors**: failures confined to a single in-flight call
//!   ([`BusError::OutOfMemory`], [`BusError::InvalidState`]). The connection
//!   stays healthy.
//!
//! No operation in this crate retries: connection and registration are
//! attempted once, and a failed call is failed for good.

use thiserror::Error;

/// Errors surfaced by the bus client seam.
#[derive(Debug, Error)]
pub enum BusError {
    /// Reply buffer allocation failed while building a response.
    ///
    /// The call fails without a reply; the caller observes the failure
    /// through the call's completion status rather than a payload.
    #[error("reply buffer allocation failed")]
    OutOfMemory,

    /// Object or method registration was rejected by the bus.
    #[error("object registration rejected: {reason}")]
    Registration {
        /// Why the bus refused the registration.
        reason: String,
    },

    /// The bus endpoint could not be reached or has shut down.
    #[error("bus connection failed: {reason}")]
    Connection {
        /// Why the connection attempt failed.
        reason: String,
    },

    /// A call token was used after its call already completed.
    ///
    /// This is a programming error in the service, fatal to that call only.
    #[error("call token in invalid state: {reason}")]
    InvalidState {
        /// Description of the misuse.
        reason: String,
    },
}

impl BusError {
    /// Create a registration error.
    #[must_use]
    pub fn registration(reason: impl Into<String>) -> Self {
        Self::Registration {
            reason: reason.into(),
        }
    }

    /// Create a connection error.
    #[must_use]
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Create an invalid-state error.
    #[must_use]
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is fatal to the whole process.
    ///
    /// Only connection failures are: registration failures leave the process
    /// running degraded, and call-scoped failures affect one call.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Returns `true` if this error is confined to a single call.
    #[must_use]
    pub const fn is_call_scoped(&self) -> bool {
        matches!(self, Self::OutOfMemory | Self::InvalidState { .. })
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
