//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. The
//! variants follow the server's public error taxonomy: authentication,
//! policy, not-found, bad-request subtypes, resource limits, and internal
//! faults. Internal details never leak into the public message of
//! `PermissionDenied` or `Unavailable`.

use std::time::Duration;

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the server core.
#[derive(Error, Debug)]
pub enum Error {
    /// Request carried no credentials.
    #[error("{0}")]
    Unauthenticated(String),

    /// Policy refusal. The public message hides the internal details.
    #[error("permission denied")]
    PermissionDenied(String),

    /// Transient unavailability. The public message hides the details.
    #[error("service unavailable")]
    Unavailable(String),

    /// Rate limit; carries the minimum delay before retrying.
    #[error("request rate limit exceeded")]
    TooManyRequests { retry_after: Duration },

    /// Unknown module hash.
    #[error("module not found")]
    ModuleNotFound,

    /// Unknown instance id.
    #[error("instance not found")]
    InstanceNotFound,

    /// Module content malformed or inconsistent.
    #[error("invalid module: {0}")]
    ModuleError(String),

    /// Entry function not exported by the module.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// Instance id is not an RFC 4122 UUID version 4.
    #[error("invalid instance id: {0}")]
    InstanceIdInvalid(String),

    /// Instance id already in use by the account.
    #[error("duplicate instance id")]
    InstanceIdExists,

    /// Operation not valid in the instance's current state.
    #[error("instance status: {0}")]
    InstanceStatus(String),

    /// Debug configuration changed while a rebuild was in flight.
    #[error("instance debug state: {0}")]
    InstanceDebugState(String),

    /// Instance has no live services to connect to.
    #[error("instance cannot be connected to")]
    InstanceNoConnect,

    /// Alleged module hash does not match content.
    #[error("module hash does not match content")]
    ModuleHashMismatch,

    /// Requested scope exceeds what the server supports.
    #[error("scope too large")]
    ScopeTooLarge,

    /// Operation not supported by this server.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Quota overflow (module size, text size, memory, stack, breakpoints).
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Nonce seen before within its expiry window.
    #[error("nonce reused")]
    NonceReused,

    /// Server is shutting down or has shut down.
    #[error("server closed")]
    ServerClosed,

    /// Any unclassified fault.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn permission_denied(internal_details: impl Into<String>) -> Self {
        Self::PermissionDenied(internal_details.into())
    }

    pub fn unavailable(internal_details: impl Into<String>) -> Self {
        Self::Unavailable(internal_details.into())
    }

    pub fn retry_after(retry_after: Duration) -> Self {
        Self::TooManyRequests {
            retry_after: retry_after.max(Duration::from_millis(1)),
        }
    }

    pub fn module_error(msg: impl Into<String>) -> Self {
        Self::ModuleError(msg.into())
    }

    pub fn function_not_found(name: impl Into<String>) -> Self {
        Self::FunctionNotFound(name.into())
    }

    pub fn instance_status(msg: impl Into<String>) -> Self {
        Self::InstanceStatus(msg.into())
    }

    pub fn resource_limit(msg: impl Into<String>) -> Self {
        Self::ResourceLimit(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

impl Error {
    /// Classify the error for failure events. Returns `None` for errors
    /// which are reported as internal faults rather than request failures.
    pub fn fail_kind(&self) -> Option<FailKind> {
        Some(match self {
            Error::Unauthenticated(_) => FailKind::AuthMissing,
            Error::PermissionDenied(_) => FailKind::AuthDenied,
            Error::TooManyRequests { .. } => FailKind::RateLimit,
            Error::ModuleNotFound => FailKind::ModuleNotFound,
            Error::InstanceNotFound => FailKind::InstanceNotFound,
            Error::ModuleError(_) => FailKind::ModuleError,
            Error::FunctionNotFound(_) => FailKind::FunctionNotFound,
            Error::InstanceIdInvalid(_) => FailKind::InstanceIdInvalid,
            Error::InstanceIdExists => FailKind::InstanceIdExists,
            Error::InstanceStatus(_) => FailKind::InstanceStatus,
            Error::InstanceDebugState(_) => FailKind::InstanceDebugState,
            Error::InstanceNoConnect => FailKind::InstanceNoConnect,
            Error::ModuleHashMismatch => FailKind::ModuleHashMismatch,
            Error::ScopeTooLarge => FailKind::ScopeTooLarge,
            Error::Unsupported(_) => FailKind::Unsupported,
            Error::ResourceLimit(_) => FailKind::ResourceLimit,
            Error::NonceReused => FailKind::AuthReused,
            _ => return None,
        })
    }

    /// True for faults that should be reported on the internal failure
    /// channel of the event monitor.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Internal(_)
                | Error::Serialization(_)
                | Error::Io(_)
                | Error::Unavailable(_)
                | Error::ServerClosed
        )
    }
}

/// Failure classification carried by `FailRequest` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailKind {
    AuthMissing,
    AuthReused,
    AuthDenied,
    RateLimit,
    ModuleNotFound,
    ModuleError,
    ModuleHashMismatch,
    FunctionNotFound,
    ProgramError,
    InstanceNotFound,
    InstanceIdInvalid,
    InstanceIdExists,
    InstanceStatus,
    InstanceNoConnect,
    InstanceDebugState,
    ScopeTooLarge,
    Unsupported,
    ResourceLimit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_messages_hide_details() {
        let err = Error::permission_denied("secret backend detail");
        assert_eq!(err.to_string(), "permission denied");

        let err = Error::unavailable("db connection pool exhausted");
        assert_eq!(err.to_string(), "service unavailable");
    }

    #[test]
    fn test_retry_after_minimum() {
        match Error::retry_after(Duration::ZERO) {
            Error::TooManyRequests { retry_after } => {
                assert!(retry_after >= Duration::from_millis(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_fail_kind_classification() {
        assert_eq!(
            Error::ModuleHashMismatch.fail_kind(),
            Some(FailKind::ModuleHashMismatch)
        );
        assert_eq!(
            Error::InstanceIdExists.fail_kind(),
            Some(FailKind::InstanceIdExists)
        );
        assert_eq!(Error::internal("boom").fail_kind(), None);
        assert!(Error::internal("boom").is_internal());
        assert!(!Error::ModuleNotFound.is_internal());
    }
}
