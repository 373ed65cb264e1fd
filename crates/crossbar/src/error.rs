use std::fmt;

/// Per-call status code carried on replies and surfaced to pending calls.
///
/// Codes travel with the message header and keep a stable string name so
/// peers built at different times agree on meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    Ok,
    NetworkFailure,
    Timeout,
    /// The target is not the right owner; the reply body carries the
    /// address to retry against.
    ForwardToOthers,
    ServiceNotFound,
    HandlerNotFound,
    AppNotExist,
    AppDowngraded,
    OperationDisabled,
    NetworkInitFailed,
    ServiceAlreadyRunning,
}

impl ErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "ERR_OK",
            ErrorCode::NetworkFailure => "ERR_NETWORK_FAILURE",
            ErrorCode::Timeout => "ERR_TIMEOUT",
            ErrorCode::ForwardToOthers => "ERR_FORWARD_TO_OTHERS",
            ErrorCode::ServiceNotFound => "ERR_SERVICE_NOT_FOUND",
            ErrorCode::HandlerNotFound => "ERR_HANDLER_NOT_FOUND",
            ErrorCode::AppNotExist => "ERR_APP_NOT_EXIST",
            ErrorCode::AppDowngraded => "ERR_APP_DOWNGRADED",
            ErrorCode::OperationDisabled => "ERR_OPERATION_DISABLED",
            ErrorCode::NetworkInitFailed => "ERR_NETWORK_INIT_FAILED",
            ErrorCode::ServiceAlreadyRunning => "ERR_SERVICE_ALREADY_RUNNING",
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ErrorCode::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors from engine startup and configuration.
///
/// Per-call failures never use this type; they flow to the pending call as
/// an [`ErrorCode`] instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("rpc engine is already running")]
    AlreadyRunning,

    #[error("network init failed for factory '{factory}': {reason}")]
    NetworkInit { factory: String, reason: String },

    #[error("unknown network factory: {name}")]
    UnknownFactory { name: String },

    #[error("unknown network aspect: {name}")]
    UnknownAspect { name: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_display_names() {
        assert_eq!(ErrorCode::Ok.to_string(), "ERR_OK");
        assert_eq!(ErrorCode::Timeout.to_string(), "ERR_TIMEOUT");
        assert_eq!(
            ErrorCode::ForwardToOthers.to_string(),
            "ERR_FORWARD_TO_OTHERS"
        );
        assert!(ErrorCode::Ok.is_ok());
        assert!(!ErrorCode::NetworkFailure.is_ok());
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::UnknownFactory {
            name: "bogus".into(),
        };
        assert_eq!(err.to_string(), "unknown network factory: bogus");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ErrorCode>();
        assert_send_sync::<EngineError>();
    }
}
