use sip_types::StatusCode;
use std::io;

/// Error kinds surfaced by the B2BUA core.
///
/// Every variant that reaches a live call maps to a final SIP response on
/// the affected leg, unparseable input is the only thing dropped silently.
#[derive(Debug, thiserror::Error)]
pub enum B2buaError {
    #[error("transaction timed out")]
    TxnTimeout,
    #[error("authentication failed")]
    AuthFailure,
    #[error("source address denied")]
    AclDeny,
    #[error("no routing rule matched")]
    NoRouteMatch,
    #[error("rejected by rule {rule_id}: {code} {reason}")]
    RuleReject {
        rule_id: String,
        code: u16,
        reason: String,
    },
    #[error("session limit exceeded")]
    LimitExceeded,
    #[error("media relay timed out")]
    RelayTimeout,
    #[error("media relay error: {0}")]
    RelayError(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("max-forwards exhausted")]
    LoopDetected,
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Sip(#[from] sip_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl B2buaError {
    /// Status code sent on the affected leg for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            B2buaError::TxnTimeout => StatusCode::REQUEST_TIMEOUT,
            B2buaError::AuthFailure | B2buaError::AclDeny => StatusCode::FORBIDDEN,
            B2buaError::NoRouteMatch => StatusCode::NOT_FOUND,
            B2buaError::RuleReject { code, .. } => StatusCode::from(*code),
            B2buaError::LimitExceeded => StatusCode::SERVICE_UNAVAILABLE,
            B2buaError::RelayTimeout | B2buaError::RelayError(_) => {
                StatusCode::SERVER_INTERNAL_ERROR
            }
            B2buaError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            B2buaError::LoopDetected => StatusCode::TOO_MANY_HOPS,
            B2buaError::Sip(sip_core::Error::RequestTimedOut) => StatusCode::REQUEST_TIMEOUT,
            B2buaError::Internal(_) | B2buaError::Sip(_) | B2buaError::Io(_) => {
                StatusCode::SERVER_INTERNAL_ERROR
            }
        }
    }

    /// Label used for the error counter
    pub fn kind(&self) -> &'static str {
        match self {
            B2buaError::TxnTimeout => "txn_timeout",
            B2buaError::AuthFailure => "auth_failure",
            B2buaError::AclDeny => "acl_deny",
            B2buaError::NoRouteMatch => "no_route_match",
            B2buaError::RuleReject { .. } => "rule_reject",
            B2buaError::LimitExceeded => "limit_exceeded",
            B2buaError::RelayTimeout => "relay_timeout",
            B2buaError::RelayError(_) => "relay_error",
            B2buaError::StoreUnavailable(_) => "store_unavailable",
            B2buaError::LoopDetected => "loop_detected",
            B2buaError::Internal(_) => "internal",
            B2buaError::Sip(_) => "sip",
            B2buaError::Io(_) => "io",
        }
    }
}

pub type Result<T, E = B2buaError> = std::result::Result<T, E>;
