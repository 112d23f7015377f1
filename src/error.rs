//! Crate-wide error taxonomy.
//!
//! Variants model *causes*, not call sites, so the web layer can map them onto the
//! HTTP status codes without each module inventing its own error type.

use crate::policy::document::Issue;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Configuration problem: bad CEL, unknown variable, malformed role binding.
    /// Audited at ERROR, then presented to the caller as a generic `AccessDenied`.
    #[error("constraint failed: {0}")]
    ConstraintFailed(String),

    #[error("already exists")]
    AlreadyExists,

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("invalid policy document")]
    Syntax(Vec<Issue>),

    #[error("{0} of {1} fan-out tasks failed")]
    Aggregate(usize, usize, Vec<String>),

    #[error("upstream I/O failure: {0}")]
    External(String),
}

impl BrokerError {
    /// Status-code mapping per the error-handling design: `ConstraintFailed` and
    /// `ResourceNotFound` collapse into the same response as `AccessDenied` so the
    /// boundary never distinguishes "denied" from "doesn't exist" or "misconfigured".
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::IllegalArgument(_) => StatusCode::BAD_REQUEST,
            BrokerError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            BrokerError::AccessDenied(_)
            | BrokerError::ConstraintFailed(_)
            | BrokerError::ResourceNotFound(_) => StatusCode::FORBIDDEN,
            BrokerError::AlreadyExists => StatusCode::OK,
            BrokerError::Syntax(_) => StatusCode::BAD_REQUEST,
            BrokerError::Aggregate(..) => StatusCode::BAD_GATEWAY,
            BrokerError::External(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// The message that may cross the trust boundary. Configuration and
    /// not-found details never leave the process; only the log gets them.
    fn public_message(&self) -> String {
        match self {
            BrokerError::ConstraintFailed(_) | BrokerError::ResourceNotFound(_) => {
                "access denied".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    issues: Option<Vec<Issue>>,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        if let BrokerError::ConstraintFailed(ref msg) = self {
            crate::audit::constraint_failed(msg);
        }
        let status = self.status();
        let issues = match &self {
            BrokerError::Syntax(issues) => Some(issues.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.public_message(),
            issues,
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
