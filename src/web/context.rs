//! Ingress authentication contract (§6): the authenticating proxy in front of
//! this service injects a verified end-user identity and device attributes as
//! headers. This service trusts the ingress exclusively — there is no direct
//! token validation of end users here.

use crate::error::BrokerError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

pub const HEADER_EMAIL: &str = "x-goog-authenticated-user-email";
pub const HEADER_USER_ID_DIRECTORY: &str = "x-accessbroker-user-id-directory";
pub const HEADER_DEVICE_ID: &str = "x-accessbroker-device-id";
pub const HEADER_ACCESS_LEVELS: &str = "x-accessbroker-access-levels";
pub const HEADER_TRACE_ID: &str = "x-cloud-trace-context";

/// The verified caller, plus the trace id used to correlate audit events with
/// the ingress's own request log.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub email: String,
    pub user_id_directory: String,
    pub device_id: Option<String>,
    pub access_levels: Vec<String>,
    pub trace_id: Option<String>,
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name)?.to_str().ok()
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = BrokerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let email = header_str(parts, HEADER_EMAIL)
            .filter(|s| !s.is_empty())
            .ok_or(BrokerError::NotAuthenticated)?
            .to_lowercase();
        let user_id_directory = header_str(parts, HEADER_USER_ID_DIRECTORY)
            .filter(|s| !s.is_empty())
            .ok_or(BrokerError::NotAuthenticated)?
            .to_string();
        let device_id = header_str(parts, HEADER_DEVICE_ID).map(str::to_string);
        let access_levels = header_str(parts, HEADER_ACCESS_LEVELS)
            .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        let trace_id = header_str(parts, HEADER_TRACE_ID).map(str::to_string);

        Ok(RequestContext { email, user_id_directory, device_id, access_levels, trace_id })
    }
}
