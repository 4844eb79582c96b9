//! Error taxonomy for the request processor (spec §4.I).
//!
//! Errors are structural, not a hierarchy of exception types: one enum,
//! mapped to an HTTP status at the edge. Mid-body streaming failures are
//! represented separately since they can no longer be mapped to a status
//! code once the response has started.

use http::StatusCode;

/// A type alias for `anyhow::Error`, used for transport/parse failures that
/// don't need their own variant because the caller only logs them.
pub type AnyError = anyhow::Error;
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("malformed stream epoch selector: {0}")]
    BadSelector(String),

    #[error("unknown group-by key: {0}")]
    BadGroupKey(String),

    #[error("no data")]
    NoData,

    #[error("timed out waiting for a concurrency slot on {url}")]
    SlotTimeout { url: String },

    #[error("upstream routing service unavailable: {0}")]
    UpstreamUnavailable(#[from] AnyError),

    #[error("streaming error after response start: {0}")]
    Streaming(String),

    #[error("413 splitting is not implemented")]
    NotImplemented,
}

impl GatewayError {
    /// Maps a pre-streaming error to the status code the client should see.
    ///
    /// Has no meaningful answer for [`GatewayError::Streaming`] or
    /// [`GatewayError::NotImplemented`]: the former truncates an
    /// already-started connection instead, the latter is logged and never
    /// surfaced to a caller.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadSelector(_) => StatusCode::BAD_REQUEST,
            GatewayError::BadGroupKey(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoData => StatusCode::NO_CONTENT,
            GatewayError::SlotTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Streaming(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NotImplemented => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
