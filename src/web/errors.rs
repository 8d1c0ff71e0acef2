use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::error;
use thiserror::Error;

/// Failures surfaced by the tracking gateway. An undecodable or unresolvable
/// tracking link means tampering or corruption, so it fails loudly instead
/// of silently redirecting nowhere; everything recipients can trigger by
/// normal means stays invisible to them.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("bad tracking link: mail hash {hash}")]
    BadTrackingLink { hash: String },
}

impl IntoResponse for TrackingError {
    fn into_response(self) -> Response {
        error!("[web] {}", self);
        match self {
            TrackingError::BadTrackingLink { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "bad tracking link").into_response()
            }
        }
    }
}
