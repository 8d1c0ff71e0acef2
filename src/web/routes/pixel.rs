use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use log::{debug, info};

use super::fingerprint;
use crate::queue::RecordingJob;
use crate::web::AppState;

/// Fixed 1x1 transparent GIF, 42 bytes.
pub const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xff, 0xff,
    0xff, 0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Serve the tracking pixel. The image always comes back identical (an
/// unknown hash must be indistinguishable from a known one); only a
/// resolvable hash with an approved fingerprint enqueues an open record.
pub async fn serve(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    debug!("[web] GET /t — pixel request hash={}", hash);

    if !hash.is_empty() {
        let lookup = hash.clone();
        let message = state
            .blocking_db(move |db| db.find_message_by_hash(&lookup))
            .await;
        match message {
            Some(message) => {
                let fp = fingerprint(&headers);
                if !state.config.filter_client_clicks || state.classifier.is_genuine(&fp) {
                    info!("[web] recording open hash={}", message.hash);
                    state.queue.enqueue(RecordingJob::Open {
                        message_id: message.id,
                        hash: message.hash,
                    });
                } else {
                    debug!("[web] open rejected by classifier hash={}", hash);
                }
            }
            None => debug!("[web] unknown pixel hash={}, serving image silently", hash),
        }
    }

    pixel_response()
}

fn pixel_response() -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CONTENT_LENGTH, "42"),
            (
                header::CACHE_CONTROL,
                "private, no-cache, no-cache=Set-Cookie, proxy-revalidate",
            ),
            (header::EXPIRES, "Wed, 11 Jan 2000 12:59:00 GMT"),
            (header::LAST_MODIFIED, "Wed, 11 Jan 2006 12:59:00 GMT"),
            (header::PRAGMA, "no-cache"),
        ],
        PIXEL_GIF,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_is_a_42_byte_gif89a() {
        assert_eq!(PIXEL_GIF.len(), 42);
        assert_eq!(&PIXEL_GIF[..6], b"GIF89a");
        assert_eq!(PIXEL_GIF[42 - 1], 0x3b); // trailer byte
    }
}
