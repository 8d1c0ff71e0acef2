use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use log::{debug, info, warn};
use serde::Deserialize;

use super::fingerprint;
use crate::queue::RecordingJob;
use crate::rewrite;
use crate::web::errors::TrackingError;
use crate::web::AppState;

#[derive(Deserialize)]
pub struct ClearLinkParams {
    #[serde(default)]
    l: String,
    #[serde(default)]
    h: String,
}

/// `/l/:url/:hash`: destination carried as slash-substituted base64.
pub async fn redirect_encoded(
    State(state): State<AppState>,
    Path((url, hash)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let decoded = match rewrite::decode_url(&url) {
        Some(decoded) => decoded,
        None => {
            warn!("[web] undecodable tracking link hash={}", hash);
            return TrackingError::BadTrackingLink { hash }.into_response();
        }
    };
    link_clicked(state, headers, decoded, hash).await
}

/// `/n?l=&h=`: destination passed in the clear, no decoding step.
pub async fn redirect_clear(
    State(state): State<AppState>,
    Query(params): Query<ClearLinkParams>,
    headers: HeaderMap,
) -> Response {
    link_clicked(state, headers, params.l, params.h).await
}

async fn link_clicked(state: AppState, headers: HeaderMap, url: String, hash: String) -> Response {
    if url.is_empty() || hash.is_empty() {
        warn!("[web] tracking link with empty url or hash");
        return TrackingError::BadTrackingLink { hash }.into_response();
    }
    if !rewrite::is_trackable_url(&url) {
        warn!("[web] tracking link resolves to invalid url hash={}", hash);
        return TrackingError::BadTrackingLink { hash }.into_response();
    }

    let lookup = hash.clone();
    let message = state
        .blocking_db(move |db| db.find_message_by_hash(&lookup))
        .await;
    let message = match message {
        Some(message) => message,
        None => return TrackingError::BadTrackingLink { hash }.into_response(),
    };

    let fp = fingerprint(&headers);
    if !state.config.filter_client_clicks || state.classifier.is_genuine(&fp) {
        info!("[web] recording click hash={}, url={}", message.hash, url);
        state.queue.enqueue(RecordingJob::Click {
            message_id: message.id,
            hash: message.hash,
            url: url.clone(),
            domain: request_domain(&headers),
        });
    } else {
        debug!("[web] click rejected by classifier hash={}", hash);
    }

    // the recipient reaches their destination no matter what the classifier said
    (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
}

/// Tenant label for a click: the subdomain of the request host, or the host
/// itself when it has no subdomain.
fn request_domain(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let host = host.split(':').next().unwrap_or(host);
    match host.split_once('.') {
        Some((subdomain, rest)) if !rest.is_empty() => subdomain.to_string(),
        _ => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn host_headers(host: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static(host));
        headers
    }

    #[test]
    fn request_domain_extracts_subdomain() {
        assert_eq!(request_domain(&host_headers("demo.lp.test")), "demo");
        assert_eq!(request_domain(&host_headers("demo.lp.test:8080")), "demo");
        assert_eq!(request_domain(&host_headers("localhost")), "localhost");
        assert_eq!(request_domain(&HeaderMap::new()), "");
    }
}
