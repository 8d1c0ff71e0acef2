pub mod link;
pub mod pixel;
pub mod sns;

use axum::http::{header, HeaderMap};
use axum::{
    routing::{get, post},
    Router,
};

use super::AppState;
use crate::classify::RequestFingerprint;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/t/:hash", get(pixel::serve))
        .route("/l/:url/:hash", get(link::redirect_encoded))
        .route("/n", get(link::redirect_clear))
        .route("/sns", post(sns::callback))
}

/// Snapshot of the request metadata the classifier decides on.
pub(crate) fn fingerprint(headers: &HeaderMap) -> RequestFingerprint {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let referer = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let all = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();
    RequestFingerprint {
        user_agent,
        referer,
        headers: all,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn fingerprint_captures_agent_referer_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("TestUA/1.0"));
        headers.insert(header::REFERER, HeaderValue::from_static("https://r.example"));
        headers.insert("X-Purpose", HeaderValue::from_static("preview"));

        let fp = fingerprint(&headers);
        assert_eq!(fp.user_agent, "TestUA/1.0");
        assert_eq!(fp.referer, "https://r.example");
        assert!(fp
            .headers
            .iter()
            .any(|(k, v)| k == "x-purpose" && v == "preview"));
    }
}
