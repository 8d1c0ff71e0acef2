use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;
use regex::Regex;
use url::Url;

/// Result of running the rewriter over an HTML body: the instrumented
/// markup plus every distinct destination URL that was routed through the
/// click endpoint, in order of first appearance.
pub struct RewriteOutcome {
    pub html: String,
    pub urls: Vec<String>,
}

pub struct ContentRewriter {
    base_url: String,
    track_opens: bool,
    track_links: bool,
    body_close: Regex,
    anchor_href: Regex,
}

impl ContentRewriter {
    pub fn new(base_url: &str, track_opens: bool, track_links: bool) -> Self {
        ContentRewriter {
            base_url: base_url.trim_end_matches('/').to_string(),
            track_opens,
            track_links,
            body_close: Regex::new(r"(?i)</body\s*>").expect("Invalid body regex"),
            anchor_href: Regex::new(r#"(?i)(<a[^>]*href=['"])([^'"]*)"#)
                .expect("Invalid anchor regex"),
        }
    }

    /// Instrument an HTML body with the given tracking handle. Regex driven
    /// and best-effort: markup the patterns do not match passes through
    /// byte-identical, malformed HTML never raises.
    pub fn add_trackers(&self, html: &str, hash: &str) -> RewriteOutcome {
        let mut urls = Vec::new();
        let mut out = html.to_string();
        if self.track_links {
            out = self.rewrite_links(&out, hash, &mut urls);
        }
        if self.track_opens {
            out = self.inject_pixel(&out, hash);
        }
        RewriteOutcome { html: out, urls }
    }

    fn inject_pixel(&self, html: &str, hash: &str) -> String {
        let pixel = format!(
            r#"<img border=0 width=1 alt="" height=1 src="{}/t/{}" />"#,
            self.base_url, hash
        );
        if let Some(m) = self.body_close.find(html) {
            debug!("[rewrite] injecting pixel before closing body tag hash={}", hash);
            let mut out = String::with_capacity(html.len() + pixel.len());
            out.push_str(&html[..m.start()]);
            out.push_str(&pixel);
            out.push_str(&html[m.start()..]);
            out
        } else {
            debug!("[rewrite] no closing body tag, appending pixel hash={}", hash);
            format!("{}{}", html, pixel)
        }
    }

    fn rewrite_links(&self, html: &str, hash: &str, urls: &mut Vec<String>) -> String {
        self.anchor_href
            .replace_all(html, |caps: &regex::Captures| {
                let target = caps[2].replace("&amp;", "&");
                if !is_trackable_url(&target) {
                    return caps[0].to_string();
                }
                if !urls.contains(&target) {
                    urls.push(target.clone());
                }
                format!(
                    "{}{}/l/{}/{}",
                    &caps[1],
                    self.base_url,
                    encode_url(&target),
                    hash
                )
            })
            .into_owned()
    }
}

/// Only absolute http(s) URLs with a host are routed through the click
/// endpoint; everything else (relative paths, anchors, mailto) is left for
/// the mail client to resolve.
pub fn is_trackable_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            (parsed.scheme() == "http" || parsed.scheme() == "https") && parsed.has_host()
        }
        Err(_) => false,
    }
}

/// Base64 with `/` swapped for `$` so the token survives as a single URL
/// path segment.
pub fn encode_url(url: &str) -> String {
    BASE64.encode(url).replace('/', "$")
}

pub fn decode_url(encoded: &str) -> Option<String> {
    let restored = encoded.replace('$', "/");
    let bytes = BASE64.decode(restored).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> ContentRewriter {
        ContentRewriter::new("https://track.example.com", true, true)
    }

    #[test]
    fn injects_pixel_before_closing_body_tag() {
        let out = rewriter().add_trackers("<html><body><p>Hi</p></body></html>", "abc123");
        assert!(out
            .html
            .contains(r#"src="https://track.example.com/t/abc123""#));
        let pixel_pos = out.html.find("<img").unwrap();
        let body_pos = out.html.find("</body>").unwrap();
        assert!(pixel_pos < body_pos);
    }

    #[test]
    fn appends_pixel_without_body_tag() {
        let out = rewriter().add_trackers("<p>Hi</p>", "abc123");
        assert!(out.html.ends_with("/>"));
        assert!(out.html.starts_with("<p>Hi</p><img"));
    }

    #[test]
    fn pixel_only_when_link_tracking_disabled() {
        let rw = ContentRewriter::new("https://track.example.com", true, false);
        let out = rw.add_trackers(r#"<a href="https://example.com/x">go</a>"#, "h");
        assert!(out.html.contains(r#"href="https://example.com/x""#));
        assert!(out.urls.is_empty());
        assert!(out.html.contains("/t/h"));
    }

    #[test]
    fn rewrites_absolute_links_and_collects_urls() {
        let out = rewriter().add_trackers(
            r#"<a href="https://example.com/page?a=1&amp;b=2">go</a>"#,
            "h4sh",
        );
        let expected = format!(
            "https://track.example.com/l/{}/h4sh",
            encode_url("https://example.com/page?a=1&b=2")
        );
        assert!(out.html.contains(&expected));
        assert_eq!(out.urls, vec!["https://example.com/page?a=1&b=2".to_string()]);
    }

    #[test]
    fn repeated_urls_are_collected_once() {
        let html = r#"<a href="https://example.com/x">one</a> <a href="https://example.com/x">two</a>"#;
        let out = rewriter().add_trackers(html, "h");
        assert_eq!(out.urls.len(), 1);
    }

    #[test]
    fn leaves_relative_and_mailto_links_alone() {
        let html = r#"<a href="/local">a</a><a href="mailto:x@y.com">b</a><a href="">c</a>"#;
        let out = rewriter().add_trackers(html, "h");
        assert!(out.html.contains(r#"href="/local""#));
        assert!(out.html.contains(r#"href="mailto:x@y.com""#));
        assert!(out.html.contains(r#"href="""#));
        assert!(out.urls.is_empty());
    }

    #[test]
    fn malformed_html_passes_through_without_panic() {
        let html = "<a href='https://example.com/ok'>x</a><a href=<<<broken";
        let out = rewriter().add_trackers(html, "h");
        assert_eq!(out.urls, vec!["https://example.com/ok".to_string()]);
    }

    #[test]
    fn encode_decode_round_trip_preserves_query_ampersands() {
        let url = "https://example.com/path/deep?page=3&x=a%20b&y=z";
        let encoded = encode_url(url);
        assert!(!encoded.contains('/'));
        assert_eq!(decode_url(&encoded).as_deref(), Some(url));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_url("!!!not-base64!!!").is_none());
        // valid base64, invalid utf-8
        let raw = BASE64.encode([0xff, 0xfe, 0xfd]);
        assert!(decode_url(&raw).is_none());
    }

    #[test]
    fn trackable_url_filter() {
        assert!(is_trackable_url("https://example.com/a"));
        assert!(is_trackable_url("http://example.com"));
        assert!(!is_trackable_url("ftp://example.com/a"));
        assert!(!is_trackable_url("mailto:a@b.com"));
        assert!(!is_trackable_url("/relative"));
        assert!(!is_trackable_url(""));
    }
}
