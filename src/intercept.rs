use log::{debug, error, info};

use crate::config::TrackerConfig;
use crate::db::{self, Database, NewTrackedMessage};
use crate::events::{EventBus, TrackerEvent};
use crate::hash;
use crate::rewrite::ContentRewriter;

/// Senders set this header to opt a message out of tracking. It is removed
/// before transmission so recipients never see it.
pub const NO_TRACK_HEADER: &str = "X-No-Track";
/// Carries the tracking handle(s) on the outbound message, one value per
/// recipient, so the provider-assigned id can be matched back after send.
pub const HASH_HEADER: &str = "X-Mailer-Hash";

const CONTENT_CAP: usize = 65535;
const CONTENT_TRUNCATE_AT: usize = 65532;

const MAX_HASH_ATTEMPTS: usize = 5;

#[derive(Clone, Debug, Default)]
pub struct Mailbox {
    pub name: String,
    pub address: String,
}

impl Mailbox {
    pub fn new(name: &str, address: &str) -> Self {
        Mailbox {
            name: name.to_string(),
            address: address.to_string(),
        }
    }

    pub fn display(&self) -> String {
        if self.name.is_empty() {
            format!("<{}>", self.address)
        } else {
            format!("{} <{}>", self.name, self.address)
        }
    }
}

/// The outbound message as exposed by the sending layer: the interceptor
/// reads and mutates the HTML body and headers before transmission, and
/// reads the header list afterwards. Text parts are never touched.
#[derive(Clone, Debug, Default)]
pub struct OutboundEmail {
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl OutboundEmail {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn serialize_headers(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out
    }
}

/// Hooks the sending layer calls around each transmission. One tracked row
/// per recipient; the shared HTML body carries the first recipient's handle
/// (see DESIGN.md on fan-out).
pub struct SendInterceptor {
    db: Database,
    config: TrackerConfig,
    events: EventBus,
    rewriter: ContentRewriter,
}

impl SendInterceptor {
    pub fn new(db: Database, config: TrackerConfig, events: EventBus) -> Self {
        let rewriter = ContentRewriter::new(
            &config.base_url,
            config.track_opens,
            config.track_links,
        );
        SendInterceptor {
            db,
            config,
            events,
            rewriter,
        }
    }

    /// Instrument the message and persist its tracking rows. Runs before
    /// the transport takes over; also performs opportunistic retention
    /// housekeeping, so stale rows age out as long as mail keeps flowing.
    pub fn before_send(&self, email: &mut OutboundEmail) {
        if email.header(NO_TRACK_HEADER).is_some() {
            email.remove_header(NO_TRACK_HEADER);
            debug!("[intercept] do-not-track header present, leaving message untouched");
        } else {
            self.create_trackers(email);
        }

        if let Err(e) = self.db.delete_expired(self.config.expire_days) {
            error!("[intercept] retention purge failed: {}", e);
        }
    }

    /// Record the provider-assigned message id once the transport reports
    /// it, so later delivery/bounce/complaint notifications can be matched.
    pub fn after_send(&self, email: &OutboundEmail, provider_message_id: Option<&str>) {
        let message_id = match provider_message_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                debug!("[intercept] no provider message id to record");
                return;
            }
        };
        for hash in email.header_values(HASH_HEADER) {
            self.db.set_provider_message_id(hash, message_id);
        }
    }

    fn create_trackers(&self, email: &mut OutboundEmail) {
        let recipients = email.to.clone();
        if recipients.is_empty() {
            debug!("[intercept] message has no recipients, nothing to track");
            return;
        }

        let sender = email.from.display();
        let content = if self.config.log_content {
            email.html_body.as_deref().map(truncate_content)
        } else {
            None
        };

        let mut link_urls: Vec<String> = Vec::new();
        for (idx, recipient) in recipients.iter().enumerate() {
            let (row_id, hash) =
                match self.create_tracker(email, &sender, recipient, content.clone()) {
                    Some(created) => created,
                    None => continue,
                };

            if idx == 0 {
                if let Some(html) = email.html_body.clone() {
                    let outcome = self.rewriter.add_trackers(&html, &hash);
                    link_urls = outcome.urls;
                    email.html_body = Some(outcome.html);
                }
            }

            for url in &link_urls {
                if let Err(e) =
                    self.db
                        .register_link(row_id, url, &hash, &self.config.app_domain)
                {
                    error!("[intercept] failed to register link {}: {}", url, e);
                }
            }

            info!(
                "[intercept] tracking message hash={}, recipient={}",
                hash, recipient.address
            );
            self.events.publish(TrackerEvent::EmailSent {
                message_id: row_id,
                hash,
            });
        }
    }

    /// Generate a handle and insert the row, regenerating on a hash
    /// collision. The unique constraint is the arbiter; an existence check
    /// alone would race with concurrent senders.
    fn create_tracker(
        &self,
        email: &mut OutboundEmail,
        sender: &str,
        recipient: &Mailbox,
        content: Option<String>,
    ) -> Option<(i64, String)> {
        for attempt in 0..MAX_HASH_ATTEMPTS {
            let hash = hash::generate();
            let mut headers = email.serialize_headers();
            headers.push_str(HASH_HEADER);
            headers.push_str(": ");
            headers.push_str(&hash);
            headers.push_str("\r\n");

            let fields = NewTrackedMessage {
                hash: hash.clone(),
                domain: self.config.app_domain.clone(),
                sender: sender.to_string(),
                recipient: recipient.display(),
                subject: email.subject.clone(),
                headers,
                content: content.clone(),
            };
            match self.db.create_message(&fields) {
                Ok(id) => {
                    email.add_header(HASH_HEADER, &hash);
                    return Some((id, hash));
                }
                Err(e) if db::is_unique_violation(&e) => {
                    debug!(
                        "[intercept] hash collision on attempt {}, regenerating",
                        attempt + 1
                    );
                }
                Err(e) => {
                    error!("[intercept] failed to create tracked message: {}", e);
                    return None;
                }
            }
        }
        error!(
            "[intercept] gave up creating tracked message after {} hash collisions",
            MAX_HASH_ATTEMPTS
        );
        None
    }
}

/// Cap captured content so one enormous campaign body cannot bloat the
/// store. Truncation respects UTF-8 boundaries.
fn truncate_content(content: &str) -> String {
    if content.len() <= CONTENT_CAP {
        return content.to_string();
    }
    let mut end = CONTENT_TRUNCATE_AT;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &content[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_display_with_and_without_name() {
        assert_eq!(
            Mailbox::new("Jo Smith", "jo@example.com").display(),
            "Jo Smith <jo@example.com>"
        );
        assert_eq!(Mailbox::new("", "jo@example.com").display(), "<jo@example.com>");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut email = OutboundEmail::default();
        email.add_header("X-No-Track", "1");
        assert!(email.header("x-no-track").is_some());
        email.remove_header("X-NO-TRACK");
        assert!(email.header("X-No-Track").is_none());
    }

    #[test]
    fn repeated_headers_keep_every_value() {
        let mut email = OutboundEmail::default();
        email.add_header(HASH_HEADER, "aaa");
        email.add_header(HASH_HEADER, "bbb");
        let values: Vec<&str> = email.header_values(HASH_HEADER).collect();
        assert_eq!(values, vec!["aaa", "bbb"]);
        assert_eq!(
            email.serialize_headers(),
            "X-Mailer-Hash: aaa\r\nX-Mailer-Hash: bbb\r\n"
        );
    }

    #[test]
    fn short_content_is_untouched() {
        assert_eq!(truncate_content("<p>hello</p>"), "<p>hello</p>");
    }

    #[test]
    fn oversized_content_is_capped_with_ellipsis() {
        let content = "x".repeat(CONTENT_CAP + 100);
        let truncated = truncate_content(&content);
        assert_eq!(truncated.len(), CONTENT_TRUNCATE_AT + 3);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn truncation_does_not_split_multibyte_chars() {
        // é is two bytes; an odd cap position must back off to a boundary
        let content = "é".repeat(40000);
        let truncated = truncate_content(&content);
        assert!(truncated.len() <= CONTENT_TRUNCATE_AT + 3);
        assert!(truncated.ends_with("..."));
        // must still be valid UTF-8 all the way through (no panic above)
        assert!(truncated.chars().count() > 0);
    }
}
