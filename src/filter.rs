use log::{debug, error, info};
use mailparse::MailHeaderMap;
use std::io::{self, Read, Write};

use crate::config::TrackerConfig;
use crate::db::Database;
use crate::events::EventBus;
use crate::intercept::{Mailbox, OutboundEmail, SendInterceptor};

/// Postfix-style pipe filter: the raw message arrives on stdin, the
/// (possibly instrumented) message leaves on stdout for reinjection. Any
/// failure mode falls back to passing the original bytes through; a broken
/// tracker must never eat mail.
pub fn run_filter(config: &TrackerConfig, sender: &str, recipients: &[String]) {
    debug!("[filter] reading message from stdin");
    let mut raw = String::new();
    io::stdin()
        .read_to_string(&mut raw)
        .expect("Failed to read message from stdin");
    info!("[filter] read message from stdin ({} bytes)", raw.len());

    let db = match Database::try_open(&config.database_url) {
        Ok(db) => db,
        Err(e) => {
            error!("[filter] database unavailable, passing message through: {}", e);
            emit(raw.as_bytes());
            return;
        }
    };

    let (mut email, rewritable) = match parse_outbound(&raw, sender, recipients) {
        Some(parsed) => parsed,
        None => {
            error!("[filter] unparseable message, passing through unmodified");
            emit(raw.as_bytes());
            return;
        }
    };
    if !rewritable {
        debug!("[filter] message body is not rewritable HTML, tracking headers only");
    }

    let original_body = email.html_body.clone();
    let original_header_count = email.headers.len();

    let interceptor = SendInterceptor::new(db, config.clone(), EventBus::new());
    interceptor.before_send(&mut email);

    let untouched =
        email.headers.len() == original_header_count && email.html_body == original_body;
    if untouched {
        emit(raw.as_bytes());
        return;
    }

    let body = email
        .html_body
        .as_deref()
        .or(email.text_body.as_deref())
        .unwrap_or_default();
    let mut out = email.serialize_headers();
    out.push_str("\r\n");
    out.push_str(body);
    emit(out.as_bytes());
    info!("[filter] instrumented message written to stdout");
}

fn emit(bytes: &[u8]) {
    let mut stdout = io::stdout();
    stdout.write_all(bytes).expect("Failed to write to stdout");
    stdout.flush().expect("Failed to flush stdout");
}

/// Build the interceptor's view of the message from its raw form. Returns
/// the email plus whether the body is safe to rewrite in place: single-part
/// text/html with a plain transfer encoding. Encoded (base64 or
/// quoted-printable) and multipart bodies pass through untouched, since
/// string rewriting inside an encoded part would corrupt it.
fn parse_outbound(
    raw: &str,
    sender: &str,
    recipients: &[String],
) -> Option<(OutboundEmail, bool)> {
    let parsed = mailparse::parse_mail(raw.as_bytes()).ok()?;

    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect();

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default();

    let from = parsed
        .headers
        .get_first_value("From")
        .and_then(|v| mailparse::addrparse(&v).ok())
        .and_then(|list| list.extract_single_info())
        .map(|info| Mailbox::new(info.display_name.as_deref().unwrap_or(""), &info.addr))
        .unwrap_or_else(|| Mailbox::new("", sender));

    let to: Vec<Mailbox> = recipients.iter().map(|r| Mailbox::new("", r)).collect();

    let is_html = parsed.ctype.mimetype == "text/html";
    let plain_encoding = parsed
        .headers
        .get_first_value("Content-Transfer-Encoding")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "7bit" | "8bit" | "binary"))
        .unwrap_or(true);
    let rewritable = is_html && plain_encoding;

    let body = raw
        .split_once("\r\n\r\n")
        .or_else(|| raw.split_once("\n\n"))
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();

    let mut email = OutboundEmail {
        from,
        to,
        subject,
        html_body: None,
        text_body: None,
        headers,
    };
    if rewritable {
        email.html_body = Some(body);
    } else {
        email.text_body = Some(body);
    }
    Some((email, rewritable))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML_MESSAGE: &str = "From: Jo <jo@example.com>\r\n\
        To: pat@example.com\r\n\
        Subject: Hello\r\n\
        Content-Type: text/html; charset=utf-8\r\n\
        \r\n\
        <html><body><p>Hi</p></body></html>";

    #[test]
    fn html_message_is_rewritable() {
        let (email, rewritable) =
            parse_outbound(HTML_MESSAGE, "jo@example.com", &["pat@example.com".to_string()])
                .unwrap();
        assert!(rewritable);
        assert_eq!(email.subject, "Hello");
        assert_eq!(email.from.name, "Jo");
        assert_eq!(email.from.address, "jo@example.com");
        assert_eq!(email.to[0].address, "pat@example.com");
        assert_eq!(
            email.html_body.as_deref(),
            Some("<html><body><p>Hi</p></body></html>")
        );
    }

    #[test]
    fn plain_text_message_is_not_rewritable() {
        let raw = "From: jo@example.com\r\nContent-Type: text/plain\r\n\r\nhello";
        let (email, rewritable) = parse_outbound(raw, "jo@example.com", &[]).unwrap();
        assert!(!rewritable);
        assert!(email.html_body.is_none());
        assert_eq!(email.text_body.as_deref(), Some("hello"));
    }

    #[test]
    fn base64_encoded_html_is_not_rewritable() {
        let raw = "From: jo@example.com\r\n\
            Content-Type: text/html\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            PGh0bWw+PC9odG1sPg==";
        let (_, rewritable) = parse_outbound(raw, "jo@example.com", &[]).unwrap();
        assert!(!rewritable);
    }

    #[test]
    fn falls_back_to_envelope_sender_without_from_header() {
        let raw = "Subject: x\r\nContent-Type: text/html\r\n\r\n<p>x</p>";
        let (email, _) = parse_outbound(raw, "envelope@example.com", &[]).unwrap();
        assert_eq!(email.from.address, "envelope@example.com");
    }
}
