use log::{info, warn};
use serde::{Deserialize, Serialize};
use url::Url;

// ── Provider envelope ──

/// Outer SNS envelope as POSTed to the webhook.
#[derive(Clone, Debug, Deserialize)]
pub struct SnsEnvelope {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "TopicArn", default)]
    pub topic_arn: Option<String>,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    #[serde(rename = "SubscribeURL", default)]
    pub subscribe_url: Option<String>,
    #[serde(rename = "SigningCertURL", default)]
    pub signing_cert_url: Option<String>,
}

impl SnsEnvelope {
    pub fn parse(body: &str) -> Option<SnsEnvelope> {
        match serde_json::from_str(body) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("[feedback] unparseable notification envelope: {}", e);
                None
            }
        }
    }

    /// Exact-match topic validation; an unconfigured topic accepts anything.
    pub fn topic_matches(&self, expected: Option<&str>) -> bool {
        match expected {
            Some(expected) => self.topic_arn.as_deref() == Some(expected),
            None => true,
        }
    }

    /// The signing certificate must at least live on the provider's own
    /// domain. Full signature verification is delegated to the fronting
    /// proxy (see DESIGN.md).
    pub fn cert_url_is_trusted(&self) -> bool {
        match &self.signing_cert_url {
            None => true,
            Some(raw) => Url::parse(raw)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.ends_with(".amazonaws.com")))
                .unwrap_or(false),
        }
    }
}

// ── Inner notification (SES-style) ──

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SesNotification {
    pub notification_type: String,
    pub mail: MailObject,
    #[serde(default)]
    pub delivery: Option<DeliveryInfo>,
    #[serde(default)]
    pub bounce: Option<BounceInfo>,
    #[serde(default)]
    pub complaint: Option<ComplaintInfo>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailObject {
    pub message_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryInfo {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub smtp_response: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BounceInfo {
    #[serde(default)]
    pub bounce_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub bounced_recipients: Vec<BouncedRecipient>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BouncedRecipient {
    pub email_address: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub diagnostic_code: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintInfo {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub complaint_feedback_type: Option<String>,
    #[serde(default)]
    pub complained_recipients: Vec<ComplainedRecipient>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplainedRecipient {
    pub email_address: String,
}

impl BounceInfo {
    pub fn is_permanent(&self) -> bool {
        self.bounce_type.as_deref() == Some("Permanent")
    }
}

/// Parse the embedded notification, returning the typed view alongside the
/// raw value kept for the audit trail.
pub fn parse_notification(raw: &str) -> Option<(SesNotification, serde_json::Value)> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("[feedback] unparseable notification payload: {}", e);
            return None;
        }
    };
    match serde_json::from_value(value.clone()) {
        Ok(typed) => Some((typed, value)),
        Err(e) => {
            warn!("[feedback] notification missing required fields: {}", e);
            None
        }
    }
}

/// Complete the provider's subscription handshake by fetching the callback
/// URL it supplied.
pub async fn confirm_subscription(subscribe_url: &str) -> Result<(), reqwest::Error> {
    info!("[feedback] confirming subscription via {}", subscribe_url);
    reqwest::get(subscribe_url).await?.error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(topic: &str) -> SnsEnvelope {
        SnsEnvelope::parse(&format!(
            r#"{{"Type":"Notification","TopicArn":"{}","Message":"{{}}"}}"#,
            topic
        ))
        .unwrap()
    }

    #[test]
    fn topic_check_is_exact_when_configured() {
        let env = envelope("arn:aws:sns:us-east-1:123:ses-feedback");
        assert!(env.topic_matches(Some("arn:aws:sns:us-east-1:123:ses-feedback")));
        assert!(!env.topic_matches(Some("arn:aws:sns:us-east-1:123:other")));
        assert!(env.topic_matches(None));
    }

    #[test]
    fn cert_url_must_be_on_provider_domain() {
        let mut env = envelope("arn");
        env.signing_cert_url =
            Some("https://sns.us-east-1.amazonaws.com/cert.pem".to_string());
        assert!(env.cert_url_is_trusted());
        env.signing_cert_url = Some("https://evil.example.com/cert.pem".to_string());
        assert!(!env.cert_url_is_trusted());
        env.signing_cert_url = None;
        assert!(env.cert_url_is_trusted());
    }

    #[test]
    fn parses_bounce_notification() {
        let raw = r#"{
            "notificationType": "Bounce",
            "mail": {"messageId": "msg-1"},
            "bounce": {
                "bounceType": "Permanent",
                "bouncedRecipients": [
                    {"emailAddress": "gone@example.com", "status": "5.1.1",
                     "action": "failed", "diagnosticCode": "smtp; 550"}
                ]
            }
        }"#;
        let (typed, value) = parse_notification(raw).unwrap();
        assert_eq!(typed.notification_type, "Bounce");
        assert_eq!(typed.mail.message_id, "msg-1");
        let bounce = typed.bounce.unwrap();
        assert!(bounce.is_permanent());
        assert_eq!(bounce.bounced_recipients[0].email_address, "gone@example.com");
        assert_eq!(value["bounce"]["bounceType"], "Permanent");
    }

    #[test]
    fn parses_delivery_notification() {
        let raw = r#"{
            "notificationType": "Delivery",
            "mail": {"messageId": "msg-2"},
            "delivery": {
                "timestamp": "2026-08-01T10:00:00.000Z",
                "smtpResponse": "250 2.0.0 OK",
                "recipients": ["rcpt@example.com"]
            }
        }"#;
        let (typed, _) = parse_notification(raw).unwrap();
        let delivery = typed.delivery.unwrap();
        assert_eq!(delivery.smtp_response.as_deref(), Some("250 2.0.0 OK"));
        assert_eq!(delivery.recipients, vec!["rcpt@example.com".to_string()]);
    }

    #[test]
    fn parses_complaint_notification() {
        let raw = r#"{
            "notificationType": "Complaint",
            "mail": {"messageId": "msg-3"},
            "complaint": {
                "timestamp": "2026-08-01T10:00:00.000Z",
                "complaintFeedbackType": "abuse",
                "complainedRecipients": [{"emailAddress": "angry@example.com"}]
            }
        }"#;
        let (typed, _) = parse_notification(raw).unwrap();
        let complaint = typed.complaint.unwrap();
        assert_eq!(complaint.complaint_feedback_type.as_deref(), Some("abuse"));
        assert_eq!(complaint.complained_recipients.len(), 1);
    }

    #[test]
    fn rejects_payload_without_mail_object() {
        assert!(parse_notification(r#"{"notificationType":"Bounce"}"#).is_none());
        assert!(parse_notification("not json").is_none());
    }
}
