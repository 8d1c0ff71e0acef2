use axum::extract::State;
use log::{debug, info, warn};

use crate::feedback::{self, SnsEnvelope};
use crate::queue::RecordingJob;
use crate::web::AppState;

/// Provider notification webhook. Acknowledgements are short plaintext; a
/// rejected envelope records nothing and says why.
pub async fn callback(State(state): State<AppState>, body: String) -> &'static str {
    let envelope = match SnsEnvelope::parse(&body) {
        Some(envelope) => envelope,
        None => return "invalid notification",
    };

    if !envelope.cert_url_is_trusted() {
        warn!("[web] notification signing certificate not on provider domain, rejecting");
        return "invalid signing certificate";
    }
    if !envelope.topic_matches(state.config.sns_topic.as_deref()) {
        warn!(
            "[web] notification topic {:?} does not match configured topic, rejecting",
            envelope.topic_arn
        );
        return "invalid topic ARN";
    }

    match envelope.kind.as_str() {
        "SubscriptionConfirmation" => {
            if let Some(url) = &envelope.subscribe_url {
                if let Err(e) = feedback::confirm_subscription(url).await {
                    warn!("[web] subscription confirmation fetch failed: {}", e);
                }
            }
            "subscription confirmed"
        }
        "Notification" => {
            process_notification(&state, envelope.message.as_deref().unwrap_or(""));
            "notification processed"
        }
        other => {
            debug!("[web] ignoring notification envelope type {}", other);
            ""
        }
    }
}

fn process_notification(state: &AppState, raw: &str) {
    let (notification, value) = match feedback::parse_notification(raw) {
        Some(parsed) => parsed,
        None => return,
    };
    info!(
        "[web] dispatching {} notification for message_id={}",
        notification.notification_type, notification.mail.message_id
    );
    match notification.notification_type.as_str() {
        "Delivery" => state.queue.enqueue(RecordingJob::Delivery { notification }),
        "Bounce" => state.queue.enqueue(RecordingJob::Bounce {
            notification,
            raw: value,
        }),
        "Complaint" => state.queue.enqueue(RecordingJob::Complaint { notification }),
        other => debug!("[web] ignoring notification type {}", other),
    }
}
