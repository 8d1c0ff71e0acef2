use log::debug;

use crate::db::{Database, EmailMeta, FailureDetail};
use crate::events::{EventBus, TrackerEvent};
use crate::feedback::{BounceInfo, ComplaintInfo, DeliveryInfo, SesNotification};

// Recording operations run on the job queue, off the request path. Each is
// safe to retry: counter bumps are atomic statements and meta merges only
// add. A retry after a partial failure can double-count an open or click
// (see DESIGN.md).

pub fn record_open(
    db: &Database,
    events: &EventBus,
    message_id: i64,
    hash: &str,
) -> Result<(), postgres::Error> {
    db.increment_opens(message_id)?;
    events.publish(TrackerEvent::EmailViewed {
        message_id,
        hash: hash.to_string(),
    });
    Ok(())
}

pub fn record_click(
    db: &Database,
    events: &EventBus,
    message_id: i64,
    hash: &str,
    url: &str,
    domain: &str,
) -> Result<(), postgres::Error> {
    db.increment_clicks(message_id)?;
    db.record_link_click(message_id, url, hash, domain)?;
    events.publish(TrackerEvent::LinkClicked {
        message_id,
        hash: hash.to_string(),
        url: url.to_string(),
    });
    Ok(())
}

// ── Feedback recording ──

pub fn record_delivery(
    db: &Database,
    events: &EventBus,
    notification: &SesNotification,
) -> Result<(), postgres::Error> {
    let message = match db.find_message_by_provider_id(&notification.mail.message_id) {
        Some(m) => m,
        None => {
            // expected after retention purge
            debug!(
                "[recorder] delivery for unknown message_id={}, dropping",
                notification.mail.message_id
            );
            return Ok(());
        }
    };
    let mut meta = message.meta.clone();
    match &notification.delivery {
        Some(delivery) => apply_delivery(&mut meta, delivery),
        None => meta.success = Some(true),
    }
    db.update_meta(message.id, &meta)?;
    events.publish(TrackerEvent::EmailDelivered {
        message_id: message.id,
        hash: message.hash,
    });
    Ok(())
}

pub fn record_bounce(
    db: &Database,
    events: &EventBus,
    notification: &SesNotification,
    raw: &serde_json::Value,
) -> Result<(), postgres::Error> {
    let message = match db.find_message_by_provider_id(&notification.mail.message_id) {
        Some(m) => m,
        None => {
            debug!(
                "[recorder] bounce for unknown message_id={}, dropping",
                notification.mail.message_id
            );
            return Ok(());
        }
    };
    let bounce = match &notification.bounce {
        Some(bounce) => bounce,
        None => return Ok(()),
    };
    let mut meta = message.meta.clone();
    apply_bounce(&mut meta, bounce, raw);
    db.update_meta(message.id, &meta)?;

    if bounce.is_permanent() {
        for recipient in &bounce.bounced_recipients {
            events.publish(TrackerEvent::PermanentBounce {
                message_id: message.id,
                recipient: recipient.email_address.clone(),
            });
        }
    }
    Ok(())
}

pub fn record_complaint(
    db: &Database,
    events: &EventBus,
    notification: &SesNotification,
) -> Result<(), postgres::Error> {
    let message = match db.find_message_by_provider_id(&notification.mail.message_id) {
        Some(m) => m,
        None => {
            debug!(
                "[recorder] complaint for unknown message_id={}, dropping",
                notification.mail.message_id
            );
            return Ok(());
        }
    };
    let complaint = match &notification.complaint {
        Some(complaint) => complaint,
        None => return Ok(()),
    };
    let mut meta = message.meta.clone();
    apply_complaint(&mut meta, complaint);
    db.update_meta(message.id, &meta)?;

    for recipient in &complaint.complained_recipients {
        events.publish(TrackerEvent::Complaint {
            message_id: message.id,
            recipient: recipient.email_address.clone(),
        });
    }
    Ok(())
}

// ── Meta merges ──
// Pure so the accumulate contract is testable without a database.

pub fn apply_delivery(meta: &mut EmailMeta, delivery: &DeliveryInfo) {
    meta.delivered_at = delivery.timestamp.clone();
    meta.smtp_response = delivery.smtp_response.clone();
    meta.success = Some(true);
}

pub fn apply_bounce(meta: &mut EmailMeta, bounce: &BounceInfo, raw: &serde_json::Value) {
    for recipient in &bounce.bounced_recipients {
        meta.failures.push(FailureDetail {
            email_address: recipient.email_address.clone(),
            status: recipient.status.clone(),
            action: recipient.action.clone(),
            diagnostic_code: recipient.diagnostic_code.clone(),
        });
    }
    meta.success = Some(false);
    // full notification kept for audit
    meta.sns_message_bounce = Some(raw.clone());
}

pub fn apply_complaint(meta: &mut EmailMeta, complaint: &ComplaintInfo) {
    meta.complaint = true;
    meta.complaint_time = complaint.timestamp.clone();
    meta.complaint_type = complaint.complaint_feedback_type.clone();
    meta.success = Some(false);
}
