use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::db::Database;
use crate::events::EventBus;
use crate::feedback::SesNotification;
use crate::recorder;

/// Recording work deferred off the request path.
#[derive(Clone, Debug)]
pub enum RecordingJob {
    Open {
        message_id: i64,
        hash: String,
    },
    Click {
        message_id: i64,
        hash: String,
        url: String,
        domain: String,
    },
    Delivery {
        notification: SesNotification,
    },
    Bounce {
        notification: SesNotification,
        raw: serde_json::Value,
    },
    Complaint {
        notification: SesNotification,
    },
}

impl RecordingJob {
    fn kind(&self) -> &'static str {
        match self {
            RecordingJob::Open { .. } => "open",
            RecordingJob::Click { .. } => "click",
            RecordingJob::Delivery { .. } => "delivery",
            RecordingJob::Bounce { .. } => "bounce",
            RecordingJob::Complaint { .. } => "complaint",
        }
    }
}

struct QueuedJob {
    id: Uuid,
    job: RecordingJob,
    first_attempt: DateTime<Utc>,
    attempts: u32,
}

/// At-least-once in-process queue: failed jobs are re-enqueued with backoff
/// until the retry horizon passes, then dropped with an error log. Enqueue
/// never blocks the caller.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
}

impl JobQueue {
    pub fn start(db: Database, events: EventBus, retry_days: i64) -> JobQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(db, events, tx.clone(), rx, retry_days));
        JobQueue { tx }
    }

    pub fn enqueue(&self, job: RecordingJob) {
        let queued = QueuedJob {
            id: Uuid::new_v4(),
            job,
            first_attempt: Utc::now(),
            attempts: 0,
        };
        debug!(
            "[queue] enqueuing {} job id={}",
            queued.job.kind(),
            queued.id
        );
        if self.tx.send(queued).is_err() {
            error!("[queue] recording worker has stopped, job dropped");
        }
    }
}

async fn worker(
    db: Database,
    events: EventBus,
    tx: mpsc::UnboundedSender<QueuedJob>,
    mut rx: mpsc::UnboundedReceiver<QueuedJob>,
    retry_days: i64,
) {
    info!("[queue] recording worker started, retry horizon {} days", retry_days);
    while let Some(mut queued) = rx.recv().await {
        match execute(&db, &events, queued.job.clone()).await {
            Ok(()) => debug!("[queue] {} job id={} completed", queued.job.kind(), queued.id),
            Err(e) => {
                let age = Utc::now().signed_duration_since(queued.first_attempt);
                if age < chrono::Duration::days(retry_days) {
                    queued.attempts += 1;
                    let delay = retry_delay(queued.attempts);
                    warn!(
                        "[queue] {} job id={} failed (attempt {}), retrying in {}s: {}",
                        queued.job.kind(),
                        queued.id,
                        queued.attempts,
                        delay.as_secs(),
                        e
                    );
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(queued);
                    });
                } else {
                    error!(
                        "[queue] {} job id={} abandoned after {} attempts: {}",
                        queued.job.kind(),
                        queued.id,
                        queued.attempts,
                        e
                    );
                }
            }
        }
    }
}

fn retry_delay(attempts: u32) -> Duration {
    // 2s, 4s, 8s, ... capped at five minutes
    Duration::from_secs(2u64.saturating_pow(attempts.min(16)).min(300))
}

/// Run one recording operation. The synchronous postgres client gets its own
/// thread; it cannot run inside the tokio runtime (see web::AppState).
async fn execute(db: &Database, events: &EventBus, job: RecordingJob) -> Result<(), String> {
    let db = db.clone();
    let events = events.clone();
    let (tx, rx) = oneshot::channel();

    std::thread::spawn(move || {
        let result = match &job {
            RecordingJob::Open { message_id, hash } => {
                recorder::record_open(&db, &events, *message_id, hash)
            }
            RecordingJob::Click {
                message_id,
                hash,
                url,
                domain,
            } => recorder::record_click(&db, &events, *message_id, hash, url, domain),
            RecordingJob::Delivery { notification } => {
                recorder::record_delivery(&db, &events, notification)
            }
            RecordingJob::Bounce { notification, raw } => {
                recorder::record_bounce(&db, &events, notification, raw)
            }
            RecordingJob::Complaint { notification } => {
                recorder::record_complaint(&db, &events, notification)
            }
        };
        let _ = tx.send(result.map_err(|e| e.to_string()));
    });

    rx.await
        .unwrap_or_else(|_| Err("recording thread panicked".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_backs_off_and_caps() {
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(4));
        assert_eq!(retry_delay(3), Duration::from_secs(8));
        assert_eq!(retry_delay(10), Duration::from_secs(300));
        assert_eq!(retry_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn job_kinds_are_stable_labels() {
        let job = RecordingJob::Open {
            message_id: 1,
            hash: "h".to_string(),
        };
        assert_eq!(job.kind(), "open");
    }
}
