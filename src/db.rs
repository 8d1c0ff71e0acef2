use log::{debug, error, info, warn};
use postgres::error::SqlState;
use postgres::{Client, NoTls};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

pub fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Timestamp string for "older than `days` days ago" comparisons. The stored
/// format sorts lexicographically, so plain string comparison is correct.
pub fn cutoff(days: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::days(days))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Client>>,
}

// ── Row types ──

#[derive(Clone, Debug, Serialize)]
pub struct TrackedMessage {
    pub id: i64,
    pub hash: String,
    pub domain: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub headers: String,
    pub content: Option<String>,
    pub opens: i64,
    pub clicks: i64,
    pub message_id: Option<String>,
    pub meta: EmailMeta,
    pub created_at: String,
}

/// Delivery/bounce/complaint state attached to a tracked message, stored as
/// JSON in the `meta` column. `failures` only ever grows: feedback merges
/// append, they never replace.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EmailMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_response: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureDetail>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub complaint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complaint_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complaint_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sns_message_bounce: Option<serde_json::Value>,
}

/// One failed recipient from a bounce notification, kept in the provider's
/// field naming so the audit trail matches what was received.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    pub email_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_code: Option<String>,
}

/// Field set for creating a tracked message row.
pub struct NewTrackedMessage {
    pub hash: String,
    pub domain: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub headers: String,
    pub content: Option<String>,
}

// ── Migrations ──

fn load_available_migrations() -> Vec<(String, String)> {
    let mut migrations = Vec::new();
    for dir in ["./migrations", "/app/migrations"] {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        info!("[db] loading migrations from {}", dir);
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match std::fs::read_to_string(&path) {
                Ok(sql) => migrations.push((name, sql)),
                Err(e) => error!("[db] failed to read migration {}: {}", name, e),
            }
        }
        // first directory that exists wins, to avoid mixing environments
        break;
    }
    if migrations.is_empty() {
        warn!("[db] no migration files found (checked ./migrations and /app/migrations)");
    }
    migrations.sort_by(|a, b| a.0.cmp(&b.0));
    migrations
}

fn run_migrations(client: &mut Client) {
    info!("[db] checking for database migrations");
    client
        .execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            &[],
        )
        .expect("Failed to create _migrations table");

    for (name, sql) in load_available_migrations() {
        let rows = client
            .query("SELECT id FROM _migrations WHERE name = $1", &[&name])
            .expect("Failed to query _migrations");
        if rows.is_empty() {
            info!("[db] applying migration: {}", name);
            let mut transaction = client.transaction().expect("Failed to start transaction");
            transaction
                .batch_execute(&sql)
                .expect("Failed to execute migration script");
            transaction
                .execute("INSERT INTO _migrations (name) VALUES ($1)", &[&name])
                .expect("Failed to record migration");
            transaction.commit().expect("Failed to commit transaction");
        } else {
            debug!("[db] migration {} already applied", name);
        }
    }
}

// ── Database ──

impl Database {
    pub fn open(url: &str) -> Self {
        Self::try_open(url).unwrap_or_else(|e| {
            panic!("Failed to connect to PostgreSQL: {}", e);
        })
    }

    /// Connect with a bounded retry loop, returning an error instead of
    /// panicking. Used by short-lived processes (the content filter) where a
    /// connection failure should pass the mail through unmodified rather
    /// than crash the pipeline.
    pub fn try_open(url: &str) -> Result<Self, String> {
        info!("[db] opening PostgreSQL database");
        let mut retry_count = 0;
        let max_retries = 30;
        let mut client = loop {
            match Client::connect(url, NoTls) {
                Ok(c) => break c,
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= max_retries {
                        error!(
                            "[db] failed to connect to PostgreSQL after {} retries: {}",
                            max_retries, e
                        );
                        return Err(format!(
                            "Failed to connect to PostgreSQL after {} retries: {}",
                            max_retries, e
                        ));
                    }
                    warn!(
                        "[db] failed to connect to PostgreSQL, retrying ({}/{}): {}",
                        retry_count, max_retries, e
                    );
                    std::thread::sleep(std::time::Duration::from_secs(1));
                }
            }
        };

        run_migrations(&mut client);

        info!("[db] PostgreSQL database opened and schema initialized");
        Ok(Database {
            conn: Arc::new(Mutex::new(client)),
        })
    }

    /// Acquire the database connection, recovering from mutex poisoning.
    fn conn(&self) -> MutexGuard<'_, Client> {
        self.conn.lock().unwrap_or_else(|e| {
            warn!("[db] mutex was poisoned, recovering connection");
            e.into_inner()
        })
    }

    // ── Tracked messages ──

    /// Insert a new tracked message and return its row id. A hash collision
    /// surfaces as a unique-violation error so the caller can regenerate.
    pub fn create_message(&self, fields: &NewTrackedMessage) -> Result<i64, postgres::Error> {
        debug!(
            "[db] creating tracked message hash={}, recipient={}",
            fields.hash, fields.recipient
        );
        let mut conn = self.conn();
        let row = conn.query_one(
            "INSERT INTO tracked_messages
                 (hash, domain, sender, recipient, subject, headers, content, opens, clicks, meta, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 0, 0, '{}', $8)
             RETURNING id",
            &[
                &fields.hash,
                &fields.domain,
                &fields.sender,
                &fields.recipient,
                &fields.subject,
                &fields.headers,
                &fields.content,
                &now(),
            ],
        )?;
        Ok(row.get(0))
    }

    pub fn find_message_by_hash(&self, hash: &str) -> Option<TrackedMessage> {
        debug!("[db] looking up tracked message hash={}", hash);
        let mut conn = self.conn();
        conn.query_opt(
            "SELECT id, hash, domain, sender, recipient, subject, headers, content,
                    opens, clicks, message_id, meta, created_at
             FROM tracked_messages WHERE hash = $1",
            &[&hash],
        )
        .unwrap_or_else(|e| {
            error!("[db] failed to query tracked message: {}", e);
            None
        })
        .map(row_to_message)
    }

    /// Look up by the provider-assigned message id recorded after send.
    pub fn find_message_by_provider_id(&self, message_id: &str) -> Option<TrackedMessage> {
        debug!("[db] looking up tracked message message_id={}", message_id);
        let mut conn = self.conn();
        conn.query_opt(
            "SELECT id, hash, domain, sender, recipient, subject, headers, content,
                    opens, clicks, message_id, meta, created_at
             FROM tracked_messages WHERE message_id = $1",
            &[&message_id],
        )
        .unwrap_or_else(|e| {
            error!("[db] failed to query tracked message: {}", e);
            None
        })
        .map(row_to_message)
    }

    pub fn set_provider_message_id(&self, hash: &str, message_id: &str) {
        info!(
            "[db] recording provider message id hash={}, message_id={}",
            hash, message_id
        );
        let mut conn = self.conn();
        if let Err(e) = conn.execute(
            "UPDATE tracked_messages SET message_id = $1 WHERE hash = $2",
            &[&message_id, &hash],
        ) {
            error!("[db] failed to set provider message id: {}", e);
        }
    }

    /// Atomic counter bump; safe under concurrent recording workers.
    pub fn increment_opens(&self, id: i64) -> Result<(), postgres::Error> {
        debug!("[db] incrementing opens for message id={}", id);
        let mut conn = self.conn();
        conn.execute(
            "UPDATE tracked_messages SET opens = opens + 1 WHERE id = $1",
            &[&id],
        )?;
        Ok(())
    }

    pub fn increment_clicks(&self, id: i64) -> Result<(), postgres::Error> {
        debug!("[db] incrementing clicks for message id={}", id);
        let mut conn = self.conn();
        conn.execute(
            "UPDATE tracked_messages SET clicks = clicks + 1 WHERE id = $1",
            &[&id],
        )?;
        Ok(())
    }

    pub fn update_meta(&self, id: i64, meta: &EmailMeta) -> Result<(), postgres::Error> {
        debug!("[db] updating meta for message id={}", id);
        let encoded = serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string());
        let mut conn = self.conn();
        conn.execute(
            "UPDATE tracked_messages SET meta = $1 WHERE id = $2",
            &[&encoded, &id],
        )?;
        Ok(())
    }

    // ── Tracked links ──

    /// Pre-register a link found during rewriting. Already-known
    /// (message, url) pairs are left untouched.
    pub fn register_link(
        &self,
        tracked_message_id: i64,
        url: &str,
        hash: &str,
        domain: &str,
    ) -> Result<(), postgres::Error> {
        debug!(
            "[db] registering link message_id={}, url={}",
            tracked_message_id, url
        );
        let mut conn = self.conn();
        conn.execute(
            "INSERT INTO tracked_links (tracked_message_id, url, hash, domain, clicks, created_at)
             VALUES ($1, $2, $3, $4, 0, $5)
             ON CONFLICT (tracked_message_id, url) DO NOTHING",
            &[&tracked_message_id, &url, &hash, &domain, &now()],
        )?;
        Ok(())
    }

    /// Find-or-create on (message, url) and bump the click counter, in one
    /// atomic statement. Links the rewriter could not pre-register are
    /// created here with their first click.
    pub fn record_link_click(
        &self,
        tracked_message_id: i64,
        url: &str,
        hash: &str,
        domain: &str,
    ) -> Result<(), postgres::Error> {
        debug!(
            "[db] recording link click message_id={}, url={}",
            tracked_message_id, url
        );
        let mut conn = self.conn();
        conn.execute(
            "INSERT INTO tracked_links (tracked_message_id, url, hash, domain, clicks, created_at)
             VALUES ($1, $2, $3, $4, 1, $5)
             ON CONFLICT (tracked_message_id, url)
             DO UPDATE SET clicks = tracked_links.clicks + 1",
            &[&tracked_message_id, &url, &hash, &domain, &now()],
        )?;
        Ok(())
    }

    // ── Retention ──

    /// Delete messages older than the retention window, links first so no
    /// orphan link survives a partial failure. Returns the number of
    /// messages removed.
    pub fn delete_expired(&self, expire_days: i64) -> Result<u64, postgres::Error> {
        if expire_days <= 0 {
            return Ok(0);
        }
        let cutoff = cutoff(expire_days);
        debug!("[db] purging tracked messages older than {}", cutoff);
        let mut conn = self.conn();
        let mut transaction = conn.transaction()?;
        transaction.execute(
            "DELETE FROM tracked_links WHERE tracked_message_id IN
                 (SELECT id FROM tracked_messages WHERE created_at < $1)",
            &[&cutoff],
        )?;
        let deleted = transaction.execute(
            "DELETE FROM tracked_messages WHERE created_at < $1",
            &[&cutoff],
        )?;
        transaction.commit()?;
        if deleted > 0 {
            info!("[db] purged {} expired tracked messages", deleted);
        }
        Ok(deleted)
    }
}

fn row_to_message(row: postgres::Row) -> TrackedMessage {
    let meta_raw: String = row.get(11);
    let meta = serde_json::from_str(&meta_raw).unwrap_or_else(|e| {
        warn!("[db] unreadable meta payload, treating as empty: {}", e);
        EmailMeta::default()
    });
    TrackedMessage {
        id: row.get(0),
        hash: row.get(1),
        domain: row.get(2),
        sender: row.get(3),
        recipient: row.get(4),
        subject: row.get(5),
        headers: row.get(6),
        content: row.get(7),
        opens: row.get(8),
        clicks: row.get(9),
        message_id: row.get(10),
        meta,
        created_at: row.get(12),
    }
}

/// True when an insert failed on a unique constraint (hash collision), as
/// opposed to a real storage error.
pub fn is_unique_violation(e: &postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_sorts_before_now() {
        assert!(cutoff(1) < now());
        assert!(cutoff(7) < cutoff(1));
    }

    #[test]
    fn meta_round_trips_through_json() {
        let mut meta = EmailMeta::default();
        meta.success = Some(false);
        meta.failures.push(FailureDetail {
            email_address: "bounce@example.com".to_string(),
            status: Some("5.1.1".to_string()),
            action: Some("failed".to_string()),
            diagnostic_code: Some("smtp; 550 user unknown".to_string()),
        });
        let encoded = serde_json::to_string(&meta).unwrap();
        let decoded: EmailMeta = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.success, Some(false));
        assert_eq!(decoded.failures.len(), 1);
        assert_eq!(decoded.failures[0].email_address, "bounce@example.com");
    }

    #[test]
    fn empty_meta_serializes_compactly() {
        let encoded = serde_json::to_string(&EmailMeta::default()).unwrap();
        assert_eq!(encoded, "{}");
    }

    #[test]
    fn failure_detail_uses_provider_field_names() {
        let detail: FailureDetail =
            serde_json::from_str(r#"{"emailAddress":"a@b.com","diagnosticCode":"550"}"#).unwrap();
        assert_eq!(detail.email_address, "a@b.com");
        assert_eq!(detail.diagnostic_code.as_deref(), Some("550"));
        assert!(detail.status.is_none());
    }
}
