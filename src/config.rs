use log::{debug, warn};
use std::env;

/// Runtime configuration, sourced from the environment at startup.
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub database_url: String,
    pub port: u16,
    /// Public base URL embedded in rewritten content, e.g. "https://mail.example.com".
    pub base_url: String,
    /// Optional path prefix the tracking routes are nested under, e.g. "/email-manager".
    pub route_prefix: String,
    /// Tenant label stored on rows created at send time.
    pub app_domain: String,
    pub track_opens: bool,
    pub track_links: bool,
    pub log_content: bool,
    /// Retention window in days; 0 disables purging.
    pub expire_days: i64,
    /// Expected SNS topic ARN; None accepts any topic.
    pub sns_topic: Option<String>,
    /// When false, every hit counts and no prefetch classification runs.
    pub filter_client_clicks: bool,
    /// How long the queue keeps retrying a failed recording job.
    pub retry_days: i64,
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => {
            debug!("[config] {} not set, defaulting to {}", key, default);
            default
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| {
            debug!("[config] {} not set or invalid, defaulting to {}", key, default);
            default
        })
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            warn!("[config] DATABASE_URL not set, defaulting to local postgres");
            "postgres://mailtrack@localhost/mailtrack".to_string()
        });
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(|| {
                debug!("[config] PORT not set or invalid, defaulting to 8080");
                8080
            });
        let base_url = env::var("BASE_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| {
                warn!("[config] BASE_URL not set, defaulting to http://localhost:{}", port);
                format!("http://localhost:{}", port)
            });
        let route_prefix = env::var("ROUTE_PREFIX")
            .map(|v| {
                let v = v.trim_end_matches('/').to_string();
                if !v.is_empty() && !v.starts_with('/') {
                    format!("/{}", v)
                } else {
                    v
                }
            })
            .unwrap_or_default();
        let app_domain = env::var("APP_DOMAIN")
            .unwrap_or_else(|_| {
                debug!("[config] APP_DOMAIN not set, defaulting to mailtrack");
                "mailtrack".to_string()
            })
            .to_lowercase();
        let sns_topic = env::var("SNS_TOPIC").ok().filter(|v| !v.is_empty());

        TrackerConfig {
            database_url,
            port,
            base_url,
            route_prefix,
            app_domain,
            track_opens: env_bool("TRACK_OPENS", true),
            track_links: env_bool("TRACK_LINKS", true),
            log_content: env_bool("LOG_CONTENT", true),
            expire_days: env_i64("EXPIRE_DAYS", 60),
            sns_topic,
            filter_client_clicks: env_bool("FILTER_EMAIL_CLIENT_CLICKS", true),
            retry_days: env_i64("RETRY_DAYS", 5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        env::set_var("MAILTRACK_TEST_FLAG", "yes");
        assert!(env_bool("MAILTRACK_TEST_FLAG", false));
        env::set_var("MAILTRACK_TEST_FLAG", "0");
        assert!(!env_bool("MAILTRACK_TEST_FLAG", true));
        env::remove_var("MAILTRACK_TEST_FLAG");
        assert!(env_bool("MAILTRACK_TEST_FLAG", true));
    }
}
