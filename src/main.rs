mod classify;
mod config;
mod db;
mod events;
mod feedback;
mod filter;
mod hash;
mod intercept;
mod queue;
mod recorder;
mod rewrite;
mod web;

use log::{error, info};
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    info!("[main] mailtrack starting, command={}", command);

    match command {
        "serve" => {
            let cfg = config::TrackerConfig::from_env();
            info!(
                "[main] serve: port={}, base_url={}, track_opens={}, track_links={}, expire_days={}",
                cfg.port, cfg.base_url, cfg.track_opens, cfg.track_links, cfg.expire_days
            );

            let database = db::Database::open(&cfg.database_url);
            let events = events::EventBus::new();
            let job_queue = queue::JobQueue::start(database.clone(), events.clone(), cfg.retry_days);

            let mut event_rx = events.subscribe();
            tokio::spawn(async move {
                loop {
                    match event_rx.recv().await {
                        Ok(event) => log::debug!("[main] event: {:?}", event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("[main] event subscriber lagged, skipped {}", skipped)
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            let state = web::AppState {
                db: database,
                config: Arc::new(cfg),
                queue: job_queue,
                classifier: Arc::new(classify::ClickClassifier::new()),
            };

            web::start_server(state).await;
        }
        "filter" => {
            let cfg = config::TrackerConfig::from_env();

            let mut sender = String::new();
            let mut recipients = Vec::new();
            let mut after_separator = false;
            let mut i = 2;
            while i < args.len() {
                if args[i] == "-f" {
                    i += 1;
                    if i < args.len() {
                        sender = args[i].clone();
                    }
                } else if args[i] == "--" {
                    after_separator = true;
                } else if after_separator {
                    recipients.push(args[i].clone());
                }
                i += 1;
            }

            info!(
                "[main] running content filter sender={}, recipients={}",
                sender,
                recipients.join(", ")
            );
            filter::run_filter(&cfg, &sender, &recipients);
            info!("[main] content filter completed");
        }
        "purge" => {
            let cfg = config::TrackerConfig::from_env();
            if cfg.expire_days <= 0 {
                info!("[main] EXPIRE_DAYS not set or zero, purging disabled");
                return;
            }
            let database = db::Database::open(&cfg.database_url);
            match database.delete_expired(cfg.expire_days) {
                Ok(deleted) => info!("[main] purge removed {} tracked messages", deleted),
                Err(e) => error!("[main] purge failed: {}", e),
            }
        }
        other => {
            if other != "help" {
                error!("[main] unknown command: {}", other);
            }
            println!("Mailtrack - Email open/click tracking service");
            println!();
            println!("Usage:");
            println!("  mailtrack serve                      Start the tracking gateway");
            println!("  mailtrack filter -f sender -- rcpt   Run as pipe content filter");
            println!("  mailtrack purge                      Delete expired tracking records");
            println!();
            println!("Environment variables:");
            println!("  DATABASE_URL                 PostgreSQL connection string");
            println!("  PORT                         Gateway port (default: 8080)");
            println!("  BASE_URL                     Public base URL for tracking links");
            println!("  ROUTE_PREFIX                 Optional path prefix for tracking routes");
            println!("  APP_DOMAIN                   Tenant label stored on tracked messages");
            println!("  TRACK_OPENS                  Inject tracking pixels (default: true)");
            println!("  TRACK_LINKS                  Rewrite links (default: true)");
            println!("  LOG_CONTENT                  Capture message bodies (default: true)");
            println!("  EXPIRE_DAYS                  Retention window in days, 0 disables (default: 60)");
            println!("  SNS_TOPIC                    Expected notification topic ARN");
            println!("  FILTER_EMAIL_CLIENT_CLICKS   Classify prefetch traffic (default: true)");
            println!("  RETRY_DAYS                   Recording job retry horizon (default: 5)");
        }
    }
}
