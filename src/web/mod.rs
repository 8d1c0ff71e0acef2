mod errors;
mod routes;

use axum::http::{StatusCode, Uri};
use axum::Router;
use log::info;
use std::sync::Arc;

use crate::classify::ClickClassifier;
use crate::config::TrackerConfig;
use crate::db::Database;
use crate::queue::JobQueue;

// ── Shared State ──

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<TrackerConfig>,
    pub queue: JobQueue,
    pub classifier: Arc<ClickClassifier>,
}

impl AppState {
    pub async fn blocking_db<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Database) -> R + Send + 'static,
        R: Send + 'static,
    {
        let db = self.db.clone();
        // std::thread, not spawn_blocking: the sync postgres client drives its
        // own internal runtime, which panics inside tokio's blocking pool
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::spawn(move || {
            let result = f(&db);
            let _ = tx.send(result);
        });

        rx.await.expect("Database thread panicked or was dropped")
    }
}

// ── Server ──

pub async fn start_server(state: AppState) {
    let port = state.config.port;
    let prefix = state.config.route_prefix.clone();

    info!("[web] initializing tracking gateway on port {}", port);

    let tracking_routes = routes::routes();
    let app = if prefix.is_empty() {
        tracking_routes
    } else {
        info!("[web] nesting tracking routes under {}", prefix);
        Router::new().nest(&prefix, tracking_routes)
    };
    let app = app.fallback(handle_not_found).with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind address {}: {}", addr, e));
    info!("[web] tracking gateway listening on {}", addr);
    axum::serve(listener, app).await.expect("Server error");
}

async fn handle_not_found(uri: Uri) -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("No route exists at {}", uri.path()),
    )
}
