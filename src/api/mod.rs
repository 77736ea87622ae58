//! The REST surface: thin glue over the ingestion core.
//!
//! ## Routes (all under `/api/v1`)
//!
//! - `GET    /keywords` — list keywords
//! - `POST   /keywords` — create a keyword
//! - `DELETE /keywords/{id}` — delete a keyword and its matches
//! - `GET    /certificates` — paginated matched certificates
//! - `GET    /certificates/export` — all matches as CSV
//! - `GET    /monitor/status` — the progress row verbatim
//! - `POST   /monitor/start` / `POST /monitor/stop` — worker lifecycle

mod certificates;
mod error;
mod keywords;
mod monitor;

pub use error::ApiError;

use crate::monitor::Monitor;
use crate::storage::Storage;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub monitor: Arc<Monitor>,
}

/// Builds the complete API router.
pub fn router(state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/keywords", get(keywords::list).post(keywords::create))
        .route("/keywords/{id}", delete(keywords::remove))
        .route("/certificates", get(certificates::list))
        .route("/certificates/export", get(certificates::export))
        .route("/monitor/status", get(monitor::status))
        .route("/monitor/start", post(monitor::start))
        .route("/monitor/stop", post(monitor::stop));

    Router::new().nest("/api/v1", api_v1).with_state(state)
}
