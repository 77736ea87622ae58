//! Worker lifecycle and status handlers.

use super::{ApiError, AppState};
use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::core::MonitorProgress;
use crate::monitor::MonitorError;

#[derive(Debug, Serialize)]
pub struct Message {
    message: &'static str,
}

/// `GET /api/v1/monitor/status`
pub async fn status(State(state): State<AppState>) -> Result<Json<MonitorProgress>, ApiError> {
    let progress = state.storage.get_progress().await?;
    Ok(Json(progress))
}

/// `POST /api/v1/monitor/start`
pub async fn start(State(state): State<AppState>) -> Result<Json<Message>, ApiError> {
    match state.monitor.start().await {
        Ok(()) => Ok(Json(Message {
            message: "monitor started",
        })),
        Err(MonitorError::AlreadyRunning) => {
            Err(ApiError::Conflict("monitor is already running".into()))
        }
        Err(err) => Err(ApiError::Internal(anyhow::Error::new(err))),
    }
}

/// `POST /api/v1/monitor/stop`
pub async fn stop(State(state): State<AppState>) -> Result<Json<Message>, ApiError> {
    match state.monitor.stop().await {
        Ok(()) => Ok(Json(Message {
            message: "monitor stopped",
        })),
        Err(MonitorError::NotRunning) => {
            Err(ApiError::Conflict("monitor is not running".into()))
        }
        Err(err) => Err(ApiError::Internal(anyhow::Error::new(err))),
    }
}
