//! Keyword CRUD handlers.

use super::{ApiError, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::core::Keyword;

#[derive(Debug, Serialize)]
pub struct KeywordList {
    keywords: Vec<Keyword>,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyword {
    value: String,
}

/// `GET /api/v1/keywords`
pub async fn list(State(state): State<AppState>) -> Result<Json<KeywordList>, ApiError> {
    let keywords = state.storage.list_keywords().await?;
    Ok(Json(KeywordList { keywords }))
}

/// `POST /api/v1/keywords`
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyword>,
) -> Result<(StatusCode, Json<Keyword>), ApiError> {
    let value = body.value.trim();
    if value.is_empty() {
        return Err(ApiError::BadRequest("keyword value cannot be empty".into()));
    }
    if value.len() < 3 {
        return Err(ApiError::BadRequest(
            "keyword must be at least 3 characters".into(),
        ));
    }

    match state.storage.create_keyword(value).await {
        Ok(keyword) => Ok((StatusCode::CREATED, Json(keyword))),
        Err(err) if is_unique_violation(&err) => {
            Err(ApiError::Conflict("keyword already exists".into()))
        }
        Err(err) => Err(err.into()),
    }
}

/// `DELETE /api/v1/keywords/{id}`
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.storage.delete_keyword(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("keyword not found".into()))
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|db| db.is_unique_violation())
}
