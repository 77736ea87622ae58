//! Matched-certificate listing and export handlers.

use super::{ApiError, AppState};
use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::core::MatchedCertificate;

const DEFAULT_PER_PAGE: i64 = 20;
const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    page: Option<i64>,
    per_page: Option<i64>,
    /// Optional keyword id filter.
    keyword: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CertificatePage {
    certificates: Vec<MatchedCertificate>,
    total: i64,
    page: i64,
    per_page: i64,
}

/// `GET /api/v1/certificates`
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<CertificatePage>, ApiError> {
    let page = params.page.filter(|p| *p > 0).unwrap_or(1);
    let per_page = params
        .per_page
        .filter(|pp| *pp > 0 && *pp <= MAX_PER_PAGE)
        .unwrap_or(DEFAULT_PER_PAGE);
    let keyword = params.keyword.filter(|id| *id > 0);

    let (certificates, total) = state.storage.list_matches(page, per_page, keyword).await?;
    Ok(Json(CertificatePage {
        certificates,
        total,
        page,
        per_page,
    }))
}

/// `GET /api/v1/certificates/export`
///
/// Streams every match as a CSV attachment.
pub async fn export(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let certs = state.storage.export_matches().await?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "id",
            "serial_number",
            "common_name",
            "sans",
            "issuer",
            "not_before",
            "not_after",
            "keyword",
            "matched_domain",
            "ct_log_index",
            "discovered_at",
        ])
        .context("write CSV header")?;

    for cert in &certs {
        writer
            .write_record([
                cert.id.to_string(),
                cert.serial_number.clone(),
                cert.common_name.clone(),
                cert.sans.join(";"),
                cert.issuer.clone(),
                cert.not_before.to_rfc3339(),
                cert.not_after.to_rfc3339(),
                cert.keyword_value.clone(),
                cert.matched_domain.clone(),
                cert.ct_log_index.to_string(),
                cert.discovered_at.to_rfc3339(),
            ])
            .context("write CSV row")?;
    }

    let body = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flush CSV writer: {e}"))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv"),
            (
                header::CONTENT_DISPOSITION,
                r#"attachment; filename="matched_certificates.csv""#,
            ),
        ],
        body,
    ))
}
