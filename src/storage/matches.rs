//! Matched-certificate storage operations.

use super::Storage;
use crate::core::{MatchPersister, MatchedCertificate};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

impl Storage {
    /// Inserts a match. Idempotent on `(serial_number, keyword_id)`: a
    /// conflicting insert succeeds without writing.
    pub async fn insert_match(&self, cert: &MatchedCertificate) -> Result<()> {
        let sans = serde_json::to_string(&cert.sans).context("encode sans")?;

        sqlx::query(
            r#"
            INSERT INTO matched_certificates
                (serial_number, common_name, sans, issuer, not_before, not_after,
                 keyword_id, matched_domain, ct_log_index, discovered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (serial_number, keyword_id) DO NOTHING
            "#,
        )
        .bind(&cert.serial_number)
        .bind(&cert.common_name)
        .bind(sans)
        .bind(&cert.issuer)
        .bind(cert.not_before)
        .bind(cert.not_after)
        .bind(cert.keyword_id)
        .bind(&cert.matched_domain)
        .bind(cert.ct_log_index)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to insert match")?;

        Ok(())
    }

    /// Returns one page of matches, newest first, optionally filtered by
    /// keyword, together with the total row count for the filter.
    pub async fn list_matches(
        &self,
        page: i64,
        per_page: i64,
        keyword_id: Option<i64>,
    ) -> Result<(Vec<MatchedCertificate>, i64)> {
        let total: i64 = match keyword_id {
            Some(id) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM matched_certificates WHERE keyword_id = ?",
                )
                .bind(id)
                .fetch_one(&self.pool)
                .await
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM matched_certificates")
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .context("failed to count matches")?;

        let base = r#"
            SELECT mc.id, mc.serial_number, mc.common_name, mc.sans, mc.issuer,
                   mc.not_before, mc.not_after, mc.keyword_id, k.value AS keyword_value,
                   mc.matched_domain, mc.ct_log_index, mc.discovered_at
            FROM matched_certificates mc
            JOIN keywords k ON k.id = mc.keyword_id
        "#;

        let offset = (page - 1) * per_page;
        let rows = match keyword_id {
            Some(id) => {
                let query = format!(
                    "{base} WHERE mc.keyword_id = ? ORDER BY mc.discovered_at DESC, mc.id DESC \
                     LIMIT ? OFFSET ?"
                );
                sqlx::query(&query)
                    .bind(id)
                    .bind(per_page)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let query = format!(
                    "{base} ORDER BY mc.discovered_at DESC, mc.id DESC LIMIT ? OFFSET ?"
                );
                sqlx::query(&query)
                    .bind(per_page)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("failed to list matches")?;

        let certs = rows
            .into_iter()
            .map(row_to_match)
            .collect::<Result<Vec<_>>>()?;
        Ok((certs, total))
    }

    /// Returns every match, newest first, for bulk export.
    pub async fn export_matches(&self) -> Result<Vec<MatchedCertificate>> {
        let rows = sqlx::query(
            r#"
            SELECT mc.id, mc.serial_number, mc.common_name, mc.sans, mc.issuer,
                   mc.not_before, mc.not_after, mc.keyword_id, k.value AS keyword_value,
                   mc.matched_domain, mc.ct_log_index, mc.discovered_at
            FROM matched_certificates mc
            JOIN keywords k ON k.id = mc.keyword_id
            ORDER BY mc.discovered_at DESC, mc.id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to export matches")?;

        rows.into_iter().map(row_to_match).collect()
    }
}

fn row_to_match(row: SqliteRow) -> Result<MatchedCertificate> {
    let sans_json: String = row.get("sans");
    Ok(MatchedCertificate {
        id: row.get("id"),
        serial_number: row.get("serial_number"),
        common_name: row.get("common_name"),
        sans: serde_json::from_str(&sans_json).context("decode sans")?,
        issuer: row.get("issuer"),
        not_before: row.get("not_before"),
        not_after: row.get("not_after"),
        keyword_id: row.get("keyword_id"),
        keyword_value: row.get("keyword_value"),
        matched_domain: row.get("matched_domain"),
        ct_log_index: row.get("ct_log_index"),
        discovered_at: row.get("discovered_at"),
    })
}

#[async_trait]
impl MatchPersister for Storage {
    async fn insert_match(&self, cert: &MatchedCertificate) -> Result<()> {
        Storage::insert_match(self, cert).await
    }
}
