//! Keyword storage operations.

use super::Storage;
use crate::core::{Keyword, KeywordLister};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

impl Storage {
    /// Lists all keywords, newest first.
    pub async fn list_keywords(&self) -> Result<Vec<Keyword>> {
        let rows = sqlx::query(
            "SELECT id, value, created_at FROM keywords ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list keywords")?;

        Ok(rows
            .into_iter()
            .map(|row| Keyword {
                id: row.get("id"),
                value: row.get("value"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Inserts a keyword, returning the stored row.
    ///
    /// A duplicate value surfaces as a database unique-constraint error;
    /// callers that care inspect the chain for `sqlx::Error`.
    pub async fn create_keyword(&self, value: &str) -> Result<Keyword> {
        let row = sqlx::query(
            "INSERT INTO keywords (value, created_at) VALUES (?, ?)
             RETURNING id, value, created_at",
        )
        .bind(value)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to create keyword")?;

        Ok(Keyword {
            id: row.get("id"),
            value: row.get("value"),
            created_at: row.get("created_at"),
        })
    }

    /// Deletes a keyword (its matches cascade). Returns false when no such
    /// keyword exists.
    pub async fn delete_keyword(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM keywords WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete keyword")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl KeywordLister for Storage {
    async fn list_keywords(&self) -> Result<Vec<Keyword>> {
        Storage::list_keywords(self).await
    }
}
