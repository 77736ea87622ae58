//! Singleton monitor-progress storage operations.

use super::Storage;
use crate::core::{MonitorProgress, ProgressStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

impl Storage {
    /// Returns the singleton progress row (seeded by the migration, so it
    /// always exists).
    pub async fn get_progress(&self) -> Result<MonitorProgress> {
        let row = sqlx::query(
            r#"
            SELECT last_processed_index, last_tree_size, last_run_at,
                   total_processed, certs_in_last_cycle, matches_in_last_cycle,
                   parse_errors_in_last_cycle, is_running, last_error, updated_at
            FROM monitor_progress
            WHERE id = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to fetch monitor progress")?;

        Ok(MonitorProgress {
            last_processed_index: row.get("last_processed_index"),
            last_tree_size: row.get("last_tree_size"),
            last_run_at: row.get("last_run_at"),
            total_processed: row.get("total_processed"),
            certs_in_last_cycle: row.get("certs_in_last_cycle"),
            matches_in_last_cycle: row.get("matches_in_last_cycle"),
            parse_errors_in_last_cycle: row.get("parse_errors_in_last_cycle"),
            is_running: row.get("is_running"),
            last_error: row.get("last_error"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Overwrites the mutable progress fields; `last_run_at` and
    /// `updated_at` are refreshed to now.
    pub async fn update_progress(&self, progress: &MonitorProgress) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE monitor_progress SET
                last_processed_index = ?,
                last_tree_size = ?,
                last_run_at = ?,
                total_processed = ?,
                certs_in_last_cycle = ?,
                matches_in_last_cycle = ?,
                parse_errors_in_last_cycle = ?,
                is_running = ?,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(progress.last_processed_index)
        .bind(progress.last_tree_size)
        .bind(now)
        .bind(progress.total_processed)
        .bind(progress.certs_in_last_cycle)
        .bind(progress.matches_in_last_cycle)
        .bind(progress.parse_errors_in_last_cycle)
        .bind(progress.is_running)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to update monitor progress")?;
        Ok(())
    }

    /// Toggles only the `is_running` flag. Also used at process start to
    /// clear a flag left behind by a crashed worker.
    pub async fn set_running(&self, running: bool) -> Result<()> {
        sqlx::query("UPDATE monitor_progress SET is_running = ?, updated_at = ? WHERE id = 1")
            .bind(running)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to set running flag")?;
        Ok(())
    }

    /// Records the last error message; the empty string clears it.
    pub async fn set_last_error(&self, message: &str) -> Result<()> {
        sqlx::query("UPDATE monitor_progress SET last_error = ?, updated_at = ? WHERE id = 1")
            .bind(message)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to set last error")?;
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for Storage {
    async fn get_progress(&self) -> Result<MonitorProgress> {
        Storage::get_progress(self).await
    }

    async fn update_progress(&self, progress: &MonitorProgress) -> Result<()> {
        Storage::update_progress(self, progress).await
    }

    async fn set_running(&self, running: bool) -> Result<()> {
        Storage::set_running(self, running).await
    }

    async fn set_last_error(&self, message: &str) -> Result<()> {
        Storage::set_last_error(self, message).await
    }
}
