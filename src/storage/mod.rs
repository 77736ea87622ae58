//! SQLite persistence for keywords, matched certificates, and the singleton
//! monitor progress row.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

mod keywords;
mod matches;
mod progress;

/// Database storage behind a pooled SQLite connection.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Connects to the database, creating the file if it does not exist.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!(url = %database_url, "connecting to database");

        let options = SqliteConnectOptions::from_str(database_url)
            .context("invalid database url")?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to database")?;

        Ok(Self { pool })
    }

    /// Runs schema migrations. Called once during startup.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        info!("closing database connection");
        self.pool.close().await;
    }
}
