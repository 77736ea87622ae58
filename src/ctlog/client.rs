//! HTTP client for an RFC 6962 Certificate Transparency log.

use crate::core::{LogClient, RawEntry, SignedTreeHead};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;

/// Per-call deadline applied by the underlying HTTP client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire form of one `get-entries` entry: base64 over JSON.
#[derive(Debug, Deserialize)]
struct WireEntry {
    leaf_input: String,
    #[serde(default)]
    extra_data: String,
}

#[derive(Debug, Deserialize)]
struct GetEntriesResponse {
    entries: Vec<WireEntry>,
}

/// Talks to a Certificate Transparency log over HTTP.
///
/// Thin and stateless: no retries or backoff. The ingestion worker decides
/// how to react to a failed call (persist the error, try again next tick).
pub struct HttpLogClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLogClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl LogClient for HttpLogClient {
    async fn get_sth(&self) -> Result<SignedTreeHead> {
        let url = format!("{}/ct/v1/get-sth", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("fetch STH")?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            bail!("get-sth returned status {}", status.as_u16());
        }

        let sth: SignedTreeHead = resp.json().await.context("decode STH")?;
        Ok(sth)
    }

    async fn get_entries(&self, start: i64, end: i64) -> Result<Vec<RawEntry>> {
        let url = format!(
            "{}/ct/v1/get-entries?start={}&end={}",
            self.base_url, start, end
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("fetch entries")?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            bail!("get-entries returned status {}", status.as_u16());
        }

        let body: GetEntriesResponse = resp.json().await.context("decode entries")?;

        let mut entries = Vec::with_capacity(body.entries.len());
        for entry in body.entries {
            entries.push(RawEntry {
                leaf_input: BASE64
                    .decode(&entry.leaf_input)
                    .context("decode leaf_input")?,
                extra_data: BASE64
                    .decode(&entry.extra_data)
                    .context("decode extra_data")?,
            });
        }
        Ok(entries)
    }
}
