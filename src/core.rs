//! Core domain types and service traits for CertSentry
//!
//! This module defines the fundamental data structures and trait contracts
//! that govern component interactions throughout the application.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-configured brand keyword to watch for in certificate identities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Keyword {
    pub id: i64,
    /// The keyword text, stored verbatim; matching lower-cases both sides.
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// The identity fields extracted from one CT log entry.
///
/// Transient: produced by the leaf parser, consumed by the matcher, never
/// persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedCertificate {
    /// Timestamp from the Merkle tree leaf header (ms since Unix epoch).
    pub timestamp: DateTime<Utc>,
    /// Certificate serial number as lowercase hex.
    pub serial: String,
    /// Subject Common Name; may be empty.
    pub common_name: String,
    /// DNS Subject Alternative Names, in certificate order.
    pub sans: Vec<String>,
    /// Issuer CN, or the first issuer Organization when the CN is empty.
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// A certificate that matched a keyword, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchedCertificate {
    #[serde(default)]
    pub id: i64,
    pub serial_number: String,
    pub common_name: String,
    pub sans: Vec<String>,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub keyword_id: i64,
    /// The keyword text, joined in on reads; empty on insert.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub keyword_value: String,
    /// The exact CN or SAN string that triggered the match.
    pub matched_domain: String,
    /// Position of the entry in the CT log.
    pub ct_log_index: i64,
    #[serde(default)]
    pub discovered_at: DateTime<Utc>,
}

/// The singleton progress/metrics record for the ingestion worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MonitorProgress {
    /// Next log index to fetch; 0 until the first successful advance.
    pub last_processed_index: i64,
    /// Tree size observed at the last successful STH fetch.
    pub last_tree_size: i64,
    /// Instant of the last tick that reached the write step.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Monotonic count of entries fetched across the process's history.
    pub total_processed: i64,
    pub certs_in_last_cycle: i64,
    pub matches_in_last_cycle: i64,
    pub parse_errors_in_last_cycle: i64,
    pub is_running: bool,
    /// Last persisted error; empty string means cleared.
    pub last_error: String,
    pub updated_at: DateTime<Utc>,
}

/// A Signed Tree Head response (RFC 6962 §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SignedTreeHead {
    pub tree_size: i64,
    pub timestamp: u64,
    #[serde(rename = "sha256_root_hash")]
    pub root_hash: String,
}

/// One raw entry from `get-entries` (RFC 6962 §4.6), already base64-decoded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawEntry {
    pub leaf_input: Vec<u8>,
    pub extra_data: Vec<u8>,
}

// =============================================================================
// Service Traits
// =============================================================================

/// Fetches tree heads and entry ranges from a Certificate Transparency log.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Retrieves the latest Signed Tree Head.
    async fn get_sth(&self) -> Result<SignedTreeHead>;

    /// Retrieves log entries in range `[start, end]` inclusive.
    ///
    /// The log is permitted to return fewer entries than requested; callers
    /// must not assume `result.len() == end - start + 1`.
    async fn get_entries(&self, start: i64, end: i64) -> Result<Vec<RawEntry>>;
}

/// Lists the currently configured keywords.
#[async_trait]
pub trait KeywordLister: Send + Sync {
    /// Returns all keywords; an empty list is valid.
    async fn list_keywords(&self) -> Result<Vec<Keyword>>;
}

/// Persists matched certificates.
#[async_trait]
pub trait MatchPersister: Send + Sync {
    /// Inserts a match. Idempotent on `(serial_number, keyword_id)`: a
    /// second insert of the same pair succeeds and writes nothing.
    async fn insert_match(&self, cert: &MatchedCertificate) -> Result<()>;
}

/// Reads and writes the singleton worker progress record.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Returns the singleton progress row; never "not found".
    async fn get_progress(&self) -> Result<MonitorProgress>;

    /// Overwrites the mutable progress fields and refreshes
    /// `last_run_at`/`updated_at`.
    async fn update_progress(&self, progress: &MonitorProgress) -> Result<()>;

    /// Toggles only the `is_running` flag.
    async fn set_running(&self, running: bool) -> Result<()>;

    /// Records the last error; the empty string clears it.
    async fn set_last_error(&self, message: &str) -> Result<()>;
}
