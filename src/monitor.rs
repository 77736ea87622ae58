//! The lifecycle-managed ingestion worker.
//!
//! One cooperative worker per process polls the CT log on a fixed interval:
//! tick → STH → range compute → fetch → parse → match → persist → advance.
//! Lifecycle transitions (`start`/`stop`/`is_running`) serialize on a single
//! mutex; the loop itself runs on its own root task so it survives the
//! caller that started it.

use crate::core::{
    Keyword, KeywordLister, LogClient, MatchPersister, MatchedCertificate, MonitorProgress,
    ProgressStore, RawEntry,
};
use crate::ctlog::parse_leaf;
use crate::matching::match_certificate;
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Deadline for the lifecycle writes that must succeed even when the
/// caller is already gone (stop, post-panic cleanup).
const SHUTDOWN_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor already running")]
    AlreadyRunning,
    #[error("monitor not running")]
    NotRunning,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// The capability set one tick consumes, shared with the panic supervisor.
struct Deps {
    log_client: Arc<dyn LogClient>,
    keywords: Arc<dyn KeywordLister>,
    matches: Arc<dyn MatchPersister>,
    progress: Arc<dyn ProgressStore>,
}

/// The most recently fetched batch, kept for idle-tick re-matching.
///
/// Owned exclusively by the worker task; deliberately in-process and
/// ephemeral. After a restart the worker re-fetches the previous window
/// instead, and idempotent inserts make either path safe to replay.
struct CachedBatch {
    start: i64,
    entries: Vec<RawEntry>,
}

pub struct Monitor {
    deps: Arc<Deps>,
    batch_size: i64,
    interval: Duration,
    reprocess_on_idle: bool,
    /// `Some` while the worker is running; the sender cancels the loop.
    lifecycle: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl Monitor {
    pub fn new(
        log_client: Arc<dyn LogClient>,
        keywords: Arc<dyn KeywordLister>,
        matches: Arc<dyn MatchPersister>,
        progress: Arc<dyn ProgressStore>,
        batch_size: i64,
        interval: Duration,
        reprocess_on_idle: bool,
    ) -> Self {
        Self {
            deps: Arc::new(Deps {
                log_client,
                keywords,
                matches,
                progress,
            }),
            batch_size,
            interval,
            reprocess_on_idle,
            lifecycle: Arc::new(Mutex::new(None)),
        }
    }

    /// Launches the background loop.
    ///
    /// The worker task is spawned on a fresh root, not tied to the caller:
    /// the request that triggered `start` may end the instant this returns
    /// without killing the worker.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut guard = self.lifecycle.lock().await;
        if guard.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *guard = Some(shutdown_tx);

        if let Err(e) = self.deps.progress.set_running(true).await {
            *guard = None;
            return Err(MonitorError::Store(e));
        }

        let deps = self.deps.clone();
        let batch_size = self.batch_size;
        let interval = self.interval;
        let reprocess_on_idle = self.reprocess_on_idle;
        let loop_handle = tokio::spawn(run_loop(
            deps.clone(),
            shutdown_rx,
            batch_size,
            interval,
            reprocess_on_idle,
        ));

        // Supervisor: a panicked loop must not take the process down or
        // leave the running flag lying.
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            let Err(join_err) = loop_handle.await else {
                return;
            };
            if !join_err.is_panic() {
                return;
            }
            let message = panic_message(join_err.into_panic());
            error!(panic = %message, "ingestion worker panicked");

            lifecycle.lock().await.take();
            let cleanup = async {
                if let Err(e) = deps
                    .progress
                    .set_last_error(&format!("panic: {message}"))
                    .await
                {
                    warn!(error = %e, "failed to persist panic message");
                }
                if let Err(e) = deps.progress.set_running(false).await {
                    warn!(error = %e, "failed to clear running flag after panic");
                }
            };
            if tokio::time::timeout(SHUTDOWN_WRITE_TIMEOUT, cleanup)
                .await
                .is_err()
            {
                warn!("timed out persisting post-panic state");
            }
        });

        Ok(())
    }

    /// Halts the loop and persists `is_running := false`.
    ///
    /// The write runs under its own deadline so shutdown completes even
    /// when the caller's request is already canceled.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        let mut guard = self.lifecycle.lock().await;
        let Some(shutdown_tx) = guard.take() else {
            return Err(MonitorError::NotRunning);
        };
        drop(guard);

        let _ = shutdown_tx.send(true);

        match tokio::time::timeout(
            SHUTDOWN_WRITE_TIMEOUT,
            self.deps.progress.set_running(false),
        )
        .await
        {
            Ok(result) => result.map_err(MonitorError::Store),
            Err(_) => Err(MonitorError::Store(anyhow!(
                "timed out persisting stopped state"
            ))),
        }
    }

    /// Whether the worker loop is active.
    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }
}

async fn run_loop(
    deps: Arc<Deps>,
    mut shutdown_rx: watch::Receiver<bool>,
    batch_size: i64,
    interval: Duration,
    reprocess_on_idle: bool,
) {
    info!(
        batch_size,
        interval_secs = interval.as_secs(),
        reprocess_on_idle,
        "ingestion worker started"
    );

    let mut cache: Option<CachedBatch> = None;
    // The first tick fires immediately; one batch runs right at startup.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                debug!("ingestion worker received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        debug!("ingestion worker shut down mid-batch");
                        break;
                    }
                    _ = process_batch(&deps, batch_size, reprocess_on_idle, &mut cache) => {}
                }
            }
        }
    }

    info!("ingestion worker stopped");
}

/// One tick: fetch, parse, match, persist, advance.
///
/// Never returns an error; failures are persisted to `last_error` and the
/// next tick retries. Progress only advances on a fully fetched batch.
async fn process_batch(
    deps: &Deps,
    batch_size: i64,
    reprocess_on_idle: bool,
    cache: &mut Option<CachedBatch>,
) {
    let sth = match deps.log_client.get_sth().await {
        Ok(sth) => sth,
        Err(e) => {
            error!(error = %e, "failed to get STH");
            persist_error(deps, &format!("failed to get STH: {e:#}")).await;
            return;
        }
    };
    metrics::gauge!("certsentry_log_tree_size").set(sth.tree_size as f64);

    let prog = match deps.progress.get_progress().await {
        Ok(prog) => prog,
        Err(e) => {
            error!(error = %e, "failed to get monitor state");
            persist_error(deps, &format!("failed to get monitor state: {e:#}")).await;
            return;
        }
    };

    let mut start = prog.last_processed_index;
    if start == 0 {
        // First run: begin near the tree head instead of replaying history.
        start = (sth.tree_size - batch_size).max(0);
    }
    let end = (start + batch_size - 1).min(sth.tree_size - 1);
    let has_new = start <= end;

    let entries: Vec<RawEntry>;
    let batch_start: i64;

    if has_new {
        info!(start, end, tree_size = sth.tree_size, "fetching CT log entries");
        entries = match deps.log_client.get_entries(start, end).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "failed to fetch entries");
                persist_error(deps, &format!("failed to fetch entries: {e:#}")).await;
                return;
            }
        };
        batch_start = start;
        *cache = Some(CachedBatch {
            start,
            entries: entries.clone(),
        });
    } else if reprocess_on_idle {
        if let Some(cached) = cache.as_ref() {
            debug!(
                start = cached.start,
                count = cached.entries.len(),
                "re-matching cached batch"
            );
            entries = cached.entries.clone();
            batch_start = cached.start;
        } else {
            // Fresh process with no cache: re-fetch the previous window.
            let rematch_start = (prog.last_processed_index - batch_size).max(0);
            let rematch_end = prog.last_processed_index - 1;
            if rematch_start > rematch_end {
                info!("no entries to reprocess yet");
                refresh_progress(deps, &prog, sth.tree_size).await;
                return;
            }
            info!(
                start = rematch_start,
                end = rematch_end,
                "re-fetching previous batch for re-matching"
            );
            entries = match deps.log_client.get_entries(rematch_start, rematch_end).await {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "failed to re-fetch entries");
                    persist_error(deps, &format!("failed to re-fetch entries: {e:#}")).await;
                    return;
                }
            };
            batch_start = rematch_start;
            *cache = Some(CachedBatch {
                start: rematch_start,
                entries: entries.clone(),
            });
        }
    } else {
        // Caught up, skip mode: only show the worker is still alive.
        info!(
            last_processed = prog.last_processed_index,
            tree_size = sth.tree_size,
            "no new entries, skipping"
        );
        refresh_progress(deps, &prog, sth.tree_size).await;
        return;
    }

    let keywords = match deps.keywords.list_keywords().await {
        Ok(keywords) => keywords,
        Err(e) => {
            error!(error = %e, "failed to load keywords");
            persist_error(deps, &format!("failed to load keywords: {e:#}")).await;
            return;
        }
    };

    if keywords.is_empty() {
        info!("no keywords configured, skipping matching");
        if has_new {
            advance_progress(deps, &prog, end, sth.tree_size, entries.len() as i64, 0, 0).await;
        }
        clear_error(deps).await;
        return;
    }

    let (matches, parse_errors) = match_entries(deps, &entries, batch_start, &keywords).await;

    info!(
        entries = entries.len(),
        parse_errors,
        matches,
        reprocessed = !has_new,
        "batch processed"
    );

    if has_new {
        advance_progress(
            deps,
            &prog,
            end,
            sth.tree_size,
            entries.len() as i64,
            matches,
            parse_errors,
        )
        .await;
    } else {
        // Re-matched an old batch: metrics roll, the index stays put.
        let update = MonitorProgress {
            last_tree_size: sth.tree_size,
            certs_in_last_cycle: entries.len() as i64,
            matches_in_last_cycle: matches,
            parse_errors_in_last_cycle: parse_errors,
            is_running: true,
            ..prog.clone()
        };
        if let Err(e) = deps.progress.update_progress(&update).await {
            error!(error = %e, "failed to update monitor progress");
        }
    }
    clear_error(deps).await;
}

/// Parses and matches each entry in log order, persisting matches as they
/// are found. A failed insert loses that match but never aborts the batch.
async fn match_entries(
    deps: &Deps,
    entries: &[RawEntry],
    batch_start: i64,
    keywords: &[Keyword],
) -> (i64, i64) {
    let mut match_count = 0i64;
    let mut parse_errors = 0i64;

    for (i, entry) in entries.iter().enumerate() {
        let parsed = match parse_leaf(&entry.leaf_input, &entry.extra_data) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(index = batch_start + i as i64, error = %e, "skipping unparseable entry");
                parse_errors += 1;
                continue;
            }
        };

        for found in match_certificate(&parsed, keywords) {
            let record = MatchedCertificate {
                id: 0,
                serial_number: parsed.serial.clone(),
                common_name: parsed.common_name.clone(),
                sans: parsed.sans.clone(),
                issuer: parsed.issuer.clone(),
                not_before: parsed.not_before,
                not_after: parsed.not_after,
                keyword_id: found.keyword_id,
                keyword_value: String::new(),
                matched_domain: found.matched_domain,
                ct_log_index: batch_start + i as i64,
                discovered_at: chrono::Utc::now(),
            };
            if let Err(e) = deps.matches.insert_match(&record).await {
                error!(error = %e, domain = %record.matched_domain, "failed to store match");
                continue;
            }
            match_count += 1;
        }
    }

    metrics::counter!("certsentry_entries_processed_total").increment(entries.len() as u64);
    metrics::counter!("certsentry_matches_total").increment(match_count as u64);
    metrics::counter!("certsentry_parse_errors_total").increment(parse_errors as u64);

    (match_count, parse_errors)
}

/// Advances the index past a freshly processed batch.
async fn advance_progress(
    deps: &Deps,
    prev: &MonitorProgress,
    end_index: i64,
    tree_size: i64,
    processed: i64,
    matches: i64,
    parse_errors: i64,
) {
    let update = MonitorProgress {
        last_processed_index: end_index + 1,
        last_tree_size: tree_size,
        total_processed: prev.total_processed + processed,
        certs_in_last_cycle: processed,
        matches_in_last_cycle: matches,
        parse_errors_in_last_cycle: parse_errors,
        is_running: true,
        ..prev.clone()
    };
    if let Err(e) = deps.progress.update_progress(&update).await {
        error!(error = %e, "failed to update monitor progress");
    }
}

/// Refreshes `last_tree_size` and the timestamps without touching the
/// index or the per-cycle metrics.
async fn refresh_progress(deps: &Deps, prev: &MonitorProgress, tree_size: i64) {
    let update = MonitorProgress {
        last_tree_size: tree_size,
        is_running: true,
        ..prev.clone()
    };
    if let Err(e) = deps.progress.update_progress(&update).await {
        error!(error = %e, "failed to refresh monitor progress");
    }
}

async fn persist_error(deps: &Deps, message: &str) {
    if let Err(e) = deps.progress.set_last_error(message).await {
        warn!(error = %e, "failed to persist last error");
    }
}

async fn clear_error(deps: &Deps) {
    if let Err(e) = deps.progress.set_last_error("").await {
        warn!(error = %e, "failed to clear last error");
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SignedTreeHead;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
    use std::sync::Mutex as StdMutex;

    // --- mocks ---

    struct MockLogClient {
        tree_size: StdMutex<Option<i64>>,
        entries: StdMutex<Result<Vec<RawEntry>, String>>,
        entry_calls: StdMutex<Vec<(i64, i64)>>,
    }

    impl MockLogClient {
        fn with_tree(tree_size: i64, entries: Vec<RawEntry>) -> Self {
            Self {
                tree_size: StdMutex::new(Some(tree_size)),
                entries: StdMutex::new(Ok(entries)),
                entry_calls: StdMutex::new(Vec::new()),
            }
        }

        fn failing_sth() -> Self {
            Self {
                tree_size: StdMutex::new(None),
                entries: StdMutex::new(Ok(Vec::new())),
                entry_calls: StdMutex::new(Vec::new()),
            }
        }

        fn entry_calls(&self) -> Vec<(i64, i64)> {
            self.entry_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LogClient for MockLogClient {
        async fn get_sth(&self) -> anyhow::Result<SignedTreeHead> {
            match *self.tree_size.lock().unwrap() {
                Some(tree_size) => Ok(SignedTreeHead {
                    tree_size,
                    timestamp: 0,
                    root_hash: String::new(),
                }),
                None => Err(anyhow!("network error")),
            }
        }

        async fn get_entries(&self, start: i64, end: i64) -> anyhow::Result<Vec<RawEntry>> {
            self.entry_calls.lock().unwrap().push((start, end));
            match &*self.entries.lock().unwrap() {
                Ok(entries) => Ok(entries.clone()),
                Err(msg) => Err(anyhow!("{msg}")),
            }
        }
    }

    #[derive(Default)]
    struct MockKeywords {
        keywords: StdMutex<Vec<Keyword>>,
        fail: bool,
    }

    impl MockKeywords {
        fn with(values: &[(i64, &str)]) -> Self {
            Self {
                keywords: StdMutex::new(
                    values
                        .iter()
                        .map(|(id, value)| Keyword {
                            id: *id,
                            value: value.to_string(),
                            created_at: chrono::Utc::now(),
                        })
                        .collect(),
                ),
                fail: false,
            }
        }

        fn add(&self, id: i64, value: &str) {
            self.keywords.lock().unwrap().push(Keyword {
                id,
                value: value.to_string(),
                created_at: chrono::Utc::now(),
            });
        }
    }

    #[async_trait]
    impl KeywordLister for MockKeywords {
        async fn list_keywords(&self) -> anyhow::Result<Vec<Keyword>> {
            if self.fail {
                return Err(anyhow!("db error"));
            }
            Ok(self.keywords.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct MockMatches {
        stored: StdMutex<Vec<MatchedCertificate>>,
        fail: bool,
    }

    impl MockMatches {
        fn stored(&self) -> Vec<MatchedCertificate> {
            self.stored.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MatchPersister for MockMatches {
        async fn insert_match(&self, cert: &MatchedCertificate) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow!("insert failed"));
            }
            self.stored.lock().unwrap().push(cert.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockProgress {
        state: StdMutex<MonitorProgress>,
        fail_get: bool,
        updates: StdMutex<Vec<MonitorProgress>>,
        errors: StdMutex<Vec<String>>,
    }

    impl MockProgress {
        fn with_index(last_processed_index: i64) -> Self {
            Self {
                state: StdMutex::new(MonitorProgress {
                    last_processed_index,
                    ..Default::default()
                }),
                ..Default::default()
            }
        }

        fn updates(&self) -> Vec<MonitorProgress> {
            self.updates.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProgressStore for MockProgress {
        async fn get_progress(&self) -> anyhow::Result<MonitorProgress> {
            if self.fail_get {
                return Err(anyhow!("db error"));
            }
            Ok(self.state.lock().unwrap().clone())
        }

        async fn update_progress(&self, progress: &MonitorProgress) -> anyhow::Result<()> {
            let mut applied = progress.clone();
            applied.last_run_at = Some(chrono::Utc::now());
            applied.updated_at = chrono::Utc::now();
            *self.state.lock().unwrap() = applied.clone();
            self.updates.lock().unwrap().push(applied);
            Ok(())
        }

        async fn set_running(&self, running: bool) -> anyhow::Result<()> {
            self.state.lock().unwrap().is_running = running;
            Ok(())
        }

        async fn set_last_error(&self, message: &str) -> anyhow::Result<()> {
            self.state.lock().unwrap().last_error = message.to_string();
            self.errors.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    // --- helpers ---

    struct Fixture {
        log: Arc<MockLogClient>,
        keywords: Arc<MockKeywords>,
        matches: Arc<MockMatches>,
        progress: Arc<MockProgress>,
        deps: Deps,
    }

    fn fixture(log: MockLogClient, keywords: MockKeywords, progress: MockProgress) -> Fixture {
        let log = Arc::new(log);
        let keywords = Arc::new(keywords);
        let matches = Arc::new(MockMatches::default());
        let progress = Arc::new(progress);
        let deps = Deps {
            log_client: log.clone(),
            keywords: keywords.clone(),
            matches: matches.clone(),
            progress: progress.clone(),
        };
        Fixture {
            log,
            keywords,
            matches,
            progress,
            deps,
        }
    }

    fn self_signed_der(cn: &str, sans: &[&str]) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.serial_number = Some(SerialNumber::from(vec![0x01]));
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.self_signed(&key).unwrap().der().to_vec()
    }

    fn build_leaf(cert_der: &[u8]) -> RawEntry {
        let mut buf = vec![0u8, 0u8];
        buf.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&[
            (cert_der.len() >> 16) as u8,
            (cert_der.len() >> 8) as u8,
            cert_der.len() as u8,
        ]);
        buf.extend_from_slice(cert_der);
        RawEntry {
            leaf_input: buf,
            extra_data: Vec::new(),
        }
    }

    // --- process_batch tests ---

    #[tokio::test]
    async fn stores_match_and_advances_progress() {
        let entry = build_leaf(&self_signed_der("example.com", &["www.example.com"]));
        let f = fixture(
            MockLogClient::with_tree(200, vec![entry]),
            MockKeywords::with(&[(1, "example")]),
            MockProgress::with_index(100),
        );

        process_batch(&f.deps, 10, false, &mut None).await;

        let stored = f.matches.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].common_name, "example.com");
        assert_eq!(stored[0].keyword_id, 1);
        assert_eq!(stored[0].matched_domain, "example.com");
        assert_eq!(stored[0].ct_log_index, 100);
        assert_eq!(stored[0].serial_number, "1");

        let updates = f.progress.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].last_processed_index, 110);
        assert_eq!(updates[0].last_tree_size, 200);
        assert_eq!(updates[0].certs_in_last_cycle, 1);
        assert_eq!(updates[0].matches_in_last_cycle, 1);
        assert_eq!(updates[0].total_processed, 1);

        // A fully successful tick clears last_error.
        assert_eq!(f.progress.errors().last().map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn sth_error_aborts_tick_and_persists_error() {
        let f = fixture(
            MockLogClient::failing_sth(),
            MockKeywords::default(),
            MockProgress::with_index(100),
        );

        process_batch(&f.deps, 10, false, &mut None).await;

        assert!(f.log.entry_calls().is_empty());
        assert!(f.progress.updates().is_empty());
        assert_eq!(
            f.progress.errors(),
            vec!["failed to get STH: network error".to_string()]
        );
    }

    #[tokio::test]
    async fn progress_read_error_aborts_before_fetching() {
        let f = fixture(
            MockLogClient::with_tree(200, Vec::new()),
            MockKeywords::default(),
            MockProgress {
                fail_get: true,
                ..Default::default()
            },
        );

        process_batch(&f.deps, 10, false, &mut None).await;

        assert!(f.log.entry_calls().is_empty());
        assert_eq!(
            f.progress.errors(),
            vec!["failed to get monitor state: db error".to_string()]
        );
    }

    #[tokio::test]
    async fn fetch_error_leaves_progress_unchanged() {
        let log = MockLogClient::with_tree(200, Vec::new());
        *log.entries.lock().unwrap() = Err("boom".to_string());
        let f = fixture(log, MockKeywords::default(), MockProgress::with_index(100));

        process_batch(&f.deps, 10, false, &mut None).await;

        assert!(f.progress.updates().is_empty());
        assert_eq!(
            f.progress.errors(),
            vec!["failed to fetch entries: boom".to_string()]
        );
    }

    #[tokio::test]
    async fn caught_up_skip_mode_refreshes_without_fetching() {
        let f = fixture(
            MockLogClient::with_tree(100, Vec::new()),
            MockKeywords::default(),
            MockProgress::with_index(100),
        );
        f.progress.state.lock().unwrap().certs_in_last_cycle = 7;
        f.progress.state.lock().unwrap().matches_in_last_cycle = 3;

        let mut cache = None;
        process_batch(&f.deps, 10, false, &mut cache).await;
        process_batch(&f.deps, 10, false, &mut cache).await;

        assert!(f.log.entry_calls().is_empty());
        let updates = f.progress.updates();
        assert_eq!(updates.len(), 2);
        for update in &updates {
            // Index and rolling metrics are untouched on idle skip ticks.
            assert_eq!(update.last_processed_index, 100);
            assert_eq!(update.last_tree_size, 100);
            assert_eq!(update.certs_in_last_cycle, 7);
            assert_eq!(update.matches_in_last_cycle, 3);
        }
    }

    #[tokio::test]
    async fn keyword_load_error_aborts_after_fetch() {
        let entry = build_leaf(&self_signed_der("example.com", &[]));
        let f = fixture(
            MockLogClient::with_tree(200, vec![entry]),
            MockKeywords {
                fail: true,
                ..Default::default()
            },
            MockProgress::with_index(100),
        );

        process_batch(&f.deps, 10, false, &mut None).await;

        assert!(f.matches.stored().is_empty());
        assert!(f.progress.updates().is_empty());
        assert_eq!(
            f.progress.errors(),
            vec!["failed to load keywords: db error".to_string()]
        );
    }

    #[tokio::test]
    async fn no_keywords_still_advances_and_clears_error() {
        let entry = build_leaf(&self_signed_der("example.com", &[]));
        let f = fixture(
            MockLogClient::with_tree(200, vec![entry]),
            MockKeywords::default(),
            MockProgress::with_index(100),
        );

        process_batch(&f.deps, 10, false, &mut None).await;

        assert!(f.matches.stored().is_empty());
        let updates = f.progress.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].last_processed_index, 110);
        assert_eq!(updates[0].matches_in_last_cycle, 0);
        assert_eq!(f.progress.errors(), vec![String::new()]);
    }

    #[tokio::test]
    async fn parse_error_is_counted_and_isolated() {
        let bad = RawEntry {
            leaf_input: build_leaf(&[0xDE, 0xAD]).leaf_input,
            extra_data: Vec::new(),
        };
        let good = build_leaf(&self_signed_der("foo.example.net", &[]));
        let f = fixture(
            MockLogClient::with_tree(200, vec![bad, good]),
            MockKeywords::with(&[(1, "foo")]),
            MockProgress::with_index(100),
        );

        process_batch(&f.deps, 10, false, &mut None).await;

        let stored = f.matches.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].matched_domain, "foo.example.net");
        // The bad entry sits at batch_start; the good one right after it.
        assert_eq!(stored[0].ct_log_index, 101);

        let updates = f.progress.updates();
        assert_eq!(updates[0].parse_errors_in_last_cycle, 1);
        assert_eq!(updates[0].certs_in_last_cycle, 2);
        assert_eq!(updates[0].last_processed_index, 110);
    }

    #[tokio::test]
    async fn insert_error_does_not_abort_batch() {
        let entry = build_leaf(&self_signed_der("example.com", &[]));
        let log = MockLogClient::with_tree(200, vec![entry]);
        let keywords = MockKeywords::with(&[(1, "example")]);
        let matches = Arc::new(MockMatches {
            fail: true,
            ..Default::default()
        });
        let progress = Arc::new(MockProgress::with_index(100));
        let deps = Deps {
            log_client: Arc::new(log),
            keywords: Arc::new(keywords),
            matches: matches.clone(),
            progress: progress.clone(),
        };

        process_batch(&deps, 10, false, &mut None).await;

        let updates = progress.updates();
        assert_eq!(updates.len(), 1);
        // The match was lost but the entry was paid for: progress advances.
        assert_eq!(updates[0].matches_in_last_cycle, 0);
        assert_eq!(updates[0].last_processed_index, 110);
    }

    #[tokio::test]
    async fn first_run_starts_near_tree_head() {
        let f = fixture(
            MockLogClient::with_tree(1000, Vec::new()),
            MockKeywords::default(),
            MockProgress::with_index(0),
        );

        process_batch(&f.deps, 50, false, &mut None).await;

        assert_eq!(f.log.entry_calls(), vec![(950, 999)]);
        let updates = f.progress.updates();
        assert_eq!(updates[0].last_processed_index, 1000);
    }

    #[tokio::test]
    async fn first_run_clamps_small_trees_to_zero() {
        let f = fixture(
            MockLogClient::with_tree(5, Vec::new()),
            MockKeywords::default(),
            MockProgress::with_index(0),
        );

        process_batch(&f.deps, 50, false, &mut None).await;

        assert_eq!(f.log.entry_calls(), vec![(0, 4)]);
    }

    #[tokio::test]
    async fn rematch_mode_uses_cache_when_keyword_added_later() {
        let entry = build_leaf(&self_signed_der("example.com", &["www.example.com"]));
        let f = fixture(
            MockLogClient::with_tree(110, vec![entry]),
            MockKeywords::default(),
            MockProgress::with_index(100),
        );

        let mut cache = None;

        // First tick: entries fetched and cached, but no keywords yet.
        process_batch(&f.deps, 10, true, &mut cache).await;
        assert!(f.matches.stored().is_empty());
        assert_eq!(f.progress.updates()[0].last_processed_index, 110);

        f.keywords.add(1, "example");

        // Second tick: caught up; the cached batch is re-matched and the
        // index stays put.
        process_batch(&f.deps, 10, true, &mut cache).await;

        let stored = f.matches.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].keyword_id, 1);
        assert_eq!(stored[0].ct_log_index, 100);

        let updates = f.progress.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].last_processed_index, 110);
        assert_eq!(updates[1].matches_in_last_cycle, 1);
        // The cached batch was served from memory, not re-fetched.
        assert_eq!(f.log.entry_calls().len(), 1);
    }

    #[tokio::test]
    async fn rematch_mode_refetches_after_restart() {
        let entry = build_leaf(&self_signed_der("example.com", &[]));
        let f = fixture(
            MockLogClient::with_tree(110, vec![entry]),
            MockKeywords::with(&[(1, "example")]),
            MockProgress::with_index(110),
        );

        // No cache: a fresh process re-fetches the previous window.
        process_batch(&f.deps, 10, true, &mut None).await;

        assert_eq!(f.log.entry_calls(), vec![(100, 109)]);
        let stored = f.matches.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].ct_log_index, 100);
        assert_eq!(f.progress.updates()[0].last_processed_index, 110);
    }

    #[tokio::test]
    async fn rematch_mode_with_no_previous_batch_only_refreshes() {
        let f = fixture(
            MockLogClient::with_tree(0, Vec::new()),
            MockKeywords::default(),
            MockProgress::with_index(0),
        );

        process_batch(&f.deps, 10, true, &mut None).await;

        assert!(f.log.entry_calls().is_empty());
        let updates = f.progress.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].last_processed_index, 0);
    }

    #[tokio::test]
    async fn reprocessing_is_idempotent_across_ticks() {
        let entry = build_leaf(&self_signed_der("example.com", &[]));
        let f = fixture(
            MockLogClient::with_tree(110, vec![entry]),
            MockKeywords::with(&[(1, "example")]),
            MockProgress::with_index(110),
        );

        let mut cache = None;
        for _ in 0..3 {
            process_batch(&f.deps, 10, true, &mut cache).await;
        }

        // The mock records every insert; the real store deduplicates on
        // (serial, keyword_id). What matters here is the stable index.
        for update in f.progress.updates() {
            assert_eq!(update.last_processed_index, 110);
        }
    }
}
