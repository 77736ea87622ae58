#![allow(dead_code)]
//! Mock capability implementations for exercising the monitor's public
//! lifecycle from the outside.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use certsentry::core::{
    Keyword, KeywordLister, LogClient, MatchPersister, MatchedCertificate, MonitorProgress,
    ProgressStore, RawEntry, SignedTreeHead,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A log client stub that counts STH calls. Each tick fails fast (the
/// lifecycle tests only care that ticks happen), and it can be armed to
/// panic instead.
#[derive(Default)]
pub struct MockLogClient {
    pub sth_calls: AtomicUsize,
    pub panic_on_sth: AtomicBool,
}

impl MockLogClient {
    pub fn panicking() -> Self {
        Self {
            sth_calls: AtomicUsize::new(0),
            panic_on_sth: AtomicBool::new(true),
        }
    }

    pub fn calls(&self) -> usize {
        self.sth_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogClient for MockLogClient {
    async fn get_sth(&self) -> Result<SignedTreeHead> {
        self.sth_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_sth.load(Ordering::SeqCst) {
            panic!("boom in tick");
        }
        Err(anyhow!("stub"))
    }

    async fn get_entries(&self, _start: i64, _end: i64) -> Result<Vec<RawEntry>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub struct MockKeywords;

#[async_trait]
impl KeywordLister for MockKeywords {
    async fn list_keywords(&self) -> Result<Vec<Keyword>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub struct MockMatches;

#[async_trait]
impl MatchPersister for MockMatches {
    async fn insert_match(&self, _cert: &MatchedCertificate) -> Result<()> {
        Ok(())
    }
}

/// A progress store that records the lifecycle writes it receives.
#[derive(Default)]
pub struct MockProgress {
    pub running_calls: Mutex<Vec<bool>>,
    pub last_error: Mutex<String>,
    pub fail_set_running: AtomicBool,
}

impl MockProgress {
    pub fn failing_set_running() -> Self {
        Self {
            fail_set_running: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn running_calls(&self) -> Vec<bool> {
        self.running_calls.lock().unwrap().clone()
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressStore for MockProgress {
    async fn get_progress(&self) -> Result<MonitorProgress> {
        Ok(MonitorProgress::default())
    }

    async fn update_progress(&self, _progress: &MonitorProgress) -> Result<()> {
        Ok(())
    }

    async fn set_running(&self, running: bool) -> Result<()> {
        if self.fail_set_running.load(Ordering::SeqCst) {
            return Err(anyhow!("db down"));
        }
        self.running_calls.lock().unwrap().push(running);
        Ok(())
    }

    async fn set_last_error(&self, message: &str) -> Result<()> {
        *self.last_error.lock().unwrap() = message.to_string();
        Ok(())
    }
}

/// Polls a condition until it holds or a two-second deadline expires.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Bundles the mocks behind a monitor with a fast tick interval.
pub struct TestMonitor {
    pub monitor: Arc<certsentry::monitor::Monitor>,
    pub log: Arc<MockLogClient>,
    pub progress: Arc<MockProgress>,
}

pub fn test_monitor(log: MockLogClient, progress: MockProgress) -> TestMonitor {
    let log = Arc::new(log);
    let progress = Arc::new(progress);
    let monitor = Arc::new(certsentry::monitor::Monitor::new(
        log.clone(),
        Arc::new(MockKeywords),
        Arc::new(MockMatches),
        progress.clone(),
        10,
        Duration::from_millis(20),
        false,
    ));
    TestMonitor {
        monitor,
        log,
        progress,
    }
}
