//! Shared test doubles for pool, stage and pipeline tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde_json::Value;

use crate::error::AppError;
use crate::pool::DriverFactory;
use crate::stage::{StageEvent, StageReporter};
use crate::traits::{Scraper, ScrapeRecord};
use crate::unit::{CrawlTarget, Fields};

/// In-memory driver handed out by [`MockDriverFactory`].
#[derive(Debug)]
pub struct MockDriver {
    pub id: u64,
}

#[derive(Debug, Default)]
struct MockFactoryState {
    next_id: AtomicU64,
    created: AtomicUsize,
    torn_down: AtomicUsize,
    probe_failures: AtomicUsize,
    create_failures: AtomicUsize,
    teardown_errors: AtomicBool,
}

/// Factory of id-stamped in-memory drivers with scriptable failures.
#[derive(Debug, Clone, Default)]
pub struct MockDriverFactory {
    state: Arc<MockFactoryState>,
}

impl MockDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every teardown return an error.
    pub fn with_teardown_errors(self) -> Self {
        self.state.teardown_errors.store(true, Ordering::Release);
        self
    }

    /// Make the next liveness probe report an unhealthy driver.
    pub fn fail_next_probe(&self) {
        self.state.probe_failures.fetch_add(1, Ordering::AcqRel);
    }

    /// Make the next driver creation fail.
    pub fn fail_next_create(&self) {
        self.state.create_failures.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of drivers successfully created so far.
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::Acquire)
    }

    /// Number of drivers handed to teardown so far.
    pub fn torn_down(&self) -> usize {
        self.state.torn_down.load(Ordering::Acquire)
    }

    fn consume(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DriverFactory for MockDriverFactory {
    type Driver = MockDriver;

    async fn create(&self) -> Result<MockDriver, AppError> {
        if Self::consume(&self.state.create_failures) {
            return Err(AppError::Browser("scripted create failure".into()));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::AcqRel);
        self.state.created.fetch_add(1, Ordering::AcqRel);
        Ok(MockDriver { id })
    }

    async fn probe(&self, _driver: &mut MockDriver) -> bool {
        !Self::consume(&self.state.probe_failures)
    }

    async fn teardown(&self, _driver: MockDriver) -> Result<(), AppError> {
        self.state.torn_down.fetch_add(1, Ordering::AcqRel);
        if self.state.teardown_errors.load(Ordering::Acquire) {
            return Err(AppError::Browser("scripted teardown failure".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Script {
    remaining_failures: u32,
    calls: u32,
}

/// Scraper whose per-target outcomes follow a script: each target fails
/// a configured number of times, then succeeds with a payload echoing
/// the target. Call counts are recorded for assertions.
#[derive(Debug, Clone, Default)]
pub struct ScriptedScraper {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
}

impl ScriptedScraper {
    /// Succeeds on every call unless a failure script is added.
    pub fn always_ok() -> Self {
        Self::default()
    }

    /// Fail the first `failures` calls for `locator`, then succeed.
    pub fn with_failures(self, locator: &str, failures: u32) -> Self {
        self.scripts.lock().unwrap().insert(
            locator.to_string(),
            Script {
                remaining_failures: failures,
                calls: 0,
            },
        );
        self
    }

    /// How many times `locator` has been scraped.
    pub fn calls_for(&self, locator: &str) -> u32 {
        self.scripts
            .lock()
            .unwrap()
            .get(locator)
            .map(|s| s.calls)
            .unwrap_or(0)
    }
}

impl Scraper for ScriptedScraper {
    type Driver = MockDriver;

    async fn scrape(
        &self,
        _driver: &mut MockDriver,
        target: &CrawlTarget,
    ) -> Result<ScrapeRecord, AppError> {
        let fail = {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.entry(target.locator.clone()).or_default();
            script.calls += 1;
            if script.remaining_failures > 0 {
                script.remaining_failures = script.remaining_failures.saturating_sub(1);
                true
            } else {
                false
            }
        };
        if fail {
            return Err(AppError::Scrape(format!(
                "scripted failure for {}",
                target.locator
            )));
        }
        let mut payload = Fields::new();
        payload.insert("locator".into(), Value::String(target.locator.clone()));
        payload.insert(
            "category".into(),
            Value::String(target.category.to_string()),
        );
        Ok(ScrapeRecord::new(payload))
    }
}

#[derive(Debug, Default)]
struct Canned {
    extra: Fields,
    remaining_failures: u32,
    calls: u32,
}

/// Scraper returning canned per-locator payloads for orchestrator
/// tests. Every success payload echoes the locator under `locator_key`
/// plus the target category, then the canned extra fields.
#[derive(Debug, Clone)]
pub struct CannedScraper {
    locator_key: String,
    canned: Arc<Mutex<HashMap<String, Canned>>>,
}

impl CannedScraper {
    pub fn new(locator_key: &str) -> Self {
        Self {
            locator_key: locator_key.to_string(),
            canned: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_payload(self, locator: &str, extra: Fields) -> Self {
        self.canned
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_default()
            .extra = extra;
        self
    }

    /// Fail the first `failures` calls for `locator`, then succeed.
    pub fn with_failures(self, locator: &str, failures: u32) -> Self {
        self.canned
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_default()
            .remaining_failures = failures;
        self
    }

    pub fn calls_for(&self, locator: &str) -> u32 {
        self.canned
            .lock()
            .unwrap()
            .get(locator)
            .map(|c| c.calls)
            .unwrap_or(0)
    }
}

impl Scraper for CannedScraper {
    type Driver = MockDriver;

    async fn scrape(
        &self,
        _driver: &mut MockDriver,
        target: &CrawlTarget,
    ) -> Result<ScrapeRecord, AppError> {
        let mut canned = self.canned.lock().unwrap();
        let entry = canned.entry(target.locator.clone()).or_default();
        entry.calls += 1;
        if entry.remaining_failures > 0 {
            entry.remaining_failures -= 1;
            return Err(AppError::Scrape(format!(
                "scripted failure for {}",
                target.locator
            )));
        }
        let mut payload = Fields::new();
        payload.insert(
            self.locator_key.clone(),
            Value::String(target.locator.clone()),
        );
        payload.insert(
            "category".into(),
            Value::String(target.category.to_string()),
        );
        for (k, v) in &entry.extra {
            payload.insert(k.clone(), v.clone());
        }
        Ok(ScrapeRecord::new(payload))
    }
}

/// Reporter that records the variant name of every event it sees.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl StageReporter for RecordingReporter {
    fn report(&self, event: StageEvent<'_>) {
        let label = match event {
            StageEvent::Started { .. } => "Started",
            StageEvent::TargetSucceeded { .. } => "TargetSucceeded",
            StageEvent::TargetRetrying { .. } => "TargetRetrying",
            StageEvent::TargetFailed { .. } => "TargetFailed",
            StageEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
