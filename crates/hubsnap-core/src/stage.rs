//! Concurrent retrying crawl stage.
//!
//! Transforms a batch of [`CrawlTarget`]s into a completion-ordered
//! stream of [`PipelineUnit`]s using a collaborator-supplied
//! [`Scraper`], under bounded concurrency, with fixed-delay retry.
//! Failures never escape the stream: a target either succeeds or, after
//! `max_retries` re-attempts, finalizes as an error unit carrying the
//! last failure reason and the target's identifying fields.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::error::AppError;
use crate::pool::DriverPool;
use crate::traits::Scraper;
use crate::unit::{CrawlTarget, Fields, PipelineUnit, exhausted_error};

/// Per-stage crawl configuration.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Worker concurrency bound; also the driver pool size.
    pub threads: usize,
    /// Re-attempts after the first failure. A target is scraped at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Fixed delay before a failed target is resubmitted.
    pub retry_delay: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            max_retries: 10,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl StageConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Events emitted by a running stage for live progress reporting.
#[derive(Debug, Clone)]
pub enum StageEvent<'a> {
    Started {
        stage: &'a str,
        targets: usize,
    },
    TargetSucceeded {
        stage: &'a str,
        locator: &'a str,
        summary: Option<&'a Fields>,
    },
    TargetRetrying {
        stage: &'a str,
        locator: &'a str,
        attempt: u32,
        error: &'a str,
    },
    TargetFailed {
        stage: &'a str,
        locator: &'a str,
        attempts: u32,
        error: &'a str,
    },
    Finished {
        stage: &'a str,
        succeeded: usize,
        failed: usize,
    },
}

/// Receives stage events (decoupled progress reporting; injected per
/// orchestrator instance, never global).
pub trait StageReporter: Send + Sync {
    fn report(&self, event: StageEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStageReporter;

impl StageReporter for TracingStageReporter {
    fn report(&self, event: StageEvent<'_>) {
        match event {
            StageEvent::Started { stage, targets } => {
                tracing::info!(%stage, %targets, "Stage started");
            }
            StageEvent::TargetSucceeded {
                stage,
                locator,
                summary,
            } => {
                tracing::info!(%stage, %locator, ?summary, "Target scraped");
            }
            StageEvent::TargetRetrying {
                stage,
                locator,
                attempt,
                error,
            } => {
                tracing::warn!(%stage, %locator, %attempt, %error, "Target failed, will retry");
            }
            StageEvent::TargetFailed {
                stage,
                locator,
                attempts,
                error,
            } => {
                tracing::error!(%stage, %locator, %attempts, %error, "Target failed permanently");
            }
            StageEvent::Finished {
                stage,
                succeeded,
                failed,
            } => {
                tracing::info!(%stage, %succeeded, %failed, "Stage finished");
            }
        }
    }
}

/// Finite, non-restartable stream of pipeline units in completion
/// order. Consumed exactly once by the caller.
pub struct UnitStream {
    rx: mpsc::Receiver<PipelineUnit>,
}

impl UnitStream {
    /// An already-finished stream (for empty target lists).
    pub fn empty() -> Self {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<PipelineUnit> {
        self.rx.recv().await
    }

    pub async fn collect(mut self) -> Vec<PipelineUnit> {
        let mut units = Vec::new();
        while let Some(unit) = self.next().await {
            units.push(unit);
        }
        units
    }
}

/// One bounded-concurrency, retrying transformation from crawl targets
/// to a unit stream.
pub struct CrawlStage<S, F>
where
    S: Scraper,
    F: crate::pool::DriverFactory<Driver = S::Driver>,
{
    name: String,
    config: StageConfig,
    scraper: S,
    factory: F,
    /// Key under which a failed target's locator is recorded in error
    /// units (e.g. `repo_link`, `detail_link`), so fix-up runs can
    /// reseed targets from the error checkpoint alone.
    locator_key: String,
}

impl<S, F> CrawlStage<S, F>
where
    S: Scraper,
    F: crate::pool::DriverFactory<Driver = S::Driver>,
{
    pub fn new(
        name: impl Into<String>,
        config: StageConfig,
        scraper: S,
        factory: F,
        locator_key: impl Into<String>,
    ) -> Result<Self, AppError> {
        if config.threads == 0 {
            return Err(AppError::Config("stage threads must be at least 1".into()));
        }
        Ok(Self {
            name: name.into(),
            config,
            scraper,
            factory,
            locator_key: locator_key.into(),
        })
    }

    /// Run the stage over `targets`, merging `context` into every
    /// emitted success payload.
    ///
    /// The driver pool is created here, sized to `threads`, and shut
    /// down once every target has reached a final outcome. Each worker
    /// holds one pool driver for the duration of one scrape call; retry
    /// delays are slept without holding a driver or a worker slot.
    pub async fn run<R>(
        self,
        targets: Vec<CrawlTarget>,
        context: Fields,
        reporter: Arc<R>,
    ) -> Result<UnitStream, AppError>
    where
        R: StageReporter + 'static,
    {
        reporter.report(StageEvent::Started {
            stage: &self.name,
            targets: targets.len(),
        });

        if targets.is_empty() {
            reporter.report(StageEvent::Finished {
                stage: &self.name,
                succeeded: 0,
                failed: 0,
            });
            return Ok(UnitStream::empty());
        }

        let pool = Arc::new(DriverPool::new(self.factory.clone(), self.config.threads).await?);
        let workers = Arc::new(Semaphore::new(self.config.threads));
        // Capacity covers one unit per target, so sends never block even
        // if the consumer lags the crawl.
        let (tx, rx) = mpsc::channel(targets.len());

        let name = Arc::new(self.name);
        let locator_key = Arc::new(self.locator_key);
        let context = Arc::new(context);
        let config = self.config;

        let mut tasks: JoinSet<bool> = JoinSet::new();
        for target in targets {
            tasks.spawn(run_target(
                target,
                config.clone(),
                self.scraper.clone(),
                Arc::clone(&pool),
                Arc::clone(&workers),
                tx.clone(),
                Arc::clone(&name),
                Arc::clone(&locator_key),
                Arc::clone(&context),
                Arc::clone(&reporter),
            ));
        }
        drop(tx);

        tokio::spawn(async move {
            let mut succeeded = 0usize;
            let mut failed = 0usize;
            while let Some(res) = tasks.join_next().await {
                match res {
                    Ok(true) => succeeded += 1,
                    Ok(false) => failed += 1,
                    Err(e) => {
                        // A worker panic loses that target's unit but
                        // must not wedge the stage or the pool.
                        tracing::error!(error = %e, "Stage worker task failed");
                        failed += 1;
                    }
                }
            }
            pool.shutdown().await;
            reporter.report(StageEvent::Finished {
                stage: &name,
                succeeded,
                failed,
            });
        });

        Ok(UnitStream { rx })
    }
}

/// Drive one target to its final outcome: success unit or, after
/// retries are exhausted, an error unit. Returns whether it succeeded.
#[allow(clippy::too_many_arguments)]
async fn run_target<S, F, R>(
    target: CrawlTarget,
    config: StageConfig,
    scraper: S,
    pool: Arc<DriverPool<F>>,
    workers: Arc<Semaphore>,
    tx: mpsc::Sender<PipelineUnit>,
    stage: Arc<String>,
    locator_key: Arc<String>,
    context: Arc<Fields>,
    reporter: Arc<R>,
) -> bool
where
    S: Scraper,
    F: crate::pool::DriverFactory<Driver = S::Driver>,
    R: StageReporter,
{
    let mut failures: u32 = 0;
    loop {
        let outcome = {
            let _slot = workers
                .acquire()
                .await
                .expect("stage semaphore never closed");
            match pool.acquire().await {
                Ok(mut driver) => scraper.scrape(&mut driver, &target).await,
                Err(e) => Err(e),
            }
            // Driver and worker slot released here, before any retry sleep.
        };

        match outcome {
            Ok(record) => {
                let mut payload = record.payload;
                for (key, value) in context.iter() {
                    payload.insert(key.clone(), value.clone());
                }
                reporter.report(StageEvent::TargetSucceeded {
                    stage: &stage,
                    locator: &target.locator,
                    summary: (!record.message.is_empty()).then_some(&record.message),
                });
                let unit = if record.message.is_empty() {
                    PipelineUnit::success(payload)
                } else {
                    PipelineUnit::success_with_message(payload, record.message)
                };
                let _ = tx.send(unit).await;
                return true;
            }
            Err(error) => {
                failures += 1;
                let reason = error.to_string();
                if failures <= config.max_retries {
                    reporter.report(StageEvent::TargetRetrying {
                        stage: &stage,
                        locator: &target.locator,
                        attempt: failures,
                        error: &reason,
                    });
                    tokio::time::sleep(config.retry_delay).await;
                } else {
                    reporter.report(StageEvent::TargetFailed {
                        stage: &stage,
                        locator: &target.locator,
                        attempts: failures,
                        error: &reason,
                    });
                    let record = exhausted_error(&target, &locator_key, &reason);
                    let _ = tx.send(PipelineUnit::failure(record)).await;
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::testutil::{MockDriverFactory, RecordingReporter, ScriptedScraper};
    use crate::unit::Category;

    fn fast_config(threads: usize, max_retries: u32) -> StageConfig {
        StageConfig::default()
            .with_threads(threads)
            .with_max_retries(max_retries)
            .with_retry_delay(Duration::from_millis(1))
    }

    fn targets(locators: &[&str]) -> Vec<CrawlTarget> {
        locators
            .iter()
            .map(|l| CrawlTarget::new(*l, Category::Models))
            .collect()
    }

    #[tokio::test]
    async fn empty_target_list_yields_empty_stream() {
        let stage = CrawlStage::new(
            "repo-page",
            fast_config(2, 3),
            ScriptedScraper::always_ok(),
            MockDriverFactory::new(),
            "repo_link",
        )
        .unwrap();

        let units = stage
            .run(vec![], Fields::new(), Arc::new(RecordingReporter::new()))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(units.is_empty());
    }

    #[tokio::test]
    async fn all_targets_accounted_for_exactly_once() {
        let scraper = ScriptedScraper::always_ok().with_failures("B", 1).with_failures("D", 99);
        let stage = CrawlStage::new(
            "repo-page",
            fast_config(3, 2),
            scraper,
            MockDriverFactory::new(),
            "repo_link",
        )
        .unwrap();

        let units = stage
            .run(
                targets(&["A", "B", "C", "D", "E"]),
                Fields::new(),
                Arc::new(RecordingReporter::new()),
            )
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(units.len(), 5);
        let mut seen = HashSet::new();
        for unit in &units {
            let locator = if let Some(payload) = &unit.payload {
                payload["locator"].as_str().unwrap().to_string()
            } else {
                unit.error.as_ref().unwrap()["repo_link"]
                    .as_str()
                    .unwrap()
                    .to_string()
            };
            assert!(seen.insert(locator), "duplicate outcome for a target");
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(units.iter().filter(|u| u.is_error()).count(), 1);
    }

    #[tokio::test]
    async fn fails_k_times_then_succeeds_invokes_k_plus_one_scrapes() {
        let scraper = ScriptedScraper::always_ok().with_failures("A", 2);
        let stage = CrawlStage::new(
            "repo-page",
            fast_config(1, 5),
            scraper.clone(),
            MockDriverFactory::new(),
            "repo_link",
        )
        .unwrap();

        let units = stage
            .run(
                targets(&["A"]),
                Fields::new(),
                Arc::new(RecordingReporter::new()),
            )
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(units.len(), 1);
        assert!(units[0].is_success());
        assert_eq!(scraper.calls_for("A"), 3);
    }

    #[tokio::test]
    async fn always_failing_target_attempted_max_retries_plus_one_times() {
        let scraper = ScriptedScraper::always_ok().with_failures("A", u32::MAX);
        let stage = CrawlStage::new(
            "repo-page",
            fast_config(1, 4),
            scraper.clone(),
            MockDriverFactory::new(),
            "repo_link",
        )
        .unwrap();

        let units = stage
            .run(
                targets(&["A"]),
                Fields::new(),
                Arc::new(RecordingReporter::new()),
            )
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(units.len(), 1);
        let error = units[0].error.as_ref().unwrap();
        assert_eq!(error["repo_link"], "A");
        assert_eq!(error["category"], "models");
        assert!(error["error_msg"].as_str().unwrap().contains("scripted failure"));
        assert_eq!(scraper.calls_for("A"), 5);
    }

    #[tokio::test]
    async fn flaky_middle_target_recovers_with_zero_error_records() {
        // 3 targets, B fails twice then succeeds, generous retry budget.
        let scraper = ScriptedScraper::always_ok().with_failures("B", 2);
        let stage = CrawlStage::new(
            "repo-page",
            fast_config(3, 5),
            scraper.clone(),
            MockDriverFactory::new(),
            "repo_link",
        )
        .unwrap();

        let units = stage
            .run(
                targets(&["A", "B", "C"]),
                Fields::new(),
                Arc::new(RecordingReporter::new()),
            )
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.is_success()));
        assert_eq!(scraper.calls_for("B"), 3);
        assert_eq!(scraper.calls_for("A"), 1);
        assert_eq!(scraper.calls_for("C"), 1);
    }

    #[tokio::test]
    async fn context_is_merged_into_success_payloads() {
        let mut context = Fields::new();
        context.insert("run_date".into(), "2026-08-28".into());

        let stage = CrawlStage::new(
            "repo-page",
            fast_config(1, 0),
            ScriptedScraper::always_ok(),
            MockDriverFactory::new(),
            "repo_link",
        )
        .unwrap();

        let units = stage
            .run(
                targets(&["A"]),
                context,
                Arc::new(RecordingReporter::new()),
            )
            .await
            .unwrap()
            .collect()
            .await;

        let payload = units[0].payload.as_ref().unwrap();
        assert_eq!(payload["run_date"], "2026-08-28");
        assert_eq!(payload["locator"], "A");
    }

    #[tokio::test]
    async fn reporter_sees_lifecycle_events() {
        let reporter = Arc::new(RecordingReporter::new());
        let scraper = ScriptedScraper::always_ok().with_failures("A", 1);
        let stage = CrawlStage::new(
            "repo-page",
            fast_config(1, 2),
            scraper,
            MockDriverFactory::new(),
            "repo_link",
        )
        .unwrap();

        stage
            .run(targets(&["A"]), Fields::new(), Arc::clone(&reporter))
            .await
            .unwrap()
            .collect()
            .await;

        // Finished is reported by the drain task, shortly after the
        // stream closes.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let events = reporter.labels();
        assert_eq!(events.first().map(String::as_str), Some("Started"));
        assert!(events.iter().any(|e| e == "TargetRetrying"));
        assert!(events.iter().any(|e| e == "TargetSucceeded"));
        assert_eq!(events.last().map(String::as_str), Some("Finished"));
    }

    #[tokio::test]
    async fn zero_threads_is_a_config_error() {
        let err = CrawlStage::new(
            "repo-page",
            StageConfig::default().with_threads(0),
            ScriptedScraper::always_ok(),
            MockDriverFactory::new(),
            "repo_link",
        )
        .err()
        .unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }
}
