//! Per-source staged orchestrator.
//!
//! A [`SourcePipeline`] drives one hub source through the four stages
//! of a snapshot: org links, repo pages, detail pages, post-processing.
//! Each stage consumes its predecessor's in-memory result by default
//! and can instead be seeded from a checkpoint through its options
//! struct, which is how resumed and fix-up runs work. Stage methods
//! return `Result<&mut Self>` so full runs chain fluently.
//!
//! All checkpoints for a run live under `<root>/<YYYY-MM-DD>/<source>/`
//! with fixed file names, so a snapshot is recoverable from the
//! filesystem layout alone.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::Value;

use crate::error::AppError;
use crate::links::{OrgLinksConfig, repo_name};
use crate::pool::DriverFactory;
use crate::resume::StageInput;
use crate::sink::{JsonlWriter, StageSink, WriteMode};
use crate::stage::{CrawlStage, StageConfig, StageReporter};
use crate::traits::{Enricher, Scraper};
use crate::unit::{Category, Fields, PipelineUnit};

pub const ORG_LINKS_FILE: &str = "org-links.jsonl";
pub const REPO_PAGE_FILE: &str = "repo-page.jsonl";
pub const REPO_PAGE_ERRORS_FILE: &str = "repo-page-errors.jsonl";
pub const DETAIL_ERRORS_FILE: &str = "detail-page-errors.jsonl";
pub const POST_PROCESS_ERRORS_FILE: &str = "post-process-errors.jsonl";

pub const KEY_REPO_LINK: &str = "repo_link";
pub const KEY_DETAIL_LINK: &str = "detail_link";

pub fn raw_info_file(category: Category) -> &'static str {
    match category {
        Category::Models => "raw-models-info.jsonl",
        Category::Datasets => "raw-datasets-info.jsonl",
    }
}

pub fn processed_info_file(category: Category) -> &'static str {
    match category {
        Category::Models => "processed-models-info.jsonl",
        Category::Datasets => "processed-datasets-info.jsonl",
    }
}

/// How far a pipeline has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    NotStarted,
    LinksReady,
    RepoPagesReady,
    DetailPagesReady,
    PostProcessed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::NotStarted => "not-started",
            PipelineState::LinksReady => "links-ready",
            PipelineState::RepoPagesReady => "repo-pages-ready",
            PipelineState::DetailPagesReady => "detail-pages-ready",
            PipelineState::PostProcessed => "post-processed",
        };
        write!(f, "{s}")
    }
}

/// Options for [`SourcePipeline::init_links`].
#[derive(Debug, Clone)]
pub struct LinksOptions {
    pub config_path: PathBuf,
    /// Restrict the run to these orgs; `None` takes every org that
    /// publishes on this pipeline's source.
    pub orgs: Option<Vec<String>>,
    pub categories: Vec<Category>,
}

impl LinksOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            orgs: None,
            categories: vec![Category::Models, Category::Datasets],
        }
    }

    pub fn with_orgs(mut self, orgs: Vec<String>) -> Self {
        self.orgs = Some(orgs);
        self
    }

    pub fn with_categories(mut self, categories: Vec<Category>) -> Self {
        self.categories = categories;
        self
    }
}

/// Options for [`SourcePipeline::crawl_repo_page`].
#[derive(Debug, Clone, Default)]
pub struct RepoStageOptions {
    pub stage: StageConfig,
    /// Seed targets explicitly (resume or fix-up) instead of from the
    /// in-memory links result.
    pub input: Option<StageInput>,
}

impl RepoStageOptions {
    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_input(mut self, input: StageInput) -> Self {
        self.input = Some(input);
        self
    }
}

/// Options for [`SourcePipeline::crawl_detail_page`].
#[derive(Debug, Clone, Default)]
pub struct DetailStageOptions {
    pub stage: StageConfig,
    pub input: Option<StageInput>,
}

impl DetailStageOptions {
    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_input(mut self, input: StageInput) -> Self {
        self.input = Some(input);
        self
    }
}

/// Options for [`SourcePipeline::post_process`].
#[derive(Debug, Clone)]
pub struct PostProcessOptions {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Process these records (read back from raw checkpoints) instead
    /// of the in-memory detail result.
    pub input: Option<Vec<Fields>>,
}

impl Default for PostProcessOptions {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_retries: 2,
            retry_delay: Duration::from_secs(5),
            input: None,
        }
    }
}

impl PostProcessOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
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

    pub fn with_input(mut self, records: Vec<Fields>) -> Self {
        self.input = Some(records);
        self
    }
}

/// Staged crawl of one hub source into one dated snapshot directory.
pub struct SourcePipeline {
    source: String,
    snapshot_dir: PathBuf,
    state: PipelineState,
    repo_org_mapper: BTreeMap<String, String>,
    link_rows: Vec<Fields>,
    repo_rows: Vec<Fields>,
    raw_rows: Vec<Fields>,
    processed_rows: Vec<Fields>,
}

impl SourcePipeline {
    pub fn new(save_root: impl AsRef<Path>, date: NaiveDate, source: impl Into<String>) -> Self {
        let source = source.into();
        let snapshot_dir = save_root
            .as_ref()
            .join(date.format("%Y-%m-%d").to_string())
            .join(&source);
        Self {
            source,
            snapshot_dir,
            state: PipelineState::NotStarted,
            repo_org_mapper: BTreeMap::new(),
            link_rows: Vec::new(),
            repo_rows: Vec::new(),
            raw_rows: Vec::new(),
            processed_rows: Vec::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn checkpoint_path(&self, file: &str) -> PathBuf {
        self.snapshot_dir.join(file)
    }

    pub fn link_rows(&self) -> &[Fields] {
        &self.link_rows
    }

    pub fn repo_rows(&self) -> &[Fields] {
        &self.repo_rows
    }

    pub fn raw_rows(&self) -> &[Fields] {
        &self.raw_rows
    }

    pub fn processed_rows(&self) -> &[Fields] {
        &self.processed_rows
    }

    /// Load the org-links config, filter it to this source, and build
    /// the crawl targets for the repo-page stage.
    pub fn init_links(&mut self, save: bool, opts: LinksOptions) -> Result<&mut Self, AppError> {
        let config = OrgLinksConfig::load(&opts.config_path)?;
        let selection = config.select(
            opts.orgs.as_deref(),
            Some(std::slice::from_ref(&self.source)),
        )?;
        self.repo_org_mapper = selection.repo_org_mapper.clone();

        let mut rows = Vec::new();
        for link in selection
            .links_by_source
            .get(&self.source)
            .into_iter()
            .flatten()
        {
            for category in &opts.categories {
                let mut row = Fields::new();
                row.insert(KEY_REPO_LINK.into(), Value::String(link.clone()));
                row.insert("category".into(), Value::String(category.to_string()));
                row.insert("source".into(), Value::String(self.source.clone()));
                if let Some(org) = self.repo_org_mapper.get(repo_name(link)) {
                    row.insert("org".into(), Value::String(org.clone()));
                }
                rows.push(row);
            }
        }

        if save {
            let mut writer = JsonlWriter::open(
                self.checkpoint_path(ORG_LINKS_FILE),
                WriteMode::Truncate,
            )?;
            for row in &rows {
                writer.write(row)?;
            }
            writer.close()?;
        }

        tracing::info!(
            source = %self.source,
            orgs = selection.orgs.len(),
            targets = rows.len(),
            "Org links initialized"
        );
        self.link_rows = rows;
        self.advance(PipelineState::LinksReady);
        Ok(self)
    }

    /// Crawl org repo pages, harvesting detail page links. Each success
    /// unit fans out into one checkpoint row per discovered detail link.
    pub async fn crawl_repo_page<S, F, R>(
        &mut self,
        save: bool,
        scraper: S,
        factory: F,
        reporter: Arc<R>,
        opts: RepoStageOptions,
    ) -> Result<&mut Self, AppError>
    where
        S: Scraper,
        F: DriverFactory<Driver = S::Driver>,
        R: StageReporter + 'static,
    {
        let input = match opts.input {
            Some(input) => input,
            None => {
                self.require_state(PipelineState::LinksReady, "crawl_repo_page")?;
                StageInput::from_records(&self.link_rows, KEY_REPO_LINK)?
            }
        };
        let mut context = input.context.clone();
        context.insert("source".into(), Value::String(self.source.clone()));

        let stage = CrawlStage::new("repo-page", opts.stage, scraper, factory, KEY_REPO_LINK)?;
        let mut stream = stage.run(input.targets, context, reporter).await?;

        let mut sink = if save {
            StageSink::new(
                self.checkpoint_path(REPO_PAGE_FILE),
                self.checkpoint_path(REPO_PAGE_ERRORS_FILE),
                WriteMode::Append,
            )?
            .with_required_keys(&[KEY_DETAIL_LINK, "category", "org"])
        } else {
            StageSink::errors_only(self.checkpoint_path(REPO_PAGE_ERRORS_FILE))?
        };

        let mut rows = Vec::new();
        while let Some(unit) = stream.next().await {
            let Some(payload) = unit.payload else {
                sink.accept(&unit)?;
                continue;
            };
            match self.expand_repo_payload(&payload) {
                Ok(expanded) => {
                    for row in expanded {
                        self.write_row(&mut sink, row, &mut rows)?;
                    }
                }
                Err(reason) => {
                    let record = structural_error(
                        &payload,
                        &reason,
                        &[KEY_REPO_LINK, "category", "source"],
                    );
                    sink.accept(&PipelineUnit::failure(record))?;
                }
            }
        }
        sink.close()?;

        self.repo_rows.extend(rows);
        self.advance(PipelineState::RepoPagesReady);
        Ok(self)
    }

    /// Crawl entity detail pages. Success rows land in per-category raw
    /// checkpoints; failures share one error checkpoint for the stage.
    pub async fn crawl_detail_page<S, F, R>(
        &mut self,
        save: bool,
        scraper: S,
        factory: F,
        reporter: Arc<R>,
        opts: DetailStageOptions,
    ) -> Result<&mut Self, AppError>
    where
        S: Scraper,
        F: DriverFactory<Driver = S::Driver>,
        R: StageReporter + 'static,
    {
        let input = match opts.input {
            Some(input) => input,
            None => {
                self.require_state(PipelineState::RepoPagesReady, "crawl_detail_page")?;
                StageInput::from_records(&self.repo_rows, KEY_DETAIL_LINK)?
            }
        };
        let mut context = input.context.clone();
        context.insert("source".into(), Value::String(self.source.clone()));

        let stage = CrawlStage::new("detail-page", opts.stage, scraper, factory, KEY_DETAIL_LINK)?;
        let mut stream = stage.run(input.targets, context, reporter).await?;

        let mut errors = JsonlWriter::open(
            self.checkpoint_path(DETAIL_ERRORS_FILE),
            WriteMode::Append,
        )?;
        let mut data: BTreeMap<Category, JsonlWriter> = BTreeMap::new();

        let mut rows = Vec::new();
        while let Some(unit) = stream.next().await {
            if let Some(error) = &unit.error {
                errors.write(error)?;
                continue;
            }
            let Some(mut payload) = unit.payload else {
                continue;
            };
            let category = match payload_category(&payload) {
                Ok(category) => category,
                Err(reason) => {
                    errors.write(&structural_error(
                        &payload,
                        &reason,
                        &[KEY_DETAIL_LINK, "name", "source"],
                    ))?;
                    continue;
                }
            };
            self.attribute_org(&mut payload);
            if save {
                // A data checkpoint failure costs one record, not the
                // stage: the error checkpoint keeps the identifying
                // fields so a fix-up run can re-crawl the target.
                let written = self
                    .raw_writer(&mut data, category)
                    .and_then(|writer| writer.write(&payload));
                if let Err(e) = written {
                    errors.write(&structural_error(
                        &payload,
                        &e.to_string(),
                        &[KEY_DETAIL_LINK, "name", "category", "source"],
                    ))?;
                    continue;
                }
            }
            rows.push(payload);
        }
        for writer in data.values_mut() {
            writer.close()?;
        }
        errors.close()?;

        self.raw_rows.extend(rows);
        self.advance(PipelineState::DetailPagesReady);
        Ok(self)
    }

    /// Enrich raw detail records in batches and write the processed
    /// per-category checkpoints. Recomputes from scratch every run, so
    /// the processed checkpoints open in truncate mode.
    pub async fn post_process<E>(
        &mut self,
        save: bool,
        enricher: E,
        opts: PostProcessOptions,
    ) -> Result<&mut Self, AppError>
    where
        E: Enricher,
    {
        if opts.batch_size == 0 {
            return Err(AppError::Config("post-process batch size must be at least 1".into()));
        }
        let rows = match opts.input {
            Some(rows) => rows,
            None => {
                self.require_state(PipelineState::DetailPagesReady, "post_process")?;
                self.raw_rows.clone()
            }
        };

        let mut errors = JsonlWriter::open(
            self.checkpoint_path(POST_PROCESS_ERRORS_FILE),
            WriteMode::Append,
        )?;
        let mut data: BTreeMap<Category, JsonlWriter> = BTreeMap::new();

        let mut processed = Vec::new();
        for batch in rows.chunks(opts.batch_size) {
            match enrich_with_retry(&enricher, batch, opts.max_retries, opts.retry_delay).await {
                Ok(enriched) => {
                    for row in enriched {
                        let category = match payload_category(&row) {
                            Ok(category) => category,
                            Err(reason) => {
                                errors.write(&structural_error(
                                    &row,
                                    &reason,
                                    &[KEY_DETAIL_LINK, "name", "org"],
                                ))?;
                                continue;
                            }
                        };
                        if save {
                            let written = self
                                .processed_writer(&mut data, category)
                                .and_then(|writer| writer.write(&row));
                            if let Err(e) = written {
                                errors.write(&structural_error(
                                    &row,
                                    &e.to_string(),
                                    &[KEY_DETAIL_LINK, "name", "category"],
                                ))?;
                                continue;
                            }
                        }
                        processed.push(row);
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    for row in batch {
                        errors.write(&structural_error(
                            row,
                            &reason,
                            &[KEY_DETAIL_LINK, "name", "category", "org"],
                        ))?;
                    }
                }
            }
        }
        for writer in data.values_mut() {
            writer.close()?;
        }
        errors.close()?;

        self.processed_rows = processed;
        self.advance(PipelineState::PostProcessed);
        Ok(self)
    }

    fn raw_writer<'a>(
        &self,
        writers: &'a mut BTreeMap<Category, JsonlWriter>,
        category: Category,
    ) -> Result<&'a mut JsonlWriter, AppError> {
        if !writers.contains_key(&category) {
            let writer = JsonlWriter::open(
                self.checkpoint_path(raw_info_file(category)),
                WriteMode::Append,
            )?
            .with_required_keys(&[KEY_DETAIL_LINK, "name", "org", "category"]);
            writers.insert(category, writer);
        }
        Ok(writers.get_mut(&category).expect("writer just inserted"))
    }

    fn processed_writer<'a>(
        &self,
        writers: &'a mut BTreeMap<Category, JsonlWriter>,
        category: Category,
    ) -> Result<&'a mut JsonlWriter, AppError> {
        if !writers.contains_key(&category) {
            let writer = JsonlWriter::open(
                self.checkpoint_path(processed_info_file(category)),
                WriteMode::Truncate,
            )?
            .with_required_keys(&["org", "name"]);
            writers.insert(category, writer);
        }
        Ok(writers.get_mut(&category).expect("writer just inserted"))
    }

    /// One repo-page payload carries every detail link found on that
    /// page; fan it out into one row per link.
    fn expand_repo_payload(&self, payload: &Fields) -> Result<Vec<Fields>, String> {
        let links = payload
            .get("detail_links")
            .and_then(Value::as_array)
            .ok_or_else(|| "repo page payload without a detail_links array".to_string())?;
        let category = payload
            .get("category")
            .and_then(Value::as_str)
            .ok_or_else(|| "repo page payload without a category".to_string())?;

        let mut rows = Vec::with_capacity(links.len());
        for link in links {
            let Some(link) = link.as_str() else {
                return Err("detail_links entry is not a string".to_string());
            };
            let mut row = Fields::new();
            row.insert(KEY_DETAIL_LINK.into(), Value::String(link.to_string()));
            row.insert("category".into(), Value::String(category.to_string()));
            row.insert("source".into(), Value::String(self.source.clone()));
            self.attribute_org(&mut row);
            rows.push(row);
        }
        Ok(rows)
    }

    /// Attach the owning org, resolved through the repo-org mapping
    /// built by `init_links`. Resumed runs without that mapping fall
    /// back to the owner path segment of the detail link.
    fn attribute_org(&self, row: &mut Fields) {
        if row.contains_key("org") {
            return;
        }
        let Some(owner) = row
            .get(KEY_DETAIL_LINK)
            .and_then(Value::as_str)
            .and_then(owner_segment)
        else {
            return;
        };
        let org = self
            .repo_org_mapper
            .get(owner)
            .cloned()
            .unwrap_or_else(|| owner.to_string());
        row.insert("org".into(), Value::String(org));
    }

    /// A data checkpoint failure is converted into an error record for
    /// the same sink; only a failure of the error checkpoint itself
    /// propagates.
    fn write_row(
        &self,
        sink: &mut StageSink,
        row: Fields,
        rows: &mut Vec<Fields>,
    ) -> Result<(), AppError> {
        match sink.accept(&PipelineUnit::success(row.clone())) {
            Ok(()) => {
                rows.push(row);
                Ok(())
            }
            Err(e) => {
                let record = structural_error(
                    &row,
                    &e.to_string(),
                    &[KEY_DETAIL_LINK, "category", "source"],
                );
                sink.accept(&PipelineUnit::failure(record))
            }
        }
    }

    fn require_state(&self, wanted: PipelineState, operation: &str) -> Result<(), AppError> {
        if self.state < wanted {
            return Err(AppError::Config(format!(
                "{operation} needs the pipeline at {wanted} or later, but it is {}",
                self.state
            )));
        }
        Ok(())
    }

    fn advance(&mut self, to: PipelineState) {
        if self.state < to {
            self.state = to;
        }
    }
}

async fn enrich_with_retry<E: Enricher>(
    enricher: &E,
    batch: &[Fields],
    max_retries: u32,
    retry_delay: Duration,
) -> Result<Vec<Fields>, AppError> {
    let mut failures = 0;
    loop {
        match enricher.enrich(batch).await {
            Ok(enriched) => return Ok(enriched),
            Err(e) => {
                failures += 1;
                if failures > max_retries || !e.is_retryable() {
                    return Err(e);
                }
                tracing::warn!(attempt = failures, error = %e, "Enrichment batch failed, retrying");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

fn payload_category(payload: &Fields) -> Result<Category, String> {
    payload
        .get("category")
        .and_then(Value::as_str)
        .ok_or_else(|| "payload without a category".to_string())?
        .parse()
}

/// Error record for a structurally bad payload, keeping whichever
/// identifying fields the payload still has.
fn structural_error(payload: &Fields, reason: &str, keys: &[&str]) -> Fields {
    let mut record = Fields::new();
    record.insert("error_msg".into(), Value::String(reason.to_string()));
    for key in keys {
        if let Some(value) = payload.get(*key) {
            record.insert(key.to_string(), value.clone());
        }
    }
    record
}

/// Owner path segment of a detail link (`…/owner/entity`).
fn owner_segment(link: &str) -> Option<&str> {
    let mut parts = link.trim_end_matches('/').rsplit('/');
    parts.next()?;
    parts.next()
}
