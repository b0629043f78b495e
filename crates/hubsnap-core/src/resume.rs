//! Seeding a stage from memory or from checkpoints.
//!
//! A stage normally consumes its predecessor's in-memory result, but
//! after a crash or a partial run the same targets can be rebuilt from
//! the filesystem: a data checkpoint for a full resume, or an error
//! checkpoint for a fix-up run that re-attempts only failed targets.

use std::collections::HashSet;
use std::path::Path;

use crate::error::AppError;
use crate::sink::CheckpointReader;
use crate::unit::{Category, CrawlTarget, Fields};

/// Targets plus shared context for one stage run.
#[derive(Debug, Clone, Default)]
pub struct StageInput {
    pub targets: Vec<CrawlTarget>,
    pub context: Fields,
}

impl StageInput {
    pub fn new(targets: Vec<CrawlTarget>) -> Self {
        Self {
            targets,
            context: Fields::new(),
        }
    }

    pub fn with_context(mut self, context: Fields) -> Self {
        self.context = context;
        self
    }

    /// Build targets from records, reading the locator under
    /// `locator_key` and the category under `category`.
    pub fn from_records(records: &[Fields], locator_key: &str) -> Result<Self, AppError> {
        let mut targets = Vec::with_capacity(records.len());
        for record in records {
            targets.push(target_from_record(record, locator_key)?);
        }
        Ok(Self::new(targets))
    }

    /// Full resume: targets from a predecessor's data checkpoint.
    pub fn from_repo_checkpoint(
        path: impl AsRef<Path>,
        locator_key: &str,
    ) -> Result<Self, AppError> {
        let records = CheckpointReader::read(path)?;
        Self::from_records(&records, locator_key)
    }

    /// Fix-up run: targets from an error checkpoint, re-attempting only
    /// previously failed targets. Error checkpoints accumulate across
    /// runs, so repeated locators collapse to one target.
    pub fn from_error_checkpoint(
        path: impl AsRef<Path>,
        locator_key: &str,
    ) -> Result<Self, AppError> {
        let records = CheckpointReader::read(path)?;
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for record in &records {
            let target = target_from_record(record, locator_key)?;
            if seen.insert(target.clone()) {
                targets.push(target);
            }
        }
        Ok(Self::new(targets))
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

fn target_from_record(record: &Fields, locator_key: &str) -> Result<CrawlTarget, AppError> {
    let locator = string_field(record, locator_key)?;
    let category: Category = string_field(record, "category")?
        .parse()
        .map_err(AppError::Checkpoint)?;
    Ok(CrawlTarget::new(locator, category))
}

fn string_field(record: &Fields, key: &str) -> Result<String, AppError> {
    record
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::MissingKey {
            key: key.to_string(),
            present: record.keys().cloned().collect(),
        })
}
