//! Cross-snapshot aggregation.
//!
//! Each dated snapshot directory holds per-source processed
//! checkpoints. The aggregator reduces them to one record per
//! `(org, name)` pair: categorical fields keep their first-seen value,
//! numeric fields sum across snapshots with negative sentinel values
//! excluded from the sum rather than counted as zero.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::AppError;
use crate::sink::CheckpointReader;
use crate::unit::Fields;

pub const KEY_ORG: &str = "org";
pub const KEY_NAME: &str = "name";

/// One entity aggregated across every snapshot it appears in.
#[derive(Debug, Clone)]
pub struct MergedRecord {
    pub org: String,
    pub name: String,
    /// Merged fields, including `org` and `name`.
    pub fields: Fields,
    /// How many snapshot records contributed.
    pub occurrences: usize,
}

impl MergedRecord {
    /// Numeric field value for ranking; missing and non-numeric fields
    /// rank below every real value.
    pub fn metric(&self, by: &str) -> i64 {
        self.fields.get(by).and_then(Value::as_i64).unwrap_or(i64::MIN)
    }
}

/// Merge processed records, grouping by `(org, name)`.
///
/// Record order decides which snapshot is first-seen, so callers feed
/// snapshots oldest first. Zero input records is an error, never a
/// silently empty aggregate.
pub fn merge_records(records: Vec<Fields>) -> Result<Vec<MergedRecord>, AppError> {
    if records.is_empty() {
        return Err(AppError::Merge("no records to merge".into()));
    }

    let mut merged: BTreeMap<(String, String), MergedRecord> = BTreeMap::new();
    for record in records {
        let org = required_str(&record, KEY_ORG)?;
        let name = required_str(&record, KEY_NAME)?;
        let key = (org.clone(), name.clone());
        let entry = merged.entry(key).or_insert_with(|| MergedRecord {
            org,
            name,
            fields: Fields::new(),
            occurrences: 0,
        });
        entry.occurrences += 1;
        for (field, value) in record {
            merge_field(&mut entry.fields, &field, value);
        }
    }
    Ok(merged.into_values().collect())
}

/// Merge every `processed-*.jsonl` checkpoint under the given snapshot
/// directories. Directories are visited in sorted order, so dated
/// directory names (`YYYY-MM-DD`) arrive oldest first.
pub fn merge_snapshots(dirs: &[PathBuf]) -> Result<Vec<MergedRecord>, AppError> {
    let mut sorted: Vec<&PathBuf> = dirs.iter().collect();
    sorted.sort();

    let mut records = Vec::new();
    for dir in sorted {
        let mut files = Vec::new();
        collect_processed_files(dir, &mut files)?;
        files.sort();
        for file in files {
            records.extend(CheckpointReader::read(&file)?);
        }
    }
    merge_records(records)
}

/// Sort merged records by a numeric field, highest first. Ties keep
/// the stable `(org, name)` order.
pub fn rank(records: &mut [MergedRecord], by: &str) {
    records.sort_by_key(|r| std::cmp::Reverse(r.metric(by)));
}

fn merge_field(fields: &mut Fields, key: &str, value: Value) {
    match value.as_i64() {
        Some(n) => {
            let current = fields.get(key).and_then(Value::as_i64);
            let next = match (current, n) {
                // A negative value is a sentinel, excluded from the sum.
                (Some(sum), n) if n >= 0 && sum >= 0 => sum + n,
                (Some(sum), n) if n >= 0 && sum < 0 => n,
                (Some(sum), _) => sum,
                (None, n) => n,
            };
            fields.insert(key.to_string(), Value::from(next));
        }
        // Categorical fields keep the first-seen value.
        None => {
            if !fields.contains_key(key) {
                fields.insert(key.to_string(), value);
            }
        }
    }
}

fn required_str(record: &Fields, key: &str) -> Result<String, AppError> {
    record
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::Merge(format!("record without a {key:?} field")))
}

fn collect_processed_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), AppError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| AppError::Merge(format!("reading {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| AppError::Merge(format!("reading {}: {e}", dir.display())))?;
        let path = entry.path();
        if path.is_dir() {
            collect_processed_files(&path, out)?;
        } else if let Some(file_name) = path.file_name().and_then(|n| n.to_str())
            && file_name.starts_with("processed-")
            && file_name.ends_with(".jsonl")
        {
            out.push(path);
        }
    }
    Ok(())
}
