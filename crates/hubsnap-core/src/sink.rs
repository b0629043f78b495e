//! NDJSON checkpoint files.
//!
//! Every stage persists its outcomes to two line-delimited JSON files:
//! a data checkpoint for success payloads and an error checkpoint for
//! exhausted targets. Each record is flushed as it is written so a
//! crashed run leaves behind every completed unit.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::unit::{Fields, PipelineUnit};

/// How an existing data checkpoint is treated when a sink opens it.
///
/// Error checkpoints are always appended to, whatever the mode, so
/// failure history survives recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Keep existing records and add to them (crawl stages).
    Append,
    /// Start the checkpoint over (recomputing stages).
    Truncate,
}

fn io_err(context: &str, path: &Path, e: std::io::Error) -> AppError {
    AppError::Sink(format!("{context} {}: {e}", path.display()))
}

/// One line-delimited JSON output file with optional key projection.
pub struct JsonlWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    required_keys: Vec<String>,
    drop_keys: Vec<String>,
}

impl JsonlWriter {
    /// Open `path` for writing, creating parent directories as needed.
    /// The path must end in `.jsonl`.
    pub fn open(path: impl Into<PathBuf>, mode: WriteMode) -> Result<Self, AppError> {
        let path = path.into();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            return Err(AppError::Sink(format!(
                "checkpoint path must end in .jsonl: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| io_err("creating", parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(mode == WriteMode::Append)
            .write(true)
            .truncate(mode == WriteMode::Truncate)
            .open(&path)
            .map_err(|e| io_err("opening", &path, e))?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            required_keys: Vec::new(),
            drop_keys: Vec::new(),
        })
    }

    /// Keys every written record must carry, checked after dropping.
    pub fn with_required_keys(mut self, keys: &[&str]) -> Self {
        self.required_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Keys removed from every record before writing.
    pub fn with_drop_keys(mut self, keys: &[&str]) -> Self {
        self.drop_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Project, serialize and flush one record.
    ///
    /// A missing required key is a structural defect of that one record
    /// and returns [`AppError::MissingKey`] without touching the file.
    pub fn write(&mut self, record: &Fields) -> Result<(), AppError> {
        let projected = self.project(record)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| AppError::Sink(format!("writer closed: {}", self.path.display())))?;
        serde_json::to_writer(&mut *writer, &projected)?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|e| io_err("writing", &self.path, e))
    }

    fn project(&self, record: &Fields) -> Result<Fields, AppError> {
        let mut projected: Fields = record
            .iter()
            .filter(|(key, _)| !self.drop_keys.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for key in &self.required_keys {
            if !projected.contains_key(key) {
                return Err(AppError::MissingKey {
                    key: key.clone(),
                    present: projected.keys().cloned().collect(),
                });
            }
        }
        Ok(projected)
    }

    /// Flush and release the file handle. Idempotent.
    pub fn close(&mut self) -> Result<(), AppError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| io_err("flushing", &self.path, e))?;
        }
        Ok(())
    }
}

/// The persistence side of one stage: a data checkpoint plus an
/// always-appended error checkpoint.
///
/// A stage run with saving disabled still persists its errors, so the
/// durable failure record survives memory-only runs.
pub struct StageSink {
    data: Option<JsonlWriter>,
    errors: JsonlWriter,
}

impl StageSink {
    pub fn new(
        data_path: impl Into<PathBuf>,
        error_path: impl Into<PathBuf>,
        mode: WriteMode,
    ) -> Result<Self, AppError> {
        Ok(Self {
            data: Some(JsonlWriter::open(data_path, mode)?),
            errors: JsonlWriter::open(error_path, WriteMode::Append)?,
        })
    }

    /// A sink that discards success payloads and persists only errors.
    pub fn errors_only(error_path: impl Into<PathBuf>) -> Result<Self, AppError> {
        Ok(Self {
            data: None,
            errors: JsonlWriter::open(error_path, WriteMode::Append)?,
        })
    }

    /// Projection applies to the data checkpoint only; error records are
    /// written whole so fix-up runs keep every identifying field.
    pub fn with_required_keys(mut self, keys: &[&str]) -> Self {
        self.data = self.data.map(|w| w.with_required_keys(keys));
        self
    }

    pub fn with_drop_keys(mut self, keys: &[&str]) -> Self {
        self.data = self.data.map(|w| w.with_drop_keys(keys));
        self
    }

    pub fn data_path(&self) -> Option<&Path> {
        self.data.as_ref().map(JsonlWriter::path)
    }

    pub fn error_path(&self) -> &Path {
        self.errors.path()
    }

    /// Route one unit to the matching checkpoint.
    pub fn accept(&mut self, unit: &PipelineUnit) -> Result<(), AppError> {
        if let Some(payload) = &unit.payload {
            match &mut self.data {
                Some(writer) => writer.write(payload),
                None => Ok(()),
            }
        } else if let Some(error) = &unit.error {
            self.errors.write(error)
        } else {
            Err(AppError::Sink("unit carries neither payload nor error".into()))
        }
    }

    pub fn close(&mut self) -> Result<(), AppError> {
        if let Some(data) = &mut self.data {
            data.close()?;
        }
        self.errors.close()
    }
}

/// Reads a whole checkpoint back into memory.
pub struct CheckpointReader;

impl CheckpointReader {
    /// Parse every non-blank line of `path` as a JSON object.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<Fields>, AppError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| AppError::Checkpoint(format!("opening {}: {e}", path.display())))?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.map_err(|e| AppError::Checkpoint(format!("reading {}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Fields = serde_json::from_str(&line).map_err(|e| {
                AppError::Checkpoint(format!("{} line {}: {e}", path.display(), idx + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn record(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn rejects_non_jsonl_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonlWriter::open(dir.path().join("out.csv"), WriteMode::Append).err().unwrap();
        assert!(matches!(err, AppError::Sink(_)));
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2026-08-28/huggingface/repo-page.jsonl");
        let mut writer = JsonlWriter::open(&path, WriteMode::Append).unwrap();
        writer.write(&record(&[("org", "acme")])).unwrap();
        assert_eq!(CheckpointReader::read(&path).unwrap().len(), 1);
    }

    #[test]
    fn drop_keys_are_removed_and_required_keys_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut writer = JsonlWriter::open(&path, WriteMode::Truncate)
            .unwrap()
            .with_drop_keys(&["scratch"])
            .with_required_keys(&["org", "name"]);

        writer
            .write(&record(&[("org", "acme"), ("name", "bert"), ("scratch", "x")]))
            .unwrap();

        let err = writer.write(&record(&[("org", "acme")])).unwrap_err();
        match err {
            AppError::MissingKey { key, present } => {
                assert_eq!(key, "name");
                assert_eq!(present, vec!["org".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let records = CheckpointReader::read(&path).unwrap();
        assert_eq!(records.len(), 1, "bad record must not reach the file");
        assert!(!records[0].contains_key("scratch"));
    }

    #[test]
    fn truncate_restarts_data_but_error_file_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data.jsonl");
        let errors = dir.path().join("data-errors.jsonl");

        for run in 0..2 {
            let mut sink = StageSink::new(&data, &errors, WriteMode::Truncate).unwrap();
            sink.accept(&PipelineUnit::success(record(&[("run", &run.to_string())])))
                .unwrap();
            sink.accept(&PipelineUnit::failure(record(&[("error_msg", "boom")])))
                .unwrap();
            sink.close().unwrap();
        }

        assert_eq!(CheckpointReader::read(&data).unwrap().len(), 1);
        assert_eq!(CheckpointReader::read(&errors).unwrap().len(), 2);
    }

    #[test]
    fn errors_only_sink_discards_payloads_but_keeps_errors() {
        let dir = tempfile::tempdir().unwrap();
        let errors = dir.path().join("repo-page-errors.jsonl");
        let mut sink = StageSink::errors_only(&errors).unwrap();

        sink.accept(&PipelineUnit::success(record(&[("org", "acme")])))
            .unwrap();
        sink.accept(&PipelineUnit::failure(record(&[("error_msg", "boom")])))
            .unwrap();
        sink.close().unwrap();

        assert!(sink.data_path().is_none());
        assert_eq!(CheckpointReader::read(&errors).unwrap().len(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn append_mode_extends_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        for _ in 0..2 {
            let mut writer = JsonlWriter::open(&path, WriteMode::Append).unwrap();
            writer.write(&record(&[("org", "acme")])).unwrap();
            writer.close().unwrap();
        }
        assert_eq!(CheckpointReader::read(&path).unwrap().len(), 2);
    }

    #[test]
    fn reader_skips_blank_lines_and_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        std::fs::write(&path, "{\"org\":\"acme\"}\n\n{\"org\":\"zeta\"}\n").unwrap();
        assert_eq!(CheckpointReader::read(&path).unwrap().len(), 2);

        std::fs::write(&path, "{\"org\":\"acme\"}\nnot json\n").unwrap();
        let err = CheckpointReader::read(&path).unwrap_err();
        assert!(matches!(err, AppError::Checkpoint(_)));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn missing_checkpoint_is_a_checkpoint_error() {
        let err = CheckpointReader::read("/nonexistent/never.jsonl").unwrap_err();
        assert!(matches!(err, AppError::Checkpoint(_)));
    }

    #[test]
    fn close_is_idempotent_and_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            JsonlWriter::open(dir.path().join("out.jsonl"), WriteMode::Append).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        let err = writer.write(&record(&[("org", "acme")])).unwrap_err();
        assert!(matches!(err, AppError::Sink(_)));
    }
}
