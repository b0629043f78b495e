use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON object map used for payloads, messages and error records.
pub type Fields = serde_json::Map<String, Value>;

/// Which kind of hub entity a crawl unit is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Models,
    Datasets,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Models => "models",
            Category::Datasets => "datasets",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "models" => Ok(Category::Models),
            "datasets" => Ok(Category::Datasets),
            _ => Err(format!("Unknown category: {}", s)),
        }
    }
}

/// One unit of scrape work: a page locator plus the entity category
/// wanted from it. Immutable once created; consumed exactly once per
/// stage run (success or exhausted retries).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrawlTarget {
    pub locator: String,
    pub category: Category,
}

impl CrawlTarget {
    pub fn new(locator: impl Into<String>, category: Category) -> Self {
        Self {
            locator: locator.into(),
            category,
        }
    }
}

/// The envelope flowing between all pipeline stages.
///
/// Exactly one of `payload` or `error` is populated. `message` only
/// accompanies a payload and carries a human-auditable summary for
/// progress reporting, distinct from the durable payload itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineUnit {
    pub payload: Option<Fields>,
    pub message: Option<Fields>,
    pub error: Option<Fields>,
}

impl PipelineUnit {
    /// A success unit with a payload and no summary message.
    pub fn success(payload: Fields) -> Self {
        Self {
            payload: Some(payload),
            message: None,
            error: None,
        }
    }

    /// A success unit with a payload and a progress summary.
    pub fn success_with_message(payload: Fields, message: Fields) -> Self {
        Self {
            payload: Some(payload),
            message: Some(message),
            error: None,
        }
    }

    /// An error unit. The record should carry the failure reason and the
    /// originating target's identifying fields so fix-up runs can reseed
    /// from it.
    pub fn failure(error: Fields) -> Self {
        Self {
            payload: None,
            message: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.payload.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Build an error record for a target that exhausted its retries.
pub fn exhausted_error(target: &CrawlTarget, locator_key: &str, error_msg: &str) -> Fields {
    let mut record = Fields::new();
    record.insert("error_msg".to_string(), Value::String(error_msg.to_string()));
    record.insert(
        locator_key.to_string(),
        Value::String(target.locator.clone()),
    );
    record.insert(
        "category".to_string(),
        Value::String(target.category.to_string()),
    );
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_roundtrip() {
        for category in [Category::Models, Category::Datasets] {
            let s = category.as_str();
            let parsed: Category = s.parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert!("papers".parse::<Category>().is_err());
    }

    #[test]
    fn test_category_keys_ordered_maps() {
        let mut by_category = std::collections::BTreeMap::new();
        by_category.insert(Category::Datasets, 1);
        by_category.insert(Category::Models, 2);
        assert_eq!(by_category[&Category::Models], 2);
        assert_eq!(by_category.len(), 2);
    }

    #[test]
    fn test_unit_invariant() {
        let mut payload = Fields::new();
        payload.insert("repo".into(), "acme".into());

        let ok = PipelineUnit::success(payload.clone());
        assert!(ok.is_success());
        assert!(!ok.is_error());

        let mut error = Fields::new();
        error.insert("error_msg".into(), "timeout".into());
        let bad = PipelineUnit::failure(error);
        assert!(bad.is_error());
        assert!(!bad.is_success());
    }

    #[test]
    fn test_exhausted_error_carries_target_identity() {
        let target = CrawlTarget::new("https://hub.test/acme", Category::Datasets);
        let record = exhausted_error(&target, "repo_link", "502 bad gateway");

        assert_eq!(record["error_msg"], "502 bad gateway");
        assert_eq!(record["repo_link"], "https://hub.test/acme");
        assert_eq!(record["category"], "datasets");
    }
}
