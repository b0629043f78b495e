//! Organization link configuration.
//!
//! Runs are seeded from a JSON file mapping organizations to the hub
//! sources they publish on and the organization page links on each:
//!
//! ```json
//! {
//!   "Acme AI": {
//!     "huggingface": ["https://huggingface.co/acme"],
//!     "modelscope": ["https://modelscope.cn/organization/acme"]
//!   }
//! }
//! ```
//!
//! Selection filters by requested orgs and sources and derives the
//! repo-to-org mapping later stages use to attribute entities.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::AppError;

/// Raw org-links file: org name to source name to org page links.
#[derive(Debug, Clone, Deserialize)]
pub struct OrgLinksConfig(BTreeMap<String, BTreeMap<String, Vec<String>>>);

/// The filtered slice of the config one run operates on.
#[derive(Debug, Clone)]
pub struct LinkSelection {
    /// Source name to every selected org page link on that source.
    pub links_by_source: BTreeMap<String, Vec<String>>,
    /// Repo name (last path segment of an org link) to owning org.
    pub repo_org_mapper: BTreeMap<String, String>,
    pub orgs: Vec<String>,
}

impl LinkSelection {
    pub fn total_links(&self) -> usize {
        self.links_by_source.values().map(Vec::len).sum()
    }
}

impl OrgLinksConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("parsing {}: {e}", path.display())))?;
        if config.0.is_empty() {
            return Err(AppError::Config(format!(
                "org-links config is empty: {}",
                path.display()
            )));
        }
        Ok(config)
    }

    pub fn from_map(map: BTreeMap<String, BTreeMap<String, Vec<String>>>) -> Self {
        Self(map)
    }

    /// All source names appearing anywhere in the config.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .0
            .values()
            .flat_map(|by_source| by_source.keys().cloned())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    /// Filter to the requested orgs and sources. `None` means all.
    ///
    /// Requesting a source the config never mentions, or a combination
    /// matching nothing, is a config error rather than an empty run. So
    /// is one repo name mapping to two different orgs.
    pub fn select(
        &self,
        orgs: Option<&[String]>,
        sources: Option<&[String]>,
    ) -> Result<LinkSelection, AppError> {
        let known_sources = self.sources();
        if let Some(requested) = sources {
            for source in requested {
                if !known_sources.contains(source) {
                    return Err(AppError::Config(format!(
                        "unknown source {source:?}; config has {known_sources:?}"
                    )));
                }
            }
        }
        let source_wanted = |source: &str| match sources {
            Some(requested) => requested.iter().any(|s| s == source),
            None => true,
        };
        let org_wanted = |org: &str| match orgs {
            Some(requested) => requested.iter().any(|o| o == org),
            None => true,
        };

        let mut links_by_source: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut repo_org_mapper: BTreeMap<String, String> = BTreeMap::new();
        let mut selected_orgs = Vec::new();

        for (org, by_source) in &self.0 {
            if !org_wanted(org) {
                continue;
            }
            let mut org_selected = false;
            for (source, links) in by_source {
                if !source_wanted(source) {
                    continue;
                }
                org_selected = true;
                for link in links {
                    let repo = repo_name(link);
                    match repo_org_mapper.get(repo) {
                        Some(owner) if owner != org => {
                            return Err(AppError::Config(format!(
                                "repo {repo:?} claimed by both {owner:?} and {org:?}"
                            )));
                        }
                        Some(_) => {}
                        None => {
                            repo_org_mapper.insert(repo.to_string(), org.clone());
                        }
                    }
                }
                links_by_source
                    .entry(source.clone())
                    .or_default()
                    .extend(links.iter().cloned());
            }
            if org_selected {
                selected_orgs.push(org.clone());
            }
        }

        if links_by_source.is_empty() {
            return Err(AppError::Config(
                "no org links match the requested orgs and sources".into(),
            ));
        }
        Ok(LinkSelection {
            links_by_source,
            repo_org_mapper,
            orgs: selected_orgs,
        })
    }
}

/// Last path segment of an org page link.
pub(crate) fn repo_name(link: &str) -> &str {
    link.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(link)
}
