//! Hub page scrapers.
//!
//! Two scrapers cover the two crawl stages: [`RepoPageScraper`]
//! harvests detail page links from an org's listing page, and
//! [`DetailPageScraper`] reads one entity's name and counters, with an
//! optional full-page screenshot. Both are driven through a pooled
//! [`BrowserDriver`]; the HTML itself is parsed off the rendered DOM
//! with CSS selectors, configurable per hub.

use std::path::PathBuf;

use hubsnap_core::traits::{ScrapeRecord, Scraper};
use hubsnap_core::unit::{Category, CrawlTarget, Fields};
use hubsnap_core::AppError;
use scraper::{Html, Selector};
use serde_json::Value;
use url::Url;

use crate::browser::BrowserDriver;
use crate::parse::count_to_i64;

/// Counter fields the detail scraper records as `-1` when the page
/// does not render them. The merge step treats negatives as sentinels.
const MISSING_COUNT: i64 = -1;

fn compile(selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector)
        .map_err(|e| AppError::Config(format!("bad selector {selector:?}: {e}")))
}

/// Harvests detail page links from an org listing page.
///
/// Listing pages paginate by query parameter; the scraper walks pages
/// until one yields no new links.
#[derive(Debug, Clone)]
pub struct RepoPageScraper {
    /// Selector for anchors pointing at entity detail pages.
    link_selector: String,
    /// Appended to the org link with the category and page number,
    /// e.g. `https://hub/org?tab=models&p=2`.
    page_param: String,
}

impl RepoPageScraper {
    pub fn new(link_selector: &str) -> Self {
        Self {
            link_selector: link_selector.to_string(),
            page_param: "p".to_string(),
        }
    }

    /// Defaults for Hugging Face org pages.
    pub fn huggingface() -> Self {
        Self::new("article a[href]")
    }

    fn page_url(&self, target: &CrawlTarget, page: usize) -> Result<Url, AppError> {
        let mut url = Url::parse(&target.locator)
            .map_err(|e| AppError::Scrape(format!("bad org link {}: {e}", target.locator)))?;
        url.query_pairs_mut()
            .append_pair("tab", target.category.as_str())
            .append_pair(&self.page_param, &page.to_string());
        Ok(url)
    }
}

impl Scraper for RepoPageScraper {
    type Driver = BrowserDriver;

    async fn scrape(
        &self,
        driver: &mut BrowserDriver,
        target: &CrawlTarget,
    ) -> Result<ScrapeRecord, AppError> {
        let base = Url::parse(&target.locator)
            .map_err(|e| AppError::Scrape(format!("bad org link {}: {e}", target.locator)))?;

        let mut links: Vec<String> = Vec::new();
        for page in 0.. {
            let url = self.page_url(target, page)?;
            let html = driver.fetch(url.as_str()).await?;
            let found = extract_detail_links(&html, &base, &self.link_selector)?;
            let before = links.len();
            for link in found {
                if !links.contains(&link) {
                    links.push(link);
                }
            }
            if links.len() == before {
                break;
            }
        }

        let mut payload = Fields::new();
        payload.insert(
            "repo_link".into(),
            Value::String(target.locator.clone()),
        );
        payload.insert(
            "category".into(),
            Value::String(target.category.to_string()),
        );
        payload.insert(
            "detail_links".into(),
            Value::Array(links.iter().map(|l| Value::String(l.clone())).collect()),
        );

        let mut message = Fields::new();
        message.insert("detail_links_found".into(), Value::from(links.len()));
        Ok(ScrapeRecord::new(payload).with_message(message))
    }
}

/// Anchors under `selector`, resolved against `base`, deduplicated in
/// document order. Self-links back to the org page are skipped.
fn extract_detail_links(html: &str, base: &Url, selector: &str) -> Result<Vec<String>, AppError> {
    let selector = compile(selector)?;
    let document = Html::parse_document(html);
    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        let resolved = resolved.to_string();
        if resolved == base.as_str() || links.contains(&resolved) {
            continue;
        }
        links.push(resolved);
    }
    Ok(links)
}

/// CSS selectors for one category's detail page layout.
#[derive(Debug, Clone)]
pub struct DetailSelectors {
    pub name: String,
    pub downloads: String,
    pub likes: String,
    pub community: String,
    /// Count of entities derived from this one; models only.
    pub used_num: Option<String>,
}

impl DetailSelectors {
    pub fn huggingface_models() -> Self {
        Self {
            name: "h1 a.font-mono".into(),
            downloads: "dl dd".into(),
            likes: "button[title^='See users who liked'] + div".into(),
            community: "a[href$='/discussions'] span".into(),
            used_num: Some("a[href*='other=base_model'] span".into()),
        }
    }

    pub fn huggingface_datasets() -> Self {
        Self {
            used_num: None,
            ..Self::huggingface_models()
        }
    }
}

/// Reads one entity detail page into a raw info record.
#[derive(Debug, Clone)]
pub struct DetailPageScraper {
    models: DetailSelectors,
    datasets: DetailSelectors,
    screenshot_dir: Option<PathBuf>,
}

impl DetailPageScraper {
    pub fn new(models: DetailSelectors, datasets: DetailSelectors) -> Self {
        Self {
            models,
            datasets,
            screenshot_dir: None,
        }
    }

    pub fn huggingface() -> Self {
        Self::new(
            DetailSelectors::huggingface_models(),
            DetailSelectors::huggingface_datasets(),
        )
    }

    /// Save a full-page screenshot of every detail page into `dir`,
    /// named `<owner>-<entity>.png`.
    pub fn with_screenshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = Some(dir.into());
        self
    }

    fn selectors(&self, category: Category) -> &DetailSelectors {
        match category {
            Category::Models => &self.models,
            Category::Datasets => &self.datasets,
        }
    }
}

impl Scraper for DetailPageScraper {
    type Driver = BrowserDriver;

    async fn scrape(
        &self,
        driver: &mut BrowserDriver,
        target: &CrawlTarget,
    ) -> Result<ScrapeRecord, AppError> {
        let page = driver.open(&target.locator).await?;
        let html = page
            .content()
            .await
            .map_err(|e| AppError::Scrape(format!("Failed to read page content: {e}")));
        let html = match html {
            Ok(html) => html,
            Err(e) => {
                BrowserDriver::close_page(page).await;
                return Err(e);
            }
        };

        let mut payload =
            match extract_detail_fields(&html, self.selectors(target.category)) {
                Ok(payload) => payload,
                Err(e) => {
                    BrowserDriver::close_page(page).await;
                    return Err(e);
                }
            };
        payload.insert(
            "detail_link".into(),
            Value::String(target.locator.clone()),
        );
        payload.insert(
            "category".into(),
            Value::String(target.category.to_string()),
        );

        if let Some(dir) = &self.screenshot_dir {
            let file = format!("{}.png", link_slug(&target.locator));
            let path = dir.join(&file);
            if let Err(e) = driver.screenshot(&page, &path).await {
                tracing::warn!(target = %target.locator, error = %e, "Screenshot failed");
            } else {
                payload.insert("img_path".into(), Value::String(path.display().to_string()));
            }
        }
        BrowserDriver::close_page(page).await;

        let mut message = Fields::new();
        if let Some(name) = payload.get("name") {
            message.insert("name".into(), name.clone());
        }
        Ok(ScrapeRecord::new(payload).with_message(message))
    }
}

/// Pull the entity name and counters out of a rendered detail page.
///
/// The name is mandatory; counters missing from the DOM are recorded
/// as the `-1` sentinel rather than failing the whole page.
fn extract_detail_fields(html: &str, selectors: &DetailSelectors) -> Result<Fields, AppError> {
    let document = Html::parse_document(html);

    let name = select_text(&document, &selectors.name)?
        .ok_or_else(|| AppError::Scrape("detail page has no entity name".into()))?;

    let mut payload = Fields::new();
    payload.insert("name".into(), Value::String(name));
    for (key, selector) in [
        ("downloads", Some(&selectors.downloads)),
        ("likes", Some(&selectors.likes)),
        ("community", Some(&selectors.community)),
        ("used_num", selectors.used_num.as_ref()),
    ] {
        let Some(selector) = selector else {
            continue;
        };
        let value = match select_text(&document, selector)? {
            Some(text) => count_to_i64(&text).unwrap_or(MISSING_COUNT),
            None => MISSING_COUNT,
        };
        payload.insert(key.to_string(), Value::from(value));
    }
    Ok(payload)
}

fn select_text(document: &Html, selector: &str) -> Result<Option<String>, AppError> {
    let selector = compile(selector)?;
    Ok(document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty()))
}

/// `https://hub/owner/entity` becomes `owner-entity`.
fn link_slug(link: &str) -> String {
    let trimmed = link.trim_end_matches('/');
    let mut parts = trimmed.rsplit('/');
    let entity = parts.next().unwrap_or(trimmed);
    match parts.next() {
        Some(owner) if !owner.is_empty() && !owner.contains(':') => format!("{owner}-{entity}"),
        _ => entity.to_string(),
    }
}
