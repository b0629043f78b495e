use std::future::Future;

use crate::error::AppError;
use crate::unit::{CrawlTarget, Fields};

/// What a collaborator scrape call yields for one target: the durable
/// payload plus a short human-auditable summary for progress output.
#[derive(Debug, Clone, Default)]
pub struct ScrapeRecord {
    pub payload: Fields,
    pub message: Fields,
}

impl ScrapeRecord {
    pub fn new(payload: Fields) -> Self {
        Self {
            payload,
            message: Fields::new(),
        }
    }

    pub fn with_message(mut self, message: Fields) -> Self {
        self.message = message;
        self
    }
}

/// Site-specific page scraping, supplied from outside the core.
///
/// Implementations are expected to return `Err` for ordinary scrape
/// failures; the stage treats any error identically and never lets it
/// escape the unit stream.
pub trait Scraper: Send + Sync + Clone + 'static {
    /// The automation handle this scraper drives (checked out of a
    /// [`DriverPool`](crate::pool::DriverPool) for the duration of one call).
    type Driver: Send + 'static;

    fn scrape(
        &self,
        driver: &mut Self::Driver,
        target: &CrawlTarget,
    ) -> impl Future<Output = Result<ScrapeRecord, AppError>> + Send;
}

/// LLM-based classification of scraped entities, supplied from outside
/// the core. Invoked by the post-process stage as an opaque, retryable,
/// batchable transform.
pub trait Enricher: Send + Sync + Clone {
    /// Enrich a batch of entity payloads. Must return one payload per
    /// input, in order.
    fn enrich(&self, batch: &[Fields]) -> impl Future<Output = Result<Vec<Fields>, AppError>> + Send;
}

/// A no-op Enricher for runs without classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEnricher;

impl Enricher for NullEnricher {
    async fn enrich(&self, batch: &[Fields]) -> Result<Vec<Fields>, AppError> {
        Ok(batch.to_vec())
    }
}
