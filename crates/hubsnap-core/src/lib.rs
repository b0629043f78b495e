pub mod error;
pub mod links;
pub mod merge;
pub mod pipeline;
pub mod pool;
pub mod resume;
pub mod sink;
pub mod stage;
pub mod traits;
pub mod unit;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::AppError;
pub use links::{LinkSelection, OrgLinksConfig};
pub use merge::{MergedRecord, merge_records, merge_snapshots, rank};
pub use pipeline::{
    DetailStageOptions, LinksOptions, PipelineState, PostProcessOptions, RepoStageOptions,
    SourcePipeline,
};
pub use pool::{DriverFactory, DriverPool, PooledDriver};
pub use resume::StageInput;
pub use sink::{CheckpointReader, JsonlWriter, StageSink, WriteMode};
pub use stage::{
    CrawlStage, StageConfig, StageEvent, StageReporter, TracingStageReporter, UnitStream,
};
pub use traits::{Enricher, NullEnricher, ScrapeRecord, Scraper};
pub use unit::{Category, CrawlTarget, Fields, PipelineUnit};
