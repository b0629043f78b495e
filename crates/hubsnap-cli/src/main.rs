use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hubsnap_client::{BrowserDriverFactory, DetailPageScraper, OpenAiEnricher, RepoPageScraper};
use hubsnap_core::pipeline::{
    self, DetailStageOptions, LinksOptions, PostProcessOptions, RepoStageOptions,
};
use hubsnap_core::sink::CheckpointReader;
use hubsnap_core::{
    Category, NullEnricher, SourcePipeline, StageConfig, StageInput, TracingStageReporter,
    merge_snapshots, rank,
};

#[derive(Parser)]
#[command(name = "hubsnap", version, about = "Batch crawler for ML hub metadata snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct SnapshotArgs {
    /// Root directory for dated snapshot output
    #[arg(long, env = "HUBSNAP_SAVE_ROOT", default_value = "results")]
    save_root: PathBuf,

    /// Snapshot date (YYYY-MM-DD); defaults to today
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Hub source to crawl
    #[arg(long, default_value = "huggingface")]
    source: String,
}

#[derive(clap::Args, Clone)]
struct CrawlArgs {
    /// Concurrent browser drivers per stage
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Re-attempts per target after the first failure
    #[arg(long, default_value_t = 10)]
    max_retries: u32,

    /// Seconds between re-attempts
    #[arg(long, default_value_t = 5)]
    retry_delay: u64,

    /// Save full-page screenshots of detail pages into this directory
    #[arg(long)]
    screenshot_dir: Option<PathBuf>,
}

#[derive(clap::Args, Clone)]
struct EnrichArgs {
    /// LLM model for entity classification (e.g. "gpt-4o-mini")
    #[arg(long, env = "HUBSNAP_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// OpenAI-compatible API base URL
    #[arg(
        long,
        env = "HUBSNAP_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    base_url: String,

    /// API key; without one, classification is skipped
    #[arg(long, env = "HUBSNAP_API_KEY")]
    api_key: Option<String>,

    /// Entities per classification request
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl one source end to end into a dated snapshot
    Run {
        #[command(flatten)]
        snapshot: SnapshotArgs,

        /// Org-links config file (org -> source -> org page links)
        #[arg(short, long, env = "HUBSNAP_ORG_LINKS", default_value = "config/org-links.json")]
        config: PathBuf,

        /// Restrict the run to these orgs
        #[arg(long, value_delimiter = ',')]
        orgs: Vec<String>,

        /// Entity categories to crawl
        #[arg(long, value_delimiter = ',', default_values_t = [Category::Models, Category::Datasets], value_parser = parse_category)]
        categories: Vec<Category>,

        #[command(flatten)]
        crawl: CrawlArgs,

        #[command(flatten)]
        enrich: EnrichArgs,

        /// Keep results in memory without writing data checkpoints
        #[arg(long, default_value_t = false)]
        no_save: bool,
    },

    /// Re-attempt the failed targets recorded in a stage's error checkpoint
    Fixup {
        #[command(flatten)]
        snapshot: SnapshotArgs,

        /// Stage to fix up: "repo-page" or "detail-page"
        #[arg(long)]
        stage: String,

        #[command(flatten)]
        crawl: CrawlArgs,
    },

    /// Recompute the processed checkpoints from the raw ones
    Process {
        #[command(flatten)]
        snapshot: SnapshotArgs,

        #[command(flatten)]
        enrich: EnrichArgs,
    },

    /// Merge dated snapshots and print or export a ranking
    Merge {
        /// Root directory holding dated snapshot directories
        #[arg(long, env = "HUBSNAP_SAVE_ROOT", default_value = "results")]
        save_root: PathBuf,

        /// Snapshot dates to merge; defaults to every one under the root
        #[arg(long, value_delimiter = ',')]
        dates: Vec<NaiveDate>,

        /// Numeric field to rank by
        #[arg(long, default_value = "downloads")]
        rank_by: String,

        /// Rows to print
        #[arg(long, default_value_t = 25)]
        limit: usize,

        /// Export the full ranking as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

fn parse_category(s: &str) -> Result<Category, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hubsnap=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            snapshot,
            config,
            orgs,
            categories,
            crawl,
            enrich,
            no_save,
        } => cmd_run(snapshot, config, orgs, categories, crawl, enrich, !no_save).await,
        Commands::Fixup {
            snapshot,
            stage,
            crawl,
        } => cmd_fixup(snapshot, &stage, crawl).await,
        Commands::Process { snapshot, enrich } => cmd_process(snapshot, enrich).await,
        Commands::Merge {
            save_root,
            dates,
            rank_by,
            limit,
            csv,
        } => cmd_merge(&save_root, &dates, &rank_by, limit, csv.as_deref()),
    }
}

fn snapshot_date(snapshot: &SnapshotArgs) -> NaiveDate {
    snapshot
        .date
        .unwrap_or_else(|| chrono::Local::now().date_naive())
}

fn stage_config(crawl: &CrawlArgs) -> StageConfig {
    StageConfig::default()
        .with_threads(crawl.threads)
        .with_max_retries(crawl.max_retries)
        .with_retry_delay(Duration::from_secs(crawl.retry_delay))
}

fn detail_scraper(crawl: &CrawlArgs) -> DetailPageScraper {
    let scraper = DetailPageScraper::huggingface();
    match &crawl.screenshot_dir {
        Some(dir) => scraper.with_screenshot_dir(dir),
        None => scraper,
    }
}

async fn cmd_run(
    snapshot: SnapshotArgs,
    config: PathBuf,
    orgs: Vec<String>,
    categories: Vec<Category>,
    crawl: CrawlArgs,
    enrich: EnrichArgs,
    save: bool,
) -> Result<()> {
    let date = snapshot_date(&snapshot);
    let mut pipeline = SourcePipeline::new(&snapshot.save_root, date, &snapshot.source);
    let reporter = Arc::new(TracingStageReporter);
    let stage = stage_config(&crawl);

    let mut links = LinksOptions::new(&config).with_categories(categories);
    if !orgs.is_empty() {
        links = links.with_orgs(orgs);
    }

    pipeline
        .init_links(save, links)?
        .crawl_repo_page(
            save,
            RepoPageScraper::huggingface(),
            BrowserDriverFactory::new(),
            Arc::clone(&reporter),
            RepoStageOptions::default().with_stage(stage.clone()),
        )
        .await?
        .crawl_detail_page(
            save,
            detail_scraper(&crawl),
            BrowserDriverFactory::new(),
            Arc::clone(&reporter),
            DetailStageOptions::default().with_stage(stage),
        )
        .await?;

    run_post_process(&mut pipeline, save, &enrich, None).await?;

    tracing::info!(
        snapshot = %pipeline.snapshot_dir().display(),
        entities = pipeline.processed_rows().len(),
        "Snapshot complete"
    );
    Ok(())
}

async fn run_post_process(
    pipeline: &mut SourcePipeline,
    save: bool,
    enrich: &EnrichArgs,
    input: Option<Vec<hubsnap_core::Fields>>,
) -> Result<()> {
    let mut opts = PostProcessOptions::default().with_batch_size(enrich.batch_size);
    if let Some(input) = input {
        opts = opts.with_input(input);
    }
    match &enrich.api_key {
        Some(api_key) => {
            let enricher =
                OpenAiEnricher::with_base_url(api_key, &enrich.model, &enrich.base_url)?;
            pipeline.post_process(save, enricher, opts).await?;
        }
        None => {
            tracing::warn!("No API key configured, skipping classification");
            pipeline.post_process(save, NullEnricher, opts).await?;
        }
    }
    Ok(())
}

async fn cmd_fixup(snapshot: SnapshotArgs, stage: &str, crawl: CrawlArgs) -> Result<()> {
    let date = snapshot_date(&snapshot);
    let mut p = SourcePipeline::new(&snapshot.save_root, date, &snapshot.source);
    let reporter = Arc::new(TracingStageReporter);
    let config = stage_config(&crawl);

    match stage {
        "repo-page" => {
            let input = StageInput::from_error_checkpoint(
                p.checkpoint_path(pipeline::REPO_PAGE_ERRORS_FILE),
                pipeline::KEY_REPO_LINK,
            )?;
            tracing::info!(targets = input.targets.len(), "Re-attempting repo pages");
            p.crawl_repo_page(
                true,
                RepoPageScraper::huggingface(),
                BrowserDriverFactory::new(),
                reporter,
                RepoStageOptions::default()
                    .with_stage(config)
                    .with_input(input),
            )
            .await?;
        }
        "detail-page" => {
            let input = StageInput::from_error_checkpoint(
                p.checkpoint_path(pipeline::DETAIL_ERRORS_FILE),
                pipeline::KEY_DETAIL_LINK,
            )?;
            tracing::info!(targets = input.targets.len(), "Re-attempting detail pages");
            p.crawl_detail_page(
                true,
                detail_scraper(&crawl),
                BrowserDriverFactory::new(),
                reporter,
                DetailStageOptions::default()
                    .with_stage(config)
                    .with_input(input),
            )
            .await?;
        }
        other => bail!("unknown stage {other:?}; expected \"repo-page\" or \"detail-page\""),
    }
    Ok(())
}

async fn cmd_process(snapshot: SnapshotArgs, enrich: EnrichArgs) -> Result<()> {
    let date = snapshot_date(&snapshot);
    let mut pipeline = SourcePipeline::new(&snapshot.save_root, date, &snapshot.source);

    let mut records = Vec::new();
    for category in [Category::Models, Category::Datasets] {
        let path = pipeline.checkpoint_path(pipeline::raw_info_file(category));
        if path.exists() {
            records.extend(CheckpointReader::read(&path)?);
        }
    }
    if records.is_empty() {
        bail!(
            "no raw checkpoints under {}",
            pipeline.snapshot_dir().display()
        );
    }

    run_post_process(&mut pipeline, true, &enrich, Some(records)).await?;
    tracing::info!(
        entities = pipeline.processed_rows().len(),
        "Processed checkpoints rewritten"
    );
    Ok(())
}

fn cmd_merge(
    save_root: &Path,
    dates: &[NaiveDate],
    rank_by: &str,
    limit: usize,
    csv_path: Option<&Path>,
) -> Result<()> {
    let dirs: Vec<PathBuf> = if dates.is_empty() {
        std::fs::read_dir(save_root)
            .with_context(|| format!("reading {}", save_root.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect()
    } else {
        dates
            .iter()
            .map(|date| save_root.join(date.format("%Y-%m-%d").to_string()))
            .collect()
    };

    let mut records = merge_snapshots(&dirs)?;
    rank(&mut records, rank_by);

    if let Some(path) = csv_path {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        writer.write_record(["rank", "org", "name", rank_by, "snapshots"])?;
        for (i, record) in records.iter().enumerate() {
            writer.write_record([
                (i + 1).to_string(),
                record.org.clone(),
                record.name.clone(),
                record.metric(rank_by).to_string(),
                record.occurrences.to_string(),
            ])?;
        }
        writer.flush()?;
        tracing::info!(rows = records.len(), path = %path.display(), "Ranking exported");
    }

    for (i, record) in records.iter().take(limit).enumerate() {
        println!(
            "{:>4}  {:<24} {:<40} {:>12}",
            i + 1,
            record.org,
            record.name,
            record.metric(rank_by),
        );
    }
    println!("\nTotal: {} entities across {} snapshot dirs", records.len(), dirs.len());

    Ok(())
}
