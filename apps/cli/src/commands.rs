//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use ideaforge_compressor::MAX_BATCH_PAPERS;
use ideaforge_core::ledger::period_key;
use ideaforge_core::pipeline::{BatchJob, BatchReport, Pipeline, ProgressReporter};
use ideaforge_core::{BudgetLedger, CancelToken, RankingView};
use ideaforge_providers::{
    HttpLiteratureSearch, HttpNoveltyProvider, JsonPaperRepository, LiteratureSearch,
    OpenRouterGenerator,
};
use ideaforge_shared::{
    AppConfig, BatchId, BatchStage, BatchStatus, IdeaId, IdeaStatus, init_config, load_config,
    validate_api_key,
};
use ideaforge_storage::{IdeaQuery, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// IdeaForge: synthesize ranked research ideas from paper batches.
#[derive(Parser)]
#[command(
    name = "ideaforge",
    version,
    about = "Synthesize, score and validate research ideas from batches of papers.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Split a paper file into batches and run the full pipeline on each.
    Run {
        /// JSON array of paper records.
        #[arg(long)]
        papers: PathBuf,

        /// Domain context for the generator (defaults to config).
        #[arg(long)]
        domain: Option<String>,

        /// Papers per batch (defaults to config, at most 200).
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Resume a batch from its last completed stage.
    Resume {
        #[arg(long)]
        batch: BatchId,

        /// Paper file the batch was created from. Needed when the batch
        /// stopped before scoring.
        #[arg(long)]
        papers: Option<PathBuf>,
    },

    /// Re-run novelty validation for a batch's top ideas.
    Validate {
        #[arg(long)]
        batch: BatchId,

        /// How many top-ranked ideas to validate (defaults to config).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List ranked ideas. Ideas below the publish threshold are hidden
    /// unless `--all` is given.
    List {
        #[arg(long)]
        status: Option<IdeaStatus>,

        #[arg(long)]
        batch: Option<BatchId>,

        #[arg(long, default_value = "20")]
        limit: u32,

        /// Include ideas below the publish threshold.
        #[arg(long)]
        all: bool,
    },

    /// Show an idea's score breakdown, validations and provenance.
    Show {
        /// Idea id (aliases of collapsed duplicates resolve).
        id: IdeaId,

        /// Print the full record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List batches, optionally by status (e.g. synthesis_failed).
    Batches {
        #[arg(long)]
        status: Option<String>,
    },

    /// Show budget caps, spend and usage for the current period.
    Budget,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "ideaforge=info",
        1 => "ideaforge=debug",
        _ => "ideaforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            papers,
            domain,
            batch_size,
        } => cmd_run(&papers, domain, batch_size).await,
        Command::Resume { batch, papers } => cmd_resume(batch, papers.as_deref()).await,
        Command::Validate { batch, top_k } => cmd_validate(batch, top_k).await,
        Command::List {
            status,
            batch,
            limit,
            all,
        } => cmd_list(status, batch, limit, all).await,
        Command::Show { id, json } => cmd_show(id, json).await,
        Command::Batches { status } => cmd_batches(status.as_deref()).await,
        Command::Budget => cmd_budget().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = config.storage.resolved_db_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| eyre!("cannot create {}: {e}", parent.display()))?;
    }
    Ok(Arc::new(Storage::open(&path).await?))
}

async fn open_storage_readonly(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = config.storage.resolved_db_path()?;
    if !path.exists() {
        return Err(eyre!(
            "no database at {}. Run `ideaforge run` first.",
            path.display()
        ));
    }
    Ok(Arc::new(Storage::open_readonly(&path).await?))
}

async fn build_pipeline(
    config: &AppConfig,
    storage: Arc<Storage>,
    papers: JsonPaperRepository,
) -> Result<Arc<Pipeline>> {
    let ledger = Arc::new(BudgetLedger::from_config(config, Some(Arc::clone(&storage))));
    ledger.init().await?;

    let generator = Arc::new(OpenRouterGenerator::from_config(&config.generator)?);
    let novelty = Arc::new(HttpNoveltyProvider::from_config(&config.novelty)?);
    let literature: Option<Arc<dyn LiteratureSearch>> = if config.literature.enabled {
        Some(Arc::new(HttpLiteratureSearch::from_config(&config.literature)?))
    } else {
        None
    };

    Ok(Arc::new(Pipeline::from_config(
        config,
        storage,
        ledger,
        Arc::new(papers),
        generator,
        novelty,
        literature,
    )))
}

/// Cancel `token` on Ctrl-C. Work stops at the next stage boundary or
/// in-flight call and the batch stays resumable.
fn cancel_on_ctrl_c(token: &CancelToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(papers: &Path, domain: Option<String>, batch_size: Option<usize>) -> Result<()> {
    // Validate API key before doing anything
    let config = load_config()?;
    validate_api_key(&config)?;

    let repository = JsonPaperRepository::load(papers)?;
    if repository.is_empty() {
        return Err(eyre!("{} contains no papers", papers.display()));
    }
    let batch_size = batch_size
        .unwrap_or(config.pipeline.batch_size)
        .clamp(1, MAX_BATCH_PAPERS);

    let jobs: Vec<BatchJob> = repository
        .ids()
        .chunks(batch_size)
        .map(|chunk| BatchJob::New {
            paper_ids: chunk.to_vec(),
            domain: domain.clone(),
        })
        .collect();

    info!(
        papers = repository.len(),
        batches = jobs.len(),
        batch_size,
        "starting run"
    );

    let storage = open_storage(&config).await?;
    let pipeline = build_pipeline(&config, storage, repository).await?;

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);

    let progress = Arc::new(CliProgress::new());
    let handles = pipeline
        .run_batches(jobs, progress.clone(), &cancel)
        .await?;

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.handle.await {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => warn!(batch = %handle.batch_id, error = %e, "batch aborted"),
            Err(e) => warn!(batch = %handle.batch_id, error = %e, "batch task panicked"),
        }
    }
    progress.finish();

    print_run_summary(&reports);
    Ok(())
}

async fn cmd_resume(batch_id: BatchId, papers: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    validate_api_key(&config)?;

    let storage = open_storage(&config).await?;
    let batch = storage
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| eyre!("batch not found: {batch_id}"))?;

    let repository = match papers {
        Some(path) => JsonPaperRepository::load(path)?,
        None if batch.stage < Some(BatchStage::Scored) => {
            return Err(eyre!(
                "batch {batch_id} stopped before scoring; pass --papers with its paper file"
            ));
        }
        None => JsonPaperRepository::default(),
    };

    info!(
        batch = %batch_id,
        status = batch.status.as_str(),
        stage = batch.stage.map(|s| s.as_str()).unwrap_or("NONE"),
        "resuming batch"
    );

    let pipeline = build_pipeline(&config, storage, repository).await?;
    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);

    let progress = CliProgress::new();
    let report = pipeline.resume_batch(batch_id, &progress, &cancel).await?;
    progress.finish();

    print_run_summary(&[report]);
    Ok(())
}

async fn cmd_validate(batch_id: BatchId, top_k: Option<usize>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let pipeline = build_pipeline(&config, storage, JsonPaperRepository::default()).await?;

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);

    let report = pipeline.revalidate(batch_id, top_k, &cancel).await?;

    println!();
    println!("  Validation finished for batch {batch_id}");
    println!("  Validated: {}", report.validated());
    println!("  Unchanged: {}", report.unchanged());
    println!("  Deferred:  {}", report.deferred());
    println!("  Failed:    {}", report.failed());
    println!();
    Ok(())
}

async fn cmd_list(
    status: Option<IdeaStatus>,
    batch_id: Option<BatchId>,
    limit: u32,
    all: bool,
) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let view = RankingView::new(storage, config.scoring.publish_threshold);

    let ideas = if !all && status.is_none() {
        view.top_k(limit, batch_id).await?
    } else {
        view.list(&IdeaQuery {
            status,
            batch_id,
            min_score: (!all).then_some(config.scoring.publish_threshold),
            limit: Some(limit),
        })
        .await?
    };

    if ideas.is_empty() {
        println!("No ideas found.");
        return Ok(());
    }

    println!(
        "{:<4} {:<36} {:>9} {:>9}  {:<20} TITLE",
        "#", "ID", "COMPOSITE", "SYNTHESIS", "STATUS"
    );
    for (i, ranked) in ideas.iter().enumerate() {
        println!(
            "{:<4} {:<36} {:>9} {:>9}  {:<20} {}",
            i + 1,
            ranked.idea.id,
            fmt_score(ranked.composite),
            fmt_score(ranked.synthesis_degree),
            ranked.idea.status.as_str(),
            ranked.idea.title
        );
    }
    Ok(())
}

async fn cmd_show(id: IdeaId, json: bool) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let view = RankingView::new(storage, config.scoring.publish_threshold);

    let detail = view
        .detail(id)
        .await?
        .ok_or_else(|| eyre!("idea not found: {id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    let idea = &detail.idea;
    println!();
    if let Some(alias) = detail.resolved_from_alias {
        println!("  ({alias} was collapsed into this idea)");
    }
    println!("  {}", idea.title);
    println!("  ID:       {}", idea.id);
    println!("  Batch:    {}", idea.batch_id);
    println!("  Status:   {}", idea.status.as_str());
    println!("  Compute:  {}", idea.estimated_compute.as_str());
    if idea.pre_existing_flag {
        println!("  Advisory: similar titles found in literature search");
    }
    println!();
    println!("  {}", idea.description);
    println!();
    println!("  Methodology: {}", idea.methodology);
    println!("  Datasets:    {}", idea.required_datasets.join(", "));
    println!("  Risks:       {}", idea.risks.join("; "));

    if let Some(score) = detail.latest_score() {
        let c = &score.components;
        println!();
        println!("  Score v{}: composite {:.3}", score.version, score.composite);
        println!("    bibliometric          {:.3}", c.bibliometric);
        println!("    synthesis degree      {:.3}", c.synthesis_degree);
        println!("    calibrated feasibility {:.3}", c.calibrated_feasibility);
        println!("      data availability   {:.3}", c.data_availability);
        println!("      compute             {:.3}", c.compute_requirement);
        println!("    calibrated impact     {:.3}", c.calibrated_impact);
        println!("    risk                  {:.3}", c.risk);
        if let Some(novelty) = c.novelty {
            println!("    novelty               {novelty:.3}");
        }
        for note in &score.notes {
            println!("    note: {note}");
        }
    }

    if !detail.validations.is_empty() {
        println!();
        println!("  Validations:");
        for record in &detail.validations {
            println!(
                "    {} {} (confidence {:.2}{})",
                record.task.as_str(),
                record.verdict.as_str(),
                record.confidence,
                if record.from_cache { ", cached" } else { "" }
            );
            if let Some(summary) = &record.summary {
                println!("      {summary}");
            }
        }
    }

    println!();
    println!("  Provenance:");
    for entry in &detail.provenance {
        println!("    [{}] {}", entry.token, entry.paper_id);
    }
    if !detail.aliases.is_empty() {
        let aliases: Vec<String> = detail.aliases.iter().map(ToString::to_string).collect();
        println!("  Aliases:  {}", aliases.join(", "));
    }
    println!();
    Ok(())
}

async fn cmd_batches(status: Option<&str>) -> Result<()> {
    let status: Option<BatchStatus> = status
        .map(|s| s.trim().to_ascii_uppercase().replace('-', "_").parse::<BatchStatus>())
        .transpose()?;

    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let batches = storage.list_batches(status).await?;

    if batches.is_empty() {
        println!("No batches found.");
        return Ok(());
    }

    println!(
        "{:<36} {:<17} {:<12} {:>6}  {:<20} ERROR",
        "ID", "STATUS", "STAGE", "PAPERS", "UPDATED"
    );
    for batch in &batches {
        println!(
            "{:<36} {:<17} {:<12} {:>6}  {:<20} {}",
            batch.id,
            batch.status.as_str(),
            batch.stage.map(|s| s.as_str()).unwrap_or("-"),
            batch.paper_ids.len(),
            batch.updated_at.format("%Y-%m-%d %H:%M:%S"),
            batch.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_budget() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let ledger = BudgetLedger::from_config(&config, Some(Arc::clone(&storage)));
    ledger.init().await?;

    let period = period_key(Utc::now());
    println!("Budget for {period} (UTC)");
    println!();
    println!(
        "{:<16} {:>10} {:>10} {:>10}",
        "PROVIDER", "CAP", "SPENT", "REMAINING"
    );
    for snapshot in ledger.snapshots().await? {
        println!(
            "{:<16} {:>10.4} {:>10.4} {:>10.4}",
            snapshot.provider,
            snapshot.cap,
            snapshot.spent,
            snapshot.remaining()
        );
    }

    let totals = storage.usage_totals(&period).await?;
    if !totals.is_empty() {
        println!();
        println!(
            "{:<16} {:>6} {:>12} {:>12} {:>10}",
            "PROVIDER", "CALLS", "TOKENS IN", "TOKENS OUT", "COST"
        );
        for total in totals {
            println!(
                "{:<16} {:>6} {:>12} {:>12} {:>10.4}",
                total.provider, total.calls, total.tokens_in, total.tokens_out, total.cost
            );
        }
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn fmt_score(score: Option<f64>) -> String {
    score.map_or_else(|| "-".to_string(), |s| format!("{s:.3}"))
}

fn print_run_summary(reports: &[BatchReport]) {
    println!();
    for report in reports {
        println!("  Batch {}", report.batch_id);
        println!("    Status:    {}", report.status.as_str());
        println!(
            "    Stage:     {}",
            report.stage.map(|s| s.as_str()).unwrap_or("NONE")
        );
        println!(
            "    Ideas:     {} kept, {} dropped, {} collapsed, {} flagged",
            report.ideas, report.dropped, report.collapsed, report.flagged
        );
        println!(
            "    Validated: {} ({} deferred)",
            report.validated, report.deferred
        );
        if let Some(error) = &report.error {
            println!("    Error:     {error}");
        }
        println!("    Time:      {:.1}s", report.elapsed.as_secs_f64());
    }
    let resumable = reports
        .iter()
        .filter(|r| r.status != BatchStatus::Completed)
        .count();
    if resumable > 0 {
        println!();
        println!("  {resumable} batch(es) can be continued with `ideaforge resume --batch <id>`.");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

fn short(batch_id: BatchId) -> String {
    batch_id.to_string().chars().take(8).collect()
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, batch_id: BatchId, stage: BatchStage) {
        self.spinner
            .set_message(format!("[{}] {}", short(batch_id), stage_label(stage)));
    }

    fn stage_completed(&self, batch_id: BatchId, stage: BatchStage, detail: &str) {
        self.spinner.println(format!(
            "  [{}] {} done: {detail}",
            short(batch_id),
            stage.as_str()
        ));
    }

    fn batch_finished(&self, report: &BatchReport) {
        self.spinner.println(format!(
            "  [{}] finished: {}",
            short(report.batch_id),
            report.status.as_str()
        ));
    }
}

fn stage_label(stage: BatchStage) -> &'static str {
    match stage {
        BatchStage::Compressed => "Compressing papers",
        BatchStage::Synthesized => "Synthesizing ideas",
        BatchStage::Filtered => "Filtering duplicates",
        BatchStage::Scored => "Scoring ideas",
        BatchStage::Validated => "Validating top ideas",
    }
}
