//! Application configuration for IdeaForge.
//!
//! User config lives at `~/.ideaforge/ideaforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{IdeaForgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "ideaforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".ideaforge";

// ---------------------------------------------------------------------------
// Config structs (matching ideaforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    /// Long-context generation provider.
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// Authoritative novelty-check provider.
    #[serde(default)]
    pub novelty: NoveltyConfig,

    /// Advisory literature-search provider.
    #[serde(default)]
    pub literature: LiteratureConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Hard spend caps per provider and period.
    #[serde(default = "default_budgets")]
    pub budgets: Vec<BudgetCapConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            generator: GeneratorConfig::default(),
            novelty: NoveltyConfig::default(),
            literature: LiteratureConfig::default(),
            compression: CompressionConfig::default(),
            filter: FilterConfig::default(),
            scoring: ScoringConfig::default(),
            pipeline: PipelineConfig::default(),
            budgets: default_budgets(),
        }
    }
}

impl AppConfig {
    /// Cap configured for `provider`, if any.
    pub fn budget_cap(&self, provider: &str) -> Option<f64> {
        self.budgets
            .iter()
            .find(|b| b.provider == provider)
            .map(|b| b.cap)
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path. A leading `~/` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Resolve `db_path`, expanding `~/`.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match self.db_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir().ok_or_else(|| {
                    IdeaForgeError::config("could not determine home directory")
                })?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.db_path)),
        }
    }
}

fn default_db_path() -> String {
    "~/.ideaforge/ideaforge.db".into()
}

/// `[generator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Provider name used as the budget ledger key.
    #[serde(default = "default_generator_name")]
    pub provider: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// OpenAI-compatible API base URL.
    #[serde(default = "default_generator_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Per-call timeout. Long-context synthesis can take minutes.
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// USD per 1k prompt tokens.
    #[serde(default = "default_cost_in")]
    pub cost_per_1k_input: f64,

    /// USD per 1k completion tokens.
    #[serde(default = "default_cost_out")]
    pub cost_per_1k_output: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_generator_name(),
            api_key_env: default_api_key_env(),
            base_url: default_generator_base_url(),
            model: default_model(),
            timeout_secs: default_generator_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            cost_per_1k_input: default_cost_in(),
            cost_per_1k_output: default_cost_out(),
        }
    }
}

fn default_generator_name() -> String {
    "openrouter".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_generator_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_generator_timeout() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    2_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_max_output_tokens() -> u32 {
    8_000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_cost_in() -> f64 {
    0.0006
}
fn default_cost_out() -> f64 {
    0.0025
}

/// `[novelty]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoveltyConfig {
    #[serde(default = "default_novelty_name")]
    pub provider: String,

    #[serde(default = "default_novelty_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_novelty_base_url")]
    pub base_url: String,

    #[serde(default = "default_novelty_timeout")]
    pub timeout_secs: u64,

    /// Flat cost charged per novelty check.
    #[serde(default = "default_check_cost")]
    pub check_cost: f64,

    /// Flat cost charged per related-work summary.
    #[serde(default = "default_summary_cost")]
    pub summary_cost: f64,

    /// Maximum concurrent validation calls.
    #[serde(default = "default_novelty_concurrency")]
    pub concurrency: u32,

    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u32,

    /// How many top-ranked ideas to validate per batch.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            provider: default_novelty_name(),
            api_key_env: default_novelty_key_env(),
            base_url: default_novelty_base_url(),
            timeout_secs: default_novelty_timeout(),
            check_cost: default_check_cost(),
            summary_cost: default_summary_cost(),
            concurrency: default_novelty_concurrency(),
            cache_ttl_days: default_cache_ttl_days(),
            top_k: default_top_k(),
        }
    }
}

fn default_novelty_name() -> String {
    "novelty".into()
}
fn default_novelty_key_env() -> String {
    "NOVELTY_API_KEY".into()
}
fn default_novelty_base_url() -> String {
    "http://localhost:8700".into()
}
fn default_novelty_timeout() -> u64 {
    120
}
fn default_check_cost() -> f64 {
    0.05
}
fn default_summary_cost() -> f64 {
    0.20
}
fn default_novelty_concurrency() -> u32 {
    4
}
fn default_cache_ttl_days() -> u32 {
    30
}
fn default_top_k() -> usize {
    10
}

/// `[literature]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiteratureConfig {
    /// Whether the advisory pre-existing check runs at all.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_literature_base_url")]
    pub base_url: String,

    #[serde(default = "default_literature_timeout")]
    pub timeout_secs: u64,

    /// Match counts above this set the advisory flag.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: usize,
}

impl Default for LiteratureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_literature_base_url(),
            timeout_secs: default_literature_timeout(),
            match_threshold: default_match_threshold(),
        }
    }
}

fn default_literature_base_url() -> String {
    "http://localhost:8701".into()
}
fn default_literature_timeout() -> u64 {
    10
}
fn default_match_threshold() -> usize {
    3
}

/// `[compression]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Character budget for one serialized batch.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Jaccard threshold for single-link keyword clustering.
    #[serde(default = "default_cluster_threshold")]
    pub cluster_threshold: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            cluster_threshold: default_cluster_threshold(),
        }
    }
}

fn default_max_chars() -> usize {
    120_000
}
fn default_cluster_threshold() -> f64 {
    0.25
}

/// `[filter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Normalized-token Jaccard above which two ideas collapse.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: default_dedup_threshold(),
        }
    }
}

fn default_dedup_threshold() -> f64 {
    0.6
}

/// `[scoring]` section: composite weights and ranking thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_w_bibliometric")]
    pub bibliometric_weight: f64,
    #[serde(default = "default_w_twenty")]
    pub synthesis_weight: f64,
    #[serde(default = "default_w_twenty")]
    pub feasibility_weight: f64,
    #[serde(default = "default_w_twenty")]
    pub impact_weight: f64,
    #[serde(default = "default_w_risk")]
    pub risk_weight: f64,

    /// Ideas below this composite are hidden from top-K views.
    #[serde(default = "default_publish_threshold")]
    pub publish_threshold: f64,

    /// Blend weight of the novelty score on re-ranking.
    #[serde(default = "default_novelty_weight")]
    pub novelty_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            bibliometric_weight: default_w_bibliometric(),
            synthesis_weight: default_w_twenty(),
            feasibility_weight: default_w_twenty(),
            impact_weight: default_w_twenty(),
            risk_weight: default_w_risk(),
            publish_threshold: default_publish_threshold(),
            novelty_weight: default_novelty_weight(),
        }
    }
}

fn default_w_bibliometric() -> f64 {
    0.25
}
fn default_w_twenty() -> f64 {
    0.20
}
fn default_w_risk() -> f64 {
    0.15
}
fn default_publish_threshold() -> f64 {
    0.6
}
fn default_novelty_weight() -> f64 {
    0.3
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Batches processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Papers per batch when splitting an input set.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Domain context passed to the generator.
    #[serde(default = "default_domain")]
    pub domain: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            domain: default_domain(),
        }
    }
}

fn default_workers() -> u32 {
    2
}
fn default_batch_size() -> usize {
    200
}
fn default_domain() -> String {
    "machine learning".into()
}

/// `[[budgets]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCapConfig {
    /// Provider name, matching `generator.provider` or `novelty.provider`.
    pub provider: String,
    /// Maximum spend per calendar month (UTC), in USD.
    pub cap: f64,
}

fn default_budgets() -> Vec<BudgetCapConfig> {
    vec![
        BudgetCapConfig {
            provider: default_generator_name(),
            cap: 50.0,
        },
        BudgetCapConfig {
            provider: default_novelty_name(),
            cap: 20.0,
        },
    ]
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.ideaforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| IdeaForgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.ideaforge/ideaforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| IdeaForgeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        IdeaForgeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject configs whose values would break pipeline invariants.
fn validate_config(config: &AppConfig) -> Result<()> {
    for (name, url) in [
        ("generator.base_url", &config.generator.base_url),
        ("novelty.base_url", &config.novelty.base_url),
        ("literature.base_url", &config.literature.base_url),
    ] {
        Url::parse(url)
            .map_err(|e| IdeaForgeError::config(format!("{name} '{url}' is not a URL: {e}")))?;
    }

    for (name, value) in [
        ("filter.dedup_threshold", config.filter.dedup_threshold),
        ("compression.cluster_threshold", config.compression.cluster_threshold),
        ("scoring.publish_threshold", config.scoring.publish_threshold),
        ("scoring.novelty_weight", config.scoring.novelty_weight),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(IdeaForgeError::config(format!(
                "{name} must be within [0, 1], got {value}"
            )));
        }
    }

    if let Some(bad) = config.budgets.iter().find(|b| b.cap < 0.0) {
        return Err(IdeaForgeError::config(format!(
            "budget cap for '{}' must not be negative",
            bad.provider
        )));
    }

    if config.novelty.concurrency == 0 || config.pipeline.workers == 0 {
        return Err(IdeaForgeError::config(
            "novelty.concurrency and pipeline.workers must be at least 1",
        ));
    }

    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| IdeaForgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| IdeaForgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| IdeaForgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the generator API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.generator.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(IdeaForgeError::config(format!(
            "generator API key not found. Set the {var_name} environment variable."
        ))),
    }
}
