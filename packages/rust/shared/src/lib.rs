//! Shared types, error model, and configuration for IdeaForge.
//!
//! This crate is the foundation depended on by all other IdeaForge crates.
//! It provides:
//! - [`IdeaForgeError`], the unified error type
//! - Domain types ([`Paper`], [`IdeaCandidate`], [`ScoreBreakdown`], [`ValidationRecord`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BudgetCapConfig, CompressionConfig, FilterConfig, GeneratorConfig,
    LiteratureConfig, NoveltyConfig, PipelineConfig, ScoringConfig, StorageConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{IdeaForgeError, Result};
pub use types::{
    BatchId, BatchRecord, BatchStage, BatchStatus, CompressedBatch, ComputeLevel, Evidence,
    IdeaCandidate, IdeaId, IdeaStatus, LedgerSnapshot, LlmScores, Paper, ProvenanceEntry,
    ProvenanceIndex, Quartile, ScoreBreakdown, ScoreComponents, Truncation, ValidationRecord, ValidationTask,
    Verdict,
};
