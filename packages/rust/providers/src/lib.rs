//! External collaborators consumed by the IdeaForge pipeline.
//!
//! Each collaborator is an `async` trait so the core can be driven by real
//! HTTP clients in production and by in-process fakes in tests:
//!
//! - [`PaperRepository`]: read-only paper records
//! - [`GenerationProvider`]: long-context text generation with token usage
//! - [`NoveltyProvider`]: authoritative novelty verdicts and related-work summaries
//! - [`LiteratureSearch`]: lightweight match counts for the advisory pre-check

mod generator;
mod http;
mod literature;
mod novelty;
mod papers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ideaforge_shared::{Evidence, Paper, Result, Verdict};

pub use generator::OpenRouterGenerator;
pub use http::classify_status;
pub use literature::HttpLiteratureSearch;
pub use novelty::HttpNoveltyProvider;
pub use papers::JsonPaperRepository;

// ---------------------------------------------------------------------------
// Papers
// ---------------------------------------------------------------------------

/// Read-by-id access to ingested papers. Immutable from the core's view.
#[async_trait]
pub trait PaperRepository: Send + Sync {
    /// Fetch papers by id, in the order requested. Unknown ids are skipped.
    async fn get_papers(&self, ids: &[String]) -> Result<Vec<Paper>>;
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// One prompt-in/text-out generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Generated text plus usage metadata.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// A long-context generator. Failures are typed as transient or permanent.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Provider name, used as the budget ledger key.
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;
}

// ---------------------------------------------------------------------------
// Novelty
// ---------------------------------------------------------------------------

/// Verdict returned by a novelty check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoveltyAssessment {
    pub verdict: Verdict,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

/// Related-work summary for an idea judged novel or partially novel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedWorkSummary {
    pub summary: String,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

/// External authority on whether an idea already exists.
#[async_trait]
pub trait NoveltyProvider: Send + Sync {
    /// Provider name, used as the budget ledger key.
    fn name(&self) -> &str;

    async fn check_novelty(&self, query: &str) -> Result<NoveltyAssessment>;

    async fn summarize_related_work(&self, query: &str) -> Result<RelatedWorkSummary>;
}

// ---------------------------------------------------------------------------
// Literature search
// ---------------------------------------------------------------------------

/// Cheap title search used only for the advisory pre-existing flag.
#[async_trait]
pub trait LiteratureSearch: Send + Sync {
    async fn count_matches(&self, title: &str) -> Result<usize>;
}
