//! Core domain types for IdeaForge batches, ideas, scores, and validations.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdeaForgeError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for idea identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdeaId(pub Uuid);

impl IdeaId {
    /// Generate a new time-sortable idea identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for IdeaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IdeaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IdeaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A UUID v7 wrapper for batch identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    /// Generate a new time-sortable batch identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Paper (external, read-only)
// ---------------------------------------------------------------------------

/// Venue quartile of a paper's publication outlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quartile {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quartile {
    /// Normalized venue score used by bibliometric scoring and batch priority.
    pub fn score(quartile: Option<Self>) -> f64 {
        match quartile {
            Some(Self::Q1) => 1.0,
            Some(Self::Q2) => 0.8,
            Some(Self::Q3) => 0.5,
            Some(Self::Q4) => 0.3,
            None => 0.4,
        }
    }
}

/// A paper record supplied by the ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    /// Stable identifier assigned by the paper repository.
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quartile: Option<Quartile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default)]
    pub citation_count: u32,
    /// Text of a dedicated limitations section, when the parser found one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limitations: Option<String>,
    /// Dataset or body-text excerpts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excerpts: Vec<String>,
}

// ---------------------------------------------------------------------------
// Idea candidates
// ---------------------------------------------------------------------------

/// Estimated compute requirement declared by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeLevel {
    Low,
    Medium,
    High,
}

impl ComputeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl FromStr for ComputeLevel {
    type Err = IdeaForgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(IdeaForgeError::validation(format!(
                "unknown compute level '{other}'"
            ))),
        }
    }
}

/// Lifecycle status of an idea candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdeaStatus {
    Candidate,
    ValidationPending,
    ValidationDeferred,
    ValidatedNovel,
    ValidatedPartial,
    RejectedDuplicate,
    SynthesisFailed,
}

impl IdeaStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "CANDIDATE",
            Self::ValidationPending => "VALIDATION_PENDING",
            Self::ValidationDeferred => "VALIDATION_DEFERRED",
            Self::ValidatedNovel => "VALIDATED_NOVEL",
            Self::ValidatedPartial => "VALIDATED_PARTIAL",
            Self::RejectedDuplicate => "REJECTED_DUPLICATE",
            Self::SynthesisFailed => "SYNTHESIS_FAILED",
        }
    }
}

impl FromStr for IdeaStatus {
    type Err = IdeaForgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CANDIDATE" => Ok(Self::Candidate),
            "VALIDATION_PENDING" => Ok(Self::ValidationPending),
            "VALIDATION_DEFERRED" => Ok(Self::ValidationDeferred),
            "VALIDATED_NOVEL" => Ok(Self::ValidatedNovel),
            "VALIDATED_PARTIAL" => Ok(Self::ValidatedPartial),
            "REJECTED_DUPLICATE" => Ok(Self::RejectedDuplicate),
            "SYNTHESIS_FAILED" => Ok(Self::SynthesisFailed),
            other => Err(IdeaForgeError::validation(format!(
                "unknown idea status '{other}'"
            ))),
        }
    }
}

/// Raw self-assessed scores from the generator, both in `1..=10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmScores {
    pub impact: u8,
    pub feasibility: u8,
}

impl LlmScores {
    /// Impact × feasibility, used to pick the survivor of a duplicate pair.
    pub fn product(&self) -> u32 {
        u32::from(self.impact) * u32::from(self.feasibility)
    }
}

/// A validated research-idea candidate bound to real paper ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdeaCandidate {
    pub id: IdeaId,
    pub batch_id: BatchId,
    /// Resolved paper ids, in citation order. Never empty.
    pub source_paper_ids: Vec<String>,
    /// The P-tokens the generator cited, parallel to `source_paper_ids`.
    #[serde(default)]
    pub source_tokens: Vec<String>,
    pub title: String,
    pub description: String,
    pub novelty_rationale: String,
    pub methodology: String,
    pub required_datasets: Vec<String>,
    pub estimated_compute: ComputeLevel,
    pub risks: Vec<String>,
    pub raw_llm_scores: LlmScores,
    pub status: IdeaStatus,
    /// Ids of near-duplicates collapsed into this record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<IdeaId>,
    /// Advisory flag from the literature pre-check. Not a rejection.
    #[serde(default)]
    pub pre_existing_flag: bool,
    pub created_at: DateTime<Utc>,
}

impl IdeaCandidate {
    /// Number of distinct source papers.
    pub fn distinct_sources(&self) -> usize {
        let mut ids: Vec<&str> = self.source_paper_ids.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

/// Per-component normalized scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub normalized_impact: f64,
    pub normalized_feasibility: f64,
    pub bibliometric: f64,
    pub synthesis_degree: f64,
    pub data_availability: f64,
    pub compute_requirement: f64,
    pub calibrated_feasibility: f64,
    pub industry_relevance: f64,
    pub calibrated_impact: f64,
    pub risk: f64,
    /// Present only once an external novelty verdict has been blended in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novelty: Option<f64>,
}

/// One immutable, explainable scoring of an idea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub idea_id: IdeaId,
    /// Assigned by the store on append; `0` until persisted.
    pub version: u32,
    pub components: ScoreComponents,
    pub composite: f64,
    /// Human-readable upgrade/downgrade explanations, in evaluation order.
    pub notes: Vec<String>,
    pub scored_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Kind of external validation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationTask {
    NoveltyCheck,
    RelatedWorkSummary,
}

impl ValidationTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoveltyCheck => "NOVELTY_CHECK",
            Self::RelatedWorkSummary => "RELATED_WORK_SUMMARY",
        }
    }
}

impl FromStr for ValidationTask {
    type Err = IdeaForgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NOVELTY_CHECK" => Ok(Self::NoveltyCheck),
            "RELATED_WORK_SUMMARY" => Ok(Self::RelatedWorkSummary),
            other => Err(IdeaForgeError::validation(format!(
                "unknown validation task '{other}'"
            ))),
        }
    }
}

/// External authority's novelty classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Novel,
    Partial,
    Exists,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Novel => "NOVEL",
            Self::Partial => "PARTIAL",
            Self::Exists => "EXISTS",
        }
    }

    /// Score blended into the composite on re-ranking.
    pub fn novelty_score(&self) -> f64 {
        match self {
            Self::Novel => 1.0,
            Self::Partial => 0.6,
            Self::Exists => 0.2,
        }
    }

    /// Status an idea moves to once this verdict is recorded.
    pub fn resulting_status(&self) -> IdeaStatus {
        match self {
            Self::Novel => IdeaStatus::ValidatedNovel,
            Self::Partial => IdeaStatus::ValidatedPartial,
            Self::Exists => IdeaStatus::RejectedDuplicate,
        }
    }
}

impl FromStr for Verdict {
    type Err = IdeaForgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NOVEL" => Ok(Self::Novel),
            "PARTIAL" => Ok(Self::Partial),
            "EXISTS" => Ok(Self::Exists),
            other => Err(IdeaForgeError::malformed(format!(
                "unknown novelty verdict '{other}'"
            ))),
        }
    }
}

/// A piece of evidence returned by the novelty provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Append-only record of one validation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub idea_id: IdeaId,
    pub task: ValidationTask,
    pub verdict: Verdict,
    pub confidence: f64,
    pub evidence: Vec<Evidence>,
    /// Related-work summary text (only for `RELATED_WORK_SUMMARY`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Whether the response was served from the validation cache.
    pub from_cache: bool,
    pub cache_expiry: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Budget ledger
// ---------------------------------------------------------------------------

/// Point-in-time view of one provider's spend for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub provider: String,
    /// Period key, `YYYY-MM` in UTC.
    pub period: String,
    pub cap: f64,
    pub reserved: f64,
    pub spent: f64,
}

impl LedgerSnapshot {
    /// Capacity still available for new reservations.
    pub fn remaining(&self) -> f64 {
        (self.cap - self.reserved - self.spent).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// One entry of the provenance index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub token: String,
    pub paper_id: String,
}

/// Binding between P-tokens shown to the generator and real paper ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceIndex {
    pub entries: Vec<ProvenanceEntry>,
}

impl ProvenanceIndex {
    /// Canonical token for position `i` (zero-based).
    pub fn token_for(i: usize) -> String {
        format!("P{}", i + 1)
    }

    /// Normalize generator spellings like `p3`, `[P3]`, ` P3 ` to `P3`.
    pub fn normalize_token(raw: &str) -> String {
        raw.trim()
            .trim_matches(|c| c == '[' || c == ']' || c == '(' || c == ')')
            .trim()
            .to_ascii_uppercase()
    }

    /// Resolve a token to its paper id.
    pub fn resolve(&self, token: &str) -> Option<&str> {
        let token = Self::normalize_token(token);
        self.entries
            .iter()
            .find(|e| e.token == token)
            .map(|e| e.paper_id.as_str())
    }

    /// Whether `paper_id` was presented in this batch.
    pub fn contains_paper(&self, paper_id: &str) -> bool {
        self.entries.iter().any(|e| e.paper_id == paper_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A paper whose entry was shortened to fit the batch budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncation {
    pub token: String,
    pub paper_id: String,
    pub reason: String,
}

/// Output of batch compression, persisted as the first pipeline checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedBatch {
    pub batch_id: BatchId,
    pub text: String,
    pub index: ProvenanceIndex,
    pub truncations: Vec<Truncation>,
    /// Keyword clusters, as lists of tokens.
    pub clusters: Vec<Vec<String>>,
    pub char_budget: usize,
    /// Set when even the all-stub rendering exceeds the budget.
    #[serde(default)]
    pub over_budget: bool,
}

/// Last completed pipeline stage of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStage {
    Compressed,
    Synthesized,
    Filtered,
    Scored,
    Validated,
}

impl BatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compressed => "COMPRESSED",
            Self::Synthesized => "SYNTHESIZED",
            Self::Filtered => "FILTERED",
            Self::Scored => "SCORED",
            Self::Validated => "VALIDATED",
        }
    }
}

impl FromStr for BatchStage {
    type Err = IdeaForgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "COMPRESSED" => Ok(Self::Compressed),
            "SYNTHESIZED" => Ok(Self::Synthesized),
            "FILTERED" => Ok(Self::Filtered),
            "SCORED" => Ok(Self::Scored),
            "VALIDATED" => Ok(Self::Validated),
            other => Err(IdeaForgeError::validation(format!(
                "unknown batch stage '{other}'"
            ))),
        }
    }
}

/// Overall status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    SynthesisFailed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::SynthesisFailed => "SYNTHESIS_FAILED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = IdeaForgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "SYNTHESIS_FAILED" => Ok(Self::SynthesisFailed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(IdeaForgeError::validation(format!(
                "unknown batch status '{other}'"
            ))),
        }
    }
}

/// Persisted batch metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub domain: String,
    pub paper_ids: Vec<String>,
    pub status: BatchStatus,
    /// Last completed stage, `None` before compression finishes.
    pub stage: Option<BatchStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idea_id_roundtrip() {
        let id = IdeaId::new();
        let parsed: IdeaId = id.to_string().parse().expect("parse IdeaId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn paper_deserializes_abstract_field() {
        let json = r#"{"id":"arxiv:1","title":"T","abstract":"A study.","quartile":"Q2","year":2021,"citation_count":12}"#;
        let paper: Paper = serde_json::from_str(json).expect("deserialize");
        assert_eq!(paper.abstract_text, "A study.");
        assert_eq!(paper.quartile, Some(Quartile::Q2));
        assert!(paper.excerpts.is_empty());
    }

    #[test]
    fn quartile_scores() {
        assert_eq!(Quartile::score(Some(Quartile::Q1)), 1.0);
        assert_eq!(Quartile::score(Some(Quartile::Q4)), 0.3);
        assert_eq!(Quartile::score(None), 0.4);
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            IdeaStatus::Candidate,
            IdeaStatus::ValidationPending,
            IdeaStatus::ValidationDeferred,
            IdeaStatus::ValidatedNovel,
            IdeaStatus::ValidatedPartial,
            IdeaStatus::RejectedDuplicate,
            IdeaStatus::SynthesisFailed,
        ] {
            let parsed: IdeaStatus = status.as_str().parse().expect("parse status");
            assert_eq!(parsed, status);
        }
        assert_eq!("validation-deferred".parse::<IdeaStatus>().unwrap(), IdeaStatus::ValidationDeferred);
    }

    #[test]
    fn verdict_scores_and_transitions() {
        assert_eq!(Verdict::Novel.novelty_score(), 1.0);
        assert_eq!(Verdict::Partial.novelty_score(), 0.6);
        assert_eq!(Verdict::Exists.novelty_score(), 0.2);
        assert_eq!(Verdict::Exists.resulting_status(), IdeaStatus::RejectedDuplicate);
        assert!("maybe".parse::<Verdict>().is_err());
    }

    #[test]
    fn provenance_resolves_loose_tokens() {
        let index = ProvenanceIndex {
            entries: vec![
                ProvenanceEntry { token: "P1".into(), paper_id: "doi:a".into() },
                ProvenanceEntry { token: "P2".into(), paper_id: "doi:b".into() },
            ],
        };
        assert_eq!(index.resolve("P2"), Some("doi:b"));
        assert_eq!(index.resolve(" [p1] "), Some("doi:a"));
        assert_eq!(index.resolve("P3"), None);
        assert!(index.contains_paper("doi:a"));
        assert!(!index.contains_paper("doi:z"));
    }

    #[test]
    fn distinct_sources_ignores_repeats() {
        let idea = IdeaCandidate {
            id: IdeaId::new(),
            batch_id: BatchId::new(),
            source_paper_ids: vec!["a".into(), "b".into(), "a".into()],
            source_tokens: vec![],
            title: "t".into(),
            description: "d".into(),
            novelty_rationale: "n".into(),
            methodology: "m".into(),
            required_datasets: vec![],
            estimated_compute: ComputeLevel::Low,
            risks: vec![],
            raw_llm_scores: LlmScores { impact: 5, feasibility: 5 },
            status: IdeaStatus::Candidate,
            aliases: vec![],
            pre_existing_flag: false,
            created_at: Utc::now(),
        };
        assert_eq!(idea.distinct_sources(), 2);
    }

    #[test]
    fn ledger_remaining_never_negative() {
        let snap = LedgerSnapshot {
            provider: "novelty".into(),
            period: "2026-10".into(),
            cap: 10.0,
            reserved: 4.0,
            spent: 7.0,
        };
        assert_eq!(snap.remaining(), 0.0);
    }
}
