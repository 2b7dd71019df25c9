//! Long-context idea synthesis for one compressed batch.
//!
//! One invocation issues a single generation request for the whole batch.
//! Transient failures are retried with jittered exponential backoff, every
//! call is reserved on the budget ledger before it is sent, and the output
//! goes through strict parsing, one auto-repair pass, and at most one repair
//! round-trip before the batch is given up on.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, instrument, warn};

use ideaforge_compressor::keywords::truncate_chars;
use ideaforge_providers::{Generation, GenerationProvider, GenerationRequest, TokenUsage};
use ideaforge_shared::{
    BatchId, CompressedBatch, ComputeLevel, GeneratorConfig, IdeaForgeError, LlmScores,
    ProvenanceIndex, Result,
};

use crate::cancel::CancelToken;
use crate::ledger::{BudgetLedger, Usage};
use crate::repair::parse_idea_array;

/// Existing titles passed as a dedup hint are capped at this many.
pub const MAX_EXISTING_TITLES: usize = 50;

/// Broken output quoted back in a repair request is cut to this length.
const MAX_REPAIR_ECHO_CHARS: usize = 20_000;

const SYSTEM_PROMPT: &str = "You are a research strategist who proposes new research ideas by \
synthesizing findings across several papers. You answer with a JSON array only, with no prose \
before or after it.";

const SCHEMA_INSTRUCTIONS: &str = r#"Return a JSON array. Each element must be an object with exactly these fields:
{
  "title": string,
  "description": string,
  "novelty_rationale": string,
  "source_papers": [string],        // P-tokens from the batch only, e.g. ["P3", "P17"]
  "methodology": string,
  "required_datasets": [string],
  "estimated_compute": "LOW" | "MEDIUM" | "HIGH",
  "risks": [string],
  "impact_score": integer 1-10,
  "feasibility_score": integer 1-10
}
Cite papers only by the P-tokens shown in the batch. Prefer ideas that combine two or more papers."#;

// ---------------------------------------------------------------------------
// Generator contract
// ---------------------------------------------------------------------------

/// One idea object exactly as the generator must emit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedIdea {
    pub title: String,
    pub description: String,
    pub novelty_rationale: String,
    pub source_papers: Vec<String>,
    pub methodology: String,
    #[serde(deserialize_with = "string_or_vec")]
    pub required_datasets: Vec<String>,
    pub estimated_compute: String,
    #[serde(deserialize_with = "string_or_vec")]
    pub risks: Vec<String>,
    pub impact_score: i64,
    pub feasibility_score: i64,
}

fn string_or_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// A generated idea that passed schema validation, with tokens normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftIdea {
    pub title: String,
    pub description: String,
    pub novelty_rationale: String,
    pub source_tokens: Vec<String>,
    pub methodology: String,
    pub required_datasets: Vec<String>,
    pub estimated_compute: ComputeLevel,
    pub risks: Vec<String>,
    pub raw_llm_scores: LlmScores,
}

/// Why generated objects were excluded from the surviving set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounts {
    /// Missing or mistyped required fields, or empty text fields.
    pub schema: usize,
    pub out_of_range: usize,
    pub unknown_compute: usize,
    /// Cited a P-token that is not in the batch's provenance index.
    pub unknown_token: usize,
}

impl DropCounts {
    pub fn total(&self) -> usize {
        self.schema + self.out_of_range + self.unknown_compute + self.unknown_token
    }
}

/// Validate untyped generator objects against the idea schema.
pub fn validate_ideas(
    values: Vec<serde_json::Value>,
    index: &ProvenanceIndex,
) -> (Vec<DraftIdea>, DropCounts) {
    let mut drafts = Vec::with_capacity(values.len());
    let mut dropped = DropCounts::default();

    for (i, value) in values.into_iter().enumerate() {
        let idea: GeneratedIdea = match serde_json::from_value(value) {
            Ok(idea) => idea,
            Err(e) => {
                warn!(position = i, error = %e, "dropping idea: schema mismatch");
                dropped.schema += 1;
                continue;
            }
        };

        if [&idea.title, &idea.description, &idea.methodology]
            .iter()
            .any(|s| s.trim().is_empty())
            || idea.source_papers.is_empty()
        {
            warn!(position = i, title = %idea.title, "dropping idea: empty required field");
            dropped.schema += 1;
            continue;
        }

        let (Some(impact), Some(feasibility)) =
            (score_in_range(idea.impact_score), score_in_range(idea.feasibility_score))
        else {
            warn!(
                position = i,
                impact = idea.impact_score,
                feasibility = idea.feasibility_score,
                "dropping idea: score outside 1-10"
            );
            dropped.out_of_range += 1;
            continue;
        };

        let compute: ComputeLevel = match idea.estimated_compute.parse() {
            Ok(level) => level,
            Err(_) => {
                warn!(position = i, compute = %idea.estimated_compute, "dropping idea: unknown compute level");
                dropped.unknown_compute += 1;
                continue;
            }
        };

        let tokens: Vec<String> = idea
            .source_papers
            .iter()
            .map(|t| ProvenanceIndex::normalize_token(t))
            .collect();
        if let Some(bad) = tokens.iter().find(|t| index.resolve(t).is_none()) {
            warn!(position = i, token = %bad, "dropping idea: unknown P-token");
            dropped.unknown_token += 1;
            continue;
        }

        drafts.push(DraftIdea {
            title: idea.title.trim().to_string(),
            description: idea.description.trim().to_string(),
            novelty_rationale: idea.novelty_rationale.trim().to_string(),
            source_tokens: tokens,
            methodology: idea.methodology.trim().to_string(),
            required_datasets: idea.required_datasets,
            estimated_compute: compute,
            risks: idea.risks,
            raw_llm_scores: LlmScores {
                impact,
                feasibility,
            },
        });
    }

    (drafts, dropped)
}

fn score_in_range(score: i64) -> Option<u8> {
    u8::try_from(score).ok().filter(|s| (1..=10).contains(s))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runtime settings for the synthesis stage.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Ledger key of the generation provider.
    pub provider: String,
    /// Total generator calls allowed per invocation, repair included.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
}

impl From<&GeneratorConfig> for SynthesisConfig {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            cost_per_1k_input: config.cost_per_1k_input,
            cost_per_1k_output: config.cost_per_1k_output,
        }
    }
}

impl SynthesisConfig {
    /// Worst-case cost of a request: `chars / 4` input tokens plus the full
    /// output allowance.
    pub fn estimate_cost(&self, request: &GenerationRequest) -> f64 {
        let chars = request.system.chars().count() + request.prompt.chars().count();
        let input_tokens = chars.div_ceil(4) as f64;
        let output_tokens = f64::from(request.max_output_tokens);
        input_tokens / 1000.0 * self.cost_per_1k_input
            + output_tokens / 1000.0 * self.cost_per_1k_output
    }

    pub fn actual_cost(&self, usage: &TokenUsage) -> f64 {
        usage.input_tokens as f64 / 1000.0 * self.cost_per_1k_input
            + usage.output_tokens as f64 / 1000.0 * self.cost_per_1k_output
    }
}

/// Everything the generator sees for one batch.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub batch: &'a CompressedBatch,
    pub domain: &'a str,
    /// Titles of ideas already in the store, as a dedup hint.
    pub existing_titles: &'a [String],
}

/// Result of a successful synthesis, persisted as the SYNTHESIZED checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOutcome {
    pub ideas: Vec<DraftIdea>,
    pub dropped: DropCounts,
    pub usage: TokenUsage,
    /// Generator calls made, including failed and repair calls.
    pub calls: u32,
    /// Whether the final output needed auto-repair or a repair round-trip.
    pub repaired: bool,
}

/// Drives one generation provider for batch synthesis.
pub struct SynthesisEngine {
    provider: Arc<dyn GenerationProvider>,
    ledger: Arc<BudgetLedger>,
    config: SynthesisConfig,
}

impl SynthesisEngine {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        ledger: Arc<BudgetLedger>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            provider,
            ledger,
            config,
        }
    }

    /// Synthesize ideas for one batch.
    #[instrument(skip_all, fields(batch = %input.batch.batch_id, provider = %self.config.provider))]
    pub async fn synthesize(
        &self,
        input: &SynthesisInput<'_>,
        cancel: &CancelToken,
    ) -> Result<SynthesisOutcome> {
        let batch_id = input.batch.batch_id;
        let max_calls = self.config.max_retries.max(1);
        let mut request = self.initial_request(input);
        let mut usage = TokenUsage::default();
        let mut backoff = self.config.initial_backoff;
        let mut calls = 0u32;
        let mut repair_sent = false;
        let mut last_error = String::from("no attempt made");

        while calls < max_calls {
            cancel.check()?;
            calls += 1;

            let generation = match self.call(&request, batch_id, cancel).await {
                Ok(generation) => generation,
                Err(e) if e.is_transient() => {
                    warn!(attempt = calls, max_calls, error = %e, "generation attempt failed");
                    last_error = e.to_string();
                    if calls < max_calls {
                        let delay = jittered(backoff);
                        debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
                        cancel
                            .run(async {
                                tokio::time::sleep(delay).await;
                                Ok(())
                            })
                            .await?;
                        backoff = (backoff * 2).min(self.config.max_backoff);
                    }
                    continue;
                }
                Err(IdeaForgeError::MalformedOutput { message }) => {
                    warn!(attempt = calls, max_calls, error = %message, "provider returned unusable output, retrying");
                    last_error = format!("malformed provider response: {message}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            usage.input_tokens += generation.usage.input_tokens;
            usage.output_tokens += generation.usage.output_tokens;

            match parse_idea_array(&generation.text) {
                Ok(parsed) => {
                    let total = parsed.values.len();
                    let (ideas, dropped) = validate_ideas(parsed.values, &input.batch.index);
                    if ideas.is_empty() {
                        return Err(IdeaForgeError::SynthesisFailed {
                            batch_id: batch_id.to_string(),
                            reason: format!(
                                "no valid ideas among {total} generated objects ({} dropped)",
                                dropped.total()
                            ),
                        });
                    }
                    info!(
                        ideas = ideas.len(),
                        dropped = dropped.total(),
                        calls,
                        repaired = parsed.repaired || repair_sent,
                        "synthesis complete"
                    );
                    return Ok(SynthesisOutcome {
                        ideas,
                        dropped,
                        usage,
                        calls,
                        repaired: parsed.repaired || repair_sent,
                    });
                }
                Err(parse_error) if !repair_sent => {
                    warn!(attempt = calls, error = %parse_error, "generator output unparseable, requesting repair");
                    last_error = format!("unparseable output: {parse_error}");
                    request = self.repair_request(&generation.text, &parse_error);
                    repair_sent = true;
                }
                Err(parse_error) => {
                    return Err(IdeaForgeError::malformed(format!(
                        "output still unparseable after repair round-trip: {parse_error}"
                    )));
                }
            }
        }

        if repair_sent {
            return Err(IdeaForgeError::malformed(format!(
                "attempts exhausted during repair: {last_error}"
            )));
        }
        Err(IdeaForgeError::SynthesisFailed {
            batch_id: batch_id.to_string(),
            reason: format!("{calls} attempts failed, last: {last_error}"),
        })
    }

    /// One reserved, timed, cancellable provider call.
    async fn call(
        &self,
        request: &GenerationRequest,
        batch_id: BatchId,
        cancel: &CancelToken,
    ) -> Result<Generation> {
        let estimate = self.config.estimate_cost(request);
        let reservation = self.ledger.reserve(&self.config.provider, estimate).await?;

        let timeout = self.config.timeout;
        let result = cancel
            .run(async {
                match tokio::time::timeout(timeout, self.provider.generate(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(IdeaForgeError::transient(
                        self.provider.name(),
                        format!("no response within {}s", timeout.as_secs()),
                    )),
                }
            })
            .await;

        match result {
            Ok(generation) => {
                let reported = generation.usage.input_tokens + generation.usage.output_tokens;
                let cost = if reported == 0 {
                    warn!(
                        provider = %self.config.provider,
                        charged = reservation.amount(),
                        "provider reported no token usage, charging the reserved estimate"
                    );
                    reservation.amount()
                } else {
                    self.config.actual_cost(&generation.usage)
                };
                self.ledger
                    .commit(
                        reservation,
                        cost,
                        Usage {
                            kind: "synthesis".into(),
                            batch_id: Some(batch_id),
                            tokens_in: generation.usage.input_tokens,
                            tokens_out: generation.usage.output_tokens,
                        },
                    )
                    .await?;
                Ok(generation)
            }
            Err(e) => {
                self.ledger.release(reservation).await;
                Err(e)
            }
        }
    }

    fn initial_request(&self, input: &SynthesisInput<'_>) -> GenerationRequest {
        let mut prompt = format!(
            "Domain: {}\n\nPropose new research ideas that synthesize findings across the papers below.\n\n{}\n",
            input.domain, SCHEMA_INSTRUCTIONS
        );
        if !input.existing_titles.is_empty() {
            prompt.push_str("\nThese ideas already exist. Do not repeat them:\n");
            for title in input.existing_titles.iter().take(MAX_EXISTING_TITLES) {
                prompt.push_str("- ");
                prompt.push_str(title);
                prompt.push('\n');
            }
        }
        prompt.push('\n');
        prompt.push_str(&input.batch.text);

        GenerationRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            max_output_tokens: self.config.max_output_tokens,
            temperature: self.config.temperature,
        }
    }

    fn repair_request(&self, broken: &str, parse_error: &str) -> GenerationRequest {
        let prompt = format!(
            "Your previous answer could not be parsed as JSON.\nParse error: {parse_error}\n\n\
             Return the same ideas as one valid JSON array and nothing else.\n\n{}\n\n\
             Previous answer:\n{}",
            SCHEMA_INSTRUCTIONS,
            truncate_chars(broken, MAX_REPAIR_ECHO_CHARS)
        );
        GenerationRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            max_output_tokens: self.config.max_output_tokens,
            temperature: 0.0,
        }
    }
}

/// `backoff` plus uniform jitter in `[0, backoff / 2]`.
fn jittered(backoff: Duration) -> Duration {
    let half = (backoff.as_millis() / 2) as u64;
    let jitter = if half == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=half)
    };
    backoff + Duration::from_millis(jitter)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ideaforge_shared::ProvenanceEntry;

    /// Generator fake that replays scripted responses and counts calls.
    pub(crate) struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<String>>>,
        pub calls: AtomicUsize,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub(crate) fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedGenerator {
        fn name(&self) -> &str {
            "openrouter"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(IdeaForgeError::transient("openrouter", "script exhausted")));
            next.map(|text| Generation {
                text,
                usage: TokenUsage {
                    input_tokens: 1000,
                    output_tokens: 500,
                },
                model: "test-model".into(),
            })
        }
    }

    pub(crate) fn test_config() -> SynthesisConfig {
        SynthesisConfig {
            provider: "openrouter".into(),
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            timeout: Duration::from_secs(5),
            max_output_tokens: 1000,
            temperature: 0.7,
            cost_per_1k_input: 0.001,
            cost_per_1k_output: 0.002,
        }
    }

    pub(crate) fn test_batch(papers: usize) -> CompressedBatch {
        CompressedBatch {
            batch_id: BatchId::new(),
            text: "# Paper batch\n[P1] A\n[P2] B\n[P3] C\n".into(),
            index: ProvenanceIndex {
                entries: (0..papers)
                    .map(|i| ProvenanceEntry {
                        token: ProvenanceIndex::token_for(i),
                        paper_id: format!("paper-{}", i + 1),
                    })
                    .collect(),
            },
            truncations: vec![],
            clusters: vec![],
            char_budget: 120_000,
            over_budget: false,
        }
    }

    pub(crate) fn idea_json(title: &str, sources: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "title": title,
            "description": format!("{title} applied to open benchmarks"),
            "novelty_rationale": "Combines two lines of work",
            "source_papers": sources,
            "methodology": "Fine-tune and evaluate",
            "required_datasets": ["ImageNet"],
            "estimated_compute": "LOW",
            "risks": ["none"],
            "impact_score": 7,
            "feasibility_score": 8
        })
    }

    fn engine(generator: Arc<ScriptedGenerator>, cap: f64) -> SynthesisEngine {
        let ledger = BudgetLedger::new(HashMap::from([("openrouter".to_string(), cap)]), None);
        SynthesisEngine::new(generator, Arc::new(ledger), test_config())
    }

    #[tokio::test]
    async fn parses_valid_response() {
        let body = serde_json::to_string(&vec![
            idea_json("Graph retrieval", &["P1", "P2"]),
            idea_json("Federated pretraining", &["[p3]"]),
        ])
        .unwrap();
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(body)]));
        let engine = engine(Arc::clone(&generator), 10.0);
        let batch = test_batch(3);
        let titles = vec!["Old idea".to_string()];
        let input = SynthesisInput {
            batch: &batch,
            domain: "machine learning",
            existing_titles: &titles,
        };

        let outcome = engine.synthesize(&input, &CancelToken::new()).await.unwrap();
        assert_eq!(outcome.ideas.len(), 2);
        assert_eq!(outcome.ideas[1].source_tokens, vec!["P3"]);
        assert_eq!(outcome.dropped.total(), 0);
        assert_eq!(outcome.calls, 1);
        assert!(!outcome.repaired);
        assert!(generator.prompts.lock().unwrap()[0].contains("- Old idea"));

        let snap = engine.ledger.snapshot("openrouter").await.unwrap();
        assert!((snap.spent - 0.002).abs() < 1e-9);
        assert_eq!(snap.reserved, 0.0);
    }

    #[tokio::test]
    async fn invalid_objects_are_dropped_and_counted() {
        let mut missing_field = idea_json("No methodology", &["P1"]);
        missing_field.as_object_mut().unwrap().remove("methodology");
        let mut out_of_range = idea_json("Too good", &["P1"]);
        out_of_range["impact_score"] = serde_json::json!(11);
        let mut bad_compute = idea_json("Huge", &["P1"]);
        bad_compute["estimated_compute"] = serde_json::json!("EXTREME");
        let mut bare_string = idea_json("Bare string risks", &["P2"]);
        bare_string["risks"] = serde_json::json!("privacy leakage");

        let body = serde_json::to_string(&vec![
            idea_json("Keeper", &["P1", "P2"]),
            missing_field,
            idea_json("Hallucinated", &["P1", "P9"]),
            out_of_range,
            bad_compute,
            bare_string,
        ])
        .unwrap();
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(body)]));
        let engine = engine(generator, 10.0);
        let batch = test_batch(3);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let outcome = engine.synthesize(&input, &CancelToken::new()).await.unwrap();
        let titles: Vec<&str> = outcome.ideas.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Keeper", "Bare string risks"]);
        assert_eq!(outcome.ideas[1].risks, vec!["privacy leakage"]);
        assert_eq!(
            outcome.dropped,
            DropCounts {
                schema: 1,
                out_of_range: 1,
                unknown_compute: 1,
                unknown_token: 1,
            }
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let body = serde_json::to_string(&vec![idea_json("Works", &["P1"])]).unwrap();
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(IdeaForgeError::transient("openrouter", "HTTP 503")),
            Ok(body),
        ]));
        let engine = engine(Arc::clone(&generator), 10.0);
        let batch = test_batch(1);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let outcome = engine.synthesize(&input, &CancelToken::new()).await.unwrap();
        assert_eq!(outcome.calls, 2);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_synthesis() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(IdeaForgeError::transient("openrouter", "HTTP 503")),
            Err(IdeaForgeError::transient("openrouter", "HTTP 502")),
            Err(IdeaForgeError::transient("openrouter", "timeout")),
        ]));
        let engine = engine(Arc::clone(&generator), 10.0);
        let batch = test_batch(1);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let err = engine.synthesize(&input, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, IdeaForgeError::SynthesisFailed { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);

        let snap = engine.ledger.snapshot("openrouter").await.unwrap();
        assert_eq!(snap.spent, 0.0);
        assert_eq!(snap.reserved, 0.0);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Err(IdeaForgeError::permanent(
            "openrouter",
            "HTTP 401",
        ))]));
        let engine = engine(Arc::clone(&generator), 10.0);
        let batch = test_batch(1);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let err = engine.synthesize(&input, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, IdeaForgeError::PermanentProvider { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repair_round_trip_recovers_output() {
        let fixed = serde_json::to_string(&vec![idea_json("Recovered", &["P1"])]).unwrap();
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok("Sorry, here is my answer: title = Recovered".into()),
            Ok(fixed),
        ]));
        let engine = engine(Arc::clone(&generator), 10.0);
        let batch = test_batch(1);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let outcome = engine.synthesize(&input, &CancelToken::new()).await.unwrap();
        assert!(outcome.repaired);
        assert_eq!(outcome.calls, 2);
        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[1].contains("could not be parsed"));
        assert!(prompts[1].contains("title = Recovered"));
    }

    #[tokio::test]
    async fn second_unparseable_output_is_malformed() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok("not json".into()),
            Ok("still not json".into()),
        ]));
        let engine = engine(Arc::clone(&generator), 10.0);
        let batch = test_batch(1);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let err = engine.synthesize(&input, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, IdeaForgeError::MalformedOutput { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_surviving_set_fails_batch() {
        let body = serde_json::to_string(&vec![idea_json("Ghost", &["P42"])]).unwrap();
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(body)]));
        let engine = engine(generator, 10.0);
        let batch = test_batch(2);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let err = engine.synthesize(&input, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, IdeaForgeError::SynthesisFailed { .. }));
    }

    #[tokio::test]
    async fn budget_rejection_fails_fast_without_calling() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok("[]".into())]));
        let engine = engine(Arc::clone(&generator), 0.0001);
        let batch = test_batch(1);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let err = engine.synthesize(&input, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, IdeaForgeError::BudgetExceeded { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    /// Generator that never reports token usage.
    struct UnmeteredGenerator {
        body: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationProvider for UnmeteredGenerator {
        fn name(&self) -> &str {
            "openrouter"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Generation {
                text: self.body.clone(),
                usage: TokenUsage::default(),
                model: "test-model".into(),
            })
        }
    }

    #[tokio::test]
    async fn missing_usage_charges_reserved_estimate() {
        let body = serde_json::to_string(&vec![idea_json("Unmetered", &["P1"])]).unwrap();
        let generator = Arc::new(UnmeteredGenerator {
            body,
            calls: AtomicUsize::new(0),
        });
        let ledger = Arc::new(BudgetLedger::new(
            HashMap::from([("openrouter".to_string(), 10.0)]),
            None,
        ));
        let engine = SynthesisEngine::new(generator.clone(), Arc::clone(&ledger), test_config());
        let batch = test_batch(1);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };
        let estimate = engine.config.estimate_cost(&engine.initial_request(&input));

        engine.synthesize(&input, &CancelToken::new()).await.unwrap();
        engine.synthesize(&input, &CancelToken::new()).await.unwrap();
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

        let snap = ledger.snapshot("openrouter").await.unwrap();
        assert!(estimate > 0.0);
        assert!((snap.spent - 2.0 * estimate).abs() < 1e-9);
        assert_eq!(snap.reserved, 0.0);
    }

    #[tokio::test]
    async fn unusable_provider_response_is_retried() {
        let body = serde_json::to_string(&vec![idea_json("Second try", &["P1"])]).unwrap();
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(IdeaForgeError::malformed("empty completion")),
            Ok(body),
        ]));
        let engine = engine(Arc::clone(&generator), 10.0);
        let batch = test_batch(1);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let outcome = engine.synthesize(&input, &CancelToken::new()).await.unwrap();
        assert_eq!(outcome.ideas[0].title, "Second try");
        assert_eq!(outcome.calls, 2);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeated_unusable_responses_exhaust_attempts() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(IdeaForgeError::malformed("empty completion")),
            Err(IdeaForgeError::malformed("undecodable body")),
            Err(IdeaForgeError::malformed("empty completion")),
        ]));
        let engine = engine(Arc::clone(&generator), 10.0);
        let batch = test_batch(1);
        let input = SynthesisInput {
            batch: &batch,
            domain: "ml",
            existing_titles: &[],
        };

        let err = engine.synthesize(&input, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, IdeaForgeError::SynthesisFailed { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn estimate_covers_prompt_and_output() {
        let config = test_config();
        let request = GenerationRequest {
            system: String::new(),
            prompt: "x".repeat(4000),
            max_output_tokens: 1000,
            temperature: 0.0,
        };
        // 1000 input tokens at 0.001 plus 1000 output tokens at 0.002
        assert!((config.estimate_cost(&request) - 0.003).abs() < 1e-12);
    }

    #[test]
    fn jitter_stays_within_half_backoff() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
