//! Budget-gated external novelty validation and re-ranking.
//!
//! The gate looks at the top-K ranked ideas of a batch. For each one it
//! consults the validation cache, otherwise reserves budget and asks the
//! novelty provider for a verdict. NOVEL and PARTIAL verdicts chain a
//! related-work summary; EXISTS never does. Every verdict appends a
//! validation record, moves the idea's status, and appends a re-ranked score
//! version.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use ideaforge_providers::{NoveltyAssessment, NoveltyProvider, RelatedWorkSummary};
use ideaforge_shared::{
    AppConfig, IdeaCandidate, IdeaForgeError, IdeaId, IdeaStatus, Result, ScoreBreakdown,
    ValidationRecord, ValidationTask, Verdict,
};
use ideaforge_storage::Storage;

use crate::cancel::CancelToken;
use crate::ledger::{BudgetLedger, Usage};
use crate::scoring::rescore_with_novelty;

/// Runtime settings for the gate.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Ledger key of the novelty provider.
    pub provider: String,
    pub check_cost: f64,
    pub summary_cost: f64,
    pub concurrency: usize,
    pub cache_ttl: chrono::Duration,
    pub timeout: Duration,
    pub novelty_weight: f64,
    pub top_k: usize,
}

impl From<&AppConfig> for ValidationConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            provider: config.novelty.provider.clone(),
            check_cost: config.novelty.check_cost,
            summary_cost: config.novelty.summary_cost,
            concurrency: config.novelty.concurrency.max(1) as usize,
            cache_ttl: chrono::Duration::days(i64::from(config.novelty.cache_ttl_days)),
            timeout: Duration::from_secs(config.novelty.timeout_secs),
            novelty_weight: config.scoring.novelty_weight,
            top_k: config.novelty.top_k,
        }
    }
}

/// What happened to one idea.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// A verdict was recorded and a new score version appended.
    Validated {
        verdict: Verdict,
        from_cache: bool,
        summarized: bool,
        composite: f64,
        score_version: u32,
    },
    /// Warm cache and already re-ranked: nothing but the cache expiry moved.
    Unchanged,
    /// The novelty reservation was refused by the ledger.
    Deferred,
    /// A per-idea failure. The idea is back to CANDIDATE.
    Failed(String),
}

/// Outcomes in rank order.
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub outcomes: Vec<(IdeaId, ValidationOutcome)>,
}

impl GateReport {
    pub fn validated(&self) -> usize {
        self.count(|o| matches!(o, ValidationOutcome::Validated { .. }))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, ValidationOutcome::Unchanged))
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, ValidationOutcome::Deferred))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ValidationOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&ValidationOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Cache key for an idea: SHA-256 of normalized `title + "\n" + description`.
pub fn cache_key(idea: &IdeaCandidate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(&idea.title).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize(&idea.description).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Natural-language query sent to the novelty provider.
pub fn build_query(idea: &IdeaCandidate) -> String {
    format!(
        "Has the following research idea already been published?\n\
         Title: {}\nDescription: {}\nMethodology: {}\nClaimed novelty: {}",
        idea.title.trim(),
        idea.description.trim(),
        idea.methodology.trim(),
        idea.novelty_rationale.trim()
    )
}

#[derive(Clone)]
pub struct SelectiveValidationGate {
    provider: Arc<dyn NoveltyProvider>,
    ledger: Arc<BudgetLedger>,
    storage: Arc<Storage>,
    config: Arc<ValidationConfig>,
}

impl SelectiveValidationGate {
    pub fn new(
        provider: Arc<dyn NoveltyProvider>,
        ledger: Arc<BudgetLedger>,
        storage: Arc<Storage>,
        config: ValidationConfig,
    ) -> Self {
        Self {
            provider,
            ledger,
            storage,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate the first `top_k` ideas of `ranked`, concurrently.
    #[instrument(skip_all, fields(ideas = ranked.len(), top_k = top_k))]
    pub async fn validate(
        &self,
        ranked: &[IdeaCandidate],
        top_k: usize,
        cancel: &CancelToken,
    ) -> Result<GateReport> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles = Vec::new();

        for idea in ranked.iter().take(top_k) {
            let gate = self.clone();
            let idea = idea.clone();
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let id = idea.id;
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => gate.validate_idea(&idea, &cancel).await,
                    Err(_) => Err(IdeaForgeError::Cancelled),
                };
                (id, outcome)
            }));
        }

        let mut report = GateReport::default();
        let mut cancelled = false;
        for handle in handles {
            let (id, result) = match handle.await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "validation task panicked");
                    continue;
                }
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(IdeaForgeError::Cancelled) => {
                    cancelled = true;
                    continue;
                }
                Err(e) => ValidationOutcome::Failed(e.to_string()),
            };
            report.outcomes.push((id, outcome));
        }
        if cancelled || cancel.is_cancelled() {
            return Err(IdeaForgeError::Cancelled);
        }

        info!(
            validated = report.validated(),
            unchanged = report.unchanged(),
            deferred = report.deferred(),
            failed = report.failed(),
            "validation complete"
        );
        Ok(report)
    }

    /// Validate one idea, restoring CANDIDATE status if it fails midway.
    async fn validate_idea(&self, idea: &IdeaCandidate, cancel: &CancelToken) -> Result<ValidationOutcome> {
        match self.try_validate_idea(idea, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if !matches!(e, IdeaForgeError::Cancelled) {
                    warn!(idea = %idea.id, error = %e, "validation failed");
                }
                if let Err(revert) = self
                    .storage
                    .update_idea_status(idea.id, IdeaStatus::Candidate)
                    .await
                {
                    warn!(idea = %idea.id, error = %revert, "could not restore idea status");
                }
                Err(e)
            }
        }
    }

    async fn try_validate_idea(
        &self,
        idea: &IdeaCandidate,
        cancel: &CancelToken,
    ) -> Result<ValidationOutcome> {
        cancel.check()?;
        let now = Utc::now();
        let expiry = now + self.config.cache_ttl;
        let key = cache_key(idea);

        let prior = self.storage.latest_score(idea.id).await?.ok_or_else(|| {
            IdeaForgeError::validation(format!("idea {} has no score to re-rank", idea.id))
        })?;

        if let Some(cached) = self
            .storage
            .get_cached_validation(&key, ValidationTask::NoveltyCheck, now)
            .await?
        {
            let assessment: NoveltyAssessment = serde_json::from_str(&cached.payload_json)
                .map_err(|e| IdeaForgeError::malformed(format!("corrupt cache entry: {e}")))?;
            self.storage
                .touch_cached_validation(&key, ValidationTask::NoveltyCheck, expiry)
                .await?;

            if prior.components.novelty.is_some() {
                if assessment.verdict != Verdict::Exists {
                    self.storage
                        .touch_cached_validation(&key, ValidationTask::RelatedWorkSummary, expiry)
                        .await?;
                }
                debug!(idea = %idea.id, "warm cache, already re-ranked");
                return Ok(ValidationOutcome::Unchanged);
            }
            debug!(idea = %idea.id, verdict = assessment.verdict.as_str(), "novelty cache hit");
            return self
                .apply_verdict(idea, &prior, assessment, true, &key, expiry, cancel)
                .await;
        }

        self.storage
            .update_idea_status(idea.id, IdeaStatus::ValidationPending)
            .await?;

        let reservation = match self
            .ledger
            .reserve(&self.config.provider, self.config.check_cost)
            .await
        {
            Ok(reservation) => reservation,
            Err(IdeaForgeError::BudgetExceeded { remaining, .. }) => {
                info!(idea = %idea.id, remaining, "novelty check deferred: budget exhausted");
                self.storage
                    .update_idea_status(idea.id, IdeaStatus::ValidationDeferred)
                    .await?;
                return Ok(ValidationOutcome::Deferred);
            }
            Err(e) => return Err(e),
        };

        let query = build_query(idea);
        let assessment = match self.timed(self.provider.check_novelty(&query), cancel).await {
            Ok(assessment) => {
                self.ledger
                    .commit(reservation, self.config.check_cost, self.usage(idea, "novelty_check"))
                    .await?;
                assessment
            }
            Err(e) => {
                self.ledger.release(reservation).await;
                return Err(e);
            }
        };

        let payload = serde_json::to_string(&assessment)
            .map_err(|e| IdeaForgeError::Storage(format!("serialize cache payload: {e}")))?;
        self.storage
            .put_cached_validation(&key, ValidationTask::NoveltyCheck, &payload, expiry)
            .await?;

        self.apply_verdict(idea, &prior, assessment, false, &key, expiry, cancel)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_verdict(
        &self,
        idea: &IdeaCandidate,
        prior: &ScoreBreakdown,
        assessment: NoveltyAssessment,
        from_cache: bool,
        key: &str,
        expiry: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<ValidationOutcome> {
        let verdict = assessment.verdict;
        if from_cache && self.verdict_already_recorded(idea.id, &assessment).await? {
            debug!(idea = %idea.id, "novelty verdict already on record, not appending again");
        } else {
            self.storage
                .append_validation(&ValidationRecord {
                    idea_id: idea.id,
                    task: ValidationTask::NoveltyCheck,
                    verdict,
                    confidence: assessment.confidence,
                    evidence: assessment.evidence,
                    summary: None,
                    from_cache,
                    cache_expiry: expiry,
                    created_at: Utc::now(),
                })
                .await?;
        }

        let summarized = match verdict {
            Verdict::Exists => false,
            Verdict::Novel | Verdict::Partial => {
                self.related_work(idea, verdict, assessment.confidence, key, expiry, cancel)
                    .await?
            }
        };

        self.storage
            .update_idea_status(idea.id, verdict.resulting_status())
            .await?;

        let base = self.blend_base(prior).await?;
        let next = rescore_with_novelty(
            &base,
            verdict,
            assessment.confidence,
            self.config.novelty_weight,
            Utc::now(),
        );
        let score_version = self.storage.append_score_version(&next).await?;

        info!(
            idea = %idea.id,
            verdict = verdict.as_str(),
            from_cache,
            summarized,
            composite = next.composite,
            "idea validated"
        );
        Ok(ValidationOutcome::Validated {
            verdict,
            from_cache,
            summarized,
            composite: next.composite,
            score_version,
        })
    }

    /// Latest score version without a novelty blend. Re-validation blends
    /// against this so novelty is counted once.
    async fn blend_base(&self, prior: &ScoreBreakdown) -> Result<ScoreBreakdown> {
        if prior.components.novelty.is_none() {
            return Ok(prior.clone());
        }
        let history = self.storage.score_history(prior.idea_id).await?;
        Ok(history
            .into_iter()
            .rev()
            .find(|b| b.components.novelty.is_none())
            .unwrap_or_else(|| prior.clone()))
    }

    /// A run interrupted after the verdict was stored but before the score
    /// was re-ranked leaves a matching NOVELTY_CHECK record behind.
    async fn verdict_already_recorded(
        &self,
        idea_id: IdeaId,
        assessment: &NoveltyAssessment,
    ) -> Result<bool> {
        let records = self.storage.validation_records(idea_id).await?;
        Ok(records
            .iter()
            .rev()
            .find(|r| r.task == ValidationTask::NoveltyCheck)
            .is_some_and(|r| {
                r.verdict == assessment.verdict && r.confidence == assessment.confidence
            }))
    }

    /// Chained related-work summary. Deferral or provider failure leaves the
    /// verdict standing and returns `false`.
    async fn related_work(
        &self,
        idea: &IdeaCandidate,
        verdict: Verdict,
        confidence: f64,
        key: &str,
        expiry: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let task = ValidationTask::RelatedWorkSummary;
        let now = Utc::now();

        let (summary, from_cache) =
            if let Some(cached) = self.storage.get_cached_validation(key, task, now).await? {
                let summary: RelatedWorkSummary = serde_json::from_str(&cached.payload_json)
                    .map_err(|e| IdeaForgeError::malformed(format!("corrupt cache entry: {e}")))?;
                self.storage.touch_cached_validation(key, task, expiry).await?;
                (summary, true)
            } else {
                let reservation = match self
                    .ledger
                    .reserve(&self.config.provider, self.config.summary_cost)
                    .await
                {
                    Ok(reservation) => reservation,
                    Err(IdeaForgeError::BudgetExceeded { remaining, .. }) => {
                        info!(idea = %idea.id, remaining, "related-work summary deferred: budget exhausted");
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                };

                let query = build_query(idea);
                let summary = match self
                    .timed(self.provider.summarize_related_work(&query), cancel)
                    .await
                {
                    Ok(summary) => {
                        self.ledger
                            .commit(
                                reservation,
                                self.config.summary_cost,
                                self.usage(idea, "related_work_summary"),
                            )
                            .await?;
                        summary
                    }
                    Err(IdeaForgeError::Cancelled) => {
                        self.ledger.release(reservation).await;
                        return Err(IdeaForgeError::Cancelled);
                    }
                    Err(e) => {
                        self.ledger.release(reservation).await;
                        warn!(idea = %idea.id, error = %e, "related-work summary failed");
                        return Ok(false);
                    }
                };

                let payload = serde_json::to_string(&summary)
                    .map_err(|e| IdeaForgeError::Storage(format!("serialize cache payload: {e}")))?;
                self.storage
                    .put_cached_validation(key, task, &payload, expiry)
                    .await?;
                (summary, false)
            };

        self.storage
            .append_validation(&ValidationRecord {
                idea_id: idea.id,
                task,
                verdict,
                confidence,
                evidence: summary.evidence,
                summary: Some(summary.summary),
                from_cache,
                cache_expiry: expiry,
                created_at: Utc::now(),
            })
            .await?;
        Ok(true)
    }

    /// Race a provider call against the timeout and the cancel token.
    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T>>,
        cancel: &CancelToken,
    ) -> Result<T> {
        let timeout = self.config.timeout;
        cancel
            .run(async {
                tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
                    Err(IdeaForgeError::transient(
                        self.provider.name(),
                        format!("no response within {}s", timeout.as_secs()),
                    ))
                })
            })
            .await
    }

    fn usage(&self, idea: &IdeaCandidate, kind: &str) -> Usage {
        Usage {
            kind: kind.to_string(),
            batch_id: Some(idea.batch_id),
            tokens_in: 0,
            tokens_out: 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ideaforge_shared::{BatchRecord, BatchStatus, ComputeLevel, Evidence, ScoringConfig};
    use uuid::Uuid;

    use crate::scoring::tests::idea as scored_idea;
    use crate::scoring::{ScoringContext, score_idea};

    /// Novelty fake returning one fixed verdict and counting calls per task.
    pub(crate) struct FakeNovelty {
        verdict: Verdict,
        fail: bool,
        delay: Duration,
        stall_summary: AtomicBool,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub checks: AtomicUsize,
        pub summaries: AtomicUsize,
    }

    impl FakeNovelty {
        pub(crate) fn new(verdict: Verdict) -> Self {
            Self {
                verdict,
                fail: false,
                delay: Duration::ZERO,
                stall_summary: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                checks: AtomicUsize::new(0),
                summaries: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NoveltyProvider for FakeNovelty {
        fn name(&self) -> &str {
            "novelty"
        }

        async fn check_novelty(&self, _query: &str) -> Result<NoveltyAssessment> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(IdeaForgeError::permanent("novelty", "HTTP 400"));
            }
            Ok(NoveltyAssessment {
                verdict: self.verdict,
                confidence: 0.8,
                evidence: vec![Evidence {
                    title: "Closest prior work".into(),
                    url: None,
                    snippet: None,
                }],
            })
        }

        async fn summarize_related_work(&self, _query: &str) -> Result<RelatedWorkSummary> {
            self.summaries.fetch_add(1, Ordering::SeqCst);
            if self.stall_summary.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(RelatedWorkSummary {
                summary: "Two adjacent lines of work exist.".into(),
                evidence: vec![],
            })
        }
    }

    pub(crate) fn test_validation_config() -> ValidationConfig {
        ValidationConfig {
            provider: "novelty".into(),
            check_cost: 0.05,
            summary_cost: 0.20,
            concurrency: 2,
            cache_ttl: chrono::Duration::days(30),
            timeout: Duration::from_secs(5),
            novelty_weight: 0.3,
            top_k: 10,
        }
    }

    struct Fixture {
        storage: Arc<Storage>,
        provider: Arc<FakeNovelty>,
        gate: SelectiveValidationGate,
    }

    async fn fixture(provider: FakeNovelty, cap: f64) -> Fixture {
        fixture_with(provider, cap, test_validation_config()).await
    }

    async fn fixture_with(provider: FakeNovelty, cap: f64, config: ValidationConfig) -> Fixture {
        let path = std::env::temp_dir().join(format!("if_gate_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.expect("open test db"));
        let ledger = Arc::new(BudgetLedger::new(
            HashMap::from([("novelty".to_string(), cap)]),
            Some(Arc::clone(&storage)),
        ));
        let provider = Arc::new(provider);
        let gate = SelectiveValidationGate::new(
            provider.clone(),
            ledger,
            Arc::clone(&storage),
            config,
        );
        Fixture {
            storage,
            provider,
            gate,
        }
    }

    /// Persist an idea with a first score version, as the pipeline would.
    async fn seed_idea(storage: &Storage, title: &str) -> IdeaCandidate {
        let mut idea = scored_idea(&["p1", "p2"], &["ImageNet"], ComputeLevel::Low, 7);
        idea.title = title.into();
        let now = Utc::now();
        storage
            .insert_batch(&BatchRecord {
                id: idea.batch_id,
                domain: "ml".into(),
                paper_ids: vec!["p1".into(), "p2".into()],
                status: BatchStatus::Running,
                stage: None,
                error: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        storage.insert_idea(&idea).await.unwrap();
        let score = score_idea(&idea, &[], &ScoringConfig::default(), &ScoringContext::now());
        storage.append_score_version(&score).await.unwrap();
        idea
    }

    #[tokio::test]
    async fn novel_verdict_chains_summary_and_reranks() {
        let f = fixture(FakeNovelty::new(Verdict::Novel), 10.0).await;
        let idea = seed_idea(&f.storage, "Sparse sensor pretraining").await;

        let report = f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        assert_eq!(report.validated(), 1);
        assert!(matches!(
            report.outcomes[0].1,
            ValidationOutcome::Validated { verdict: Verdict::Novel, summarized: true, from_cache: false, score_version: 2, .. }
        ));
        assert_eq!(f.provider.checks.load(Ordering::SeqCst), 1);
        assert_eq!(f.provider.summaries.load(Ordering::SeqCst), 1);

        let stored = f.storage.get_idea(idea.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IdeaStatus::ValidatedNovel);
        let history = f.storage.score_history(idea.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].components.novelty, Some(1.0));
        let records = f.storage.validation_records(idea.id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].summary.as_deref(), Some("Two adjacent lines of work exist."));

        let snap = f.gate.ledger.snapshot("novelty").await.unwrap();
        assert!((snap.spent - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn warm_cache_makes_zero_external_calls() {
        let f = fixture(FakeNovelty::new(Verdict::Partial), 10.0).await;
        let idea = seed_idea(&f.storage, "Sparse sensor pretraining").await;

        f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        let records_before = f.storage.validation_records(idea.id).await.unwrap().len();
        let versions_before = f.storage.score_history(idea.id).await.unwrap().len();

        let report = f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        assert_eq!(report.unchanged(), 1);
        assert_eq!(f.provider.checks.load(Ordering::SeqCst), 1);
        assert_eq!(f.provider.summaries.load(Ordering::SeqCst), 1);
        assert_eq!(f.storage.validation_records(idea.id).await.unwrap().len(), records_before);
        assert_eq!(f.storage.score_history(idea.id).await.unwrap().len(), versions_before);
    }

    #[tokio::test]
    async fn exists_verdict_is_never_summarized() {
        let f = fixture(FakeNovelty::new(Verdict::Exists), 10.0).await;
        let idea = seed_idea(&f.storage, "Already done").await;
        let prior = f.storage.latest_score(idea.id).await.unwrap().unwrap();

        let report = f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        assert_eq!(f.provider.summaries.load(Ordering::SeqCst), 0);
        let ValidationOutcome::Validated { composite, summarized, .. } = report.outcomes[0].1 else {
            panic!("expected a verdict");
        };
        assert!(!summarized);
        assert!((composite - (0.7 * prior.composite + 0.3 * 0.2)).abs() < 1e-9);

        let stored = f.storage.get_idea(idea.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IdeaStatus::RejectedDuplicate);
    }

    #[tokio::test]
    async fn exhausted_budget_defers_without_calling() {
        let f = fixture(FakeNovelty::new(Verdict::Novel), 0.0).await;
        let idea = seed_idea(&f.storage, "No money left").await;

        let report = f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        assert_eq!(report.deferred(), 1);
        assert_eq!(f.provider.checks.load(Ordering::SeqCst), 0);
        let stored = f.storage.get_idea(idea.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IdeaStatus::ValidationDeferred);
        assert_eq!(f.storage.score_history(idea.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deferred_summary_keeps_verdict() {
        let f = fixture(FakeNovelty::new(Verdict::Novel), 0.05).await;
        let idea = seed_idea(&f.storage, "Cheap check only").await;

        let report = f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        assert!(matches!(
            report.outcomes[0].1,
            ValidationOutcome::Validated { summarized: false, .. }
        ));
        assert_eq!(f.provider.summaries.load(Ordering::SeqCst), 0);
        let stored = f.storage.get_idea(idea.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IdeaStatus::ValidatedNovel);
    }

    #[tokio::test]
    async fn only_top_k_are_considered() {
        let f = fixture(FakeNovelty::new(Verdict::Exists), 10.0).await;
        let mut ideas = Vec::new();
        for title in ["First", "Second", "Third"] {
            ideas.push(seed_idea(&f.storage, title).await);
        }

        let report = f.gate.validate(&ideas, 2, &CancelToken::new()).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].0, ideas[0].id);
        assert_eq!(f.provider.checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn provider_failure_restores_candidate_status() {
        let mut provider = FakeNovelty::new(Verdict::Novel);
        provider.fail = true;
        let f = fixture(provider, 10.0).await;
        let idea = seed_idea(&f.storage, "Unlucky").await;

        let report = f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        assert_eq!(report.failed(), 1);
        let stored = f.storage.get_idea(idea.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IdeaStatus::Candidate);

        let snap = f.gate.ledger.snapshot("novelty").await.unwrap();
        assert_eq!(snap.spent, 0.0);
        assert_eq!(snap.reserved, 0.0);
    }

    fn expiring_config() -> ValidationConfig {
        ValidationConfig {
            cache_ttl: chrono::Duration::zero(),
            ..test_validation_config()
        }
    }

    #[tokio::test]
    async fn expired_cache_entry_triggers_fresh_call() {
        let f = fixture_with(FakeNovelty::new(Verdict::Exists), 10.0, expiring_config()).await;
        let idea = seed_idea(&f.storage, "Short-lived cache").await;

        f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        let report = f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();

        assert!(matches!(
            report.outcomes[0].1,
            ValidationOutcome::Validated { from_cache: false, score_version: 3, .. }
        ));
        assert_eq!(f.provider.checks.load(Ordering::SeqCst), 2);
        let snap = f.gate.ledger.snapshot("novelty").await.unwrap();
        assert!((snap.spent - 0.10).abs() < 1e-9);
    }

    #[tokio::test]
    async fn revalidation_blends_novelty_once() {
        let f = fixture_with(FakeNovelty::new(Verdict::Exists), 10.0, expiring_config()).await;
        let idea = seed_idea(&f.storage, "Blended twice").await;
        let base = f.storage.latest_score(idea.id).await.unwrap().unwrap();

        f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();

        let history = f.storage.score_history(idea.id).await.unwrap();
        assert_eq!(history.len(), 3);
        let single_blend = 0.7 * base.composite + 0.3 * 0.2;
        assert!((history[1].composite - single_blend).abs() < 1e-9);
        assert!((history[2].composite - single_blend).abs() < 1e-9);
    }

    #[tokio::test]
    async fn warm_cache_hit_extends_expiry() {
        let f = fixture(FakeNovelty::new(Verdict::Exists), 10.0).await;
        let idea = seed_idea(&f.storage, "Kept warm").await;
        let key = cache_key(&idea);

        f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        let before = f
            .storage
            .get_cached_validation(&key, ValidationTask::NoveltyCheck, Utc::now())
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        assert_eq!(report.unchanged(), 1);

        let after = f
            .storage
            .get_cached_validation(&key, ValidationTask::NoveltyCheck, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(after.expires_at > before.expires_at);
        assert_eq!(after.payload_json, before.payload_json);
        assert_eq!(f.provider.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_checks_stay_within_limit() {
        let mut provider = FakeNovelty::new(Verdict::Exists);
        provider.delay = Duration::from_millis(30);
        let f = fixture(provider, 10.0).await;
        let mut ideas = Vec::new();
        for i in 0..6 {
            ideas.push(seed_idea(&f.storage, &format!("Parallel idea {i}")).await);
        }

        let report = f.gate.validate(&ideas, 6, &CancelToken::new()).await.unwrap();
        assert_eq!(report.validated(), 6);
        assert_eq!(f.provider.checks.load(Ordering::SeqCst), 6);
        let peak = f.provider.max_in_flight.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak in-flight checks was {peak}");
    }

    #[tokio::test]
    async fn cancelled_summary_does_not_duplicate_verdict_record() {
        let provider = FakeNovelty::new(Verdict::Novel);
        provider.stall_summary.store(true, Ordering::SeqCst);
        let f = fixture(provider, 10.0).await;
        let idea = seed_idea(&f.storage, "Interrupted summary").await;

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let provider = Arc::clone(&f.provider);
        tokio::spawn(async move {
            while provider.summaries.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            canceller.cancel();
        });
        let err = f.gate.validate(&[idea.clone()], 10, &cancel).await.unwrap_err();
        assert!(matches!(err, IdeaForgeError::Cancelled));
        let stored = f.storage.get_idea(idea.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IdeaStatus::Candidate);

        f.provider.stall_summary.store(false, Ordering::SeqCst);
        let report = f.gate.validate(&[idea.clone()], 10, &CancelToken::new()).await.unwrap();
        assert!(matches!(
            report.outcomes[0].1,
            ValidationOutcome::Validated { from_cache: true, summarized: true, .. }
        ));
        assert_eq!(f.provider.checks.load(Ordering::SeqCst), 1);

        let records = f.storage.validation_records(idea.id).await.unwrap();
        let checks = records
            .iter()
            .filter(|r| r.task == ValidationTask::NoveltyCheck)
            .count();
        assert_eq!(checks, 1);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn cache_key_ignores_case_and_spacing() {
        let mut a = scored_idea(&["p1"], &[], ComputeLevel::Low, 5);
        let mut b = a.clone();
        a.title = "Sparse  Sensor Pretraining".into();
        b.title = "sparse sensor pretraining ".into();
        assert_eq!(cache_key(&a), cache_key(&b));
        b.description.push_str(" for drones");
        assert_ne!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn query_is_deterministic() {
        let idea = scored_idea(&["p1"], &[], ComputeLevel::Low, 5);
        assert_eq!(build_query(&idea), build_query(&idea.clone()));
        assert!(build_query(&idea).contains(&idea.title));
    }
}
