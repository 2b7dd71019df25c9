//! Batch pipeline: compress → synthesize → filter → score → validate.
//!
//! Each stage persists a checkpoint before the next one starts, so a failed
//! or cancelled batch resumes from its last completed stage. Batches run on a
//! bounded worker pool and share the storage handle and budget ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use ideaforge_compressor::{CompressOptions, compress_batch};
use ideaforge_providers::{GenerationProvider, LiteratureSearch, NoveltyProvider, PaperRepository};
use ideaforge_shared::{
    AppConfig, BatchId, BatchRecord, BatchStage, BatchStatus, CompressedBatch, IdeaCandidate,
    IdeaForgeError, Result, ScoringConfig,
};
use ideaforge_storage::{IdeaQuery, Storage};

use crate::cancel::CancelToken;
use crate::filter::PostSynthesisFilter;
use crate::ledger::BudgetLedger;
use crate::scoring::{ScoredIdea, ScoringContext, rank, score_idea};
use crate::synthesis::{
    MAX_EXISTING_TITLES, SynthesisConfig, SynthesisEngine, SynthesisInput, SynthesisOutcome,
};
use crate::validation::{GateReport, SelectiveValidationGate, ValidationConfig};

/// Orchestration settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Default domain for batches created without one.
    pub domain: String,
    /// Batches processed concurrently by [`Pipeline::run_batches`].
    pub workers: usize,
    pub compress: CompressOptions,
    pub scoring: ScoringConfig,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            domain: config.pipeline.domain.clone(),
            workers: config.pipeline.workers.max(1) as usize,
            compress: CompressOptions::from(&config.compression),
            scoring: config.scoring.clone(),
        }
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a batch enters a stage.
    fn stage_started(&self, batch_id: BatchId, stage: BatchStage);
    /// Called after a stage's checkpoint is written.
    fn stage_completed(&self, batch_id: BatchId, stage: BatchStage, detail: &str);
    /// Called once per batch with its final report.
    fn batch_finished(&self, report: &BatchReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _batch_id: BatchId, _stage: BatchStage) {}
    fn stage_completed(&self, _batch_id: BatchId, _stage: BatchStage, _detail: &str) {}
    fn batch_finished(&self, _report: &BatchReport) {}
}

/// Work item for the pipeline.
#[derive(Debug, Clone)]
pub enum BatchJob {
    /// Start a new batch over these paper ids.
    New {
        paper_ids: Vec<String>,
        domain: Option<String>,
    },
    /// Continue an existing batch from its last checkpoint.
    Resume(BatchId),
}

/// Outcome of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    /// Last completed stage.
    pub stage: Option<BatchStage>,
    pub ideas: usize,
    pub dropped: usize,
    pub collapsed: usize,
    pub flagged: usize,
    pub validated: usize,
    pub deferred: usize,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl BatchReport {
    fn new(batch: &BatchRecord) -> Self {
        Self {
            batch_id: batch.id,
            status: batch.status,
            stage: batch.stage,
            ideas: 0,
            dropped: 0,
            collapsed: 0,
            flagged: 0,
            validated: 0,
            deferred: 0,
            error: batch.error.clone(),
            elapsed: Duration::ZERO,
        }
    }
}

/// A batch running on the worker pool.
pub struct BatchHandle {
    pub batch_id: BatchId,
    /// Cancels this batch only.
    pub cancel: CancelToken,
    pub handle: JoinHandle<Result<BatchReport>>,
}

pub struct Pipeline {
    storage: Arc<Storage>,
    papers: Arc<dyn PaperRepository>,
    synthesis: SynthesisEngine,
    filter: PostSynthesisFilter,
    gate: SelectiveValidationGate,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        storage: Arc<Storage>,
        papers: Arc<dyn PaperRepository>,
        synthesis: SynthesisEngine,
        filter: PostSynthesisFilter,
        gate: SelectiveValidationGate,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            storage,
            papers,
            synthesis,
            filter,
            gate,
            settings,
        }
    }

    /// Wire every stage from config.
    pub fn from_config(
        config: &AppConfig,
        storage: Arc<Storage>,
        ledger: Arc<BudgetLedger>,
        papers: Arc<dyn PaperRepository>,
        generator: Arc<dyn GenerationProvider>,
        novelty: Arc<dyn NoveltyProvider>,
        literature: Option<Arc<dyn LiteratureSearch>>,
    ) -> Self {
        let synthesis = SynthesisEngine::new(
            generator,
            Arc::clone(&ledger),
            SynthesisConfig::from(&config.generator),
        );
        let filter = PostSynthesisFilter::from_config(config, literature);
        let gate = SelectiveValidationGate::new(
            novelty,
            ledger,
            Arc::clone(&storage),
            ValidationConfig::from(config),
        );
        Self::new(
            storage,
            papers,
            synthesis,
            filter,
            gate,
            PipelineSettings::from(config),
        )
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Persist a new batch record, or load an existing one for resumption.
    pub async fn prepare(&self, job: BatchJob) -> Result<BatchRecord> {
        match job {
            BatchJob::New { paper_ids, domain } => {
                if paper_ids.is_empty() {
                    return Err(IdeaForgeError::validation("a batch needs at least one paper"));
                }
                let now = Utc::now();
                let batch = BatchRecord {
                    id: BatchId::new(),
                    domain: domain.unwrap_or_else(|| self.settings.domain.clone()),
                    paper_ids,
                    status: BatchStatus::Pending,
                    stage: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                };
                self.storage.insert_batch(&batch).await?;
                info!(batch = %batch.id, papers = batch.paper_ids.len(), "batch created");
                Ok(batch)
            }
            BatchJob::Resume(id) => self
                .storage
                .get_batch(id)
                .await?
                .ok_or_else(|| IdeaForgeError::validation(format!("batch not found: {id}"))),
        }
    }

    /// Run one job to completion on the current task.
    pub async fn run_batch(
        &self,
        job: BatchJob,
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        let batch = self.prepare(job).await?;
        self.run_prepared(batch, progress, cancel).await
    }

    /// Resume a batch from its last completed stage.
    pub async fn resume_batch(
        &self,
        batch_id: BatchId,
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        self.run_batch(BatchJob::Resume(batch_id), progress, cancel)
            .await
    }

    /// Submit jobs to the worker pool. Each batch gets its own cancel token;
    /// cancelling `cancel` stops all of them.
    pub async fn run_batches(
        self: &Arc<Self>,
        jobs: Vec<BatchJob>,
        progress: Arc<dyn ProgressReporter>,
        cancel: &CancelToken,
    ) -> Result<Vec<BatchHandle>> {
        let workers = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let batch = self.prepare(job).await?;
            let batch_id = batch.id;
            let token = CancelToken::new();

            let pipeline = Arc::clone(self);
            let progress = Arc::clone(&progress);
            let workers = Arc::clone(&workers);
            let parent = cancel.clone();
            let child = token.clone();

            let handle = tokio::spawn(async move {
                let watcher = {
                    let child = child.clone();
                    tokio::spawn(async move {
                        parent.cancelled().await;
                        child.cancel();
                    })
                };
                let result = match workers.acquire_owned().await {
                    Ok(_permit) => {
                        pipeline
                            .run_prepared(batch, progress.as_ref(), &child)
                            .await
                    }
                    Err(_) => Err(IdeaForgeError::Cancelled),
                };
                watcher.abort();
                result
            });

            handles.push(BatchHandle {
                batch_id,
                cancel: token,
                handle,
            });
        }
        Ok(handles)
    }

    /// Run the validation gate again over a finished batch, e.g. to pick up
    /// ideas deferred by an exhausted budget.
    #[instrument(skip_all, fields(batch = %batch_id))]
    pub async fn revalidate(
        &self,
        batch_id: BatchId,
        top_k: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<GateReport> {
        let ideas = self.storage.list_batch_ideas(batch_id).await?;
        let ranked = self.ranked(ideas).await?;
        let top_k = top_k.unwrap_or(self.gate.config().top_k);
        self.gate.validate(&ranked, top_k, cancel).await
    }

    #[instrument(skip_all, fields(batch = %batch.id))]
    async fn run_prepared(
        &self,
        batch: BatchRecord,
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        let start = Instant::now();
        let mut report = BatchReport::new(&batch);

        if batch.status == BatchStatus::Completed {
            info!("batch already completed, nothing to resume");
            report.elapsed = start.elapsed();
            progress.batch_finished(&report);
            return Ok(report);
        }

        self.storage
            .update_batch_status(batch.id, BatchStatus::Running, None)
            .await?;

        let (status, error) = match self.execute(&batch, progress, cancel, &mut report).await {
            Ok(()) => (BatchStatus::Completed, None),
            Err(IdeaForgeError::Cancelled) => {
                warn!(stage = ?report.stage, "batch cancelled");
                (BatchStatus::Cancelled, Some("cancelled".to_string()))
            }
            // Anything that stops the run between COMPRESSED and SYNTHESIZED
            // is a synthesis failure.
            Err(e) if report.stage == Some(BatchStage::Compressed) => {
                warn!(error = %e, "synthesis failed");
                (BatchStatus::SynthesisFailed, Some(e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, stage = ?report.stage, "batch failed");
                (BatchStatus::Failed, Some(e.to_string()))
            }
        };

        self.storage
            .update_batch_status(batch.id, status, error.as_deref())
            .await?;

        report.status = status;
        report.error = error;
        report.elapsed = start.elapsed();
        info!(
            status = status.as_str(),
            ideas = report.ideas,
            validated = report.validated,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch finished"
        );
        progress.batch_finished(&report);
        Ok(report)
    }

    async fn execute(
        &self,
        batch: &BatchRecord,
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
        report: &mut BatchReport,
    ) -> Result<()> {
        let done = batch.stage;
        if let Some(stage) = done {
            info!(from = stage.as_str(), "resuming batch");
        }

        // --- Stage 1: Compression ---
        cancel.check()?;
        let compressed = if done >= Some(BatchStage::Compressed) {
            self.load_stage::<CompressedBatch>(batch.id, BatchStage::Compressed)
                .await?
        } else {
            progress.stage_started(batch.id, BatchStage::Compressed);
            let papers = self.papers.get_papers(&batch.paper_ids).await?;
            if papers.len() < batch.paper_ids.len() {
                warn!(
                    requested = batch.paper_ids.len(),
                    found = papers.len(),
                    "some papers were not found in the repository"
                );
            }
            let compressed = compress_batch(batch.id, &papers, &self.settings.compress)?;
            self.save_stage(batch.id, BatchStage::Compressed, &compressed)
                .await?;
            progress.stage_completed(
                batch.id,
                BatchStage::Compressed,
                &format!(
                    "{} papers, {} chars, {} truncated",
                    compressed.index.len(),
                    compressed.text.chars().count(),
                    compressed.truncations.len()
                ),
            );
            compressed
        };
        report.stage = Some(BatchStage::Compressed);

        // --- Stage 2: Synthesis ---
        cancel.check()?;
        let synthesis = if done >= Some(BatchStage::Synthesized) {
            self.load_stage::<SynthesisOutcome>(batch.id, BatchStage::Synthesized)
                .await?
        } else {
            progress.stage_started(batch.id, BatchStage::Synthesized);
            let existing_titles: Vec<String> = self
                .storage
                .list_ideas(&IdeaQuery {
                    limit: Some(MAX_EXISTING_TITLES as u32),
                    ..IdeaQuery::default()
                })
                .await?
                .into_iter()
                .map(|r| r.idea.title)
                .collect();
            let input = SynthesisInput {
                batch: &compressed,
                domain: &batch.domain,
                existing_titles: &existing_titles,
            };
            let outcome = self.synthesis.synthesize(&input, cancel).await?;
            self.save_stage(batch.id, BatchStage::Synthesized, &outcome)
                .await?;
            progress.stage_completed(
                batch.id,
                BatchStage::Synthesized,
                &format!(
                    "{} ideas, {} dropped, {} calls",
                    outcome.ideas.len(),
                    outcome.dropped.total(),
                    outcome.calls
                ),
            );
            outcome
        };
        report.dropped = synthesis.dropped.total();
        report.stage = Some(BatchStage::Synthesized);

        // --- Stage 3: Filtering ---
        cancel.check()?;
        let ideas = if done >= Some(BatchStage::Filtered) {
            self.storage.list_batch_ideas(batch.id).await?
        } else {
            progress.stage_started(batch.id, BatchStage::Filtered);
            let outcome = self
                .filter
                .apply(batch.id, &synthesis.ideas, &compressed.index, cancel)
                .await?;
            self.storage
                .store_filtered_ideas(batch.id, &outcome.ideas)
                .await?;
            report.collapsed = outcome.collapsed;
            report.flagged = outcome.flagged;
            progress.stage_completed(
                batch.id,
                BatchStage::Filtered,
                &format!(
                    "{} kept, {} collapsed, {} flagged",
                    outcome.ideas.len(),
                    outcome.collapsed,
                    outcome.flagged
                ),
            );
            outcome.ideas
        };
        report.ideas = ideas.len();
        report.stage = Some(BatchStage::Filtered);

        // --- Stage 4: Scoring ---
        cancel.check()?;
        if done < Some(BatchStage::Scored) {
            progress.stage_started(batch.id, BatchStage::Scored);
            let papers = self.papers.get_papers(&batch.paper_ids).await?;
            let ctx = ScoringContext::now();
            let breakdowns: Vec<_> = ideas
                .iter()
                .map(|idea| score_idea(idea, &papers, &self.settings.scoring, &ctx))
                .collect();
            let stored = self
                .storage
                .record_batch_scores(batch.id, &breakdowns)
                .await?;
            let above = stored
                .iter()
                .filter(|s| s.composite >= self.settings.scoring.publish_threshold)
                .count();
            progress.stage_completed(
                batch.id,
                BatchStage::Scored,
                &format!("{} scored, {above} above threshold", stored.len()),
            );
        }
        report.stage = Some(BatchStage::Scored);

        // --- Stage 5: Validation ---
        cancel.check()?;
        if done < Some(BatchStage::Validated) {
            progress.stage_started(batch.id, BatchStage::Validated);
            let ranked = self.ranked(ideas).await?;
            let gate = self
                .gate
                .validate(&ranked, self.gate.config().top_k, cancel)
                .await?;
            report.validated = gate.validated();
            report.deferred = gate.deferred();
            let detail = format!(
                "{} validated, {} unchanged, {} deferred, {} failed",
                gate.validated(),
                gate.unchanged(),
                gate.deferred(),
                gate.failed()
            );
            self.storage
                .save_checkpoint(batch.id, BatchStage::Validated, Some(&detail))
                .await?;
            progress.stage_completed(batch.id, BatchStage::Validated, &detail);
        }
        report.stage = Some(BatchStage::Validated);

        Ok(())
    }

    /// Order ideas by their latest score. Unscored ideas are skipped.
    async fn ranked(&self, ideas: Vec<IdeaCandidate>) -> Result<Vec<IdeaCandidate>> {
        let mut scored = Vec::with_capacity(ideas.len());
        for idea in ideas {
            match self.storage.latest_score(idea.id).await? {
                Some(score) => scored.push(ScoredIdea { idea, score }),
                None => debug!(idea = %idea.id, "skipping unscored idea"),
            }
        }
        rank(&mut scored);
        Ok(scored.into_iter().map(|s| s.idea).collect())
    }

    async fn save_stage<T: Serialize>(
        &self,
        batch_id: BatchId,
        stage: BatchStage,
        payload: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(payload).map_err(|e| {
            IdeaForgeError::Storage(format!("encode {} checkpoint: {e}", stage.as_str()))
        })?;
        self.storage
            .save_checkpoint(batch_id, stage, Some(&json))
            .await
    }

    async fn load_stage<T: serde::de::DeserializeOwned>(
        &self,
        batch_id: BatchId,
        stage: BatchStage,
    ) -> Result<T> {
        let json = self
            .storage
            .load_checkpoint(batch_id, stage)
            .await?
            .ok_or_else(|| {
                IdeaForgeError::Storage(format!(
                    "batch {batch_id} is past {} but its checkpoint is missing",
                    stage.as_str()
                ))
            })?;
        serde_json::from_str(&json).map_err(|e| {
            IdeaForgeError::Storage(format!("decode {} checkpoint: {e}", stage.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use ideaforge_providers::{Generation, GenerationRequest, JsonPaperRepository};
    use ideaforge_shared::{IdeaStatus, Paper, Quartile, Verdict};
    use uuid::Uuid;

    use crate::synthesis::tests::{ScriptedGenerator, idea_json, test_config};
    use crate::validation::tests::{FakeNovelty, test_validation_config};

    #[derive(Default)]
    struct RecordingProgress {
        started: Mutex<Vec<BatchStage>>,
        finished: Mutex<Vec<BatchStatus>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn stage_started(&self, _batch_id: BatchId, stage: BatchStage) {
            self.started.lock().unwrap().push(stage);
        }
        fn stage_completed(&self, _batch_id: BatchId, _stage: BatchStage, _detail: &str) {}
        fn batch_finished(&self, report: &BatchReport) {
            self.finished.lock().unwrap().push(report.status);
        }
    }

    /// Generator that never answers until cancelled.
    struct StalledGenerator;

    #[async_trait]
    impl GenerationProvider for StalledGenerator {
        fn name(&self) -> &str {
            "openrouter"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(IdeaForgeError::transient("openrouter", "stalled"))
        }
    }

    fn papers() -> Vec<Paper> {
        (1..=3)
            .map(|i| Paper {
                id: format!("doi:10.1/{i}"),
                title: format!("Study {i} of sparse sensor learning"),
                abstract_text: format!(
                    "We propose method {i} for sensor fusion. Results improve accuracy."
                ),
                venue: Some("NeurIPS".into()),
                quartile: Some(Quartile::Q1),
                year: Some(2024),
                citation_count: 40 * i,
                limitations: Some("Only evaluated on synthetic data.".into()),
                excerpts: vec![],
            })
            .collect()
    }

    fn good_response() -> String {
        serde_json::json!([
            idea_json("Graph retrieval", &["P1", "P2"]),
            idea_json("Federated pretraining", &["P2", "P3"]),
        ])
        .to_string()
    }

    async fn pipeline(generator: Arc<dyn GenerationProvider>) -> (Arc<Pipeline>, Arc<FakeNovelty>) {
        let path = std::env::temp_dir().join(format!("if_pipe_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.expect("open test db"));
        let ledger = Arc::new(BudgetLedger::new(
            HashMap::from([("openrouter".to_string(), 50.0), ("novelty".to_string(), 20.0)]),
            Some(Arc::clone(&storage)),
        ));
        let novelty = Arc::new(FakeNovelty::new(Verdict::Novel));
        let synthesis = SynthesisEngine::new(generator, Arc::clone(&ledger), test_config());
        let filter = PostSynthesisFilter::new(0.6, 3, None, Duration::from_secs(1));
        let gate = SelectiveValidationGate::new(
            novelty.clone(),
            ledger,
            Arc::clone(&storage),
            test_validation_config(),
        );
        let settings = PipelineSettings::from(&AppConfig::default());
        let pipeline = Pipeline::new(
            storage,
            Arc::new(JsonPaperRepository::from_papers(papers())),
            synthesis,
            filter,
            gate,
            settings,
        );
        (Arc::new(pipeline), novelty)
    }

    fn new_job() -> BatchJob {
        BatchJob::New {
            paper_ids: papers().into_iter().map(|p| p.id).collect(),
            domain: Some("sensing".into()),
        }
    }

    #[tokio::test]
    async fn runs_all_stages_and_persists_scores() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(good_response())]));
        let (pipeline, novelty) = pipeline(generator).await;
        let progress = RecordingProgress::default();

        let report = pipeline
            .run_batch(new_job(), &progress, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.stage, Some(BatchStage::Validated));
        assert_eq!(report.ideas, 2);
        assert_eq!(report.validated, 2);
        assert_eq!(
            *progress.started.lock().unwrap(),
            vec![
                BatchStage::Compressed,
                BatchStage::Synthesized,
                BatchStage::Filtered,
                BatchStage::Scored,
                BatchStage::Validated,
            ]
        );
        assert_eq!(novelty.checks.load(Ordering::SeqCst), 2);

        let storage = pipeline.storage();
        let batch = storage.get_batch(report.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.stage, Some(BatchStage::Validated));

        for idea in storage.list_batch_ideas(report.batch_id).await.unwrap() {
            assert_eq!(idea.status, IdeaStatus::ValidatedNovel);
            let history = storage.score_history(idea.id).await.unwrap();
            assert_eq!(history.len(), 2);
            assert!(history[1].components.novelty.is_some());
        }
    }

    #[tokio::test]
    async fn exhausted_retries_fail_synthesis_and_resume_skips_compression() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(IdeaForgeError::transient("openrouter", "HTTP 503")),
            Err(IdeaForgeError::transient("openrouter", "HTTP 503")),
            Err(IdeaForgeError::transient("openrouter", "timeout")),
            Ok(good_response()),
        ]));
        let (pipeline, _) = pipeline(generator.clone()).await;
        let first = RecordingProgress::default();

        let report = pipeline
            .run_batch(new_job(), &first, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, BatchStatus::SynthesisFailed);
        assert_eq!(report.stage, Some(BatchStage::Compressed));
        assert!(report.error.is_some());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);

        let storage = pipeline.storage();
        let batch = storage.get_batch(report.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::SynthesisFailed);
        assert_eq!(batch.stage, Some(BatchStage::Compressed));
        let checkpoint = storage
            .load_checkpoint(report.batch_id, BatchStage::Compressed)
            .await
            .unwrap()
            .expect("compressed checkpoint kept");
        assert!(storage.list_batch_ideas(report.batch_id).await.unwrap().is_empty());

        let second = RecordingProgress::default();
        let resumed = pipeline
            .resume_batch(report.batch_id, &second, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(resumed.status, BatchStatus::Completed);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 4);
        assert!(!second.started.lock().unwrap().contains(&BatchStage::Compressed));
        assert_eq!(
            storage
                .load_checkpoint(report.batch_id, BatchStage::Compressed)
                .await
                .unwrap(),
            Some(checkpoint)
        );
        assert_eq!(storage.list_batch_ideas(report.batch_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn completed_batch_is_not_rerun() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(good_response())]));
        let (pipeline, _) = pipeline(generator.clone()).await;
        let report = pipeline
            .run_batch(new_job(), &SilentProgress, &CancelToken::new())
            .await
            .unwrap();

        let again = pipeline
            .resume_batch(report.batch_id, &SilentProgress, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(again.status, BatchStatus::Completed);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_keeps_checkpoint_and_marks_batch() {
        let (pipeline, _) = pipeline(Arc::new(StalledGenerator)).await;
        let progress: Arc<dyn ProgressReporter> = Arc::new(SilentProgress);
        let cancel = CancelToken::new();

        let handles = pipeline
            .run_batches(vec![new_job()], progress, &cancel)
            .await
            .unwrap();
        let mut handles = handles;
        let handle = handles.remove(0);

        for _ in 0..200 {
            let batch = pipeline.storage().get_batch(handle.batch_id).await.unwrap();
            if batch.and_then(|b| b.stage) == Some(BatchStage::Compressed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();

        let report = handle.handle.await.unwrap().unwrap();
        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(report.stage, Some(BatchStage::Compressed));

        let batch = pipeline
            .storage()
            .get_batch(handle.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Cancelled);
        assert_eq!(batch.stage, Some(BatchStage::Compressed));
    }

    #[tokio::test]
    async fn worker_pool_runs_independent_batches() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok(good_response()),
            Ok(good_response()),
        ]));
        let (pipeline, _) = pipeline(generator).await;
        let progress = Arc::new(RecordingProgress::default());

        let handles = pipeline
            .run_batches(
                vec![new_job(), new_job()],
                progress.clone(),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(handles.len(), 2);
        assert_ne!(handles[0].batch_id, handles[1].batch_id);

        for handle in handles {
            let report = handle.handle.await.unwrap().unwrap();
            assert_eq!(report.status, BatchStatus::Completed);
        }
        assert_eq!(progress.finished.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_batch_cannot_resume() {
        let (pipeline, _) = pipeline(Arc::new(StalledGenerator)).await;
        let err = pipeline
            .resume_batch(BatchId::new(), &SilentProgress, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IdeaForgeError::Validation { .. }));
    }
}
