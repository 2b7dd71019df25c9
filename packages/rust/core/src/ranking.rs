//! Read API for downstream consumers.
//!
//! Readers go straight to storage and never wait on pipeline stages, so the
//! scores they see may predate validation.

use std::sync::Arc;

use serde::Serialize;

use ideaforge_shared::{
    BatchId, BatchStage, CompressedBatch, IdeaCandidate, IdeaId, ProvenanceEntry, Result,
    ScoreBreakdown, ValidationRecord,
};
use ideaforge_storage::{IdeaQuery, RankedIdea, Storage};

/// Everything known about one idea.
#[derive(Debug, Clone, Serialize)]
pub struct IdeaDetail {
    pub idea: IdeaCandidate,
    /// Set when the requested id was a collapsed duplicate of this idea.
    pub resolved_from_alias: Option<IdeaId>,
    /// Score versions, oldest first.
    pub scores: Vec<ScoreBreakdown>,
    pub validations: Vec<ValidationRecord>,
    pub aliases: Vec<IdeaId>,
    /// Token to paper id bindings for the idea's sources, in citation order.
    pub provenance: Vec<ProvenanceEntry>,
}

impl IdeaDetail {
    pub fn latest_score(&self) -> Option<&ScoreBreakdown> {
        self.scores.last()
    }
}

pub struct RankingView {
    storage: Arc<Storage>,
    publish_threshold: f64,
}

impl RankingView {
    pub fn new(storage: Arc<Storage>, publish_threshold: f64) -> Self {
        Self {
            storage,
            publish_threshold,
        }
    }

    /// Ideas in rank order, filtered by status, batch and minimum score.
    pub async fn list(&self, query: &IdeaQuery) -> Result<Vec<RankedIdea>> {
        self.storage.list_ideas(query).await
    }

    /// The best `k` ideas at or above the publish threshold.
    pub async fn top_k(&self, k: u32, batch_id: Option<BatchId>) -> Result<Vec<RankedIdea>> {
        self.storage
            .list_ideas(&IdeaQuery {
                batch_id,
                min_score: Some(self.publish_threshold),
                limit: Some(k),
                ..IdeaQuery::default()
            })
            .await
    }

    /// Full breakdown and provenance for one idea. Alias ids resolve to the
    /// idea that absorbed them.
    pub async fn detail(&self, id: IdeaId) -> Result<Option<IdeaDetail>> {
        let (idea, resolved_from_alias) = match self.storage.get_idea(id).await? {
            Some(idea) => (idea, None),
            None => match self.storage.resolve_alias(id).await? {
                Some(target) => match self.storage.get_idea(target).await? {
                    Some(idea) => (idea, Some(id)),
                    None => return Ok(None),
                },
                None => return Ok(None),
            },
        };

        let scores = self.storage.score_history(idea.id).await?;
        let validations = self.storage.validation_records(idea.id).await?;
        let provenance = self.provenance(&idea).await?;

        Ok(Some(IdeaDetail {
            aliases: idea.aliases.clone(),
            idea,
            resolved_from_alias,
            scores,
            validations,
            provenance,
        }))
    }

    /// Bindings from the batch's provenance index, falling back to the
    /// tokens recorded on the idea when the checkpoint is unavailable.
    async fn provenance(&self, idea: &IdeaCandidate) -> Result<Vec<ProvenanceEntry>> {
        let index = self
            .storage
            .load_checkpoint(idea.batch_id, BatchStage::Compressed)
            .await?
            .and_then(|json| serde_json::from_str::<CompressedBatch>(&json).ok())
            .map(|batch| batch.index);

        let entries = match index {
            Some(index) => idea
                .source_paper_ids
                .iter()
                .filter_map(|paper_id| {
                    index
                        .entries
                        .iter()
                        .find(|e| &e.paper_id == paper_id)
                        .cloned()
                })
                .collect(),
            None => idea
                .source_tokens
                .iter()
                .zip(&idea.source_paper_ids)
                .map(|(token, paper_id)| ProvenanceEntry {
                    token: token.clone(),
                    paper_id: paper_id.clone(),
                })
                .collect(),
        };
        Ok(entries)
    }
}
