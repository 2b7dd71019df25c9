//! Post-synthesis cleanup: provenance binding, near-duplicate collapse, and
//! the advisory pre-existing check.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use ideaforge_compressor::cluster::jaccard;
use ideaforge_compressor::keywords::is_stopword;
use ideaforge_providers::LiteratureSearch;
use ideaforge_shared::{
    AppConfig, BatchId, IdeaCandidate, IdeaForgeError, IdeaId, IdeaStatus, ProvenanceIndex, Result,
};

use crate::cancel::CancelToken;
use crate::synthesis::DraftIdea;

/// Result of filtering one batch.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// Surviving candidates in generation order.
    pub ideas: Vec<IdeaCandidate>,
    /// Ideas folded into another as an alias.
    pub collapsed: usize,
    /// Ideas carrying the advisory pre-existing flag.
    pub flagged: usize,
    /// Ideas dropped because no source token resolved.
    pub unresolved: usize,
}

pub struct PostSynthesisFilter {
    dedup_threshold: f64,
    match_threshold: usize,
    literature: Option<Arc<dyn LiteratureSearch>>,
    lookup_timeout: Duration,
}

impl PostSynthesisFilter {
    pub fn new(
        dedup_threshold: f64,
        match_threshold: usize,
        literature: Option<Arc<dyn LiteratureSearch>>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            dedup_threshold,
            match_threshold,
            literature,
            lookup_timeout,
        }
    }

    /// Build from config. The literature client is only kept when the
    /// advisory check is enabled.
    pub fn from_config(config: &AppConfig, literature: Option<Arc<dyn LiteratureSearch>>) -> Self {
        Self::new(
            config.filter.dedup_threshold,
            config.literature.match_threshold,
            literature.filter(|_| config.literature.enabled),
            Duration::from_secs(config.literature.timeout_secs),
        )
    }

    /// Turn validated drafts into deduplicated, provenance-bound candidates.
    #[instrument(skip_all, fields(batch = %batch_id, drafts = drafts.len()))]
    pub async fn apply(
        &self,
        batch_id: BatchId,
        drafts: &[DraftIdea],
        index: &ProvenanceIndex,
        cancel: &CancelToken,
    ) -> Result<FilterOutcome> {
        let mut outcome = FilterOutcome::default();

        let mut kept: Vec<(IdeaCandidate, BTreeSet<String>)> = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let Some(candidate) = bind_sources(batch_id, draft, index) else {
                warn!(title = %draft.title, "dropping idea: no source token resolves");
                outcome.unresolved += 1;
                continue;
            };
            let tokens = normalized_tokens(&format!("{} {}", candidate.title, candidate.description));

            let duplicate_of = kept
                .iter()
                .position(|(_, other)| jaccard(other, &tokens) > self.dedup_threshold);
            match duplicate_of {
                Some(pos) => {
                    outcome.collapsed += 1;
                    let (existing, existing_tokens) = &mut kept[pos];
                    if candidate.raw_llm_scores.product() > existing.raw_llm_scores.product() {
                        let mut winner = candidate;
                        absorb(&mut winner, existing);
                        info!(kept = %winner.id, dropped = %existing.id, "collapsed near-duplicate idea");
                        *existing = winner;
                        *existing_tokens = tokens;
                    } else {
                        info!(kept = %existing.id, dropped = %candidate.id, "collapsed near-duplicate idea");
                        absorb(existing, &candidate);
                    }
                }
                None => kept.push((candidate, tokens)),
            }
        }
        outcome.ideas = kept.into_iter().map(|(idea, _)| idea).collect();

        if let Some(literature) = &self.literature {
            for idea in &mut outcome.ideas {
                if self.pre_existing_check(literature.as_ref(), idea, cancel).await? {
                    idea.pre_existing_flag = true;
                    outcome.flagged += 1;
                }
            }
        }

        info!(
            kept = outcome.ideas.len(),
            collapsed = outcome.collapsed,
            flagged = outcome.flagged,
            unresolved = outcome.unresolved,
            "filter complete"
        );
        Ok(outcome)
    }

    /// Advisory only. Lookup failures are logged and treated as no match.
    async fn pre_existing_check(
        &self,
        literature: &dyn LiteratureSearch,
        idea: &IdeaCandidate,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let lookup = cancel
            .run(async {
                tokio::time::timeout(self.lookup_timeout, literature.count_matches(&idea.title))
                    .await
                    .unwrap_or_else(|_| Err(IdeaForgeError::transient("literature", "lookup timed out")))
            })
            .await;

        match lookup {
            Ok(matches) if matches > self.match_threshold => {
                info!(idea = %idea.id, title = %idea.title, matches, "advisory: similar work may already exist");
                Ok(true)
            }
            Ok(matches) => {
                debug!(idea = %idea.id, matches, "advisory check clear");
                Ok(false)
            }
            Err(IdeaForgeError::Cancelled) => Err(IdeaForgeError::Cancelled),
            Err(e) => {
                warn!(idea = %idea.id, error = %e, "advisory literature check failed, ignoring");
                Ok(false)
            }
        }
    }
}

/// Resolve a draft's P-tokens to paper ids, deduplicated in citation order.
fn bind_sources(batch_id: BatchId, draft: &DraftIdea, index: &ProvenanceIndex) -> Option<IdeaCandidate> {
    let mut source_paper_ids: Vec<String> = Vec::with_capacity(draft.source_tokens.len());
    let mut source_tokens = Vec::with_capacity(draft.source_tokens.len());
    for token in &draft.source_tokens {
        if let Some(paper_id) = index.resolve(token)
            && !source_paper_ids.iter().any(|p| p == paper_id)
        {
            source_paper_ids.push(paper_id.to_string());
            source_tokens.push(ProvenanceIndex::normalize_token(token));
        }
    }
    if source_paper_ids.is_empty() {
        return None;
    }

    Some(IdeaCandidate {
        id: IdeaId::new(),
        batch_id,
        source_paper_ids,
        source_tokens,
        title: draft.title.clone(),
        description: draft.description.clone(),
        novelty_rationale: draft.novelty_rationale.clone(),
        methodology: draft.methodology.clone(),
        required_datasets: draft.required_datasets.clone(),
        estimated_compute: draft.estimated_compute,
        risks: draft.risks.clone(),
        raw_llm_scores: draft.raw_llm_scores,
        status: IdeaStatus::Candidate,
        aliases: Vec::new(),
        pre_existing_flag: false,
        created_at: Utc::now(),
    })
}

/// Record `dropped` and everything it had absorbed as aliases of `kept`.
fn absorb(kept: &mut IdeaCandidate, dropped: &IdeaCandidate) {
    kept.aliases.push(dropped.id);
    kept.aliases.extend(dropped.aliases.iter().copied());
}

/// Lowercase, non-alphanumerics to spaces, stopwords removed.
pub fn normalized_tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|w| !is_stopword(w))
        .map(str::to_string)
        .collect()
}
