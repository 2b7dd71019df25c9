//! Deterministic batch compression for long-context synthesis.
//!
//! Turns a batch of paper records into one bounded text block plus a
//! provenance index. Each paper gets a stable short token (`P1`…`Pn`) that
//! the generator must cite; the index is the only way generator output is
//! bound back to real paper ids. No I/O happens here.

pub mod cluster;
pub mod keywords;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, instrument, warn};

use ideaforge_shared::{
    BatchId, CompressedBatch, CompressionConfig, IdeaForgeError, Paper, ProvenanceEntry,
    ProvenanceIndex, Quartile, Result, Truncation,
};

/// Upper bound on papers per batch.
pub const MAX_BATCH_PAPERS: usize = 200;

/// Longest contribution/limitation line kept per paper.
const MAX_LINE_CHARS: usize = 320;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Options for [`compress_batch`].
#[derive(Debug, Clone)]
pub struct CompressOptions {
    /// Character budget for the serialized batch.
    pub max_chars: usize,
    /// Jaccard threshold for single-link clustering.
    pub cluster_threshold: f64,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self::from(&CompressionConfig::default())
    }
}

impl From<&CompressionConfig> for CompressOptions {
    fn from(config: &CompressionConfig) -> Self {
        Self {
            max_chars: config.max_chars,
            cluster_threshold: config.cluster_threshold,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-paper digest
// ---------------------------------------------------------------------------

/// Everything the serializer needs about one paper.
#[derive(Debug, Clone)]
struct PaperDigest {
    token: String,
    paper_id: String,
    headline: String,
    contribution: String,
    methods: Vec<String>,
    datasets: Vec<String>,
    limitations: Option<String>,
    keywords: BTreeSet<String>,
    priority: f64,
}

impl PaperDigest {
    fn build(index: usize, paper: &Paper) -> Self {
        let keywords = keywords::keyword_set(paper);
        let text = format!(
            "{} {} {}",
            paper.title,
            paper.abstract_text,
            paper.excerpts.join(" ")
        );

        Self {
            token: ProvenanceIndex::token_for(index),
            paper_id: paper.id.clone(),
            headline: headline(paper),
            contribution: keywords::truncate_chars(
                &keywords::contribution_sentence(paper, &keywords),
                MAX_LINE_CHARS,
            ),
            methods: keywords::extract_methods(&text),
            datasets: keywords::extract_datasets(&text),
            limitations: keywords::limitations(paper)
                .map(|l| keywords::truncate_chars(&l, MAX_LINE_CHARS)),
            keywords,
            priority: priority(paper),
        }
    }

    /// Full multi-line entry.
    fn render_full(&self) -> String {
        let mut out = format!("[{}] {}\n", self.token, self.headline);
        out.push_str(&format!("  - Contribution: {}\n", self.contribution));
        if !self.methods.is_empty() {
            out.push_str(&format!("  - Methods: {}\n", self.methods.join(", ")));
        }
        if !self.datasets.is_empty() {
            out.push_str(&format!("  - Datasets: {}\n", self.datasets.join(", ")));
        }
        if let Some(limitations) = &self.limitations {
            out.push_str(&format!("  - Limitations: {limitations}\n"));
        }
        out
    }

    /// One-line stub used when the batch is over budget.
    fn render_stub(&self) -> String {
        format!("[{}] {}\n", self.token, self.headline)
    }
}

/// `Title (Venue, 2021; Q1; 152 citations)`.
fn headline(paper: &Paper) -> String {
    let mut meta: Vec<String> = Vec::new();
    match (&paper.venue, paper.year) {
        (Some(venue), Some(year)) => meta.push(format!("{venue}, {year}")),
        (Some(venue), None) => meta.push(venue.clone()),
        (None, Some(year)) => meta.push(year.to_string()),
        (None, None) => {}
    }
    if let Some(q) = paper.quartile {
        meta.push(format!("{q:?}"));
    }
    meta.push(format!("{} citations", paper.citation_count));
    format!("{} ({})", paper.title.trim(), meta.join("; "))
}

/// Venue score plus log-scaled citations. Lowest priority is demoted first.
fn priority(paper: &Paper) -> f64 {
    let citations = (f64::from(paper.citation_count).ln_1p() / 1000_f64.ln_1p()).min(1.0);
    Quartile::score(paper.quartile) + citations
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Compress `papers` into a bounded batch text and provenance index.
///
/// Papers over budget are demoted to one-line stubs in ascending priority
/// order; no paper is ever omitted. Every demotion is recorded.
#[instrument(skip_all, fields(batch = %batch_id, papers = papers.len()))]
pub fn compress_batch(
    batch_id: BatchId,
    papers: &[Paper],
    opts: &CompressOptions,
) -> Result<CompressedBatch> {
    if papers.is_empty() {
        return Err(IdeaForgeError::validation("cannot compress an empty batch"));
    }
    if papers.len() > MAX_BATCH_PAPERS {
        return Err(IdeaForgeError::validation(format!(
            "batch has {} papers, maximum is {MAX_BATCH_PAPERS}",
            papers.len()
        )));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let unique: Vec<&Paper> = papers
        .iter()
        .filter(|p| {
            let fresh = seen.insert(p.id.as_str());
            if !fresh {
                warn!(paper_id = %p.id, "duplicate paper id in batch, keeping first occurrence");
            }
            fresh
        })
        .collect();

    let digests: Vec<PaperDigest> = unique
        .iter()
        .enumerate()
        .map(|(i, p)| PaperDigest::build(i, p))
        .collect();

    let keyword_sets: Vec<BTreeSet<String>> =
        digests.iter().map(|d| d.keywords.clone()).collect();
    let clusters = cluster::single_link_clusters(&keyword_sets, opts.cluster_threshold);

    debug!(clusters = clusters.len(), "keyword clustering complete");

    let full: Vec<String> = digests.iter().map(PaperDigest::render_full).collect();
    let stubs: Vec<String> = digests.iter().map(PaperDigest::render_stub).collect();
    let mut stubbed = vec![false; digests.len()];

    // Budget is in characters, not bytes.
    let mut total = render(batch_id, &digests, &clusters, &full, &stubs, &stubbed)
        .chars()
        .count();
    let mut truncations = Vec::new();

    if total > opts.max_chars {
        let mut order: Vec<usize> = (0..digests.len()).collect();
        // Ascending priority; among equals the later token goes first.
        order.sort_by(|&a, &b| {
            digests[a]
                .priority
                .total_cmp(&digests[b].priority)
                .then(b.cmp(&a))
        });

        for i in order {
            if total <= opts.max_chars {
                break;
            }
            stubbed[i] = true;
            total -= full[i].chars().count() - stubs[i].chars().count();
            truncations.push(Truncation {
                token: digests[i].token.clone(),
                paper_id: digests[i].paper_id.clone(),
                reason: format!(
                    "demoted to stub (priority {:.2}) to fit {} char budget",
                    digests[i].priority, opts.max_chars
                ),
            });
        }
    }

    let text = render(batch_id, &digests, &clusters, &full, &stubs, &stubbed);
    let chars = text.chars().count();
    let over_budget = chars > opts.max_chars;
    if over_budget {
        warn!(
            chars,
            budget = opts.max_chars,
            "batch exceeds budget even with every paper stubbed"
        );
    }

    let index = ProvenanceIndex {
        entries: digests
            .iter()
            .map(|d| ProvenanceEntry {
                token: d.token.clone(),
                paper_id: d.paper_id.clone(),
            })
            .collect(),
    };

    debug!(
        chars,
        truncated = truncations.len(),
        "batch compression complete"
    );

    Ok(CompressedBatch {
        batch_id,
        text,
        index,
        truncations,
        clusters: clusters
            .iter()
            .map(|c| c.iter().map(|&i| digests[i].token.clone()).collect())
            .collect(),
        char_budget: opts.max_chars,
        over_budget,
    })
}

/// Serialize the batch. Pure concatenation, so per-entry length deltas are exact.
fn render(
    batch_id: BatchId,
    digests: &[PaperDigest],
    clusters: &[Vec<usize>],
    full: &[String],
    stubs: &[String],
    stubbed: &[bool],
) -> String {
    let mut out = format!(
        "# Paper batch {batch_id}\n{} papers in {} keyword clusters. Cite papers only by their [P#] token.\n",
        digests.len(),
        clusters.len()
    );

    for (n, members) in clusters.iter().enumerate() {
        out.push_str(&format!(
            "\n## Cluster {}: {}\n",
            n + 1,
            cluster_label(digests, members)
        ));
        for &i in members {
            out.push_str(if stubbed[i] { &stubs[i] } else { &full[i] });
        }
    }
    out
}

/// Up to three most frequent keywords across the cluster, ties alphabetical.
fn cluster_label(digests: &[PaperDigest], members: &[usize]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for &i in members {
        for k in &digests[i].keywords {
            *counts.entry(k.as_str()).or_default() += 1;
        }
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let label: Vec<&str> = ranked.into_iter().take(3).map(|(k, _)| k).collect();
    if label.is_empty() {
        "misc".to_string()
    } else {
        label.join(", ")
    }
}
