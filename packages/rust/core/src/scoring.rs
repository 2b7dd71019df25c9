//! Deterministic hybrid scoring.
//!
//! [`score_idea`] combines the generator's self-assessed impact and
//! feasibility with rule-based calibration (bibliometrics, data availability,
//! compute, industry relevance, risk). It performs no I/O and reads no clock:
//! the reference time comes from [`ScoringContext`], so identical inputs
//! always produce an identical breakdown.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;

use ideaforge_shared::{
    ComputeLevel, IdeaCandidate, Paper, Quartile, ScoreBreakdown, ScoreComponents, ScoringConfig,
    Verdict,
};

/// Citation counts at or above this saturate the citation signal.
const CITATION_SATURATION: f64 = 1000.0;

/// Citation signal half-life, in years.
const CITATION_HALF_LIFE_YEARS: f64 = 5.0;

/// Assumed age of a paper with no publication year.
const UNKNOWN_AGE_YEARS: f64 = 5.0;

static PROPRIETARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:hospital|clinic|patient records?|ehr|proprietary|private|internal|confidential|in-house|company|customer|commercial|licensed)\b",
    )
    .expect("valid regex")
});

static PUBLIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:public|open|benchmarks?|kaggle|uci|imagenet|coco|cifar|mnist|squad|glue|wikipedia|common crawl|openstreetmap|librispeech|datasets?|corpus|corpora)\b",
    )
    .expect("valid regex")
});

static INDUSTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:healthcare|clinical|medical|finance|financial|banking|manufacturing|retail|logistics|supply chain|energy|agriculture|automotive|autonomous driving|robotics|cybersecurity|fraud|e-commerce|telecommunications?|insurance|legal)\b",
    )
    .expect("valid regex")
});

static RISK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(privacy|bias|ethic(?:s|al)|regulat(?:ory|ion)|consent|security|adversarial|hallucination|safety|leakage|overfitting|reproducibility|dual-use|misuse)\b",
    )
    .expect("valid regex")
});

/// How a required dataset was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetAccess {
    Public,
    Unknown,
    Proprietary,
}

/// Proprietary rules win over public ones.
pub fn classify_dataset(name: &str) -> DatasetAccess {
    if PROPRIETARY_RE.is_match(name) {
        DatasetAccess::Proprietary
    } else if PUBLIC_RE.is_match(name) {
        DatasetAccess::Public
    } else {
        DatasetAccess::Unknown
    }
}

/// Step function over distinct source papers.
pub fn synthesis_degree(distinct_sources: usize) -> f64 {
    match distinct_sources {
        0 => 0.0,
        1 => 0.5,
        2 => 0.8,
        _ => 1.0,
    }
}

pub fn compute_score(level: ComputeLevel) -> f64 {
    match level {
        ComputeLevel::Low => 1.0,
        ComputeLevel::Medium => 0.7,
        ComputeLevel::High => 0.4,
    }
}

/// Log-scaled citation count with exponential recency decay.
pub fn citation_signal(citations: u32, year: Option<i32>, as_of: DateTime<Utc>) -> f64 {
    let volume = ((1.0 + f64::from(citations)).ln() / (1.0 + CITATION_SATURATION).ln()).min(1.0);
    let age = match year {
        Some(year) => f64::from((as_of.year() - year).max(0)),
        None => UNKNOWN_AGE_YEARS,
    };
    volume * (-std::f64::consts::LN_2 * age / CITATION_HALF_LIFE_YEARS).exp()
}

/// Reference point for time-dependent sub-scores.
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext {
    pub as_of: DateTime<Utc>,
}

impl ScoringContext {
    pub fn now() -> Self {
        Self { as_of: Utc::now() }
    }
}

/// Score one idea. `papers` must contain the idea's sources; missing ones
/// count as unknown venue with no citation signal.
pub fn score_idea(
    idea: &IdeaCandidate,
    papers: &[Paper],
    weights: &ScoringConfig,
    ctx: &ScoringContext,
) -> ScoreBreakdown {
    let mut notes = Vec::new();

    let normalized_impact = f64::from(idea.raw_llm_scores.impact) / 10.0;
    let normalized_feasibility = f64::from(idea.raw_llm_scores.feasibility) / 10.0;

    let bibliometric = bibliometric_score(idea, papers, ctx, &mut notes);

    let sources = idea.distinct_sources();
    let synthesis = synthesis_degree(sources);
    if sources >= 3 {
        notes.push(format!("Synthesis upgraded: combines {sources} distinct papers."));
    } else if sources == 1 {
        notes.push("Synthesis limited: builds on a single paper.".to_string());
    }

    let (data_availability, proprietary) = data_availability(&idea.required_datasets, &mut notes);

    let compute_requirement = compute_score(idea.estimated_compute);
    if idea.estimated_compute == ComputeLevel::High {
        notes.push("Feasibility downgraded: HIGH compute requirement.".to_string());
    }

    let calibrated_feasibility =
        0.4 * normalized_feasibility + 0.6 * (data_availability * compute_requirement);

    let industry_relevance = match INDUSTRY_RE.find(&idea.description) {
        Some(hit) => {
            notes.push(format!(
                "Impact upgraded: applied-domain relevance ('{}').",
                hit.as_str()
            ));
            1.0
        }
        None => 0.0,
    };
    let calibrated_impact = 0.7 * normalized_impact + 0.3 * industry_relevance;

    let risk_terms = risk_terms(idea);
    let proprietary_flag = if proprietary { 1.0 } else { 0.0 };
    let risk = 0.6 * proprietary_flag + 0.4 * (risk_terms.len().min(3) as f64 / 3.0);
    if proprietary {
        notes.push("Risk raised: depends on proprietary data.".to_string());
    }
    if !risk_terms.is_empty() {
        let terms: Vec<&str> = risk_terms.iter().map(String::as_str).collect();
        notes.push(format!("Risk raised: mentions {}.", terms.join(", ")));
    }

    let composite = weights.bibliometric_weight * bibliometric
        + weights.synthesis_weight * synthesis
        + weights.feasibility_weight * calibrated_feasibility
        + weights.impact_weight * calibrated_impact
        - weights.risk_weight * risk;

    ScoreBreakdown {
        idea_id: idea.id,
        version: 0,
        components: ScoreComponents {
            normalized_impact,
            normalized_feasibility,
            bibliometric,
            synthesis_degree: synthesis,
            data_availability,
            compute_requirement,
            calibrated_feasibility,
            industry_relevance,
            calibrated_impact,
            risk,
            novelty: None,
        },
        composite,
        notes,
        scored_at: ctx.as_of,
    }
}

fn bibliometric_score(
    idea: &IdeaCandidate,
    papers: &[Paper],
    ctx: &ScoringContext,
    notes: &mut Vec<String>,
) -> f64 {
    let ids: BTreeSet<&str> = idea.source_paper_ids.iter().map(String::as_str).collect();
    if ids.is_empty() {
        return 0.0;
    }

    let mut venue_total = 0.0;
    let mut citation_total = 0.0;
    let mut missing = 0usize;
    for id in &ids {
        match papers.iter().find(|p| p.id == *id) {
            Some(paper) => {
                venue_total += Quartile::score(paper.quartile);
                citation_total += citation_signal(paper.citation_count, paper.year, ctx.as_of);
            }
            None => {
                venue_total += Quartile::score(None);
                missing += 1;
            }
        }
    }
    if missing > 0 {
        notes.push(format!(
            "Bibliometric downgraded: {missing} source paper(s) without metadata."
        ));
    }

    let n = ids.len() as f64;
    0.6 * (venue_total / n) + 0.4 * (citation_total / n)
}

/// Returns the availability score and whether any dataset is proprietary.
fn data_availability(datasets: &[String], notes: &mut Vec<String>) -> (f64, bool) {
    let classes: Vec<DatasetAccess> = datasets.iter().map(|d| classify_dataset(d)).collect();
    let proprietary = classes
        .iter()
        .filter(|c| **c == DatasetAccess::Proprietary)
        .count();

    for (name, class) in datasets.iter().zip(&classes) {
        if *class == DatasetAccess::Proprietary {
            notes.push(format!(
                "Feasibility downgraded: '{name}' identified as proprietary."
            ));
        }
    }

    if !classes.is_empty() && classes.iter().all(|c| *c == DatasetAccess::Public) {
        (1.0, false)
    } else if proprietary * 2 > classes.len() {
        (0.3, true)
    } else {
        (0.7, proprietary > 0)
    }
}

/// Distinct risk keywords across risks, description and methodology.
fn risk_terms(idea: &IdeaCandidate) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    let texts = idea
        .risks
        .iter()
        .map(String::as_str)
        .chain([idea.description.as_str(), idea.methodology.as_str()]);
    for text in texts {
        for m in RISK_RE.find_iter(text) {
            terms.insert(m.as_str().to_ascii_lowercase());
        }
    }
    terms
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// An idea paired with its current breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredIdea {
    pub idea: IdeaCandidate,
    pub score: ScoreBreakdown,
}

/// Rank order: composite desc, synthesis degree desc, created_at asc.
pub fn rank_cmp(a: &ScoredIdea, b: &ScoredIdea) -> Ordering {
    b.score
        .composite
        .total_cmp(&a.score.composite)
        .then_with(|| {
            b.score
                .components
                .synthesis_degree
                .total_cmp(&a.score.components.synthesis_degree)
        })
        .then_with(|| a.idea.created_at.cmp(&b.idea.created_at))
}

/// Stable sort into rank order.
pub fn rank(items: &mut [ScoredIdea]) {
    items.sort_by(rank_cmp);
}

/// Blend a novelty verdict into `prior`, producing the next breakdown.
pub fn rescore_with_novelty(
    prior: &ScoreBreakdown,
    verdict: Verdict,
    confidence: f64,
    weight: f64,
    scored_at: DateTime<Utc>,
) -> ScoreBreakdown {
    let novelty = verdict.novelty_score();
    let composite = (1.0 - weight) * prior.composite + weight * novelty;

    let mut notes = prior.notes.clone();
    let direction = if composite >= prior.composite {
        "upgraded"
    } else {
        "downgraded"
    };
    notes.push(format!(
        "Novelty {direction}: external verdict {} (confidence {confidence:.2}), composite {:.3} -> {composite:.3}.",
        verdict.as_str(),
        prior.composite
    ));

    ScoreBreakdown {
        idea_id: prior.idea_id,
        version: 0,
        components: ScoreComponents {
            novelty: Some(novelty),
            ..prior.components
        },
        composite,
        notes,
        scored_at,
    }
}
