//! Lexicon-based keyword extraction over paper titles and abstracts.
//!
//! Each extractor is a plain function over `&str`. Lexicon patterns are
//! compiled once and matched case-insensitively.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use ideaforge_shared::Paper;

// ---------------------------------------------------------------------------
// Lexicons
// ---------------------------------------------------------------------------

/// `(label, pattern)` pairs for method mentions.
const METHOD_PATTERNS: &[(&str, &str)] = &[
    ("transformer", r"\btransformers?\b"),
    ("graph neural network", r"\bgraph neural networks?\b|\bgnns?\b"),
    ("reinforcement learning", r"\breinforcement learning\b"),
    ("contrastive learning", r"\bcontrastive\b"),
    ("diffusion model", r"\bdiffusion models?\b|\bdenoising diffusion\b"),
    ("federated learning", r"\bfederated\b"),
    ("knowledge distillation", r"\bdistill(?:ation|ed)?\b"),
    ("bayesian inference", r"\bbayesian\b"),
    ("self-supervised learning", r"\bself-supervised\b"),
    ("fine-tuning", r"\bfine-?tun(?:e|ed|ing)\b"),
    ("retrieval augmentation", r"\bretrieval[- ]augmented\b|\brag\b"),
    ("convolutional network", r"\bconvolutional\b|\bcnns?\b"),
    ("attention mechanism", r"\battention\b"),
    ("variational autoencoder", r"\bvariational auto-?encoders?\b|\bvaes?\b"),
    ("gradient boosting", r"\bgradient[- ]boost(?:ing|ed)\b|\bxgboost\b"),
    ("meta-learning", r"\bmeta-?learning\b"),
    ("causal inference", r"\bcausal\b"),
    ("active learning", r"\bactive learning\b"),
    ("language model", r"\blanguage models?\b|\bllms?\b"),
    ("graph embedding", r"\bgraph embeddings?\b|\bnode2vec\b"),
    ("time-series forecasting", r"\btime[- ]series\b|\bforecasting\b"),
    ("anomaly detection", r"\banomaly detection\b|\boutlier detection\b"),
    ("optimization", r"\boptimi[sz]ation\b"),
];

/// `(label, pattern)` pairs for well-known dataset mentions.
const DATASET_PATTERNS: &[(&str, &str)] = &[
    ("ImageNet", r"\bimagenet\b"),
    ("COCO", r"\b(?:ms-?)?coco\b"),
    ("CIFAR", r"\bcifar-?(?:10|100)?\b"),
    ("MNIST", r"\bmnist\b"),
    ("SQuAD", r"\bsquad\b"),
    ("GLUE", r"\bglue\b"),
    ("MIMIC", r"\bmimic(?:-iii|-iv)?\b"),
    ("Wikipedia", r"\bwikipedia\b"),
    ("Common Crawl", r"\bcommon ?crawl\b"),
    ("UCI", r"\buci\b"),
    ("Kaggle", r"\bkaggle\b"),
    ("LibriSpeech", r"\blibrispeech\b"),
    ("OpenStreetMap", r"\bopenstreetmap\b"),
];

static METHOD_LEXICON: LazyLock<Vec<(&'static str, Regex)>> =
    LazyLock::new(|| compile_lexicon(METHOD_PATTERNS));

static DATASET_LEXICON: LazyLock<Vec<(&'static str, Regex)>> =
    LazyLock::new(|| compile_lexicon(DATASET_PATTERNS));

/// Capitalized names followed by "dataset", "benchmark" or "corpus".
static NAMED_DATASET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][A-Za-z0-9\-]{2,})\s+(?:dataset|benchmark|corpus)\b").expect("valid regex")
});

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9\-]*").expect("valid regex"));

static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+(?:[.!?]+|$)").expect("valid regex"));

const STOPWORDS: &[&str] = &[
    "a", "about", "above", "across", "after", "again", "against", "all", "also", "an", "and",
    "any", "are", "as", "at", "based", "be", "been", "being", "between", "both", "but", "by",
    "can", "could", "do", "does", "during", "each", "for", "from", "further", "has", "have",
    "how", "however", "in", "into", "is", "it", "its", "more", "most", "new", "not", "of", "on",
    "only", "or", "other", "our", "over", "paper", "propose", "proposed", "same", "show", "such",
    "than", "that", "the", "their", "them", "these", "they", "this", "those", "through", "to",
    "towards", "under", "use", "used", "using", "via", "was", "we", "well", "were", "what",
    "when", "where", "which", "while", "with", "within", "without", "work", "would",
];

fn compile_lexicon(patterns: &[(&'static str, &str)]) -> Vec<(&'static str, Regex)> {
    patterns
        .iter()
        .map(|(label, pattern)| {
            let re = Regex::new(&format!("(?i){pattern}")).expect("valid lexicon regex");
            (*label, re)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tokenization
// ---------------------------------------------------------------------------

/// Whether `word` (lowercase) is a stopword.
pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.binary_search(&word).is_ok()
}

/// Lowercase word tokens of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect()
}

/// Lowercase, non-stopword tokens of at least three characters.
pub fn content_words(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|w| w.len() >= 3 && !is_stopword(w))
        .collect()
}

/// Split prose into trimmed, non-empty sentences.
pub fn split_sentences(text: &str) -> Vec<&str> {
    SENTENCE_RE
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// Method labels mentioned in `text`, in lexicon order.
pub fn extract_methods(text: &str) -> Vec<String> {
    METHOD_LEXICON
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(label, _)| (*label).to_string())
        .collect()
}

/// Dataset names mentioned in `text`: lexicon hits first, then named datasets.
pub fn extract_datasets(text: &str) -> Vec<String> {
    let mut found: Vec<String> = DATASET_LEXICON
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(label, _)| (*label).to_string())
        .collect();

    for caps in NAMED_DATASET_RE.captures_iter(text) {
        let name = caps[1].to_string();
        if !found.iter().any(|f| f.eq_ignore_ascii_case(&name)) {
            found.push(name);
        }
    }
    found
}

/// Keyword set of a paper: lexicon labels plus title content words.
pub fn keyword_set(paper: &Paper) -> BTreeSet<String> {
    let text = paper_text(paper);
    let mut set: BTreeSet<String> = extract_methods(&text)
        .into_iter()
        .chain(extract_datasets(&text))
        .map(|k| k.to_ascii_lowercase())
        .collect();
    set.extend(content_words(&paper.title));
    set
}

/// Highest keyword-density sentence of the abstract. Ties go to the earliest.
pub fn contribution_sentence(paper: &Paper, keywords: &BTreeSet<String>) -> String {
    let keyword_words: BTreeSet<&str> = keywords
        .iter()
        .flat_map(|k| k.split_whitespace())
        .collect();

    let mut best: Option<(&str, f64)> = None;
    for sentence in split_sentences(&paper.abstract_text) {
        let tokens = tokenize(sentence);
        if tokens.is_empty() {
            continue;
        }
        let hits = tokens
            .iter()
            .filter(|t| keyword_words.contains(t.as_str()))
            .count();
        let density = hits as f64 / tokens.len() as f64;
        if best.is_none_or(|(_, d)| density > d) {
            best = Some((sentence, density));
        }
    }

    match best {
        Some((sentence, _)) => sentence.to_string(),
        None => paper.title.clone(),
    }
}

/// Limitations: the dedicated section if present, else the abstract's tail.
pub fn limitations(paper: &Paper) -> Option<String> {
    if let Some(section) = paper.limitations.as_deref().map(str::trim) {
        if !section.is_empty() {
            let sentences = split_sentences(section);
            return Some(sentences.iter().take(2).copied().collect::<Vec<_>>().join(" "));
        }
    }

    let sentences = split_sentences(&paper.abstract_text);
    if sentences.len() >= 2 {
        sentences.last().map(|s| (*s).to_string())
    } else {
        None
    }
}

/// Title, abstract, and excerpts joined for lexicon matching.
fn paper_text(paper: &Paper) -> String {
    let mut text = format!("{}. {}", paper.title, paper.abstract_text);
    for excerpt in &paper.excerpts {
        text.push(' ');
        text.push_str(excerpt);
    }
    text
}

/// Truncate `s` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper(title: &str, abstract_text: &str) -> Paper {
        Paper {
            id: "p".into(),
            title: title.into(),
            abstract_text: abstract_text.into(),
            venue: None,
            quartile: None,
            year: None,
            citation_count: 0,
            limitations: None,
            excerpts: vec![],
        }
    }

    #[test]
    fn stopwords_are_sorted_for_binary_search() {
        let mut sorted = STOPWORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOPWORDS);
        assert!(is_stopword("the"));
        assert!(!is_stopword("transformer"));
    }

    #[test]
    fn methods_match_case_insensitively() {
        let methods = extract_methods("We fine-tune a Transformer with Contrastive objectives.");
        assert_eq!(methods, vec!["transformer", "contrastive learning", "fine-tuning"]);
    }

    #[test]
    fn datasets_include_named_benchmarks() {
        let datasets =
            extract_datasets("Results on ImageNet and the ChestScan benchmark exceed prior work.");
        assert_eq!(datasets, vec!["ImageNet", "ChestScan"]);
    }

    #[test]
    fn contribution_picks_densest_sentence() {
        let p = paper(
            "Graph neural networks for traffic forecasting",
            "Traffic is hard to predict. We introduce a graph neural network for traffic forecasting. Code is released.",
        );
        let keywords = keyword_set(&p);
        let sentence = contribution_sentence(&p, &keywords);
        assert_eq!(sentence, "We introduce a graph neural network for traffic forecasting.");
    }

    #[test]
    fn contribution_falls_back_to_title() {
        let p = paper("Untitled Study", "");
        assert_eq!(contribution_sentence(&p, &BTreeSet::new()), "Untitled Study");
    }

    #[test]
    fn limitations_prefer_dedicated_section() {
        let mut p = paper("T", "First sentence. Second sentence. Last sentence.");
        assert_eq!(limitations(&p).as_deref(), Some("Last sentence."));

        p.limitations = Some("Small sample. Single site. Short horizon.".into());
        assert_eq!(limitations(&p).as_deref(), Some("Small sample. Single site."));
    }

    #[test]
    fn single_sentence_abstract_has_no_limitations() {
        let p = paper("T", "Only one sentence here.");
        assert!(limitations(&p).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
