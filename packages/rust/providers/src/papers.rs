//! File-backed paper repository for local runs.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use ideaforge_shared::{IdeaForgeError, Paper, Result};

use crate::PaperRepository;

/// Papers loaded from a JSON array file, kept in input order.
#[derive(Debug, Clone, Default)]
pub struct JsonPaperRepository {
    papers: Vec<Paper>,
    by_id: HashMap<String, usize>,
}

impl JsonPaperRepository {
    /// Load a JSON array of paper records.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| IdeaForgeError::io(path, e))?;
        let papers: Vec<Paper> = serde_json::from_str(&content).map_err(|e| {
            IdeaForgeError::validation(format!("{} is not a paper array: {e}", path.display()))
        })?;
        info!(path = %path.display(), papers = papers.len(), "loaded paper file");
        Ok(Self::from_papers(papers))
    }

    /// Build from records already in memory. Later duplicates are ignored.
    pub fn from_papers(papers: Vec<Paper>) -> Self {
        let mut by_id = HashMap::with_capacity(papers.len());
        let mut kept = Vec::with_capacity(papers.len());
        for paper in papers {
            if by_id.contains_key(&paper.id) {
                continue;
            }
            by_id.insert(paper.id.clone(), kept.len());
            kept.push(paper);
        }
        Self {
            papers: kept,
            by_id,
        }
    }

    /// All paper ids, in file order.
    pub fn ids(&self) -> Vec<String> {
        self.papers.iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.papers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.papers.is_empty()
    }
}

#[async_trait]
impl PaperRepository for JsonPaperRepository {
    async fn get_papers(&self, ids: &[String]) -> Result<Vec<Paper>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.by_id.get(id).map(|&i| self.papers[i].clone()))
            .collect())
    }
}
