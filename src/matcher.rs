//! Term matcher implementations: an embedding-backed cosine index built one
//! document per metric node, and a local string-similarity fallback for
//! deployments without an embedding endpoint.

use crate::error::Result;
use crate::hierarchy::MetricHierarchy;
use crate::llm::EmbeddingClient;
use crate::services::{FuzzyCandidate, TermMatcher};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

fn node_document(name: &str, synonyms: &[String], description: &str) -> String {
    let mut doc = name.to_string();
    if !synonyms.is_empty() {
        doc.push_str(" 别名: ");
        doc.push_str(&synonyms.join(" "));
    }
    if !description.is_empty() {
        doc.push(' ');
        doc.push_str(description);
    }
    doc
}

/// Cosine top-k over per-node embedding vectors. The index is embedded once
/// at startup; queries cost one embedding call each.
pub struct EmbeddingTermMatcher {
    client: EmbeddingClient,
    metric_ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

impl EmbeddingTermMatcher {
    pub async fn build(hierarchy: &MetricHierarchy, client: EmbeddingClient) -> Result<Self> {
        let mut metric_ids = Vec::new();
        let mut docs = Vec::new();
        for node in hierarchy.nodes() {
            metric_ids.push(node.id.clone());
            docs.push(node_document(&node.name, &node.synonyms, &node.description));
        }
        let vectors = client.embed(&docs).await?;
        info!(nodes = metric_ids.len(), "embedding index built");
        Ok(Self {
            client,
            metric_ids,
            vectors,
        })
    }
}

#[async_trait]
impl TermMatcher for EmbeddingTermMatcher {
    async fn match_terms(&self, text: &str, top_k: usize) -> Result<Vec<FuzzyCandidate>> {
        let query = self.client.embed(&[text.to_string()]).await?;
        let Some(query_vec) = query.first() else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<FuzzyCandidate> = self
            .metric_ids
            .iter()
            .zip(&self.vectors)
            .map(|(id, vec)| FuzzyCandidate {
                metric_id: id.clone(),
                score: cosine(query_vec, vec),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Offline fallback: Jaro-Winkler over names and synonyms, with a containment
/// boost so partial mentions of long names still rank well.
pub struct LocalSimilarityMatcher {
    entries: Vec<(String, String)>,
}

impl LocalSimilarityMatcher {
    pub fn new(hierarchy: &MetricHierarchy) -> Self {
        let mut entries = Vec::new();
        for node in hierarchy.nodes() {
            entries.push((node.id.clone(), node.name.clone()));
            for syn in &node.synonyms {
                entries.push((node.id.clone(), syn.clone()));
            }
        }
        Self { entries }
    }

    pub fn from_shared(hierarchy: &Arc<MetricHierarchy>) -> Self {
        Self::new(hierarchy)
    }
}

#[async_trait]
impl TermMatcher for LocalSimilarityMatcher {
    async fn match_terms(&self, text: &str, top_k: usize) -> Result<Vec<FuzzyCandidate>> {
        let mut best: Vec<FuzzyCandidate> = Vec::new();
        for (metric_id, term) in &self.entries {
            let mut score = strsim::jaro_winkler(text, term);
            if text.contains(term.as_str()) || term.contains(text) {
                score = score.max(0.85);
            }
            match best.iter_mut().find(|c| &c.metric_id == metric_id) {
                Some(existing) => existing.score = existing.score.max(score),
                None => best.push(FuzzyCandidate {
                    metric_id: metric_id.clone(),
                    score,
                }),
            }
        }
        best.sort_by(|a, b| b.score.total_cmp(&a.score));
        best.truncate(top_k);
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::MetricNode;

    fn hierarchy() -> MetricHierarchy {
        MetricHierarchy::from_nodes(vec![
            MetricNode {
                id: "res".into(),
                name: "数字资源".into(),
                level: 1,
                parent: None,
                weight: None,
                synonyms: vec!["数字化资源".into()],
                description: "数字教育资源覆盖情况".into(),
            },
            MetricNode {
                id: "infra".into(),
                name: "基础设施".into(),
                level: 1,
                parent: None,
                weight: None,
                synonyms: vec![],
                description: String::new(),
            },
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_local_matcher_ranks_synonym_hit_first() {
        let matcher = LocalSimilarityMatcher::new(&hierarchy());
        let candidates = matcher.match_terms("数字化资源", 5).await.unwrap();
        assert_eq!(candidates[0].metric_id, "res");
        assert!(candidates[0].score >= 0.85);
    }

    #[tokio::test]
    async fn test_local_matcher_respects_top_k() {
        let matcher = LocalSimilarityMatcher::new(&hierarchy());
        let candidates = matcher.match_terms("资源", 1).await.unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_cosine_bounds() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
