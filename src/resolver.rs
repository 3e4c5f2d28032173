//! Term resolution: mapping free-text spans in an utterance to metric nodes.
//!
//! Exact and synonym containment against the hierarchy runs first and costs
//! nothing. Only spans that survive that pass are sent to the external fuzzy
//! matcher; a matcher outage degrades the result to the exact/synonym hits
//! rather than failing the turn.

use crate::hierarchy::MetricHierarchy;
use crate::services::TermMatcher;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchSource {
    Exact,
    Synonym,
    Fuzzy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedMetric {
    pub node_id: String,
    pub name: String,
    pub confidence: f64,
    pub source: MatchSource,
}

/// Outcome of resolving one utterance: matched metrics in discovery order,
/// plus the spans that matched nothing (candidate `UnresolvedTerm` issues).
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub metrics: Vec<ResolvedMetric>,
    pub unmatched_spans: Vec<String>,
}

/// Filler phrases stripped before span extraction. Whatever text survives
/// after removing these and the matched metric names is treated as a
/// candidate metric span.
const STOP_PHRASES: &[&str] = &[
    "帮我看看",
    "帮我查查",
    "帮我查",
    "帮我",
    "请问",
    "我想知道",
    "我想看",
    "告诉我",
    "看看",
    "查一下",
    "查询",
    "统计",
    "一下",
    "的情况",
    "的数据",
    "情况",
    "数据",
    "怎么样",
    "如何",
    "是什么",
    "什么是",
    "多少",
    "各地",
    "今年",
    "去年",
    "综合评分",
    "综合得分",
    "综合",
    "评分",
    "得分",
    "汇总",
    "整体",
    "总体",
    "合计",
    "明细",
    "分项",
    "分别",
    "各项",
];

const SPAN_DELIMITERS: &[char] = &[
    '，', '。', '？', '！', '、', '：', ',', '.', '?', '!', ':', ';', ' ', '\t', '\n', '的', '和',
    '与', '及',
];

pub struct TermResolver {
    hierarchy: Arc<MetricHierarchy>,
    matcher: Arc<dyn TermMatcher>,
    top_k: usize,
    similarity_threshold: f64,
}

impl TermResolver {
    pub fn new(
        hierarchy: Arc<MetricHierarchy>,
        matcher: Arc<dyn TermMatcher>,
        top_k: usize,
        similarity_threshold: f64,
    ) -> Self {
        Self {
            hierarchy,
            matcher,
            top_k,
            similarity_threshold,
        }
    }

    /// Containment scan only. Never touches the external matcher.
    pub fn resolve_exact(&self, utterance: &str) -> Vec<ResolvedMetric> {
        let mut found = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for node in self.hierarchy.nodes() {
            if utterance.contains(node.name.as_str()) {
                if seen.insert(node.id.clone()) {
                    found.push(ResolvedMetric {
                        node_id: node.id.clone(),
                        name: node.name.clone(),
                        confidence: 1.0,
                        source: MatchSource::Exact,
                    });
                }
            } else if node.synonyms.iter().any(|s| utterance.contains(s.as_str())) {
                if seen.insert(node.id.clone()) {
                    found.push(ResolvedMetric {
                        node_id: node.id.clone(),
                        name: node.name.clone(),
                        confidence: 0.9,
                        source: MatchSource::Synonym,
                    });
                }
            }
        }
        found
    }

    /// Full resolution: containment scan, then fuzzy lookup per leftover span.
    pub async fn resolve(&self, utterance: &str) -> Resolution {
        let metrics = self.resolve_exact(utterance);
        let matched_terms: Vec<String> = metrics
            .iter()
            .flat_map(|m| {
                let node = self.hierarchy.node(&m.node_id);
                let mut terms = vec![m.name.clone()];
                if let Some(node) = node {
                    terms.extend(node.synonyms.iter().cloned());
                }
                terms
            })
            .collect();

        let mut resolution = Resolution {
            metrics,
            unmatched_spans: Vec::new(),
        };
        let mut seen: HashSet<String> = resolution
            .metrics
            .iter()
            .map(|m| m.node_id.clone())
            .collect();

        for span in extract_spans(utterance, &matched_terms) {
            match self.matcher.match_terms(&span, self.top_k).await {
                Ok(candidates) => {
                    let mut hit = false;
                    for cand in candidates {
                        if cand.score < self.similarity_threshold {
                            continue;
                        }
                        let Some(node) = self.hierarchy.node(&cand.metric_id) else {
                            debug!(metric_id = %cand.metric_id, "matcher returned unknown metric id");
                            continue;
                        };
                        hit = true;
                        if seen.insert(node.id.clone()) {
                            resolution.metrics.push(ResolvedMetric {
                                node_id: node.id.clone(),
                                name: node.name.clone(),
                                confidence: cand.score.clamp(0.0, 1.0),
                                source: MatchSource::Fuzzy,
                            });
                        }
                    }
                    if !hit {
                        resolution.unmatched_spans.push(span);
                    }
                }
                Err(e) => {
                    // Degrade to whatever the containment scan found; an
                    // unverifiable span must not trigger a clarification.
                    warn!(error = %e, span = %span, "fuzzy matcher unavailable");
                }
            }
        }
        resolution
    }
}

/// Candidate metric spans: the utterance minus matched terms, filler phrases,
/// and delimiters. Single characters and bare numbers are noise.
pub fn extract_spans(utterance: &str, matched_terms: &[String]) -> Vec<String> {
    let mut text = utterance.to_string();
    for term in matched_terms {
        if !term.is_empty() {
            text = text.replace(term.as_str(), "|");
        }
    }
    for phrase in STOP_PHRASES {
        text = text.replace(phrase, "|");
    }
    text.split(|c: char| c == '|' || SPAN_DELIMITERS.contains(&c))
        .map(str::trim)
        .filter(|s| s.chars().count() >= 2)
        .filter(|s| !s.chars().all(|c| c.is_ascii_digit() || c == '年' || c == '月'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::hierarchy::MetricNode;
    use crate::services::FuzzyCandidate;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(id: &str, name: &str, level: u32, parent: Option<&str>) -> MetricNode {
        MetricNode {
            id: id.to_string(),
            name: name.to_string(),
            level,
            parent: parent.map(|p| p.to_string()),
            weight: None,
            synonyms: vec![],
            description: String::new(),
        }
    }

    fn hierarchy() -> Arc<MetricHierarchy> {
        Arc::new(
            MetricHierarchy::from_nodes(vec![
                node("infra", "基础设施", 1, None),
                node("infra_net", "网络", 2, Some("infra")),
                node("res", "数字资源", 1, None),
            ])
            .unwrap(),
        )
    }

    struct ScriptedMatcher {
        calls: AtomicUsize,
        reply: Vec<FuzzyCandidate>,
        fail: bool,
    }

    #[async_trait]
    impl TermMatcher for ScriptedMatcher {
        async fn match_terms(&self, _text: &str, _top_k: usize) -> Result<Vec<FuzzyCandidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::error::AgentError::Llm("matcher down".into()));
            }
            Ok(self.reply.clone())
        }
    }

    fn resolver(matcher: ScriptedMatcher) -> TermResolver {
        TermResolver::new(hierarchy(), Arc::new(matcher), 5, 0.7)
    }

    #[tokio::test]
    async fn test_exact_containment_skips_matcher() {
        let matcher = ScriptedMatcher {
            calls: AtomicUsize::new(0),
            reply: vec![],
            fail: false,
        };
        let r = resolver(matcher);
        let res = r.resolve("帮我看看基础设施的情况").await;
        assert_eq!(res.metrics.len(), 1);
        assert_eq!(res.metrics[0].node_id, "infra");
        assert_eq!(res.metrics[0].source, MatchSource::Exact);
        assert!(res.unmatched_spans.is_empty());
    }

    #[tokio::test]
    async fn test_fuzzy_fallback_above_threshold() {
        let matcher = ScriptedMatcher {
            calls: AtomicUsize::new(0),
            reply: vec![
                FuzzyCandidate {
                    metric_id: "res".into(),
                    score: 0.82,
                },
                FuzzyCandidate {
                    metric_id: "infra".into(),
                    score: 0.4,
                },
            ],
            fail: false,
        };
        let r = resolver(matcher);
        let res = r.resolve("帮我看看数字化资源的情况").await;
        let fuzzy: Vec<_> = res
            .metrics
            .iter()
            .filter(|m| m.source == MatchSource::Fuzzy)
            .collect();
        assert_eq!(fuzzy.len(), 1);
        assert_eq!(fuzzy[0].node_id, "res");
        assert!(res.unmatched_spans.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_span_reported() {
        let matcher = ScriptedMatcher {
            calls: AtomicUsize::new(0),
            reply: vec![],
            fail: false,
        };
        let r = resolver(matcher);
        let res = r.resolve("帮我看看智慧黑板的数据").await;
        assert!(res.metrics.is_empty());
        assert_eq!(res.unmatched_spans, vec!["智慧黑板".to_string()]);
    }

    #[tokio::test]
    async fn test_matcher_failure_degrades() {
        let matcher = ScriptedMatcher {
            calls: AtomicUsize::new(0),
            reply: vec![],
            fail: true,
        };
        let r = resolver(matcher);
        let res = r.resolve("帮我看看智慧黑板和基础设施的情况").await;
        assert_eq!(res.metrics.len(), 1);
        assert_eq!(res.metrics[0].node_id, "infra");
        // The unverifiable span is dropped, not surfaced as unresolved.
        assert!(res.unmatched_spans.is_empty());
    }

    #[test]
    fn test_extract_spans_strips_fillers() {
        let spans = extract_spans("帮我看看智慧黑板的情况", &[]);
        assert_eq!(spans, vec!["智慧黑板".to_string()]);
        let spans = extract_spans("2023年基础设施怎么样", &["基础设施".to_string()]);
        assert!(spans.is_empty());
    }
}
