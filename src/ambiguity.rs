//! Ambiguity evaluation over the resolved metrics of one turn.
//!
//! Pure rules, no I/O: the same input always yields the same ordered issue
//! list. Issues are control-flow signals routed to the clarification node,
//! never errors.

use crate::config::RequiredParam;
use crate::hierarchy::MetricHierarchy;
use crate::intent::IntentType;
use crate::resolver::Resolution;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How a non-leaf metric should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeOption {
    /// Sum or listing of children without weighting.
    Rollup,
    /// Composite value from children using configured weights.
    WeightedScore,
    /// One row per child metric.
    ChildDetail,
}

impl ScopeOption {
    pub fn label(&self) -> &'static str {
        match self {
            ScopeOption::Rollup => "整体汇总",
            ScopeOption::WeightedScore => "综合评分",
            ScopeOption::ChildDetail => "分项明细",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AmbiguityIssue {
    UnresolvedTerm {
        span: String,
    },
    ScopeAmbiguous {
        node_id: String,
        name: String,
        options: Vec<ScopeOption>,
    },
    MissingParameter {
        name: String,
        reason: String,
    },
}

impl AmbiguityIssue {
    /// The one clarification question this issue poses to the user.
    pub fn question(&self) -> String {
        match self {
            AmbiguityIssue::UnresolvedTerm { span } => format!(
                "没有找到与「{}」对应的指标，您指的是哪个指标？",
                span
            ),
            AmbiguityIssue::ScopeAmbiguous { name, options, .. } => {
                let listed: Vec<String> = options
                    .iter()
                    .enumerate()
                    .map(|(i, o)| format!("{}. {}", i + 1, o.label()))
                    .collect();
                format!(
                    "「{}」包含多个子指标，您想查看哪种口径？\n{}",
                    name,
                    listed.join("\n")
                )
            }
            AmbiguityIssue::MissingParameter { reason, .. } => {
                format!("{}，请补充说明。", reason)
            }
        }
    }
}

const ROLLUP_CUES: &[&str] = &["总", "合计", "汇总", "整体", "total", "sum"];
const SCORE_CUES: &[&str] = &["评分", "综合", "得分", "score", "rating"];
const DETAIL_CUES: &[&str] = &["各", "分别", "明细", "分项", "每个", "breakdown", "each"];

/// What the evaluator concluded: ordered open issues, aggregation choices the
/// utterance itself settled, and defaults filled without asking.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub issues: Vec<AmbiguityIssue>,
    pub implied_scopes: Vec<(String, ScopeOption)>,
    pub filled_defaults: Vec<(String, String)>,
}

pub struct AmbiguityEvaluator {
    hierarchy: Arc<MetricHierarchy>,
    required_params: Vec<RequiredParam>,
}

impl AmbiguityEvaluator {
    pub fn new(hierarchy: Arc<MetricHierarchy>, required_params: Vec<RequiredParam>) -> Self {
        Self {
            hierarchy,
            required_params,
        }
    }

    /// Applies the rules in fixed order: unresolved terms, then scope
    /// ambiguity per resolved metric, then missing parameters. Output order
    /// is deterministic so questions stay stable across turns.
    pub fn evaluate(
        &self,
        intent: IntentType,
        utterance: &str,
        resolution: &Resolution,
        scope_choices: &HashMap<String, ScopeOption>,
        provided_params: &HashMap<String, String>,
    ) -> Evaluation {
        let mut out = Evaluation::default();

        // Rule 1: unresolved spans matter only when the intent needs metrics.
        if intent == IntentType::MetricQuery {
            for span in &resolution.unmatched_spans {
                out.issues.push(AmbiguityIssue::UnresolvedTerm {
                    span: span.clone(),
                });
            }
        }

        // Rule 2: non-leaf metrics without an aggregation decision.
        for metric in &resolution.metrics {
            if self.hierarchy.is_leaf(&metric.node_id) {
                continue;
            }
            if scope_choices.contains_key(&metric.node_id) {
                continue;
            }
            if let Some(implied) = scope_cue(utterance, &self.hierarchy, &metric.node_id) {
                out.implied_scopes.push((metric.node_id.clone(), implied));
                continue;
            }
            let mut options = vec![ScopeOption::Rollup];
            if self.hierarchy.all_children_weighted(&metric.node_id) {
                options.push(ScopeOption::WeightedScore);
            }
            options.push(ScopeOption::ChildDetail);
            out.issues.push(AmbiguityIssue::ScopeAmbiguous {
                node_id: metric.node_id.clone(),
                name: metric.name.clone(),
                options,
            });
        }

        // Rule 3: required filters. A year named in the utterance always wins,
        // even over a value carried from an earlier question; other configured
        // defaults are filled silently and never become a question.
        for param in &self.required_params {
            if param.name == "year" {
                if let Some(year) = detect_year(utterance) {
                    out.filled_defaults.push((param.name.clone(), year));
                    continue;
                }
            }
            if provided_params.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    out.filled_defaults
                        .push((param.name.clone(), default.clone()));
                }
                None => {
                    out.issues.push(AmbiguityIssue::MissingParameter {
                        name: param.name.clone(),
                        reason: param.reason.clone(),
                    });
                }
            }
        }

        out
    }
}

/// Explicit aggregation cue in the utterance, if any. Detail cues are checked
/// first: "各" style phrasing is the most explicit about wanting rows per
/// child, while "总"/"综合" overlap with metric names more often.
fn scope_cue(utterance: &str, hierarchy: &MetricHierarchy, node_id: &str) -> Option<ScopeOption> {
    if DETAIL_CUES.iter().any(|c| utterance.contains(c)) {
        return Some(ScopeOption::ChildDetail);
    }
    if SCORE_CUES.iter().any(|c| utterance.contains(c)) {
        if hierarchy.all_children_weighted(node_id) {
            return Some(ScopeOption::WeightedScore);
        }
        return Some(ScopeOption::Rollup);
    }
    if ROLLUP_CUES.iter().any(|c| utterance.contains(c)) {
        return Some(ScopeOption::Rollup);
    }
    None
}

/// Four-digit year anywhere in the utterance.
pub fn detect_year(utterance: &str) -> Option<String> {
    let chars: Vec<char> = utterance.chars().collect();
    for window in chars.windows(4) {
        if window.iter().all(|c| c.is_ascii_digit()) {
            let year: String = window.iter().collect();
            if year.starts_with("19") || year.starts_with("20") {
                return Some(year);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_required_params;
    use crate::hierarchy::MetricNode;
    use crate::resolver::{MatchSource, ResolvedMetric};

    fn node(
        id: &str,
        name: &str,
        level: u32,
        parent: Option<&str>,
        weight: Option<f64>,
    ) -> MetricNode {
        MetricNode {
            id: id.to_string(),
            name: name.to_string(),
            level,
            parent: parent.map(|p| p.to_string()),
            weight,
            synonyms: vec![],
            description: String::new(),
        }
    }

    fn hierarchy() -> Arc<MetricHierarchy> {
        Arc::new(
            MetricHierarchy::from_nodes(vec![
                node("infra", "基础设施", 1, None, None),
                node("infra_net", "网络", 2, Some("infra"), Some(0.3)),
                node("infra_term", "终端", 2, Some("infra"), Some(0.4)),
                node("infra_room", "教室", 2, Some("infra"), Some(0.3)),
                node("literacy", "数字素养", 1, None, None),
                node("literacy_student", "学生数字素养", 2, Some("literacy"), None),
                node("literacy_teacher", "教师数字素养", 2, Some("literacy"), Some(0.5)),
            ])
            .unwrap(),
        )
    }

    fn resolved(node_id: &str, name: &str) -> ResolvedMetric {
        ResolvedMetric {
            node_id: node_id.to_string(),
            name: name.to_string(),
            confidence: 1.0,
            source: MatchSource::Exact,
        }
    }

    fn evaluator() -> AmbiguityEvaluator {
        AmbiguityEvaluator::new(hierarchy(), default_required_params())
    }

    #[test]
    fn test_scope_ambiguous_with_all_options() {
        let resolution = Resolution {
            metrics: vec![resolved("infra", "基础设施")],
            unmatched_spans: vec![],
        };
        let eval = evaluator().evaluate(
            IntentType::MetricQuery,
            "帮我看看基础设施的情况",
            &resolution,
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(eval.issues.len(), 1);
        match &eval.issues[0] {
            AmbiguityIssue::ScopeAmbiguous { node_id, options, .. } => {
                assert_eq!(node_id, "infra");
                assert_eq!(
                    options,
                    &vec![
                        ScopeOption::Rollup,
                        ScopeOption::WeightedScore,
                        ScopeOption::ChildDetail
                    ]
                );
            }
            other => panic!("expected ScopeAmbiguous, got {:?}", other),
        }
        // Year and region both have defaults; filled without asking.
        assert!(eval
            .filled_defaults
            .iter()
            .any(|(name, value)| name == "region" && value == "全国"));
    }

    #[test]
    fn test_weighted_score_excluded_when_child_lacks_weight() {
        let resolution = Resolution {
            metrics: vec![resolved("literacy", "数字素养")],
            unmatched_spans: vec![],
        };
        let eval = evaluator().evaluate(
            IntentType::MetricQuery,
            "数字素养的情况",
            &resolution,
            &HashMap::new(),
            &HashMap::new(),
        );
        match &eval.issues[0] {
            AmbiguityIssue::ScopeAmbiguous { options, .. } => {
                assert!(!options.contains(&ScopeOption::WeightedScore));
                assert_eq!(
                    options,
                    &vec![ScopeOption::Rollup, ScopeOption::ChildDetail]
                );
            }
            other => panic!("expected ScopeAmbiguous, got {:?}", other),
        }
    }

    #[test]
    fn test_aggregation_cue_settles_scope() {
        let resolution = Resolution {
            metrics: vec![resolved("infra", "基础设施")],
            unmatched_spans: vec![],
        };
        let eval = evaluator().evaluate(
            IntentType::MetricQuery,
            "基础设施的综合评分是多少",
            &resolution,
            &HashMap::new(),
            &HashMap::new(),
        );
        assert!(eval.issues.is_empty());
        assert_eq!(
            eval.implied_scopes,
            vec![("infra".to_string(), ScopeOption::WeightedScore)]
        );
    }

    #[test]
    fn test_issue_ordering_is_deterministic() {
        let resolution = Resolution {
            metrics: vec![resolved("infra", "基础设施")],
            unmatched_spans: vec!["智慧黑板".to_string()],
        };
        let params = vec![crate::config::RequiredParam::new(
            "grade",
            "缺少学段范围",
            None,
        )];
        let eval = AmbiguityEvaluator::new(hierarchy(), params);
        let issues = eval
            .evaluate(
                IntentType::MetricQuery,
                "帮我看看智慧黑板和基础设施的情况",
                &resolution,
                &HashMap::new(),
                &HashMap::new(),
            )
            .issues;
        assert_eq!(issues.len(), 3);
        assert!(matches!(issues[0], AmbiguityIssue::UnresolvedTerm { .. }));
        assert!(matches!(issues[1], AmbiguityIssue::ScopeAmbiguous { .. }));
        assert!(matches!(issues[2], AmbiguityIssue::MissingParameter { .. }));
    }

    #[test]
    fn test_idempotent_for_identical_input() {
        let resolution = Resolution {
            metrics: vec![resolved("infra", "基础设施")],
            unmatched_spans: vec!["智慧黑板".to_string()],
        };
        let e = evaluator();
        let scopes = HashMap::new();
        let params = HashMap::new();
        let first = e.evaluate(
            IntentType::MetricQuery,
            "帮我看看智慧黑板和基础设施",
            &resolution,
            &scopes,
            &params,
        );
        let second = e.evaluate(
            IntentType::MetricQuery,
            "帮我看看智慧黑板和基础设施",
            &resolution,
            &scopes,
            &params,
        );
        assert_eq!(first.issues, second.issues);
    }

    #[test]
    fn test_unresolved_terms_tolerated_outside_metric_query() {
        let resolution = Resolution {
            metrics: vec![],
            unmatched_spans: vec!["智慧黑板".to_string()],
        };
        let eval = evaluator().evaluate(
            IntentType::SimpleQuery,
            "智慧黑板",
            &resolution,
            &HashMap::new(),
            &HashMap::new(),
        );
        assert!(eval
            .issues
            .iter()
            .all(|i| !matches!(i, AmbiguityIssue::UnresolvedTerm { .. })));
    }

    #[test]
    fn test_resolved_scope_not_reasked() {
        let resolution = Resolution {
            metrics: vec![resolved("infra", "基础设施")],
            unmatched_spans: vec![],
        };
        let mut scopes = HashMap::new();
        scopes.insert("infra".to_string(), ScopeOption::WeightedScore);
        let eval = evaluator().evaluate(
            IntentType::MetricQuery,
            "帮我看看基础设施的情况",
            &resolution,
            &scopes,
            &HashMap::new(),
        );
        assert!(eval.issues.is_empty());
    }

    #[test]
    fn test_year_detected_in_utterance() {
        assert_eq!(detect_year("2023年基础设施"), Some("2023".to_string()));
        assert_eq!(detect_year("基础设施怎么样"), None);
    }

    #[test]
    fn test_year_in_utterance_overrides_carried_value() {
        let resolution = Resolution {
            metrics: vec![resolved("infra", "基础设施")],
            unmatched_spans: vec![],
        };
        let mut scopes = HashMap::new();
        scopes.insert("infra".to_string(), ScopeOption::WeightedScore);
        let mut params = HashMap::new();
        params.insert("year".to_string(), "2023".to_string());
        let eval = evaluator().evaluate(
            IntentType::MetricQuery,
            "2024年基础设施的综合评分",
            &resolution,
            &scopes,
            &params,
        );
        assert!(eval.issues.is_empty());
        assert!(eval
            .filled_defaults
            .iter()
            .any(|(name, value)| name == "year" && value == "2024"));
    }
}
