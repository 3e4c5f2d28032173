//! Context assembly: the refined intent, the pruned metric context, and the
//! generation payload. The refined intent is the only query text the SQL
//! generator ever receives.

use crate::ambiguity::ScopeOption;
use crate::error::{AgentError, Result};
use crate::hierarchy::MetricHierarchy;
use crate::services::GenerationPayload;
use crate::session::SessionState;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

const GENERATION_INSTRUCTION: &str =
    "你是教育数字化指标库的SQL生成助手。根据数据库结构、指标口径和用户需求，生成一条MySQL SELECT语句。";

#[derive(Debug, Deserialize)]
struct SchemaDoc {
    tables: Vec<TableDoc>,
}

#[derive(Debug, Deserialize)]
struct TableDoc {
    name: String,
    #[serde(default)]
    comment: String,
    columns: Vec<ColumnDoc>,
}

#[derive(Debug, Deserialize)]
struct ColumnDoc {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    #[serde(default)]
    comment: String,
}

/// Static schema description, rendered once into prompt text.
pub struct SchemaCatalog {
    text: String,
}

impl SchemaCatalog {
    pub fn from_json(json_str: &str) -> Result<Self> {
        let doc: SchemaDoc = serde_json::from_str(json_str)
            .map_err(|e| AgentError::Config(format!("failed to parse schema JSON: {}", e)))?;
        let mut lines = Vec::new();
        for table in &doc.tables {
            if table.comment.is_empty() {
                lines.push(format!("表 {}:", table.name));
            } else {
                lines.push(format!("表 {} ({}):", table.name, table.comment));
            }
            for col in &table.columns {
                if col.comment.is_empty() {
                    lines.push(format!("  - {} {}", col.name, col.column_type));
                } else {
                    lines.push(format!(
                        "  - {} {} {}",
                        col.name, col.column_type, col.comment
                    ));
                }
            }
        }
        Ok(Self {
            text: lines.join("\n"),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

pub struct ContextAssembler {
    hierarchy: Arc<MetricHierarchy>,
    schema: SchemaCatalog,
}

impl ContextAssembler {
    pub fn new(hierarchy: Arc<MetricHierarchy>, schema: SchemaCatalog) -> Self {
        Self { hierarchy, schema }
    }

    /// The disambiguated restatement: base question plus explicit scope
    /// instructions, filter values, and any verbatim clarification leftovers.
    pub fn refine_intent(&self, state: &SessionState) -> String {
        let mut parts = vec![state.active_utterance.clone()];

        for metric in &state.identified_metrics {
            let Some(choice) = state.scope_choices.get(&metric.node_id) else {
                continue;
            };
            match choice {
                ScopeOption::Rollup => {
                    parts.push(format!(
                        "指标「{}」取其整体汇总值，不展开子指标。",
                        metric.name
                    ));
                }
                ScopeOption::WeightedScore => {
                    let formula = self.weighted_formula(&metric.node_id);
                    parts.push(format!(
                        "指标「{}」按配置权重计算综合评分: {}。",
                        metric.name, formula
                    ));
                }
                ScopeOption::ChildDetail => {
                    let children: Vec<String> = self
                        .hierarchy
                        .children(&metric.node_id)
                        .iter()
                        .map(|c| c.name.clone())
                        .collect();
                    parts.push(format!(
                        "指标「{}」分别列出各子指标: {}。",
                        metric.name,
                        children.join("、")
                    ));
                }
            }
        }

        let mut params: Vec<(&String, &String)> = state.provided_params.iter().collect();
        params.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in params {
            parts.push(format!("筛选条件 {}: {}。", name, value));
        }

        for note in &state.fallback_notes {
            parts.push(format!("补充说明: {}。", note));
        }

        parts.join(" ")
    }

    fn weighted_formula(&self, node_id: &str) -> String {
        self.hierarchy
            .children(node_id)
            .iter()
            .map(|c| match c.weight {
                Some(w) => format!("{}×{}", c.name, w),
                None => c.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(" + ")
    }

    /// Only the identified metrics and their direct children, never the
    /// whole taxonomy.
    pub fn metric_context(&self, state: &SessionState) -> String {
        let mut lines = Vec::new();
        for metric in &state.identified_metrics {
            let Some(node) = self.hierarchy.node(&metric.node_id) else {
                continue;
            };
            lines.push(format!(
                "指标 {} (id={}, 层级{}): {}",
                node.name, node.id, node.level, node.description
            ));
            for child in self.hierarchy.children(&node.id) {
                match child.weight {
                    Some(w) => lines.push(format!(
                        "  子指标 {} (id={}, 权重{}): {}",
                        child.name, child.id, w, child.description
                    )),
                    None => lines.push(format!(
                        "  子指标 {} (id={}): {}",
                        child.name, child.id, child.description
                    )),
                }
            }
        }
        lines.join("\n")
    }

    /// Payload for the generator. Requires an assembled refined intent; the
    /// raw utterance never reaches the generator.
    pub fn build_payload(&self, state: &SessionState) -> Result<GenerationPayload> {
        let refined = state.refined_intent.clone().ok_or_else(|| {
            AgentError::Generation("generation requested before intent was refined".to_string())
        })?;
        let mut payload = GenerationPayload {
            instruction: GENERATION_INSTRUCTION.to_string(),
            full_schema: self.schema.text().to_string(),
            metric_context: self.metric_context(state),
            refined_user_query: refined,
            prior_sql: None,
            prior_error_feedback: None,
        };
        if state.retry_count > 0 {
            payload.prior_sql = state.generated_sql.clone();
            payload.prior_error_feedback = state.failure.clone();
        }
        Ok(payload)
    }
}
