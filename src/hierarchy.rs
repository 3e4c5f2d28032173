//! Metric hierarchy index.
//!
//! The metric taxonomy is loaded once at startup from a flat-record JSON
//! document and is immutable afterwards. Construction validates the tree
//! shape; any inconsistency is fatal (no partial index).

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricNode {
    pub id: String,
    pub name: String,
    pub level: u32,
    #[serde(default)]
    pub parent: Option<String>,
    /// Sibling weights under one parent sum to 1 when all are present.
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Immutable in-memory index over the metric tree.
#[derive(Debug)]
pub struct MetricHierarchy {
    nodes: HashMap<String, MetricNode>,
    /// Insertion order of node ids, used to keep child listings stable.
    order: Vec<String>,
    children: HashMap<String, Vec<String>>,
    by_term: HashMap<String, Vec<String>>,
}

fn normalize_term(s: &str) -> String {
    s.trim().to_lowercase()
}

impl MetricHierarchy {
    pub fn from_nodes(records: Vec<MetricNode>) -> Result<Self> {
        let mut nodes: HashMap<String, MetricNode> = HashMap::new();
        let mut order = Vec::with_capacity(records.len());

        for node in records {
            if nodes.contains_key(&node.id) {
                return Err(AgentError::Hierarchy(format!(
                    "duplicate metric id '{}'",
                    node.id
                )));
            }
            order.push(node.id.clone());
            nodes.insert(node.id.clone(), node);
        }

        // Orphan check before any traversal.
        for node in nodes.values() {
            if let Some(ref parent_id) = node.parent {
                if !nodes.contains_key(parent_id) {
                    return Err(AgentError::Hierarchy(format!(
                        "metric '{}' references unknown parent '{}'",
                        node.id, parent_id
                    )));
                }
            }
        }

        // Cycle check: walk the parent chain of every node.
        for start in nodes.keys() {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut current = start.as_str();
            while let Some(parent_id) = nodes[current].parent.as_deref() {
                if !seen.insert(current) {
                    return Err(AgentError::Hierarchy(format!(
                        "cycle detected through metric '{}'",
                        start
                    )));
                }
                current = parent_id;
            }
        }

        // Level consistency: roots at 1, children exactly one below parent.
        for node in nodes.values() {
            match node.parent.as_deref() {
                None => {
                    if node.level != 1 {
                        return Err(AgentError::Hierarchy(format!(
                            "root metric '{}' has level {}, expected 1",
                            node.id, node.level
                        )));
                    }
                }
                Some(parent_id) => {
                    let parent_level = nodes[parent_id].level;
                    if node.level != parent_level + 1 {
                        return Err(AgentError::Hierarchy(format!(
                            "metric '{}' has level {} under parent '{}' at level {}",
                            node.id, node.level, parent_id, parent_level
                        )));
                    }
                }
            }
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for id in &order {
            if let Some(parent_id) = nodes[id].parent.clone() {
                children.entry(parent_id).or_default().push(id.clone());
            }
        }

        let mut by_term: HashMap<String, Vec<String>> = HashMap::new();
        for id in &order {
            let node = &nodes[id];
            by_term
                .entry(normalize_term(&node.name))
                .or_default()
                .push(id.clone());
            for syn in &node.synonyms {
                by_term
                    .entry(normalize_term(syn))
                    .or_default()
                    .push(id.clone());
            }
        }

        Ok(Self {
            nodes,
            order,
            children,
            by_term,
        })
    }

    pub fn from_json(json_str: &str) -> Result<Self> {
        let records: Vec<MetricNode> = serde_json::from_str(json_str)
            .map_err(|e| AgentError::Hierarchy(format!("failed to parse hierarchy JSON: {}", e)))?;
        Self::from_nodes(records)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Hierarchy(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    pub fn node(&self, id: &str) -> Option<&MetricNode> {
        self.nodes.get(id)
    }

    /// All nodes in definition order.
    pub fn nodes(&self) -> impl Iterator<Item = &MetricNode> {
        self.order.iter().map(move |id| &self.nodes[id])
    }

    /// Exact name/synonym lookup. Fuzzy matching lives in the resolver.
    pub fn lookup_by_term(&self, text: &str) -> Vec<&MetricNode> {
        self.by_term
            .get(&normalize_term(text))
            .map(|ids| ids.iter().map(|id| &self.nodes[id]).collect())
            .unwrap_or_default()
    }

    pub fn children(&self, id: &str) -> Vec<&MetricNode> {
        self.children
            .get(id)
            .map(|ids| ids.iter().map(|cid| &self.nodes[cid]).collect())
            .unwrap_or_default()
    }

    /// Parent-to-root chain.
    pub fn ancestors(&self, id: &str) -> Vec<&MetricNode> {
        let mut chain = Vec::new();
        let mut current = self.nodes.get(id).and_then(|n| n.parent.as_deref());
        while let Some(parent_id) = current {
            let parent = &self.nodes[parent_id];
            chain.push(parent);
            current = parent.parent.as_deref();
        }
        chain
    }

    pub fn is_leaf(&self, id: &str) -> bool {
        self.children.get(id).map_or(true, |c| c.is_empty())
    }

    /// True when every direct child carries a weight, i.e. a weighted
    /// composite score is computable for this node.
    pub fn all_children_weighted(&self, id: &str) -> bool {
        let children = self.children(id);
        !children.is_empty() && children.iter().all(|c| c.weight.is_some())
    }

    /// Human-readable definition for a metric, including its children when
    /// it is a parent. Used for metric-definition answers.
    pub fn definition_text(&self, id: &str) -> Option<String> {
        let node = self.nodes.get(id)?;
        let mut lines = vec![format!("**{}**: {}", node.name, node.description)];
        let children = self.children(id);
        if !children.is_empty() {
            lines.push("包含二级指标:".to_string());
            for child in children {
                lines.push(format!("  - {}: {}", child.name, child.description));
            }
        }
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, name: &str, level: u32, parent: Option<&str>, weight: Option<f64>) -> MetricNode {
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

    fn education_nodes() -> Vec<MetricNode> {
        vec![
            node("infra", "基础设施", 1, None, None),
            node("infra_net", "网络", 2, Some("infra"), Some(0.3)),
            node("infra_term", "终端", 2, Some("infra"), Some(0.4)),
            node("infra_room", "教室", 2, Some("infra"), Some(0.3)),
            node("literacy", "数字素养", 1, None, None),
            node("literacy_student", "学生数字素养", 2, Some("literacy"), None),
            node("literacy_teacher", "教师数字素养", 2, Some("literacy"), Some(0.5)),
        ]
    }

    #[test]
    fn test_build_and_query() {
        let h = MetricHierarchy::from_nodes(education_nodes()).unwrap();
        assert_eq!(h.lookup_by_term("基础设施")[0].id, "infra");
        assert!(h.lookup_by_term("不存在的指标").is_empty());

        let children: Vec<&str> = h.children("infra").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(children, vec!["infra_net", "infra_term", "infra_room"]);

        assert!(h.is_leaf("infra_net"));
        assert!(!h.is_leaf("infra"));

        let ancestors: Vec<&str> = h.ancestors("infra_net").iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ancestors, vec!["infra"]);
    }

    #[test]
    fn test_synonym_lookup() {
        let mut nodes = education_nodes();
        nodes[0].synonyms = vec!["信息化基础".to_string()];
        let h = MetricHierarchy::from_nodes(nodes).unwrap();
        assert_eq!(h.lookup_by_term("信息化基础")[0].id, "infra");
        // Lookup normalizes case and surrounding whitespace.
        assert_eq!(h.lookup_by_term(" 基础设施 ")[0].id, "infra");
    }

    #[test]
    fn test_weighted_children() {
        let h = MetricHierarchy::from_nodes(education_nodes()).unwrap();
        assert!(h.all_children_weighted("infra"));
        // 学生数字素养 carries no weight.
        assert!(!h.all_children_weighted("literacy"));
        // Leaves have no children to weight.
        assert!(!h.all_children_weighted("infra_net"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut nodes = education_nodes();
        nodes.push(node("infra", "重复", 1, None, None));
        let err = MetricHierarchy::from_nodes(nodes).unwrap_err();
        assert!(matches!(err, AgentError::Hierarchy(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_orphan_parent_rejected() {
        let mut nodes = education_nodes();
        nodes.push(node("stray", "孤儿", 2, Some("missing"), None));
        let err = MetricHierarchy::from_nodes(nodes).unwrap_err();
        assert!(err.to_string().contains("unknown parent"));
    }

    #[test]
    fn test_cycle_rejected() {
        let nodes = vec![
            node("a", "甲", 1, Some("b"), None),
            node("b", "乙", 2, Some("a"), None),
        ];
        let err = MetricHierarchy::from_nodes(nodes).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_level_mismatch_rejected() {
        let nodes = vec![
            node("a", "甲", 1, None, None),
            node("b", "乙", 3, Some("a"), None),
        ];
        let err = MetricHierarchy::from_nodes(nodes).unwrap_err();
        assert!(err.to_string().contains("level"));
    }

    #[test]
    fn test_root_level_must_be_one() {
        let nodes = vec![node("a", "甲", 2, None, None)];
        assert!(MetricHierarchy::from_nodes(nodes).is_err());
    }
}
