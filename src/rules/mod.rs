//! Rule engine
//!
//! A recursive boolean AST over torrent attributes, shared by automations
//! and the controllers that need scoping. Evaluation is pure: the result
//! depends only on the condition, the torrent, and the `EvalContext`.

mod eval;
mod projection;

pub use eval::{evaluate, CategoryEntry, EvalContext};
pub use projection::{FreeSpaceProjection, ProjectionSet};

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Hard cap on AST depth; deeper trees evaluate to false
pub const MAX_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleField {
    Name,
    Hash,
    Category,
    Tags,
    SavePath,
    ContentPath,
    State,
    Tracker,
    Comment,
    Size,
    TotalSize,
    Downloaded,
    Uploaded,
    AmountLeft,
    FreeSpace,
    AddedOn,
    CompletionOn,
    LastActivity,
    SeedingTime,
    TimeActive,
    AddedOnAge,
    CompletionOnAge,
    LastActivityAge,
    Ratio,
    Progress,
    Availability,
    DlSpeed,
    UpSpeed,
    NumSeeds,
    NumLeechs,
    NumComplete,
    NumIncomplete,
    TrackersCount,
    Private,
    IsUnregistered,
    HardlinkScope,
    HasMissingFiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equal,
    NotEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    ExistsIn,
    ContainsIn,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Between,
}

/// Group node: AND/OR over children, with optional negation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCondition {
    pub operator: GroupOperator,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Leaf node: one typed comparison against a torrent attribute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafCondition {
    pub field: RuleField,
    pub operator: RuleOperator,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    /// Lazily compiled regex for `matches`, cached on the node
    #[serde(skip)]
    pub(crate) compiled: OnceLock<Option<regex::Regex>>,
}

impl LeafCondition {
    pub fn new(field: RuleField, operator: RuleOperator, value: serde_json::Value) -> Self {
        Self {
            field,
            operator,
            value: Some(value),
            min_value: None,
            max_value: None,
            compiled: OnceLock::new(),
        }
    }

    pub(crate) fn regex(&self) -> Option<&regex::Regex> {
        self.compiled
            .get_or_init(|| {
                let pattern = self.value.as_ref()?.as_str()?;
                regex::Regex::new(pattern).ok()
            })
            .as_ref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Condition {
    Group(GroupCondition),
    Leaf(LeafCondition),
}

impl Condition {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::Group(GroupCondition {
            operator: GroupOperator::And,
            negate: false,
            conditions,
        })
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self::Group(GroupCondition {
            operator: GroupOperator::Or,
            negate: false,
            conditions,
        })
    }

    pub fn leaf(field: RuleField, operator: RuleOperator, value: serde_json::Value) -> Self {
        Self::Leaf(LeafCondition::new(field, operator, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_json_shape() {
        let raw = r#"{
            "type": "group",
            "operator": "and",
            "conditions": [
                {"type": "leaf", "field": "name", "operator": "contains", "value": "ubuntu"},
                {"type": "leaf", "field": "ratio", "operator": "greater_or_equal", "value": 1.5}
            ]
        }"#;
        let cond: Condition = serde_json::from_str(raw).unwrap();
        match cond {
            Condition::Group(g) => {
                assert_eq!(g.operator, GroupOperator::And);
                assert_eq!(g.conditions.len(), 2);
                assert!(!g.negate);
            }
            Condition::Leaf(_) => panic!("expected group"),
        }
    }

    #[test]
    fn test_leaf_camel_case_fields() {
        let raw = r#"{"type": "leaf", "field": "addedOnAge", "operator": "between",
                      "minValue": 60, "maxValue": 3600}"#;
        let cond: Condition = serde_json::from_str(raw).unwrap();
        match cond {
            Condition::Leaf(l) => {
                assert_eq!(l.field, RuleField::AddedOnAge);
                assert_eq!(l.operator, RuleOperator::Between);
                assert_eq!(l.min_value, Some(60.0));
                assert_eq!(l.max_value, Some(3600.0));
            }
            Condition::Group(_) => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_regex_cache_compiles_once() {
        let leaf = LeafCondition::new(
            RuleField::Name,
            RuleOperator::Matches,
            serde_json::json!("^ubuntu.*$"),
        );
        let first = leaf.regex().map(|r| r.as_str().to_string());
        let second = leaf.regex().map(|r| r.as_str().to_string());
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some("^ubuntu.*$"));
    }

    #[test]
    fn test_invalid_regex_caches_none() {
        let leaf = LeafCondition::new(
            RuleField::Name,
            RuleOperator::Matches,
            serde_json::json!("(unclosed"),
        );
        assert!(leaf.regex().is_none());
        assert!(leaf.regex().is_none());
    }
}
