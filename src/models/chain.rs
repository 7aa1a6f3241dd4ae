//! Chain records and the tree nodes built from them.
//!
//! A `Chain` is stored flat (one record per unit or group, linked by
//! `parent_id`). `ChainTreeNode` only exists in memory as the output of
//! `tree::build_tree`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record classification. Anything that is not `group` behaves as a unit;
/// custom flavours are kept verbatim so they round-trip through storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChainType {
    #[default]
    Unit,
    Group,
    Flavor(String),
}

impl ChainType {
    pub fn as_str(&self) -> &str {
        match self {
            ChainType::Unit => "unit",
            ChainType::Group => "group",
            ChainType::Flavor(name) => name,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ChainType::Group)
    }
}

impl From<String> for ChainType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "unit" => ChainType::Unit,
            "group" => ChainType::Group,
            _ => ChainType::Flavor(value),
        }
    }
}

impl From<ChainType> for String {
    fn from(value: ChainType) -> Self {
        value.as_str().to_string()
    }
}

fn default_repeat_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chain {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    pub sort_order: i64,

    pub trigger: String,
    /// Planned length in minutes; ignored when `is_durationless`.
    pub duration: u32,
    pub is_durationless: bool,
    pub description: String,

    pub auxiliary_signal: String,
    /// Booking window in minutes.
    pub auxiliary_duration: u32,
    pub auxiliary_completion_trigger: String,

    pub current_streak: u32,
    pub auxiliary_streak: u32,
    pub total_completions: u32,
    pub total_failures: u32,
    pub auxiliary_failures: u32,

    #[serde(default = "default_repeat_count")]
    pub task_repeat_count: u32,

    pub exceptions: Vec<String>,
    pub auxiliary_exceptions: Vec<String>,

    pub time_limit_hours: Option<u32>,
    pub group_started_at: Option<DateTime<Utc>>,
    pub group_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Default for Chain {
    fn default() -> Self {
        Self {
            id: String::new(),
            parent_id: None,
            name: String::new(),
            chain_type: ChainType::Unit,
            sort_order: 0,
            trigger: String::new(),
            duration: 25,
            is_durationless: false,
            description: String::new(),
            auxiliary_signal: String::new(),
            auxiliary_duration: 15,
            auxiliary_completion_trigger: String::new(),
            current_streak: 0,
            auxiliary_streak: 0,
            total_completions: 0,
            total_failures: 0,
            auxiliary_failures: 0,
            task_repeat_count: 1,
            exceptions: Vec::new(),
            auxiliary_exceptions: Vec::new(),
            time_limit_hours: None,
            group_started_at: None,
            group_expires_at: None,
            created_at: DateTime::<Utc>::default(),
            last_completed_at: None,
            deleted_at: None,
        }
    }
}

impl Chain {
    pub fn new(name: impl Into<String>, chain_type: ChainType, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            chain_type,
            created_at,
            ..Self::default()
        }
    }

    pub fn is_group(&self) -> bool {
        self.chain_type.is_group()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Repeat count clamped to at least one completion.
    pub fn repeat_count(&self) -> u32 {
        self.task_repeat_count.max(1)
    }

    /// A unit is done for the current group cycle once its streak reaches the repeat count.
    pub fn is_unit_complete(&self) -> bool {
        self.current_streak >= self.repeat_count()
    }

    pub fn planned_minutes(&self) -> u32 {
        if self.is_durationless {
            0
        } else {
            self.duration
        }
    }

    pub fn has_time_limit(&self) -> bool {
        self.is_group() && self.time_limit_hours.is_some()
    }

    pub fn is_group_timer_running(&self) -> bool {
        self.group_started_at.is_some() && self.group_expires_at.is_some()
    }

    /// Starts the group-cycle clock. Returns false when no limit is set or a clock already runs.
    pub fn start_group_timer(&mut self, now: DateTime<Utc>) -> bool {
        let Some(hours) = self.time_limit_hours.filter(|_| self.is_group()) else {
            return false;
        };
        if self.is_group_timer_running() {
            return false;
        }
        self.group_started_at = Some(now);
        self.group_expires_at = Some(now + Duration::hours(i64::from(hours)));
        true
    }

    pub fn clear_group_timer(&mut self) {
        self.group_started_at = None;
        self.group_expires_at = None;
    }

    /// Appends a main-chain exception rule. Exact, case-sensitive name match.
    pub fn add_exception(&mut self, rule: &str) -> bool {
        push_unique(&mut self.exceptions, rule)
    }

    pub fn add_auxiliary_exception(&mut self, rule: &str) -> bool {
        push_unique(&mut self.auxiliary_exceptions, rule)
    }

    pub fn has_exception(&self, rule: &str) -> bool {
        self.exceptions.iter().any(|existing| existing == rule)
    }

    pub fn has_auxiliary_exception(&self, rule: &str) -> bool {
        self.auxiliary_exceptions.iter().any(|existing| existing == rule)
    }
}

fn push_unique(list: &mut Vec<String>, rule: &str) -> bool {
    if list.iter().any(|existing| existing == rule) {
        return false;
    }
    list.push(rule.to_string());
    true
}

/// A chain decorated with its resolved children. Read-only for consumers;
/// changes go through `Chain` records and a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTreeNode {
    #[serde(flatten)]
    pub chain: Chain,
    pub children: Vec<ChainTreeNode>,
    pub depth: u32,
}

impl ChainTreeNode {
    pub fn id(&self) -> &str {
        &self.chain.id
    }

    pub fn is_group(&self) -> bool {
        self.chain.is_group()
    }

    /// Pre-order walk over this node and every descendant.
    pub fn walk(&self) -> Vec<&ChainTreeNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node);
            for child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_type_round_trips_custom_flavours() {
        let json = r#"{"id":"a","type":"deepwork"}"#;
        let chain: Chain = serde_json::from_str(json).unwrap();
        assert_eq!(chain.chain_type, ChainType::Flavor("deepwork".into()));
        assert!(!chain.is_group());

        let value = serde_json::to_value(&chain).unwrap();
        assert_eq!(value["type"], "deepwork");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let chain: Chain = serde_json::from_str(r#"{"name":"no id"}"#).unwrap();
        assert!(chain.id.is_empty());
        assert_eq!(chain.task_repeat_count, 1);
        assert_eq!(chain.chain_type, ChainType::Unit);
    }

    #[test]
    fn exceptions_are_case_sensitive_and_unique() {
        let mut chain = Chain::default();
        assert!(chain.add_auxiliary_exception("bathroom"));
        assert!(!chain.add_auxiliary_exception("bathroom"));
        assert!(chain.add_auxiliary_exception("Bathroom"));
        assert_eq!(chain.auxiliary_exceptions.len(), 2);
    }

    #[test]
    fn group_timer_only_starts_once() {
        let now = Utc::now();
        let mut group = Chain::new("g", ChainType::Group, now);
        group.time_limit_hours = Some(2);

        assert!(group.start_group_timer(now));
        assert_eq!(group.group_expires_at, Some(now + Duration::hours(2)));
        assert!(!group.start_group_timer(now + Duration::minutes(5)));
        assert_eq!(group.group_started_at, Some(now));
    }
}
