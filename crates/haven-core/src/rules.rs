use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{RuleId, RuleLogId};

/// A camera referenced by a rule, with the channels to watch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraRef {
    pub camera_id: String,
    pub channels: Vec<u32>,
}

/// One automation rule: watch cameras, evaluate a natural-language condition,
/// execute or propose actions when it holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerRule {
    pub id: RuleId,
    pub name: String,
    pub enabled: bool,
    pub cameras: Vec<CameraRef>,
    /// Natural-language condition evaluated by the vision model.
    pub condition: String,
    pub execute_info: ExecuteInfo,
    #[serde(default)]
    pub filter: TriggerFilter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteMode {
    /// Fully-resolved actions, executed synchronously at firing time.
    Static,
    /// Action descriptions only; resolved by a dynamic execution agent.
    Dynamic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteInfo {
    pub mode: ExecuteMode,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub action_descriptions: Vec<String>,
    /// Tool sources a dynamic execution is allowed to use.
    #[serde(default)]
    pub tool_source_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<String>,
}

/// A fully-resolved, directly-invocable unit of execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    pub tool_source_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_source_display_name: String,
    pub human_introduction: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TriggerFilter {
    /// Cron expression; when set, the rule only fires while the current
    /// minute matches it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_period: Option<String>,
    /// Minimum seconds between firings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    /// At most `count` firings per `window_secs` sliding window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<FrequencyFilter>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FrequencyFilter {
    pub count: u32,
    pub window_secs: u64,
}

/// Three-way classification of the vision model's answer for one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConditionCode {
    /// Nothing happened: no memory update, no firing.
    Nothing,
    /// New qualifying occurrence: update memory, firing-eligible.
    NewOccurrence,
    /// Same ongoing occurrence: update memory, not firing-eligible.
    Ongoing,
}

impl ConditionCode {
    pub fn updates_memory(&self) -> bool {
        matches!(self, Self::NewOccurrence | Self::Ongoing)
    }

    pub fn is_firing_eligible(&self) -> bool {
        matches!(self, Self::NewOccurrence)
    }
}

impl TryFrom<u8> for ConditionCode {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Nothing),
            1 => Ok(Self::NewOccurrence),
            2 => Ok(Self::Ongoing),
            other => Err(format!("condition code out of range: {other}")),
        }
    }
}

impl From<ConditionCode> for u8 {
    fn from(c: ConditionCode) -> u8 {
        match c {
            ConditionCode::Nothing => 0,
            ConditionCode::NewOccurrence => 1,
            ConditionCode::Ongoing => 2,
        }
    }
}

/// Per-channel outcome of one evaluation round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConditionResult {
    pub camera_id: String,
    pub channel: u32,
    pub code: ConditionCode,
    /// Persisted frame paths for motion-positive channels.
    #[serde(default)]
    pub frame_paths: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    /// Dynamic execution still in flight.
    Pending,
    Success,
    Failed,
}

/// Per-action outcome recorded for static firings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub tool_source_id: String,
    pub tool_name: String,
    pub success: bool,
    pub output: String,
}

/// Execution outcome attached to a log row. Written synchronously for static
/// firings; for dynamic firings it starts Pending and is updated exactly once
/// when the execution completes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub status: ExecuteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub action_outcomes: Vec<ActionOutcome>,
    /// Dynamic executions merge their instruction transcript here.
    #[serde(default)]
    pub transcript: Vec<Value>,
}

impl ExecuteResult {
    pub fn pending() -> Self {
        Self {
            status: ExecuteStatus::Pending,
            summary: None,
            action_outcomes: Vec::new(),
            transcript: Vec::new(),
        }
    }
}

/// Immutable-once-written record of one firing, save for the single dynamic
/// execute_result update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerRuleLog {
    pub id: RuleLogId,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub fired_at: DateTime<Utc>,
    pub condition_results: Vec<ConditionResult>,
    pub execute_result: ExecuteResult,
}
