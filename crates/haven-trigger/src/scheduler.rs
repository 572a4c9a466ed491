use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use haven_core::ids::{RuleId, RuleLogId};
use haven_core::rules::{
    ActionOutcome, ConditionCode, ConditionResult, ExecuteMode, ExecuteResult, ExecuteStatus,
    TriggerRule, TriggerRuleLog,
};
use haven_engine::toolsource::{ToolOutput, ToolSourceRegistry};
use haven_llm::client::ClientRegistry;
use haven_store::{FrameStore, RuleLogRepo};

use crate::dynamic::DynamicExecutor;
use crate::filters;
use crate::frames::FrameSource;
use crate::gate::{GateRegistry, MotionMemory};
use crate::motion;
use crate::vision::ConditionEvaluator;

const DEFAULT_TICK: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick: DEFAULT_TICK }
    }
}

/// Outcome of evaluating one (camera, channel) for a rule, frames still in
/// hand so they can be persisted if the rule fires.
struct ChannelOutcome {
    camera_id: String,
    channel: u32,
    code: ConditionCode,
    frames: Vec<Bytes>,
}

/// Fixed-tick rule evaluation pipeline: pre-filter, motion gate, concurrent
/// vision evaluation under per-rule single-flight gates, post-filter, then
/// static execution or dynamic delegation. Holds its own in-memory rule copy;
/// the CRUD surface keeps it in sync via add_rule/remove_rule.
pub struct TriggerScheduler {
    config: SchedulerConfig,
    rules: Mutex<HashMap<RuleId, TriggerRule>>,
    gates: GateRegistry,
    memory: MotionMemory,
    frame_source: Arc<dyn FrameSource>,
    evaluator: ConditionEvaluator,
    registry: Arc<ToolSourceRegistry>,
    dynamic: Arc<DynamicExecutor>,
    logs: RuleLogRepo,
    frames: Arc<FrameStore>,
}

impl TriggerScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        clients: Arc<ClientRegistry>,
        frame_source: Arc<dyn FrameSource>,
        registry: Arc<ToolSourceRegistry>,
        dynamic: Arc<DynamicExecutor>,
        logs: RuleLogRepo,
        frames: Arc<FrameStore>,
    ) -> Self {
        Self {
            config,
            rules: Mutex::new(HashMap::new()),
            gates: GateRegistry::new(),
            memory: MotionMemory::new(),
            frame_source,
            evaluator: ConditionEvaluator::new(clients),
            registry,
            dynamic,
            logs,
            frames,
        }
    }

    /// Seed the in-memory copy at startup.
    pub fn load_rules(&self, rules: Vec<TriggerRule>) {
        let mut map = self.rules.lock();
        map.clear();
        for rule in rules {
            map.insert(rule.id.clone(), rule);
        }
        info!(count = map.len(), "trigger rules loaded");
    }

    /// Keep the in-memory copy in sync after a create or update.
    pub fn add_rule(&self, rule: TriggerRule) {
        self.rules.lock().insert(rule.id.clone(), rule);
    }

    /// Keep the in-memory copy in sync after a delete. Drops the rule's gate
    /// and debounce state too.
    pub fn remove_rule(&self, rule_id: &RuleId) {
        self.rules.lock().remove(rule_id);
        self.gates.remove(rule_id);
        self.memory.forget_rule(rule_id);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    /// Tick until cancelled. Missed ticks are skipped, not bunched.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick = ?self.config.tick, "trigger scheduler running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("trigger scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick_at(Utc::now()).await;
                }
            }
        }
    }

    /// One full evaluation round at a given instant.
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) {
        // Pre-filter before any frame or LLM cost.
        let candidates: Vec<TriggerRule> = {
            let rules = self.rules.lock();
            rules
                .values()
                .filter(|rule| filters::pre_filter(rule, &self.gates.firings(&rule.id), now))
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        // Single-flight claim; a rule whose previous round is still out
        // skips this tick entirely rather than queueing.
        let mut claimed = Vec::new();
        for rule in candidates {
            if self.gates.try_acquire(&rule.id, now) {
                claimed.push(rule);
            } else {
                debug!(rule_id = %rule.id, "evaluation still in flight, skipping tick");
            }
        }
        if claimed.is_empty() {
            return;
        }

        // Fetch each (camera, channel) once, however many rules share it.
        let mut frame_cache: HashMap<(String, u32), Vec<Bytes>> = HashMap::new();
        for rule in &claimed {
            for camera in &rule.cameras {
                for &channel in &camera.channels {
                    let key = (camera.camera_id.clone(), channel);
                    if frame_cache.contains_key(&key) {
                        continue;
                    }
                    let frames = match self
                        .frame_source
                        .latest_frames(&camera.camera_id, channel)
                        .await
                    {
                        Ok(frames) => frames,
                        Err(e) => {
                            warn!(camera_id = %camera.camera_id, channel, error = %e, "frame fetch failed");
                            Vec::new()
                        }
                    };
                    frame_cache.insert(key, frames);
                }
            }
        }

        // Rules evaluate concurrently; each releases its own gate.
        futures::future::join_all(
            claimed
                .into_iter()
                .map(|rule| self.evaluate_rule(rule, &frame_cache, now)),
        )
        .await;
    }

    async fn evaluate_rule(
        &self,
        rule: TriggerRule,
        frame_cache: &HashMap<(String, u32), Vec<Bytes>>,
        now: DateTime<Utc>,
    ) {
        let rule_ref = &rule;
        let outcomes = futures::future::join_all(
            rule.cameras
                .iter()
                .flat_map(|camera| {
                    camera
                        .channels
                        .iter()
                        .map(move |&channel| (camera.camera_id.clone(), channel))
                })
                .map(|(camera_id, channel)| async move {
                    let frames = frame_cache
                        .get(&(camera_id.clone(), channel))
                        .cloned()
                        .unwrap_or_default();
                    if !motion::has_motion(&frames) {
                        return None;
                    }

                    let seen = self
                        .memory
                        .last(&rule_ref.id, &camera_id, channel)
                        .is_some();
                    let code = match self
                        .evaluator
                        .evaluate(&rule_ref.condition, &frames, seen)
                        .await
                    {
                        Ok(code) => code,
                        Err(e) => {
                            warn!(rule_id = %rule_ref.id, camera_id = %camera_id, channel, error = %e,
                                "condition evaluation failed");
                            ConditionCode::Nothing
                        }
                    };
                    Some(ChannelOutcome {
                        camera_id,
                        channel,
                        code,
                        frames,
                    })
                }),
        )
        .await;

        let outcomes: Vec<ChannelOutcome> = outcomes.into_iter().flatten().collect();

        let mut eligible = false;
        for outcome in &outcomes {
            if outcome.code.updates_memory() {
                if let Some(newest) = outcome.frames.last() {
                    self.memory.remember(
                        &rule.id,
                        &outcome.camera_id,
                        outcome.channel,
                        FrameStore::content_hash(newest),
                    );
                }
            }
            if outcome.code.is_firing_eligible() {
                eligible = true;
            }
        }

        // Post-filter and history write in one synchronous section.
        let fire = eligible && filters::post_filter(self.gates.last_firing(&rule.id), now);
        if fire {
            self.gates.record_firing(&rule.id, now);
            self.fire(&rule, outcomes, now).await;
        }

        self.gates.release(&rule.id);
    }

    /// Persist frames, write the single log row, and execute.
    #[instrument(skip(self, rule, outcomes), fields(rule_id = %rule.id, rule_name = %rule.name))]
    async fn fire(&self, rule: &TriggerRule, outcomes: Vec<ChannelOutcome>, now: DateTime<Utc>) {
        info!("trigger rule fired");

        let condition_results: Vec<ConditionResult> = outcomes
            .into_iter()
            .map(|outcome| {
                let frame_paths = outcome
                    .frames
                    .iter()
                    .filter_map(|frame| match self.frames.save(frame) {
                        Ok(path) => Some(path),
                        Err(e) => {
                            warn!(error = %e, "frame persistence failed");
                            None
                        }
                    })
                    .collect();
                ConditionResult {
                    camera_id: outcome.camera_id,
                    channel: outcome.channel,
                    code: outcome.code,
                    frame_paths,
                }
            })
            .collect();

        let log_id = RuleLogId::new();
        match rule.execute_info.mode {
            ExecuteMode::Static => {
                let execute_result = self.execute_static(rule).await;
                let log = TriggerRuleLog {
                    id: log_id,
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    fired_at: now,
                    condition_results,
                    execute_result,
                };
                if let Err(e) = self.logs.append(&log) {
                    warn!(error = %e, "failed to append rule log");
                }
            }
            ExecuteMode::Dynamic => {
                if self.dynamic.is_in_flight(&rule.id) {
                    debug!("dynamic execution already in flight, not spawning another");
                    return;
                }
                let log = TriggerRuleLog {
                    id: log_id.clone(),
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    fired_at: now,
                    condition_results,
                    execute_result: ExecuteResult::pending(),
                };
                if let Err(e) = self.logs.append(&log) {
                    warn!(error = %e, "failed to append rule log");
                    return;
                }
                if !self.dynamic.spawn(rule.clone(), log_id.clone()) {
                    // Lost a race with another firing path; close out the row.
                    let result = ExecuteResult {
                        status: ExecuteStatus::Failed,
                        summary: Some("duplicate execution suppressed".into()),
                        action_outcomes: Vec::new(),
                        transcript: Vec::new(),
                    };
                    if let Err(e) = self.logs.update_execute_result(&log_id, &result) {
                        warn!(error = %e, "failed to close duplicate log row");
                    }
                }
            }
        }
    }

    /// Run fully-resolved actions in order, recording each outcome.
    async fn execute_static(&self, rule: &TriggerRule) -> ExecuteResult {
        let mut action_outcomes = Vec::new();
        let mut all_ok = true;

        for action in &rule.execute_info.actions {
            let composite =
                ToolSourceRegistry::composite_name(&action.tool_source_id, &action.tool_name);
            let output = match self
                .registry
                .call(&composite, action.tool_input.clone())
                .await
            {
                Ok(output) => output,
                Err(e) => ToolOutput::error(e.to_string()),
            };
            if output.is_error {
                all_ok = false;
            }
            action_outcomes.push(ActionOutcome {
                tool_source_id: action.tool_source_id.clone(),
                tool_name: action.tool_name.clone(),
                success: !output.is_error,
                output: output.content,
            });
        }

        ExecuteResult {
            status: if all_ok {
                ExecuteStatus::Success
            } else {
                ExecuteStatus::Failed
            },
            summary: rule.execute_info.notification.clone(),
            action_outcomes,
            transcript: Vec::new(),
        }
    }
}
