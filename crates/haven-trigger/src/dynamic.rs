use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{info, instrument, warn};

use haven_core::ids::{RequestId, RuleLogId, RuleId, SessionId};
use haven_core::messages::ChatMessage;
use haven_core::rules::{ExecuteResult, ExecuteStatus, TriggerRule};
use haven_engine::context::{RequestContext, RequestContextStore};
use haven_engine::dialog::{Outbox, Transcript};
use haven_engine::executor::ToolExecutor;
use haven_engine::runner::{AgentRunner, NullObserver, RunOutcome, RunnerConfig};
use haven_llm::client::{ClientRegistry, Purpose};
use haven_store::RuleLogRepo;

/// Wall-clock budget for one dynamic execution, well above any single ask
/// or LLM call timeout underneath it.
const EXECUTION_BUDGET: Duration = Duration::from_secs(120);

const SYSTEM_PROMPT: &str = "You are a home automation executor. A trigger \
rule just fired. Carry out the listed actions using the available tools, \
then reply with a short summary of what you did. Do not invent actions \
beyond the list.";

/// Append-only instruction record for one dynamic execution, readable while
/// it grows. Late joiners replay from an index cursor and then follow live;
/// the cursor contract guarantees no skip and no duplicate.
#[derive(Default)]
pub struct LiveTranscript {
    entries: Mutex<Vec<Value>>,
    notify: Notify,
    done: AtomicBool,
}

impl LiveTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: Value) {
        self.entries.lock().push(entry);
        self.notify.notify_waiters();
    }

    fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.entries.lock().clone()
    }

    /// Everything at or past `cursor` right now, without waiting.
    pub fn read_from(&self, cursor: usize) -> (Vec<Value>, bool) {
        let entries = self.entries.lock();
        let batch = if cursor < entries.len() {
            entries[cursor..].to_vec()
        } else {
            Vec::new()
        };
        (batch, self.is_done())
    }

    /// Wait until there is something past `cursor` or the run finishes.
    /// Returns the new batch and whether the transcript is complete. The
    /// caller advances its cursor by the batch length; entries are never
    /// re-delivered and never skipped.
    pub async fn wait_from(&self, cursor: usize) -> (Vec<Value>, bool) {
        loop {
            // Register for wakeup before checking, so a push landing between
            // the check and the await cannot be lost.
            let notified = self.notify.notified();
            {
                let entries = self.entries.lock();
                if cursor < entries.len() {
                    return (entries[cursor..].to_vec(), self.is_done());
                }
                if self.is_done() {
                    return (Vec::new(), true);
                }
            }
            notified.await;
        }
    }
}

/// Spawns and tracks dynamic executions: at most one in flight per rule id,
/// each with a followable transcript merged into its log row on completion.
pub struct DynamicExecutor {
    clients: Arc<ClientRegistry>,
    tools: Arc<ToolExecutor>,
    logs: RuleLogRepo,
    contexts: Arc<RequestContextStore>,
    in_flight: Mutex<HashSet<RuleId>>,
    transcripts: DashMap<RuleLogId, Arc<LiveTranscript>>,
}

impl DynamicExecutor {
    pub fn new(clients: Arc<ClientRegistry>, tools: Arc<ToolExecutor>, logs: RuleLogRepo) -> Self {
        Self {
            clients,
            tools,
            logs,
            contexts: Arc::new(RequestContextStore::default()),
            in_flight: Mutex::new(HashSet::new()),
            transcripts: DashMap::new(),
        }
    }

    /// Request contexts for in-flight executions. Agents spawned by a tool
    /// call hold only the request_id and recover the rest from here.
    pub fn contexts(&self) -> &Arc<RequestContextStore> {
        &self.contexts
    }

    pub fn is_in_flight(&self, rule_id: &RuleId) -> bool {
        self.in_flight.lock().contains(rule_id)
    }

    /// Live transcript for a running (or just-finished, not yet reaped)
    /// execution, keyed by its log row.
    pub fn transcript(&self, log_id: &RuleLogId) -> Option<Arc<LiveTranscript>> {
        self.transcripts.get(log_id).map(|e| e.value().clone())
    }

    /// Start a dynamic execution for one firing. Returns false without
    /// spawning anything when the rule already has an execution in flight.
    #[instrument(skip(self, rule), fields(rule_id = %rule.id, log_id = %log_id))]
    pub fn spawn(self: &Arc<Self>, rule: TriggerRule, log_id: RuleLogId) -> bool {
        {
            // Check-and-insert under one lock; the dedup decision and the
            // claim are atomic.
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(rule.id.clone()) {
                return false;
            }
        }

        let transcript = Arc::new(LiveTranscript::new());
        self.transcripts.insert(log_id.clone(), transcript.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let rule_id = rule.id.clone();
            let result = this.run_one(rule, &log_id, &transcript).await;

            transcript.finish();
            if let Err(e) = this.logs.update_execute_result(&log_id, &result) {
                warn!(log_id = %log_id, error = %e, "failed to record dynamic result");
            }
            this.transcripts.remove(&log_id);
            // Unconditional: the rule must be re-runnable whatever happened.
            this.in_flight.lock().remove(&rule_id);
        });
        true
    }

    async fn run_one(
        &self,
        rule: TriggerRule,
        log_id: &RuleLogId,
        live: &Arc<LiveTranscript>,
    ) -> ExecuteResult {
        let client = match self.clients.get(Purpose::Planning) {
            Ok(client) => client,
            Err(e) => {
                warn!(log_id = %log_id, error = %e, "no planning model bound");
                return failed_result(live, format!("no planning model: {e}"));
            }
        };

        let source_filter = if rule.execute_info.tool_source_ids.is_empty() {
            None
        } else {
            Some(rule.execute_info.tool_source_ids.as_slice())
        };
        let tools = self.tools.schemas(source_filter, &[]).await;

        let actions = rule
            .execute_info
            .action_descriptions
            .iter()
            .map(|d| format!("- {d}"))
            .collect::<Vec<_>>()
            .join("\n");
        let history = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user_text(format!(
                "Rule \"{}\" fired (condition: {}).\nActions to carry out:\n{actions}",
                rule.name, rule.condition
            )),
        ];

        // The outbox forwards every instruction to the live transcript as it
        // is emitted; a forwarder task keeps append order.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward_to = live.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match serde_json::to_value(&envelope) {
                    Ok(value) => forward_to.push(value),
                    Err(e) => warn!(error = %e, "unencodable envelope"),
                }
            }
        });

        let request_id = RequestId::new();
        self.contexts.insert(
            request_id.clone(),
            RequestContext {
                live: Some(tx.clone()),
                camera_ids: rule.cameras.iter().map(|c| c.camera_id.clone()).collect(),
                tool_source_ids: rule.execute_info.tool_source_ids.clone(),
                ..Default::default()
            },
        );

        let outbox = Outbox::new(
            SessionId::new(),
            request_id.clone(),
            Arc::new(Transcript::new()),
            Some(tx),
        );

        let runner = AgentRunner::new(client, self.tools.clone(), RunnerConfig::default());
        let run = runner.run(history, tools, &outbox, &NullObserver);

        let result = match tokio::time::timeout(EXECUTION_BUDGET, run).await {
            Ok((outcome, history)) => {
                let summary = last_assistant_text(&history);
                info!(log_id = %log_id, ?outcome, "dynamic execution finished");
                ExecuteResult {
                    status: if outcome == RunOutcome::Completed {
                        ExecuteStatus::Success
                    } else {
                        ExecuteStatus::Failed
                    },
                    summary,
                    action_outcomes: Vec::new(),
                    transcript: Vec::new(),
                }
            }
            Err(_) => {
                warn!(log_id = %log_id, "dynamic execution timed out");
                ExecuteResult {
                    status: ExecuteStatus::Failed,
                    summary: Some("execution timed out".into()),
                    action_outcomes: Vec::new(),
                    transcript: Vec::new(),
                }
            }
        };

        // Let the forwarder drain before merging. Both sender handles (the
        // outbox's and the context's) must go first or the drain never ends.
        drop(outbox);
        self.contexts.remove(&request_id);
        let _ = forwarder.await;

        ExecuteResult {
            transcript: live.snapshot(),
            ..result
        }
    }
}

fn failed_result(live: &Arc<LiveTranscript>, summary: String) -> ExecuteResult {
    ExecuteResult {
        status: ExecuteStatus::Failed,
        summary: Some(summary),
        action_outcomes: Vec::new(),
        transcript: live.snapshot(),
    }
}

fn last_assistant_text(history: &[ChatMessage]) -> Option<String> {
    history.iter().rev().find_map(|msg| match msg {
        ChatMessage::Assistant {
            content: Some(text),
            ..
        } if !text.is_empty() => Some(text.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use haven_core::rules::{
        CameraRef, ConditionResult, ExecuteInfo, ExecuteMode, TriggerFilter, TriggerRuleLog,
    };
    use haven_engine::toolsource::ToolSourceRegistry;
    use haven_llm::mock::{MockChatClient, MockReply};
    use haven_store::Database;

    fn dynamic_rule() -> TriggerRule {
        TriggerRule {
            id: RuleId::new(),
            name: "porch light".into(),
            enabled: true,
            cameras: vec![CameraRef {
                camera_id: "cam_front".into(),
                channels: vec![0],
            }],
            condition: "a person is at the door".into(),
            execute_info: ExecuteInfo {
                mode: ExecuteMode::Dynamic,
                actions: vec![],
                action_descriptions: vec!["turn on the porch light".into()],
                tool_source_ids: vec![],
                notification: None,
            },
            filter: TriggerFilter::default(),
        }
    }

    fn pending_log(rule: &TriggerRule) -> TriggerRuleLog {
        TriggerRuleLog {
            id: RuleLogId::new(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            fired_at: Utc::now(),
            condition_results: vec![ConditionResult {
                camera_id: "cam_front".into(),
                channel: 0,
                code: haven_core::rules::ConditionCode::NewOccurrence,
                frame_paths: vec![],
            }],
            execute_result: ExecuteResult::pending(),
        }
    }

    fn executor_with(replies: Vec<MockReply>) -> (Arc<DynamicExecutor>, RuleLogRepo) {
        let clients = ClientRegistry::new();
        clients.bind(Purpose::Planning, Arc::new(MockChatClient::new(replies)));

        let tools = Arc::new(ToolExecutor::new(Arc::new(ToolSourceRegistry::new())));
        let db = Database::in_memory().unwrap();
        let logs = RuleLogRepo::new(db);

        (
            Arc::new(DynamicExecutor::new(Arc::new(clients), tools, logs.clone())),
            logs,
        )
    }

    async fn wait_done(executor: &DynamicExecutor, rule_id: &RuleId) {
        for _ in 0..100 {
            if !executor.is_in_flight(rule_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dynamic execution never finished");
    }

    #[tokio::test]
    async fn execution_merges_transcript_and_updates_log_once() {
        let (executor, logs) = executor_with(vec![MockReply::stream_text("porch light is on")]);
        let rule = dynamic_rule();
        let log = pending_log(&rule);
        logs.append(&log).unwrap();

        assert!(executor.spawn(rule.clone(), log.id.clone()));
        wait_done(&executor, &rule.id).await;

        let stored = logs.get(&log.id).unwrap();
        assert_eq!(stored.execute_result.status, ExecuteStatus::Success);
        assert_eq!(
            stored.execute_result.summary.as_deref(),
            Some("porch light is on")
        );
        // Request context reaped with the run.
        assert!(executor.contexts().is_empty());
        // Streamed chunks plus the finished envelope
        assert!(!stored.execute_result.transcript.is_empty());
        let last = stored.execute_result.transcript.last().unwrap();
        assert_eq!(last["namespace"], "dialog");
        assert_eq!(last["name"], "finished");
    }

    #[tokio::test]
    async fn second_spawn_for_same_rule_is_rejected() {
        let (executor, logs) = executor_with(vec![
            MockReply::delayed(
                Duration::from_millis(200),
                MockReply::stream_text("done"),
            ),
            MockReply::stream_text("never used"),
        ]);
        let rule = dynamic_rule();
        let first = pending_log(&rule);
        let second = pending_log(&rule);
        logs.append(&first).unwrap();
        logs.append(&second).unwrap();

        assert!(executor.spawn(rule.clone(), first.id.clone()));
        assert!(!executor.spawn(rule.clone(), second.id.clone()));
        assert!(executor.is_in_flight(&rule.id));

        wait_done(&executor, &rule.id).await;
        // After completion the rule may run again.
        let third = pending_log(&rule);
        logs.append(&third).unwrap();
        assert!(executor.spawn(rule, third.id));
    }

    #[tokio::test]
    async fn late_joiner_replays_without_skip_or_duplicate() {
        let (executor, logs) = executor_with(vec![MockReply::delayed(
            Duration::from_millis(50),
            MockReply::stream_text("one two three four"),
        )]);
        let rule = dynamic_rule();
        let log = pending_log(&rule);
        logs.append(&log).unwrap();

        assert!(executor.spawn(rule.clone(), log.id.clone()));
        let transcript = executor.transcript(&log.id).unwrap();

        // Follow from the start while the run is still producing.
        let mut seen: Vec<Value> = Vec::new();
        let mut cursor = 0usize;
        loop {
            let (batch, done) = transcript.wait_from(cursor).await;
            cursor += batch.len();
            seen.extend(batch);
            if done {
                // Drain whatever landed between the last batch and done.
                let (rest, _) = transcript.read_from(cursor);
                seen.extend(rest);
                break;
            }
        }

        wait_done(&executor, &rule.id).await;
        let stored = logs.get(&log.id).unwrap();
        assert_eq!(seen.len(), stored.execute_result.transcript.len());
        // No duplicates: every entry index appears exactly once, in order.
        for (mine, theirs) in seen.iter().zip(stored.execute_result.transcript.iter()) {
            assert_eq!(mine, theirs);
        }
    }

    #[tokio::test]
    async fn missing_planning_model_fails_cleanly() {
        let clients = Arc::new(ClientRegistry::new());
        let tools = Arc::new(ToolExecutor::new(Arc::new(ToolSourceRegistry::new())));
        let db = Database::in_memory().unwrap();
        let logs = RuleLogRepo::new(db);
        let executor = Arc::new(DynamicExecutor::new(clients, tools, logs.clone()));

        let rule = dynamic_rule();
        let log = pending_log(&rule);
        logs.append(&log).unwrap();

        assert!(executor.spawn(rule.clone(), log.id.clone()));
        wait_done(&executor, &rule.id).await;

        let stored = logs.get(&log.id).unwrap();
        assert_eq!(stored.execute_result.status, ExecuteStatus::Failed);
        assert!(!executor.is_in_flight(&rule.id));
    }
}
