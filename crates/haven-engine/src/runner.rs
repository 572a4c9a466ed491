use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tracing::{info, instrument, warn};

use haven_core::envelope::names;
use haven_core::messages::{ChatMessage, ChatRequest, ToolCallBlock, ToolSchema};

use haven_llm::accumulate::TurnAccumulator;
use haven_llm::client::ChatClient;

use crate::dialog::Outbox;
use crate::error::EngineError;
use crate::executor::ToolExecutor;
use crate::toolsource::ToolOutput;

pub const DEFAULT_MAX_STEPS: u32 = 8;

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub max_steps: u32,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Model finished with `finish_reason == "stop"`.
    Completed,
    /// max_steps elapsed without a stop.
    Exhausted,
    /// A step errored; an exception instruction was emitted first.
    Failed,
}

impl RunOutcome {
    pub fn success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Hook running after each tool result and once before the terminal finished
/// envelope. Observers see results but never alter control flow.
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn on_tool_result(&self, _call: &ToolCallBlock, _output: &ToolOutput) {}

    /// Optional summary payload emitted as an actions_summary instruction
    /// immediately before the finished envelope.
    async fn finish_summary(&self, _history: &[ChatMessage]) -> Option<Value> {
        None
    }
}

/// No-op observer for runs that do not watch tools.
pub struct NullObserver;

#[async_trait]
impl StepObserver for NullObserver {}

enum StepControl {
    Stop,
    Continue,
}

/// Think-act-observe loop over a streaming chat model and the tool executor.
///
/// Each step streams one assistant turn, forwards content deltas live,
/// executes requested tools sequentially, then loops until the model stops or
/// the step budget runs out. Exactly one finished envelope terminates every
/// run, whatever path got there.
pub struct AgentRunner {
    client: Arc<dyn ChatClient>,
    executor: Arc<ToolExecutor>,
    config: RunnerConfig,
}

impl AgentRunner {
    pub fn new(
        client: Arc<dyn ChatClient>,
        executor: Arc<ToolExecutor>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            client,
            executor,
            config,
        }
    }

    #[instrument(skip_all, fields(session_id = %outbox.session_id, request_id = %outbox.request_id))]
    pub async fn run(
        &self,
        mut history: Vec<ChatMessage>,
        tools: Vec<ToolSchema>,
        outbox: &Outbox,
        observer: &dyn StepObserver,
    ) -> (RunOutcome, Vec<ChatMessage>) {
        for step in 1..=self.config.max_steps {
            match self.step(&mut history, &tools, outbox, observer).await {
                Ok(StepControl::Stop) => {
                    info!(step, "run completed");
                    self.finish(outbox, observer, &history, RunOutcome::Completed)
                        .await;
                    return (RunOutcome::Completed, history);
                }
                Ok(StepControl::Continue) => {}
                Err(e) => {
                    warn!(step, error = %e, "step failed");
                    outbox.instruction(
                        names::NS_DIALOG,
                        names::EXCEPTION,
                        json!({"message": e.to_string()}),
                    );
                    self.finish(outbox, observer, &history, RunOutcome::Failed)
                        .await;
                    return (RunOutcome::Failed, history);
                }
            }
        }

        warn!(max_steps = self.config.max_steps, "run exhausted");
        self.finish(outbox, observer, &history, RunOutcome::Exhausted)
            .await;
        (RunOutcome::Exhausted, history)
    }

    /// One think-act cycle. Appends exactly one assistant turn and one tool
    /// turn per executed call.
    async fn step(
        &self,
        history: &mut Vec<ChatMessage>,
        tools: &[ToolSchema],
        outbox: &Outbox,
        observer: &dyn StepObserver,
    ) -> Result<StepControl, EngineError> {
        let mut request = ChatRequest::new(self.client.model(), history.clone());
        request.tools = tools.to_vec();
        request.temperature = self.config.temperature;
        request.max_tokens = self.config.max_tokens;

        let mut stream = self.client.stream(&request).await?;
        let mut turn = TurnAccumulator::new();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            if let Some(delta) = turn.apply(&chunk) {
                outbox.instruction(names::NS_STREAM, names::TEXT_CHUNK, json!({"text": delta}));
            }
        }

        let stopped = turn.finish_reason() == Some("stop");
        let (content, calls) = turn.finish();
        history.push(ChatMessage::assistant_turn(content, calls.clone()));

        for call in &calls {
            outbox.instruction(
                names::NS_TOOL,
                names::CALL_STARTED,
                json!({
                    "tool_call_id": call.id,
                    "tool_name": call.function.name,
                    "arguments": call.function.arguments,
                }),
            );

            let output = self
                .executor
                .execute(&call.function.name, &call.function.arguments)
                .await;

            outbox.instruction(
                names::NS_TOOL,
                names::CALL_RESULT,
                json!({
                    "tool_call_id": call.id,
                    "tool_name": call.function.name,
                    "content": output.content,
                    "is_error": output.is_error,
                }),
            );
            history.push(ChatMessage::tool_result(&call.id, &output.content));

            observer.on_tool_result(call, &output).await;
        }

        if stopped {
            Ok(StepControl::Stop)
        } else {
            Ok(StepControl::Continue)
        }
    }

    /// Emit the optional summary then the single terminal envelope.
    async fn finish(
        &self,
        outbox: &Outbox,
        observer: &dyn StepObserver,
        history: &[ChatMessage],
        outcome: RunOutcome,
    ) {
        if let Some(summary) = observer.finish_summary(history).await {
            outbox.instruction(names::NS_DIALOG, names::ACTIONS_SUMMARY, summary);
        }
        outbox.instruction(
            names::NS_DIALOG,
            names::FINISHED,
            json!({"success": outcome.success()}),
        );
    }
}
