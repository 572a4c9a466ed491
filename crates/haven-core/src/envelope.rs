use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{RequestId, SessionId};

/// Dialog namespace/name constants. The (namespace, name) pair is the
/// dispatch key for the closed handler registry.
pub mod names {
    pub const NS_REQUEST: &str = "request";
    pub const QUERY: &str = "query";
    pub const EXECUTE_ACTIONS: &str = "execute_actions";

    pub const NS_STREAM: &str = "stream";
    pub const TEXT_CHUNK: &str = "text_chunk";
    pub const TOAST: &str = "toast";

    pub const NS_TOOL: &str = "tool";
    pub const CALL_STARTED: &str = "call_started";
    pub const CALL_RESULT: &str = "call_result";

    pub const NS_DIALOG: &str = "dialog";
    pub const EXCEPTION: &str = "exception";
    pub const FINISHED: &str = "finished";
    pub const REDIRECT: &str = "redirect";
    pub const ACTIONS_SUMMARY: &str = "actions_summary";
    pub const CONFIRM_REQUEST: &str = "confirm_request";
    pub const CONFIRM_RESULT: &str = "confirm_result";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Inbound: something that happened (user query, confirmation result).
    Event,
    /// Outbound: something the client should render or act on.
    Instruction,
}

/// Wire envelope exchanged over a dialog session.
///
/// Every envelope an agent emits is appended, in emission order, to exactly
/// one session transcript and forwarded to the live channel if one exists.
/// The payload stays opaque here; the dispatch registry owns typed decoding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DialogEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub namespace: String,
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub payload: Value,
}

impl DialogEnvelope {
    pub fn event(
        namespace: &str,
        name: &str,
        request_id: RequestId,
        session_id: SessionId,
        payload: Value,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            namespace: namespace.to_string(),
            name: name.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            request_id,
            session_id,
            payload,
        }
    }

    pub fn instruction(
        namespace: &str,
        name: &str,
        request_id: RequestId,
        session_id: SessionId,
        payload: Value,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Instruction,
            namespace: namespace.to_string(),
            name: name.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            request_id,
            session_id,
            payload,
        }
    }

    /// Dispatch key.
    pub fn key(&self) -> (&str, &str) {
        (&self.namespace, &self.name)
    }

    pub fn is_terminal(&self) -> bool {
        self.namespace == names::NS_DIALOG && self.name == names::FINISHED
    }
}

/// Typed payload bodies for the envelopes the engine itself emits.
/// Inbound event payloads are decoded by the consumer that registered them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallStarted {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExceptionBody {
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinishedBody {
    pub success: bool,
}

/// Same-turn redirect: hands the next inbound event for this session to a
/// specific agent address, optionally persisting the turn's title/history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedirectBody {
    pub target: String,
    #[serde(default)]
    pub persist_title: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let env = DialogEnvelope::instruction(
            names::NS_STREAM,
            names::TEXT_CHUNK,
            RequestId::from_raw("req_1"),
            SessionId::from_raw("sess_1"),
            serde_json::json!({"text": "hello"}),
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "instruction");
        assert_eq!(json["namespace"], "stream");
        assert_eq!(json["name"], "text_chunk");
        assert_eq!(json["request_id"], "req_1");
        assert_eq!(json["session_id"], "sess_1");
        assert!(json["timestamp"].is_i64());
    }

    #[test]
    fn dispatch_key() {
        let env = DialogEnvelope::event(
            names::NS_REQUEST,
            names::QUERY,
            RequestId::new(),
            SessionId::new(),
            Value::Null,
        );
        assert_eq!(env.key(), ("request", "query"));
        assert!(!env.is_terminal());
    }

    #[test]
    fn finished_is_terminal() {
        let env = DialogEnvelope::instruction(
            names::NS_DIALOG,
            names::FINISHED,
            RequestId::new(),
            SessionId::new(),
            serde_json::to_value(FinishedBody { success: true }).unwrap(),
        );
        assert!(env.is_terminal());
    }

    #[test]
    fn redirect_body_defaults_persist_title() {
        let body: RedirectBody =
            serde_json::from_value(serde_json::json!({"target": "agent_x"})).unwrap();
        assert!(!body.persist_title);
    }
}
