use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use async_trait::async_trait;
use haven_core::envelope::{names, DialogEnvelope, EnvelopeKind, RedirectBody};
use haven_core::ids::{RequestId, SessionId};

use crate::agents::{self, Address, Agent, Responder};
use crate::error::EngineError;

type Handler = Arc<dyn Fn(DialogEnvelope) -> BoxFuture<'static, Result<(), EngineError>> + Send + Sync>;

/// Ordered, per-session record of every envelope emitted, distinct from the
/// LLM conversation history.
#[derive(Default)]
pub struct Transcript {
    entries: Mutex<Vec<DialogEnvelope>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, envelope: DialogEnvelope) {
        self.entries.lock().push(envelope);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<DialogEnvelope> {
        self.entries.lock().clone()
    }
}

/// Emission path for one dialog turn: every envelope is appended to the
/// session transcript and, if a live channel exists, forwarded immediately.
/// Both happen in emission order within one synchronous call.
#[derive(Clone)]
pub struct Outbox {
    pub session_id: SessionId,
    pub request_id: RequestId,
    transcript: Arc<Transcript>,
    live: Option<mpsc::UnboundedSender<DialogEnvelope>>,
}

impl Outbox {
    pub fn new(
        session_id: SessionId,
        request_id: RequestId,
        transcript: Arc<Transcript>,
        live: Option<mpsc::UnboundedSender<DialogEnvelope>>,
    ) -> Self {
        Self {
            session_id,
            request_id,
            transcript,
            live,
        }
    }

    pub fn instruction(&self, namespace: &str, name: &str, payload: Value) -> DialogEnvelope {
        let envelope = DialogEnvelope::instruction(
            namespace,
            name,
            self.request_id.clone(),
            self.session_id.clone(),
            payload,
        );
        self.emit(envelope.clone());
        envelope
    }

    fn emit(&self, envelope: DialogEnvelope) {
        self.transcript.append(envelope.clone());
        if let Some(live) = &self.live {
            // A departed client is not an error; the transcript keeps the record.
            let _ = live.send(envelope);
        }
    }

    pub fn transcript(&self) -> &Arc<Transcript> {
        &self.transcript
    }
}

struct PendingRedirect {
    target: String,
    persist_title: bool,
}

/// Closed (namespace, name) → {decoder, handler} registry for inbound events.
///
/// Handlers are registered with a typed payload; decoding failures are
/// protocol violations that degrade to a logged error for that one envelope.
/// A redirect instruction arms the dispatcher to hand the next inbound event
/// for that session to a named target instead of the keyed handler.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<(String, String), Handler>,
    targets: HashMap<String, Handler>,
    redirects: Mutex<HashMap<SessionId, PendingRedirect>>,
    persist_flags: Mutex<HashMap<SessionId, bool>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one (namespace, name) key. The payload type
    /// is the decoder; registration closes the union.
    pub fn register<T, F>(&mut self, namespace: &str, name: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, DialogEnvelope) -> BoxFuture<'static, Result<(), EngineError>>
            + Send
            + Sync
            + 'static,
    {
        let key = (namespace.to_string(), name.to_string());
        self.handlers.insert(key, Self::decode_and_call(handler));
    }

    /// Register a named redirect target.
    pub fn register_target<T, F>(&mut self, target: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, DialogEnvelope) -> BoxFuture<'static, Result<(), EngineError>>
            + Send
            + Sync
            + 'static,
    {
        self.targets
            .insert(target.to_string(), Self::decode_and_call(handler));
    }

    fn decode_and_call<T, F>(handler: F) -> Handler
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, DialogEnvelope) -> BoxFuture<'static, Result<(), EngineError>>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(move |envelope: DialogEnvelope| {
            match serde_json::from_value::<T>(envelope.payload.clone()) {
                Ok(payload) => handler(payload, envelope),
                Err(e) => {
                    let key = format!("{}.{}", envelope.namespace, envelope.name);
                    Box::pin(async move {
                        Err(EngineError::Protocol(format!(
                            "undecodable payload for {key}: {e}"
                        )))
                    })
                }
            }
        })
    }

    /// Arm a one-shot redirect for the session's next inbound event.
    pub fn arm_redirect(&self, session_id: &SessionId, redirect: &RedirectBody) {
        self.redirects.lock().insert(
            session_id.clone(),
            PendingRedirect {
                target: redirect.target.clone(),
                persist_title: redirect.persist_title,
            },
        );
    }

    /// Whether the redirect that consumed the last event asked for the
    /// turn's title/history to be persisted.
    pub fn take_persist_flag(&self, session_id: &SessionId) -> bool {
        self.persist_flags.lock().remove(session_id).unwrap_or(false)
    }

    /// Route one inbound event. Failures are isolated to this envelope.
    pub async fn dispatch(&self, envelope: DialogEnvelope) -> Result<(), EngineError> {
        if envelope.kind != EnvelopeKind::Event {
            return Err(EngineError::Protocol(format!(
                "dispatch expects events, got instruction {}.{}",
                envelope.namespace, envelope.name
            )));
        }

        // A pending redirect consumes exactly one event.
        let redirected = self.redirects.lock().remove(&envelope.session_id);
        if let Some(pending) = redirected {
            if pending.persist_title {
                self.persist_flags
                    .lock()
                    .insert(envelope.session_id.clone(), true);
            }
            let handler = self.targets.get(&pending.target).ok_or_else(|| {
                EngineError::Protocol(format!("unknown redirect target: {}", pending.target))
            })?;
            return handler(envelope).await;
        }

        let key = (envelope.namespace.clone(), envelope.name.clone());
        match self.handlers.get(&key) {
            Some(handler) => handler(envelope).await,
            None => {
                warn!(namespace = %key.0, name = %key.1, "no handler for dialog event");
                Err(EngineError::Protocol(format!(
                    "unhandled dialog key {}.{}",
                    key.0, key.1
                )))
            }
        }
    }
}

/// Hosts one session's inbound dispatch on an agent mailbox: events for the
/// session are handled strictly in arrival order, one at a time, so handler
/// state needs no locking. `tell` delivers fire-and-forget; `ask` surfaces
/// the dispatch result to the caller.
pub struct SessionAgent {
    dispatcher: Arc<Dispatcher>,
}

impl SessionAgent {
    pub fn start(dispatcher: Arc<Dispatcher>) -> Address<SessionAgent> {
        agents::create(Self { dispatcher })
    }
}

#[async_trait]
impl Agent for SessionAgent {
    type Msg = DialogEnvelope;
    type Reply = Result<(), EngineError>;

    async fn handle(&mut self, msg: DialogEnvelope, responder: Option<Responder<Self::Reply>>) {
        let result = self.dispatcher.dispatch(msg).await;
        if let Err(e) = &result {
            warn!(error = %e, "dialog event failed");
        }
        if let Some(r) = responder {
            r.respond(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Query {
        text: String,
    }

    fn event(ns: &str, name: &str, session: &SessionId, payload: Value) -> DialogEnvelope {
        DialogEnvelope::event(ns, name, RequestId::new(), session.clone(), payload)
    }

    #[tokio::test]
    async fn dispatch_routes_by_key() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        let hits2 = hits.clone();
        dispatcher.register::<Query, _>(names::NS_REQUEST, names::QUERY, move |q, _env| {
            let hits = hits2.clone();
            Box::pin(async move {
                assert_eq!(q.text, "hello");
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let session = SessionId::new();
        dispatcher
            .dispatch(event(
                names::NS_REQUEST,
                names::QUERY,
                &session,
                serde_json::json!({"text": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_key_is_protocol_error() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch(event(
                "nope",
                "missing",
                &SessionId::new(),
                Value::Null,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn undecodable_payload_is_protocol_error() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register::<Query, _>(names::NS_REQUEST, names::QUERY, |_q, _env| {
            Box::pin(async { Ok(()) })
        });

        let err = dispatcher
            .dispatch(event(
                names::NS_REQUEST,
                names::QUERY,
                &SessionId::new(),
                serde_json::json!({"wrong": 1}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn redirect_consumes_exactly_one_event() {
        let normal_hits = Arc::new(AtomicUsize::new(0));
        let target_hits = Arc::new(AtomicUsize::new(0));

        let mut dispatcher = Dispatcher::new();
        let n = normal_hits.clone();
        dispatcher.register::<Value, _>(names::NS_REQUEST, names::QUERY, move |_p, _env| {
            let n = n.clone();
            Box::pin(async move {
                n.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let t = target_hits.clone();
        dispatcher.register_target::<Value, _>("confirm_flow", move |_p, _env| {
            let t = t.clone();
            Box::pin(async move {
                t.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let session = SessionId::new();
        dispatcher.arm_redirect(
            &session,
            &RedirectBody {
                target: "confirm_flow".into(),
                persist_title: true,
            },
        );

        // First event goes to the target, second to the keyed handler.
        dispatcher
            .dispatch(event(names::NS_REQUEST, names::QUERY, &session, Value::Null))
            .await
            .unwrap();
        dispatcher
            .dispatch(event(names::NS_REQUEST, names::QUERY, &session, Value::Null))
            .await
            .unwrap();

        assert_eq!(target_hits.load(Ordering::SeqCst), 1);
        assert_eq!(normal_hits.load(Ordering::SeqCst), 1);
        assert!(dispatcher.take_persist_flag(&session));
        assert!(!dispatcher.take_persist_flag(&session));
    }

    #[tokio::test]
    async fn session_agent_serializes_events() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let seen = order.clone();
        dispatcher.register::<Query, _>(names::NS_REQUEST, names::QUERY, move |q, _env| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().push(q.text);
                Ok(())
            })
        });

        let addr = SessionAgent::start(Arc::new(dispatcher));
        let session = SessionId::new();
        for i in 0..10 {
            addr.tell(event(
                names::NS_REQUEST,
                names::QUERY,
                &session,
                serde_json::json!({"text": format!("m{i}")}),
            ));
        }
        // Ask lands behind the tells, so its reply proves they all ran.
        addr.ask(
            event(
                names::NS_REQUEST,
                names::QUERY,
                &session,
                serde_json::json!({"text": "last"}),
            ),
            Duration::from_secs(1),
        )
        .await
        .unwrap()
        .unwrap();

        let seen = order.lock().clone();
        assert_eq!(seen.len(), 11);
        assert_eq!(seen[0], "m0");
        assert_eq!(seen[10], "last");
        addr.exit();
    }

    #[tokio::test]
    async fn outbox_appends_and_forwards_in_order() {
        let transcript = Arc::new(Transcript::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(
            SessionId::new(),
            RequestId::new(),
            transcript.clone(),
            Some(tx),
        );

        outbox.instruction(names::NS_STREAM, names::TEXT_CHUNK, serde_json::json!({"text": "a"}));
        outbox.instruction(names::NS_STREAM, names::TEXT_CHUNK, serde_json::json!({"text": "b"}));

        let entries = transcript.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload["text"], "a");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload["text"], "a");
        assert_eq!(second.payload["text"], "b");
    }

    #[tokio::test]
    async fn outbox_without_live_channel_still_appends() {
        let transcript = Arc::new(Transcript::new());
        let outbox = Outbox::new(SessionId::new(), RequestId::new(), transcript.clone(), None);
        outbox.instruction(names::NS_DIALOG, names::FINISHED, serde_json::json!({"success": true}));
        assert_eq!(transcript.len(), 1);
    }
}
