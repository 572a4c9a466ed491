use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tracing::{instrument, warn};

use haven_core::messages::{ChatMessage, ChatRequest};
use haven_core::rules::ConditionCode;
use haven_llm::client::{ClientRegistry, Purpose};

use crate::error::TriggerError;

const SYSTEM_PROMPT: &str = "You are a security camera analyst. You are shown \
a short frame sequence from one camera and a condition to check. Answer with \
a single digit and nothing else: 0 if the condition does not hold in these \
frames; 1 if it holds and this is a NEW occurrence not present in the \
previous check; 2 if it holds but is the SAME ongoing occurrence that was \
already reported.";

/// Evaluates one rule condition against one channel's frame sequence through
/// the vision-purpose model.
pub struct ConditionEvaluator {
    clients: Arc<ClientRegistry>,
}

impl ConditionEvaluator {
    pub fn new(clients: Arc<ClientRegistry>) -> Self {
        Self { clients }
    }

    /// One blocking vision call. A response that is not a clean 0/1/2 is a
    /// protocol wobble, not a failure: it degrades to Nothing with a warning.
    #[instrument(skip_all, fields(frames = frames.len(), seen_before))]
    pub async fn evaluate(
        &self,
        condition: &str,
        frames: &[Bytes],
        seen_before: bool,
    ) -> Result<ConditionCode, TriggerError> {
        let client = self.clients.get(Purpose::Vision)?;

        let data_urls: Vec<String> = frames
            .iter()
            .map(|f| format!("data:image/jpeg;base64,{}", BASE64.encode(f)))
            .collect();

        let hint = if seen_before {
            "A previous check already reported an occurrence for this condition."
        } else {
            "No occurrence has been reported for this condition yet."
        };
        let prompt = format!("Condition: {condition}\n{hint}");

        let request = ChatRequest::new(
            client.model(),
            vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user_with_images(prompt, data_urls),
            ],
        );

        let response = client.complete(&request).await?;
        let Some(text) = response.text() else {
            warn!("empty vision response, treating as nothing");
            return Ok(ConditionCode::Nothing);
        };

        Ok(parse_code(text))
    }
}

/// First valid digit wins; anything else is Nothing.
fn parse_code(text: &str) -> ConditionCode {
    for c in text.chars() {
        match c {
            '0' => return ConditionCode::Nothing,
            '1' => return ConditionCode::NewOccurrence,
            '2' => return ConditionCode::Ongoing,
            _ => {}
        }
    }
    warn!(text, "unparsable vision answer, treating as nothing");
    ConditionCode::Nothing
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_llm::mock::{MockChatClient, MockReply};

    fn registry_with(replies: Vec<MockReply>) -> Arc<ClientRegistry> {
        let registry = ClientRegistry::new();
        registry.bind(Purpose::Vision, Arc::new(MockChatClient::new(replies)));
        Arc::new(registry)
    }

    #[test]
    fn code_parsing() {
        assert_eq!(parse_code("0"), ConditionCode::Nothing);
        assert_eq!(parse_code(" 1 "), ConditionCode::NewOccurrence);
        assert_eq!(parse_code("2."), ConditionCode::Ongoing);
        assert_eq!(parse_code("Answer: 1"), ConditionCode::NewOccurrence);
        assert_eq!(parse_code("maybe?"), ConditionCode::Nothing);
    }

    #[tokio::test]
    async fn evaluate_returns_model_code() {
        let evaluator = ConditionEvaluator::new(registry_with(vec![MockReply::text("1")]));
        let frames = vec![Bytes::from_static(b"frame-a"), Bytes::from_static(b"frame-b")];
        let code = evaluator
            .evaluate("a person at the door", &frames, false)
            .await
            .unwrap();
        assert_eq!(code, ConditionCode::NewOccurrence);
    }

    #[tokio::test]
    async fn garbage_answer_degrades_to_nothing() {
        let evaluator =
            ConditionEvaluator::new(registry_with(vec![MockReply::text("I think so, yes")]));
        let code = evaluator
            .evaluate("a cat on the counter", &[Bytes::from_static(b"f")], true)
            .await
            .unwrap();
        assert_eq!(code, ConditionCode::Nothing);
    }

    #[tokio::test]
    async fn missing_vision_binding_is_configuration_error() {
        let evaluator = ConditionEvaluator::new(Arc::new(ClientRegistry::new()));
        let err = evaluator
            .evaluate("anything", &[], false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TriggerError::Core(haven_core::errors::HavenError::ConfigurationMissing(_))
        ));
    }
}
