pub mod accumulate;
pub mod client;
pub mod mock;
pub mod openai;

pub use accumulate::{ToolCallAccumulator, TurnAccumulator};
pub use client::{ChatClient, ChatStream, ClientRegistry, Purpose};
pub use mock::{MockChatClient, MockReply};
pub use openai::OpenAiClient;
