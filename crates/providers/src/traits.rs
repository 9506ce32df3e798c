use palaver_domain::chat::{ChatMessage, ToolDefinition};
use palaver_domain::stream::{BoxStream, StreamEvent};
use palaver_domain::Result;

/// One provider round-trip. Model parameters come from the config
/// snapshot the turn is bound to, never from ambient state.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// An LLM endpoint that can stream a response.
///
/// The turn engine always consumes the streamed form; the non-streaming
/// HTTP surface aggregates frames at the edge instead of asking the
/// provider for a blocking completion.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}
