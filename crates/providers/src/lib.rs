//! LLM provider client.
//!
//! The gateway speaks one wire contract: an OpenAI-compatible streamed
//! chat-completions endpoint. [`OpenAiChatClient`] builds the request
//! from a [`ChatRequest`], drains the SSE body, and classifies every
//! delta into provider-agnostic [`StreamEvent`]s; HTTP failures map to
//! the gateway error taxonomy (429 + `Retry-After` → `RateLimited`,
//! 5xx / transport → `UpstreamUnavailable`).

mod openai;
mod sse;
mod traits;

pub use openai::OpenAiChatClient;
pub use traits::{ChatRequest, LlmProvider};
