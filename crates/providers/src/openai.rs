//! OpenAI-compatible chat-completions client.
//!
//! Works with any endpoint that follows the `/chat/completions` wire
//! contract (OpenAI, vLLM, Ollama, LM Studio, gateways in front of
//! them). Tool-call fragments arrive keyed by array index; the parser
//! assembles them and emits a `ToolCallFinished` per completed call
//! before the terminal `Done`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use palaver_domain::chat::{ChatMessage, Role, ToolDefinition};
use palaver_domain::config::ApiConfig;
use palaver_domain::stream::{BoxStream, StreamEvent, Usage};
use palaver_domain::{Error, Result};

use crate::sse::event_stream;
use crate::traits::{ChatRequest, LlmProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiChatClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(cfg: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            api_key: cfg.api_key.clone(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();
        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_wire).collect());
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiChatClient {
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(req);

        tracing::debug!(url = %url, model = %req.model, "chat stream request");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let resp = builder.json(&body).send().await.map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, &resp));
        }

        let mut assembler = ToolCallAssembler::default();
        Ok(event_stream(resp, move |payload| {
            assembler.parse(payload)
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn classify_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::UpstreamUnavailable(format!("LLM endpoint unreachable: {e}"))
    } else {
        Error::Internal(format!("LLM request failed: {e}"))
    }
}

fn classify_status(status: reqwest::StatusCode, resp: &reqwest::Response) -> Error {
    match status.as_u16() {
        401 | 403 => Error::Unauthorized("LLM endpoint rejected credentials".into()),
        429 => Error::RateLimited {
            retry_after: parse_retry_after(resp),
        },
        500..=599 => Error::UpstreamUnavailable(format!("LLM endpoint returned {status}")),
        _ => Error::Internal(format!("LLM endpoint returned {status}")),
    }
}

/// `Retry-After` in whole seconds; HTTP-date form is ignored (the
/// scheduler's own backoff covers it).
fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn message_to_wire(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
            "content": msg.content,
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let tool_calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.call_id,
                        "type": "function",
                        "function": {
                            "name": tc.tool_name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            serde_json::json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
                "tool_calls": tool_calls,
            })
        }
        role => serde_json::json!({
            "role": role.as_str(),
            "content": msg.content,
        }),
    }
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delta parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default, Debug)]
struct PartialCall {
    call_id: String,
    tool_name: String,
    arguments: String,
}

/// Stateful parser for one response stream.
///
/// Tool-call fragments are keyed by `index`; `id` and `function.name`
/// arrive on the first fragment, `function.arguments` accumulates over
/// the rest. Assembled calls flush as `ToolCallFinished` when the
/// provider signals the finish reason (or on `[DONE]` as a fallback).
#[derive(Default)]
pub(crate) struct ToolCallAssembler {
    partial: BTreeMap<u64, PartialCall>,
    flushed: bool,
}

impl ToolCallAssembler {
    pub fn parse(&mut self, payload: &str) -> Vec<Result<StreamEvent>> {
        if payload.trim() == "[DONE]" {
            let mut events = self.flush_calls();
            if !self.flushed {
                self.flushed = true;
                events.push(Ok(StreamEvent::Done {
                    usage: None,
                    finish_reason: Some("stop".into()),
                }));
            }
            return events;
        }

        let v: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        let choice = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first());

        // Usage-only chunk (stream_options.include_usage).
        let Some(choice) = choice else {
            if let Some(usage) = v.get("usage").and_then(parse_usage) {
                self.flushed = true;
                return vec![Ok(StreamEvent::Done {
                    usage: Some(usage),
                    finish_reason: None,
                })];
            }
            return Vec::new();
        };

        let mut events = Vec::new();
        let delta = choice.get("delta").unwrap_or(&Value::Null);

        if let Some(fragments) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for fragment in fragments {
                events.extend(self.absorb_fragment(fragment));
            }
        }

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token {
                    text: text.to_owned(),
                }));
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            events.extend(self.flush_calls());
            self.flushed = true;
            events.push(Ok(StreamEvent::Done {
                usage: v.get("usage").and_then(parse_usage),
                finish_reason: Some(reason.to_owned()),
            }));
        }

        events
    }

    fn absorb_fragment(&mut self, fragment: &Value) -> Vec<Result<StreamEvent>> {
        let index = fragment.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
        let entry = self.partial.entry(index).or_default();
        let mut events = Vec::new();

        if let Some(id) = fragment.get("id").and_then(|i| i.as_str()) {
            entry.call_id = id.to_owned();
        }
        if let Some(name) = fragment
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
        {
            let first_sight = entry.tool_name.is_empty();
            entry.tool_name.push_str(name);
            if first_sight {
                events.push(Ok(StreamEvent::ToolCallStarted {
                    call_id: entry.call_id.clone(),
                    tool_name: entry.tool_name.clone(),
                }));
            }
        }
        if let Some(args) = fragment
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(|a| a.as_str())
        {
            entry.arguments.push_str(args);
            events.push(Ok(StreamEvent::ToolCallDelta {
                call_id: entry.call_id.clone(),
                delta: args.to_owned(),
            }));
        }

        events
    }

    fn flush_calls(&mut self) -> Vec<Result<StreamEvent>> {
        let partial = std::mem::take(&mut self.partial);
        partial
            .into_values()
            .map(|call| {
                let arguments = if call.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&call.arguments).unwrap_or_else(|e| {
                        tracing::warn!(
                            call_id = %call.call_id,
                            tool = %call.tool_name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    })
                };
                Ok(StreamEvent::ToolCallFinished {
                    call_id: call.call_id,
                    tool_name: call.tool_name,
                    arguments,
                })
            })
            .collect()
    }
}

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_domain::chat::ToolCall;

    fn parse_all(assembler: &mut ToolCallAssembler, payloads: &[&str]) -> Vec<StreamEvent> {
        payloads
            .iter()
            .flat_map(|p| assembler.parse(p))
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn text_deltas_become_tokens() {
        let mut asm = ToolCallAssembler::default();
        let events = parse_all(
            &mut asm,
            &[
                r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            ],
        );
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[test]
    fn tool_call_fragments_assemble_by_index() {
        let mut asm = ToolCallAssembler::default();
        let events = parse_all(
            &mut asm,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"shell.exec","arguments":""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"comm"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"and\":\"ls\"}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            ],
        );

        let finished: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => Some((call_id.clone(), tool_name.clone(), arguments.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, "call_1");
        assert_eq!(finished[0].1, "shell.exec");
        assert_eq!(finished[0].2, serde_json::json!({"command": "ls"}));

        // Finished flushes before Done.
        let done_pos = events
            .iter()
            .position(|e| matches!(e, StreamEvent::Done { .. }))
            .unwrap();
        let finished_pos = events
            .iter()
            .position(|e| matches!(e, StreamEvent::ToolCallFinished { .. }))
            .unwrap();
        assert!(finished_pos < done_pos);
    }

    #[test]
    fn two_parallel_calls_assemble_independently() {
        let mut asm = ToolCallAssembler::default();
        let events = parse_all(
            &mut asm,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c0","function":{"name":"clock.now","arguments":"{}"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"c1","function":{"name":"web.fetch","arguments":"{\"url\":\"x\"}"}}]}}]}"#,
                "[DONE]",
            ],
        );
        let names: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallFinished { tool_name, .. } => Some(tool_name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["clock.now", "web.fetch"]);
    }

    #[test]
    fn empty_arguments_default_to_object() {
        let mut asm = ToolCallAssembler::default();
        let events = parse_all(
            &mut asm,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c0","function":{"name":"clock.now"}}]}}]}"#,
                "[DONE]",
            ],
        );
        let args = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallFinished { arguments, .. } => Some(arguments.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(args, serde_json::json!({}));
    }

    #[test]
    fn usage_only_chunk_carries_done() {
        let mut asm = ToolCallAssembler::default();
        let events = parse_all(
            &mut asm,
            &[r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#],
        );
        match &events[0] {
            StreamEvent::Done { usage: Some(u), .. } => {
                assert_eq!(u.total_tokens, 15);
            }
            other => panic!("expected Done with usage, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_yields_json_error() {
        let mut asm = ToolCallAssembler::default();
        let results = asm.parse("not json at all");
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn assistant_tool_message_serializes_arguments_as_string() {
        let msg = ChatMessage::assistant_with_tools(
            "",
            vec![ToolCall {
                call_id: "c1".into(),
                tool_name: "shell.exec".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["content"], Value::Null);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "shell.exec");
        // OpenAI wire format carries arguments as a JSON *string*.
        assert!(wire["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let wire = message_to_wire(&ChatMessage::tool_result("c9", "output"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c9");
    }
}
