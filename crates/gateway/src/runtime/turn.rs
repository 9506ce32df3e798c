//! Turn execution — prompt assembly, streamed LLM consumption, tool
//! interleave, confirmation suspension, and the commit.
//!
//! A turn is a transaction on the session store: `run_new_turn` opens
//! it, and exactly one of commit (finalize), abort (failure), or
//! suspension (the open handle parks inside the confirmation store)
//! follows. Resumes re-enter the same loop from the parked state.

use std::collections::VecDeque;

use futures_util::StreamExt;

use palaver_domain::chat::{ChatMessage, Role, ToolCall, ToolCallStatus};
use palaver_domain::events::{Event, EventPayload};
use palaver_domain::frame::Frame;
use palaver_domain::stream::{StreamEvent, Usage};
use palaver_domain::{Error, Result};
use palaver_memory::MemoryCandidate;
use palaver_providers::ChatRequest;
use palaver_store::TurnHandle;
use palaver_tools::ToolContext;

use super::confirm::SuspendedTurn;
use super::dedup::normalize_final_text;
use super::{build_system_prompt, ConfirmAction, TurnRuntime, WorkCtx};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome / state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Committed; the client saw `done`.
    Completed,
    /// Parked in the confirmation store awaiting a human decision.
    Suspended,
}

/// Mutable turn state carried through hops and across suspension.
struct TurnState {
    handle: TurnHandle,
    user_text: String,
    messages: Vec<ChatMessage>,
    text_buf: String,
    hops: u32,
    usage: Usage,
}

impl TurnState {
    fn append_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.text_buf.is_empty() {
            self.text_buf.push_str("\n\n");
        }
        self.text_buf.push_str(text);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a fresh turn for one user message.
pub async fn run_new_turn(
    rt: &TurnRuntime,
    ctx: &WorkCtx,
    user_message: &str,
) -> Result<TurnOutcome> {
    let config = ctx.config();

    // Opening the transaction enforces both ownership (foreign session
    // is NotFound) and the single-open-turn invariant (Busy while a
    // suspended turn holds the slot).
    let mut handle = rt.sessions.begin_turn(&ctx.user_id, &ctx.session_id)?;

    rt.bus.emit(Event::with_correlation(
        EventPayload::ChannelMessage {
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
            content: user_message.to_owned(),
        },
        &ctx.request_id,
    ));
    rt.bus.emit(Event::with_correlation(
        EventPayload::ConversationStart {
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
        },
        &ctx.request_id,
    ));

    // Recall is regenerated per turn and bounded by its own deadline;
    // on timeout the turn proceeds without it.
    let recall_block = rt
        .memory
        .recall(
            &ctx.user_id,
            &ctx.session_id,
            user_message,
            &config.memory.recall,
        )
        .await;

    let mut messages = Vec::new();
    messages.push(ChatMessage::system(build_system_prompt(config)));
    if let Some(block) = recall_block {
        messages.push(ChatMessage::system(block));
    }
    match rt.sessions.history_tail(
        &ctx.user_id,
        &ctx.session_id,
        config.conversation.history_rounds,
    ) {
        Ok(history) => messages.extend(history),
        Err(e) => {
            rt.sessions.abort_turn(handle);
            return Err(e);
        }
    }
    messages.push(ChatMessage::user(user_message));

    handle.push(Role::User, user_message, Vec::new());

    let state = TurnState {
        handle,
        user_text: user_message.to_owned(),
        messages,
        text_buf: String::new(),
        hops: 0,
        usage: Usage::default(),
    };
    drive(rt, ctx, state, VecDeque::new()).await
}

/// Resume a suspended turn after a confirmation decision (TTL expiry
/// arrives here as `Reject`).
pub async fn run_resume(
    rt: &TurnRuntime,
    ctx: &WorkCtx,
    suspended: SuspendedTurn,
    action: ConfirmAction,
) -> Result<TurnOutcome> {
    let SuspendedTurn {
        handle,
        user_text,
        messages,
        text_buf,
        hops,
        usage,
        pending_call,
        queued_calls,
        ..
    } = suspended;

    let mut state = TurnState {
        handle,
        user_text,
        messages,
        text_buf,
        hops,
        usage,
    };

    match action {
        ConfirmAction::Approve => {
            execute_tool(rt, ctx, &mut state, &pending_call).await;
        }
        ConfirmAction::Reject => {
            record_rejection(rt, ctx, &mut state, &pending_call).await;
            if ctx.config().tools.reject_ends_turn {
                state.append_text("Understood — I won't run that tool.");
                return finalize(rt, ctx, state).await;
            }
        }
    }

    drive(rt, ctx, state, queued_calls).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The hop loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatch any pending tool calls, then stream the next LLM response;
/// repeat until a response arrives with no tool calls (finalize), a
/// confirmation suspends the turn, or a bound trips.
async fn drive(
    rt: &TurnRuntime,
    ctx: &WorkCtx,
    mut state: TurnState,
    mut pending_calls: VecDeque<ToolCall>,
) -> Result<TurnOutcome> {
    let config = ctx.config();

    loop {
        // ── Tool dispatch phase ──────────────────────────────────
        while let Some(call) = pending_calls.pop_front() {
            if ctx.cancel.is_cancelled() {
                rt.sessions.abort_turn(state.handle);
                return Err(Error::Cancelled("turn cancelled during tool dispatch".into()));
            }

            ctx.send_frame(Frame::ToolDetected {
                content: call.tool_name.clone(),
            })
            .await;
            rt.bus.emit(Event::with_correlation(
                EventPayload::ConversationStreamToolDetected {
                    session_id: ctx.session_id.clone(),
                    tool_name: call.tool_name.clone(),
                },
                &ctx.request_id,
            ));

            if config.tools.needs_confirmation(&call.tool_name) {
                return suspend_for_confirmation(rt, ctx, state, call, pending_calls).await;
            }
            execute_tool(rt, ctx, &mut state, &call).await;
        }

        // ── LLM phase ────────────────────────────────────────────
        if state.hops >= config.conversation.tool_hops_max {
            rt.sessions.abort_turn(state.handle);
            return Err(Error::ToolLoopLimit(config.conversation.tool_hops_max));
        }
        if ctx.cancel.is_cancelled() {
            rt.sessions.abort_turn(state.handle);
            return Err(Error::Cancelled("turn cancelled before LLM call".into()));
        }

        let request = ChatRequest {
            messages: state.messages.clone(),
            tools: rt.tools.definitions(&config.tools),
            model: config.api.model.clone(),
            temperature: config.api.temperature,
            max_tokens: config.api.max_tokens,
        };
        let mut stream = match rt.provider.chat_stream(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                rt.sessions.abort_turn(state.handle);
                return Err(e);
            }
        };

        let mut hop_text = String::new();
        let mut finished_calls: Vec<ToolCall> = Vec::new();

        while let Some(event) = stream.next().await {
            if ctx.cancel.is_cancelled() {
                rt.sessions.abort_turn(state.handle);
                return Err(Error::Cancelled("turn cancelled mid-stream".into()));
            }
            match event {
                Ok(StreamEvent::Token { text }) => {
                    hop_text.push_str(&text);
                    ctx.send_frame(Frame::Text {
                        content: text.clone(),
                    })
                    .await;
                    rt.bus.emit(Event::with_correlation(
                        EventPayload::ConversationStreamText {
                            session_id: ctx.session_id.clone(),
                            content: text,
                        },
                        &ctx.request_id,
                    ));
                }
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }) => {
                    finished_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                Ok(StreamEvent::Done { usage, .. }) => {
                    if let Some(usage) = usage {
                        state.usage.absorb(&usage);
                    }
                }
                Ok(_) => {} // started/delta fragments; assembly happens provider-side
                Err(e) => {
                    rt.sessions.abort_turn(state.handle);
                    return Err(e);
                }
            }
        }

        state.append_text(&hop_text);

        if finished_calls.is_empty() {
            return finalize(rt, ctx, state).await;
        }

        state.hops += 1;
        state
            .messages
            .push(ChatMessage::assistant_with_tools(hop_text, finished_calls.clone()));
        pending_calls = finished_calls.into();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn execute_tool(rt: &TurnRuntime, ctx: &WorkCtx, state: &mut TurnState, call: &ToolCall) {
    ctx.send_frame(Frame::ToolStart {
        call_id: call.call_id.clone(),
        tool_name: call.tool_name.clone(),
        args: call.arguments.clone(),
        status: ToolCallStatus::Running,
    })
    .await;
    rt.bus.emit(Event::with_correlation(
        EventPayload::ConversationStreamToolStart {
            session_id: ctx.session_id.clone(),
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            status: ToolCallStatus::Running,
        },
        &ctx.request_id,
    ));
    rt.bus.emit(Event::with_correlation(
        EventPayload::ToolCallStart {
            user_id: ctx.user_id.clone(),
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
        },
        &ctx.request_id,
    ));

    let started = std::time::Instant::now();
    let envelope = rt
        .tools
        .invoke(
            &call.tool_name,
            &call.arguments,
            &ctx.config().tools,
            &ToolContext {
                user_id: ctx.user_id.clone(),
                session_id: ctx.session_id.clone(),
            },
        )
        .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    if envelope.ok {
        ctx.send_frame(Frame::ToolResult {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            result: envelope.value.clone().unwrap_or(serde_json::Value::Null),
        })
        .await;
        rt.bus.emit(Event::with_correlation(
            EventPayload::ConversationStreamToolResult {
                session_id: ctx.session_id.clone(),
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
            },
            &ctx.request_id,
        ));
        rt.bus.emit(Event::with_correlation(
            EventPayload::ToolCallResult {
                user_id: ctx.user_id.clone(),
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                duration_ms,
            },
            &ctx.request_id,
        ));
    } else {
        let message = envelope
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "tool failed".into());
        ctx.send_frame(Frame::ToolError {
            call_id: call.call_id.clone(),
            content: message.clone(),
        })
        .await;
        rt.bus.emit(Event::with_correlation(
            EventPayload::ConversationStreamToolError {
                session_id: ctx.session_id.clone(),
                call_id: call.call_id.clone(),
                error: message,
            },
            &ctx.request_id,
        ));
        rt.bus.emit(Event::with_correlation(
            EventPayload::ToolCallError {
                user_id: ctx.user_id.clone(),
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                error_kind: envelope
                    .error
                    .as_ref()
                    .and_then(|e| {
                        serde_json::to_value(e.category)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_owned))
                    })
                    .unwrap_or_else(|| "runtime".into()),
            },
            &ctx.request_id,
        ));
    }

    let prompt_text = envelope.to_prompt_text();
    state
        .messages
        .push(ChatMessage::tool_result(&call.call_id, &prompt_text));
    state
        .handle
        .push(Role::Tool, prompt_text, vec![call.clone()]);
}

/// The synthetic tool result a rejection produces; the model (or the
/// canned closing text) sees exactly what the user decided.
async fn record_rejection(rt: &TurnRuntime, ctx: &WorkCtx, state: &mut TurnState, call: &ToolCall) {
    const REJECTED: &str = "rejected by user";

    ctx.send_frame(Frame::ToolResult {
        call_id: call.call_id.clone(),
        tool_name: call.tool_name.clone(),
        result: serde_json::Value::String(REJECTED.into()),
    })
    .await;
    rt.bus.emit(Event::with_correlation(
        EventPayload::ConversationStreamToolResult {
            session_id: ctx.session_id.clone(),
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
        },
        &ctx.request_id,
    ));

    state
        .messages
        .push(ChatMessage::tool_result(&call.call_id, REJECTED));
    state.handle.push(Role::Tool, REJECTED, vec![call.clone()]);

    rt.logs.append(
        &ctx.user_id,
        "info",
        &format!("tool call rejected: {}", call.tool_name),
        Some(&ctx.request_id),
        Some(&ctx.session_id),
        None,
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Suspension
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn suspend_for_confirmation(
    rt: &TurnRuntime,
    ctx: &WorkCtx,
    state: TurnState,
    call: ToolCall,
    queued_calls: VecDeque<ToolCall>,
) -> Result<TurnOutcome> {
    ctx.send_frame(Frame::ToolStart {
        call_id: call.call_id.clone(),
        tool_name: call.tool_name.clone(),
        args: call.arguments.clone(),
        status: ToolCallStatus::AwaitingConfirm,
    })
    .await;
    rt.bus.emit(Event::with_correlation(
        EventPayload::ConversationStreamToolStart {
            session_id: ctx.session_id.clone(),
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            status: ToolCallStatus::AwaitingConfirm,
        },
        &ctx.request_id,
    ));

    let ttl = std::time::Duration::from_secs(ctx.config().tools.confirm_ttl_secs);
    let suspended = SuspendedTurn {
        handle: state.handle,
        user_text: state.user_text,
        messages: state.messages,
        text_buf: state.text_buf,
        hops: state.hops,
        usage: state.usage,
        pending_call: call,
        queued_calls,
        frames: ctx.frames.clone(),
        frames_sent: ctx.frames_sent.clone(),
        snapshot: ctx.snapshot.clone(),
    };
    rt.confirmations
        .insert(suspended, &ctx.user_id, &ctx.session_id, ttl);

    tracing::info!(
        user_id = %ctx.user_id,
        session_id = %ctx.session_id,
        "turn suspended awaiting tool confirmation"
    );
    Ok(TurnOutcome::Suspended)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finalize / fail
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn finalize(rt: &TurnRuntime, ctx: &WorkCtx, mut state: TurnState) -> Result<TurnOutcome> {
    let final_text = normalize_final_text(&state.text_buf);
    let turn_index = state.handle.turn_index;

    state.handle.push(Role::Assistant, &final_text, Vec::new());
    rt.sessions.commit_turn(state.handle)?;

    ctx.send_frame(Frame::Done {
        session_id: ctx.session_id.clone(),
        content: Some(final_text.clone()),
    })
    .await;
    rt.bus.emit(Event::with_correlation(
        EventPayload::ConversationComplete {
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
            turn_index,
        },
        &ctx.request_id,
    ));

    // Reconnect pickup: the reply waits briefly under the session key.
    rt.connections
        .retain_result(&ctx.user_id, &ctx.session_id, &final_text);

    // Write-behind ingest; the turn is already done from the client's
    // point of view.
    rt.memory.enqueue(MemoryCandidate {
        user_id: ctx.user_id.clone(),
        session_id: ctx.session_id.clone(),
        user_text: state.user_text,
        assistant_text: final_text,
        timestamp: chrono::Utc::now(),
    });

    Ok(TurnOutcome::Completed)
}

/// Surface a terminal failure exactly once: a human-readable frame for
/// the client, a structured event for subscribers, a line in the
/// user's audit log. The turn transaction was already aborted at the
/// failure site.
pub async fn fail_turn(rt: &TurnRuntime, ctx: &WorkCtx, error: &Error) {
    tracing::warn!(
        request_id = %ctx.request_id,
        user_id = %ctx.user_id,
        session_id = %ctx.session_id,
        error_kind = error.kind(),
        error = %error,
        "turn failed"
    );
    rt.logs.append(
        &ctx.user_id,
        "error",
        &error.to_string(),
        Some(&ctx.request_id),
        Some(&ctx.session_id),
        Some(error.kind()),
    );
    rt.bus.emit(Event::with_correlation(
        EventPayload::ConversationError {
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
            error_kind: error.kind().to_owned(),
            message: error.to_string(),
        },
        &ctx.request_id,
    ));
    ctx.send_frame(Frame::Error {
        content: error.user_message(),
    })
    .await;
}
