//! End-to-end turn flows against a scripted provider: streaming,
//! final-text normalization, tool confirmation (approve / reject),
//! provider rate-limit retry, per-session ordering, and queue bounds.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use palaver_bus::EventBus;
use palaver_domain::chat::{Role, ToolCallStatus};
use palaver_domain::frame::Frame;
use palaver_domain::stream::{BoxStream, StreamEvent};
use palaver_domain::{Error, Result};
use palaver_gateway::config_service::ConfigService;
use palaver_gateway::connections::ConnectionRegistry;
use palaver_gateway::runtime::confirm::ConfirmationStore;
use palaver_gateway::runtime::scheduler::Scheduler;
use palaver_gateway::runtime::turn::{self, TurnOutcome};
use palaver_gateway::runtime::{ConfirmAction, TurnRuntime, WorkCtx, WorkItem, WorkKind};
use palaver_memory::{InMemoryGraphStore, MemoryService};
use palaver_providers::{ChatRequest, LlmProvider};
use palaver_store::{SessionStore, UserLogWriter, UserStore};
use palaver_tools::ToolRegistry;
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Script {
    Events(Vec<StreamEvent>),
    Fail(Error),
    /// Wait for the gate before streaming (lets a test hold a worker).
    Gated(Arc<Notify>, Vec<StreamEvent>),
}

struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    /// Message counts per call, for asserting prompt growth and order.
    calls: Mutex<Vec<usize>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.calls.lock().push(req.messages.len());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(Script::Events(vec![done()]));
        let events = match script {
            Script::Fail(e) => return Err(e),
            Script::Events(events) => events,
            Script::Gated(gate, events) => {
                gate.notified().await;
                events
            }
        };
        Ok(Box::pin(futures_util::stream::iter(
            events.into_iter().map(Ok),
        )))
    }
}

fn token(text: &str) -> StreamEvent {
    StreamEvent::Token { text: text.into() }
}

fn done() -> StreamEvent {
    StreamEvent::Done {
        usage: None,
        finish_reason: Some("stop".into()),
    }
}

fn tool_call(call_id: &str, tool: &str, args: serde_json::Value) -> StreamEvent {
    StreamEvent::ToolCallFinished {
        call_id: call_id.into(),
        tool_name: tool.into(),
        arguments: args,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    _dir: tempfile::TempDir,
    rt: Arc<TurnRuntime>,
    user_id: String,
    session_id: String,
}

fn make_runtime(provider: Arc<dyn LlmProvider>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let config =
        Arc::new(ConfigService::load(dir.path().join("config"), bus.clone()).unwrap());
    let users = Arc::new(UserStore::new(&dir.path().join("data"), None).unwrap());
    let sessions = Arc::new(SessionStore::new(&dir.path().join("data")).unwrap());
    let logs = Arc::new(UserLogWriter::new(dir.path().join("logs")));
    let memory = MemoryService::start(
        Default::default(),
        Arc::new(InMemoryGraphStore::new()),
        bus.clone(),
    );
    let rt = Arc::new(TurnRuntime {
        bus: bus.clone(),
        users: users.clone(),
        sessions: sessions.clone(),
        logs,
        memory,
        tools: Arc::new(ToolRegistry::with_builtins()),
        provider,
        config,
        confirmations: Arc::new(ConfirmationStore::new()),
        connections: Arc::new(ConnectionRegistry::new(Duration::from_secs(60), bus)),
    });

    let (user, _token) = users.register("tester", "pw", None).unwrap();
    let session = sessions.create_session(&user.user_id).unwrap();

    Harness {
        _dir: dir,
        rt,
        user_id: user.user_id,
        session_id: session.session_id,
    }
}

fn make_ctx(h: &Harness) -> (WorkCtx, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(256);
    let ctx = WorkCtx {
        user_id: h.user_id.clone(),
        session_id: h.session_id.clone(),
        request_id: "req-test".into(),
        snapshot: h.rt.config.snapshot_for(&h.user_id),
        frames: tx,
        frames_sent: Arc::new(AtomicBool::new(false)),
        cancel: CancellationToken::new(),
    };
    (ctx, rx)
}

fn drain_frames(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Pump frames until `done` (true) or timeout/closure (false).
async fn wait_done(rx: &mut mpsc::Receiver<Frame>) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Frame::Done { .. })) => return true,
            Ok(Some(_)) => continue,
            _ => return false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn duplicated_final_text_commits_normalized() {
    let provider = ScriptedProvider::new(vec![Script::Events(vec![
        token("Hello.\n\nWorld.\n\nHello.\n\nWorld."),
        done(),
    ])]);
    let h = make_runtime(provider);
    let (ctx, mut rx) = make_ctx(&h);

    let outcome = turn::run_new_turn(&h.rt, &ctx, "say hello twice")
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let frames = drain_frames(&mut rx);
    let done_content = frames
        .iter()
        .find_map(|f| match f {
            Frame::Done { content, .. } => content.clone(),
            _ => None,
        })
        .unwrap();
    assert_eq!(done_content, "Hello.\n\nWorld.");

    // The committed assistant message is the normalized body, exactly once.
    let record = h.rt.sessions.get_session(&h.user_id, &h.session_id).unwrap();
    let assistants: Vec<_> = record
        .messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].content, "Hello.\n\nWorld.");
}

#[tokio::test]
async fn confirmation_reject_flow_runs_no_tool() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("should_not_exist");

    let provider = ScriptedProvider::new(vec![
        Script::Events(vec![
            tool_call(
                "call_1",
                "shell.exec",
                serde_json::json!({"command": format!("touch {}", marker.display())}),
            ),
            done(),
        ]),
        Script::Events(vec![token("Okay, I won't run that."), done()]),
    ]);
    let h = make_runtime(provider);
    let (ctx, mut rx) = make_ctx(&h);

    // Turn suspends at the confirmation-listed tool.
    let outcome = turn::run_new_turn(&h.rt, &ctx, "run touch for me")
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Suspended);
    assert_eq!(h.rt.confirmations.pending_count(), 1);

    let frames = drain_frames(&mut rx);
    assert!(matches!(frames.last(), Some(Frame::ToolStart { status: ToolCallStatus::AwaitingConfirm, .. })));

    // Reject; the turn resumes, tells the model, and finishes.
    let pending = h
        .rt
        .confirmations
        .take(&h.user_id, &h.session_id, "call_1")
        .unwrap();
    let outcome = turn::run_resume(&h.rt, &ctx, pending.state, ConfirmAction::Reject)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let frames = drain_frames(&mut rx);
    let rejected = frames.iter().any(|f| {
        matches!(f, Frame::ToolResult { result, .. } if result == &serde_json::json!("rejected by user"))
    });
    assert!(rejected, "expected the synthetic rejection result frame");
    assert!(matches!(frames.last(), Some(Frame::Done { .. })));

    // No side effect happened.
    assert!(!marker.exists());

    // Committed turn: user + tool(rejected) + assistant.
    let record = h.rt.sessions.get_session(&h.user_id, &h.session_id).unwrap();
    assert_eq!(record.messages.len(), 3);
    assert_eq!(record.messages[1].role, Role::Tool);
    assert_eq!(record.messages[1].content, "rejected by user");
    assert_eq!(record.messages[2].content, "Okay, I won't run that.");
}

#[tokio::test]
async fn confirmation_approve_executes_the_tool() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("approved");

    let provider = ScriptedProvider::new(vec![
        Script::Events(vec![
            tool_call(
                "call_1",
                "shell.exec",
                serde_json::json!({"command": format!("touch {}", marker.display())}),
            ),
            done(),
        ]),
        Script::Events(vec![token("Done — the file is created."), done()]),
    ]);
    let h = make_runtime(provider);
    let (ctx, mut rx) = make_ctx(&h);

    assert_eq!(
        turn::run_new_turn(&h.rt, &ctx, "create the file").await.unwrap(),
        TurnOutcome::Suspended
    );
    let pending = h
        .rt
        .confirmations
        .take(&h.user_id, &h.session_id, "call_1")
        .unwrap();
    assert_eq!(
        turn::run_resume(&h.rt, &ctx, pending.state, ConfirmAction::Approve)
            .await
            .unwrap(),
        TurnOutcome::Completed
    );

    assert!(marker.exists(), "approved tool call must actually run");
    let frames = drain_frames(&mut rx);
    assert!(frames
        .iter()
        .any(|f| matches!(f, Frame::ToolResult { .. })));
}

#[tokio::test]
async fn while_suspended_a_new_turn_is_busy() {
    let provider = ScriptedProvider::new(vec![Script::Events(vec![
        tool_call("call_1", "shell.exec", serde_json::json!({"command": "true"})),
        done(),
    ])]);
    let h = make_runtime(provider);
    let (ctx, _rx) = make_ctx(&h);

    assert_eq!(
        turn::run_new_turn(&h.rt, &ctx, "hold the session").await.unwrap(),
        TurnOutcome::Suspended
    );

    // The suspended turn still owns the session's open-turn slot.
    let (ctx2, _rx2) = make_ctx(&h);
    let err = turn::run_new_turn(&h.rt, &ctx2, "another message")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "busy");
}

#[tokio::test]
async fn tool_hop_limit_aborts_without_partial_commit() {
    // Every response asks for another (auto-approved) tool call.
    let hop = || {
        Script::Events(vec![
            tool_call("c", "clock.now", serde_json::json!({})),
            done(),
        ])
    };
    let provider = ScriptedProvider::new((0..10).map(|_| hop()).collect());
    let h = make_runtime(provider);
    let (ctx, _rx) = make_ctx(&h);

    let err = turn::run_new_turn(&h.rt, &ctx, "loop forever")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "tool_loop_limit");

    // Aborted turn leaves no messages behind.
    let record = h.rt.sessions.get_session(&h.user_id, &h.session_id).unwrap();
    assert!(record.messages.is_empty());
    assert!(!h.rt.sessions.has_open_turn(&h.session_id));
}

#[tokio::test]
async fn rate_limit_retries_then_streams_cleanly() {
    let provider = ScriptedProvider::new(vec![
        Script::Fail(Error::RateLimited {
            retry_after: Some(Duration::from_millis(10)),
        }),
        Script::Events(vec![token("recovered"), done()]),
    ]);
    let h = make_runtime(provider.clone());

    let scheduler = Scheduler::new(Default::default(), h.rt.clone());
    let (ctx, mut rx) = make_ctx(&h);
    scheduler
        .enqueue(WorkItem {
            ctx,
            kind: WorkKind::NewTurn {
                user_message: "hello".into(),
            },
        })
        .await
        .unwrap();

    // Wait for the turn to complete through the retry.
    let mut frames = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(frame)) => {
                let terminal = matches!(frame, Frame::Done { .. } | Frame::Error { .. });
                frames.push(frame);
                if terminal {
                    break;
                }
            }
            _ => break,
        }
    }

    // No error frame reached the client; the stream starts post-retry.
    assert!(!frames.iter().any(|f| matches!(f, Frame::Error { .. })));
    assert!(matches!(frames.last(), Some(Frame::Done { .. })));
    assert_eq!(provider.calls.lock().len(), 2);
    assert_eq!(scheduler.stats().retries, 1);
}

#[tokio::test]
async fn session_queue_overflow_is_busy() {
    let gate = Arc::new(Notify::new());
    let provider = ScriptedProvider::new(vec![
        Script::Gated(gate.clone(), vec![token("first"), done()]),
        Script::Events(vec![token("second"), done()]),
        Script::Events(vec![token("third"), done()]),
    ]);
    let h = make_runtime(provider);

    let cfg = palaver_domain::config::SchedulerConfig {
        workers: 1,
        queue_depth: 1,
        ..Default::default()
    };
    let scheduler = Scheduler::new(cfg, h.rt.clone());

    let (ctx1, mut rx1) = make_ctx(&h);
    let (ctx2, _rx2) = make_ctx(&h);
    let (ctx3, _rx3) = make_ctx(&h);

    let item = |ctx: WorkCtx, msg: &str| WorkItem {
        ctx,
        kind: WorkKind::NewTurn {
            user_message: msg.into(),
        },
    };

    scheduler.enqueue(item(ctx1, "one")).await.unwrap();
    // Give the worker a moment to pick up the gated first item.
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.enqueue(item(ctx2, "two")).await.unwrap();
    let err = scheduler.enqueue(item(ctx3, "three")).await.unwrap_err();
    assert_eq!(err.kind(), "busy");

    // Release the gate; both admitted turns finish, in order.
    gate.notify_one();
    let mut saw_done = false;
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_secs(5), rx1.recv()).await {
        if matches!(frame, Frame::Done { .. }) {
            saw_done = true;
            break;
        }
    }
    assert!(saw_done);
}

#[tokio::test]
async fn turns_within_a_session_complete_in_order() {
    let provider = ScriptedProvider::new(vec![
        Script::Events(vec![token("answer one"), done()]),
        Script::Events(vec![token("answer two"), done()]),
    ]);
    let h = make_runtime(provider.clone());
    let scheduler = Scheduler::new(Default::default(), h.rt.clone());

    let (ctx1, mut rx1) = make_ctx(&h);
    let (ctx2, mut rx2) = make_ctx(&h);
    scheduler
        .enqueue(WorkItem {
            ctx: ctx1,
            kind: WorkKind::NewTurn {
                user_message: "first question".into(),
            },
        })
        .await
        .unwrap();
    scheduler
        .enqueue(WorkItem {
            ctx: ctx2,
            kind: WorkKind::NewTurn {
                user_message: "second question".into(),
            },
        })
        .await
        .unwrap();

    assert!(wait_done(&mut rx1).await);
    assert!(wait_done(&mut rx2).await);

    // Serial per session: the second prompt includes the first turn's
    // committed history (user + assistant + new user ≥ 4 messages
    // with the system prompt).
    let calls = provider.calls.lock();
    assert_eq!(calls.len(), 2);
    assert!(calls[1] > calls[0]);

    let record = h.rt.sessions.get_session(&h.user_id, &h.session_id).unwrap();
    let contents: Vec<&str> = record.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["first question", "answer one", "second question", "answer two"]
    );
}
