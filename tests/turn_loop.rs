//! 对话轮次：迭代上限、往返历史、对话间并行与对话内串行、网关重试、工具故障与事件顺序

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use toolhive::core::{ErrorKind, OrchestratorSettings, RetryPolicy, TurnRequest};
use toolhive::llm::{BackendError, BackendReply, RawToolCall, ScriptStep, ScriptedLlmClient};
use toolhive::memory::{ActionOutcome, Message};
use toolhive::pool::mock::MockEngineFactory;
use toolhive::pool::{ResourceKind, ResourcePool};
use toolhive::react::TurnEvent;

fn call(name: &str, args: serde_json::Value) -> BackendReply {
    BackendReply::calls(vec![RawToolCall {
        id: None,
        name: name.to_string(),
        arguments: args.to_string(),
    }])
}

fn sandbox_pool() -> Arc<ResourcePool> {
    Arc::new(ResourcePool::new().with_engine(Arc::new(MockEngineFactory::new(ResourceKind::Sandbox)), 2))
}

fn position(events: &[TurnEvent], pred: impl Fn(&TurnEvent) -> bool) -> usize {
    events.iter().position(pred).expect("event emitted")
}

fn settings(max_iterations: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        max_iterations,
        ..OrchestratorSettings::default()
    }
}

#[tokio::test]
async fn test_iteration_bound_holds_when_model_never_stops() {
    let client = Arc::new(ScriptedLlmClient::repeating(call("echo", json!({"text": "more"}))));
    let h = common::harness(
        client.clone(),
        sandbox_pool(),
        RetryPolicy::none(),
        Duration::from_secs(2),
        settings(4),
    );

    let response = h
        .orchestrator
        .handle_turn(TurnRequest::new("loop", "keep going"))
        .await
        .unwrap();

    assert_eq!(response.iterations, 4);
    assert_eq!(response.actions.len(), 4);
    assert_eq!(client.calls(), 5);
    let failure = response.failure.expect("bound reported in metadata");
    assert_eq!(failure.kind, ErrorKind::IterationBoundExceeded);
    assert!(response.answer.contains("Max iterations reached"));

    let history = h.orchestrator.history("loop").await.unwrap();
    let tool_results = history.iter().filter(|m| m.role() == "tool").count();
    assert_eq!(tool_results, 4);
    assert_eq!(history.last(), Some(&Message::assistant(response.answer)));
}

#[tokio::test]
async fn test_round_trip_is_user_then_assistant() {
    let client = Arc::new(ScriptedLlmClient::repeating(BackendReply::text("plain answer")));
    let h = common::harness(
        client,
        sandbox_pool(),
        RetryPolicy::none(),
        Duration::from_secs(2),
        settings(25),
    );

    h.orchestrator
        .handle_turn(TurnRequest::new("rt", "question"))
        .await
        .unwrap();

    let history = h.orchestrator.history("rt").await.unwrap();
    assert_eq!(
        history,
        vec![Message::user("question"), Message::assistant("plain answer")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_conversations_run_in_parallel() {
    let client = Arc::new(
        ScriptedLlmClient::repeating(BackendReply::text("ok")).with_delay(Duration::from_millis(300)),
    );
    let h = common::harness(
        client.clone(),
        sandbox_pool(),
        RetryPolicy::none(),
        Duration::from_secs(2),
        settings(25),
    );

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(
        h.orchestrator.handle_turn(TurnRequest::new("a", "hi from a")),
        h.orchestrator.handle_turn(TurnRequest::new("b", "hi from b")),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(client.max_in_flight(), 2);
    assert!(started.elapsed() < Duration::from_millis(550));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_conversation_turns_are_serialized() {
    let client = Arc::new(
        ScriptedLlmClient::repeating(BackendReply::text("ok")).with_delay(Duration::from_millis(100)),
    );
    let h = common::harness(
        client.clone(),
        sandbox_pool(),
        RetryPolicy::none(),
        Duration::from_secs(2),
        settings(25),
    );

    let (first, second) = tokio::join!(
        h.orchestrator.handle_turn(TurnRequest::new("shared", "one")),
        h.orchestrator.handle_turn(TurnRequest::new("shared", "two")),
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(client.max_in_flight(), 1);

    let roles: Vec<_> = h
        .orchestrator
        .history("shared")
        .await
        .unwrap()
        .iter()
        .map(Message::role)
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);
}

#[tokio::test]
async fn test_backend_timeout_then_success_is_invisible_to_user() {
    let client = Arc::new(ScriptedLlmClient::new(vec![
        ScriptStep::Stall(Duration::from_secs(10)),
        ScriptStep::Reply(BackendReply::text("second answer")),
    ]));
    let h = common::harness(
        client.clone(),
        sandbox_pool(),
        common::fast_retry(3),
        Duration::from_millis(100),
        settings(25),
    );

    let response = h
        .orchestrator
        .handle_turn(TurnRequest::new("retry", "hello"))
        .await
        .unwrap();

    assert_eq!(client.calls(), 2);
    assert_eq!(response.answer, "second answer");
    assert!(response.failure.is_none());
    let history = h.orchestrator.history("retry").await.unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_backend_down_ends_turn_with_degraded_answer() {
    let client = Arc::new(ScriptedLlmClient::new(Vec::new()).with_fallback(ScriptStep::Fail(
        BackendError::Transient("connection refused".into()),
    )));
    let h = common::harness(
        client.clone(),
        sandbox_pool(),
        common::fast_retry(3),
        Duration::from_secs(2),
        settings(25),
    );

    let response = h
        .orchestrator
        .handle_turn(TurnRequest::new("down", "hello"))
        .await
        .unwrap();

    assert_eq!(client.calls(), 3);
    let failure = response.failure.expect("failure metadata");
    assert_eq!(failure.kind, ErrorKind::TransientBackendError);
    assert!(failure.detail.contains("connection refused"));
    assert!(!response.answer.contains("connection refused"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_tool_is_a_result_not_a_registration_fault() {
    let client = Arc::new(ScriptedLlmClient::new(vec![
        ScriptStep::Reply(call("explode", json!({}))),
        ScriptStep::Reply(BackendReply::text("the tool crashed, sorry")),
    ]));
    let pool = sandbox_pool();
    let h = common::harness(
        client,
        Arc::clone(&pool),
        RetryPolicy::none(),
        Duration::from_secs(2),
        settings(25),
    );
    let before = h.monitor.run_cheap_cycle().await;
    assert!(before.tools.failed.is_empty());

    let response = h
        .orchestrator
        .handle_turn(TurnRequest::new("boom", "run it"))
        .await
        .unwrap();
    assert_eq!(response.answer, "the tool crashed, sorry");
    assert!(response.failure.is_none());

    let history = h.orchestrator.history("boom").await.unwrap();
    let outcome = history
        .iter()
        .find_map(|m| match m {
            Message::Tool { result } => Some(result.outcome.clone()),
            _ => None,
        })
        .expect("tool result appended");
    match outcome {
        ActionOutcome::Failure { kind, .. } => assert_eq!(kind, ErrorKind::ToolExecutionError),
        other => panic!("expected failure, got {other:?}"),
    }

    let after = h.monitor.run_cheap_cycle().await;
    assert_eq!(after.tools.failed, before.tools.failed);
    assert_eq!(after.tools.registered, before.tools.registered);
    let status = &after.pool[0];
    assert_eq!(status.acquired, status.released + status.reclaimed);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn test_unknown_tool_is_fed_back_to_model() {
    let client = Arc::new(ScriptedLlmClient::new(vec![
        ScriptStep::Reply(call("teleport", json!({}))),
        ScriptStep::Reply(BackendReply::text("I cannot teleport.")),
    ]));
    let h = common::harness(
        client.clone(),
        sandbox_pool(),
        RetryPolicy::none(),
        Duration::from_secs(2),
        settings(25),
    );

    let response = h
        .orchestrator
        .handle_turn(TurnRequest::new("u", "teleport me"))
        .await
        .unwrap();
    assert_eq!(response.answer, "I cannot teleport.");

    // 第二次请求里模型能看到 UnknownTool 结果
    let second = &client.requests()[1];
    let fed_back = second.messages.iter().any(|m| {
        matches!(m, Message::Tool { result } if result.failure_kind() == Some(ErrorKind::UnknownTool))
    });
    assert!(fed_back);
}

#[tokio::test]
async fn test_stream_events_are_ordered() {
    let client = Arc::new(ScriptedLlmClient::new(vec![
        ScriptStep::Reply(call("echo", json!({"text": "abc"}))),
        ScriptStep::Reply(BackendReply::text("final answer text")),
    ]));
    let h = common::harness(
        client,
        sandbox_pool(),
        RetryPolicy::none(),
        Duration::from_secs(2),
        settings(25),
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let response = h
        .orchestrator
        .handle_turn_stream(TurnRequest::new("s", "stream it"), tx)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    assert_eq!(position(&events, |e| matches!(e, TurnEvent::TurnStarted { .. })), 0);
    let requested = position(&events, |e| matches!(e, TurnEvent::ActionRequested { .. }));
    let completed = position(&events, |e| matches!(e, TurnEvent::ActionCompleted { ok: true, .. }));
    let first_delta = position(&events, |e| matches!(e, TurnEvent::AnswerDelta { .. }));
    assert!(requested < completed && completed < first_delta);
    assert!(matches!(events.last(), Some(TurnEvent::AnswerComplete { answer }) if *answer == response.answer));

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::AnswerDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "final answer text");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_engine_startup_cannot_outlive_turn_deadline() {
    let client = Arc::new(
        ScriptedLlmClient::new(vec![ScriptStep::Reply(call(
            "engine_cmd",
            json!({"op": "echo", "text": "hi"}),
        ))])
        .with_fallback(ScriptStep::Reply(BackendReply::text("done"))),
    );
    let factory =
        MockEngineFactory::new(ResourceKind::Sandbox).with_startup_delay(Duration::from_secs(3));
    let pool = Arc::new(ResourcePool::new().with_engine(Arc::new(factory.clone()), 2));
    let h = common::harness(
        client,
        pool,
        RetryPolicy::none(),
        Duration::from_secs(2),
        OrchestratorSettings {
            turn_timeout: Duration::from_millis(500),
            ..OrchestratorSettings::default()
        },
    );

    let started = std::time::Instant::now();
    let response = h
        .orchestrator
        .handle_turn(TurnRequest::new("slow-start", "use the engine"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(1500), "took {:?}", started.elapsed());

    let failure = response.failure.expect("deadline reported in metadata");
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert!(response.answer.contains("took too long"), "{}", response.answer);

    let history = h.orchestrator.history("slow-start").await.unwrap();
    let tool_failure = history.iter().find_map(|m| match m {
        Message::Tool { result } => result.failure_kind(),
        _ => None,
    });
    assert_eq!(tool_failure, Some(ErrorKind::Timeout));
    assert_eq!(factory.launches(), 1);
}
