mod common;

use std::sync::Arc;
use std::time::Duration;

use sw_core::config::SwarmConfig;
use sw_core::history::agent_view;
use sw_core::types::{ExecutionMode, MessageRole, ModelMessage};
use sw_session::{
    AgentSchema, EventSource, Registry, SwarmError, SwarmRuntime, SwarmSchema, ToolContext,
};

use common::{echo, echo_runtime, failing, recv, tool_on, FnTool, SlowHistory};

// ===========================================================================
// Stale writes
// ===========================================================================

#[tokio::test]
async fn test_commit_after_agent_change_lands_on_new_agent_only() {
    let runtime = echo_runtime();
    let session = runtime.session("c1", "s").unwrap();

    assert_eq!(session.complete("hi").await.unwrap(), "a: hi");
    assert!(runtime.change_to_agent("b", "c1").await.unwrap());
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "b");

    runtime
        .commit_assistant_message("stale", "c1", "a")
        .await
        .unwrap();
    runtime
        .commit_assistant_message("fresh", "c1", "b")
        .await
        .unwrap();

    let raw = runtime.get_raw_history("c1").await.unwrap();
    assert!(raw.iter().all(|m| m.content != "stale"));
    let b_history = runtime.get_agent_history("c1", "b").await.unwrap();
    assert_eq!(b_history.len(), 1);
    assert_eq!(b_history[0].content, "fresh");
    assert_eq!(b_history[0].role, MessageRole::Assistant);
}

#[tokio::test]
async fn test_commit_racing_agent_change_never_lands_after_switch() {
    let registry = Registry::builder()
        .agent(AgentSchema::new("a", "you are a", echo()).with_dependencies(["b"]))
        .agent(AgentSchema::new("b", "you are b", echo()))
        .swarm(SwarmSchema::new("s", ["a", "b"], "a"))
        .build()
        .unwrap();
    let history = SlowHistory::new(Duration::from_millis(50));
    let runtime = SwarmRuntime::with_history(registry, SwarmConfig::default(), history);
    let _session = runtime.session("c1", "s").unwrap();

    let writers = vec![
        {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.commit_assistant_message("stale", "c1", "a").await })
        },
        {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                runtime
                    .commit_user_message("stale-user", ExecutionMode::User, "c1", "a")
                    .await
            })
        },
    ];
    tokio::task::yield_now().await;

    assert!(runtime.change_to_agent("b", "c1").await.unwrap());
    let at_switch = runtime.get_raw_history("c1").await.unwrap();

    for writer in writers {
        writer.await.unwrap().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Anything addressed to `a` either landed before the switch or was dropped.
    let after = runtime.get_raw_history("c1").await.unwrap();
    assert_eq!(after, at_switch);
    let view = |raw: &[ModelMessage]| {
        agent_view(raw, "b", "you are b", 50)
            .into_iter()
            .map(|m| (m.role, m.agent_name, m.content))
            .collect::<Vec<_>>()
    };
    assert_eq!(view(after.as_slice()), view(at_switch.as_slice()));
    assert!(runtime
        .get_agent_history("c1", "b")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_stale_execute_and_stateless_run_return_empty() {
    let runtime = echo_runtime();
    let _session = runtime.session("c1", "s").unwrap();
    runtime.change_to_agent("b", "c1").await.unwrap();

    assert_eq!(runtime.execute("ping", "c1", "a").await.unwrap(), "");
    assert_eq!(runtime.run_stateless("ping", "c1", "a").await.unwrap(), "");
    assert_eq!(runtime.execute("ping", "c1", "b").await.unwrap(), "b: ping");
}

#[tokio::test]
async fn test_force_commits_target_active_agent() {
    let runtime = echo_runtime();
    let _session = runtime.session("c1", "s").unwrap();
    runtime.change_to_agent("b", "c1").await.unwrap();

    runtime
        .commit_system_message_force("be brief", "c1")
        .await
        .unwrap();
    runtime
        .commit_user_message_force("typed", ExecutionMode::User, "c1")
        .await
        .unwrap();

    let b_history = runtime.get_agent_history("c1", "b").await.unwrap();
    let contents: Vec<_> = b_history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["be brief", "typed"]);
    assert_eq!(
        runtime.get_last_system_message("c1").await.unwrap().as_deref(),
        Some("be brief")
    );
    assert_eq!(
        runtime.get_last_user_message("c1").await.unwrap().as_deref(),
        Some("typed")
    );
}

#[tokio::test]
async fn test_tool_request_commit_validates_tools() {
    let runtime = echo_runtime();
    let _session = runtime.session("c1", "s").unwrap();
    let request = sw_core::types::ToolRequest {
        tool_name: "missing".into(),
        params: serde_json::json!({}),
    };
    let err = runtime
        .commit_tool_request_force(vec![request], "c1")
        .await
        .unwrap_err();
    assert!(matches!(err, SwarmError::ToolNotRegistered(name) if name == "missing"));
}

// ===========================================================================
// Execution pipeline
// ===========================================================================

#[tokio::test]
async fn test_one_shot_complete_tears_session_down() {
    let runtime = echo_runtime();
    let reply = runtime.complete("hello", "c1", "s").await.unwrap();
    assert_eq!(reply, "a: hello");
    assert!(!runtime.has_session("c1"));
    assert!(runtime.get_raw_history("c1").await.is_err());
    assert_eq!(runtime.perf().open_executions("c1"), 0);

    // A second one-shot call for the same client starts from scratch.
    assert_eq!(runtime.complete("again", "c1", "s").await.unwrap(), "a: again");
}

#[tokio::test]
async fn test_one_shot_complete_serializes_per_client() {
    let runtime = echo_runtime();
    let mut handles = Vec::new();
    for i in 0..4 {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime.complete(&format!("m{i}"), "c1", "s").await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), format!("a: m{i}"));
    }
}

#[tokio::test]
async fn test_perf_and_bus_balanced_when_completion_fails() {
    let registry = Registry::builder()
        .agent(AgentSchema::new("a", "you are a", failing()))
        .swarm(SwarmSchema::new("s", ["a"], "a"))
        .build()
        .unwrap();
    let runtime = SwarmRuntime::new(registry, SwarmConfig::default());
    let session = runtime.session("c1", "s").unwrap();

    let (tx, rx) = flume::unbounded();
    runtime
        .listen_bus_event("c1", EventSource::ExecutionBus, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.kind);
            }
        })
        .unwrap();

    let err = session.complete("hi").await.unwrap_err();
    assert!(matches!(err, SwarmError::Completion(_)));

    assert_eq!(runtime.perf().open_executions("c1"), 0);
    assert_eq!(runtime.perf().active_session_execution_count("c1"), 1);
    assert_eq!(runtime.perf().total_execution_count(), 1);
    assert_eq!(recv(&rx).await, "commit-execution-begin");
    assert_eq!(recv(&rx).await, "commit-execution-end");
}

#[tokio::test]
async fn test_dropped_turn_still_closes_execution() {
    let stuck = FnTool::new("stuck", |_ctx: ToolContext| async move {
        futures::future::pending::<()>().await;
        Ok::<(), SwarmError>(())
    });
    let registry = Registry::builder()
        .agent(AgentSchema::new("a", "you are a", tool_on("go", "stuck")).with_tools(["stuck"]))
        .swarm(SwarmSchema::new("s", ["a"], "a"))
        .tool(stuck)
        .build()
        .unwrap();
    let runtime = SwarmRuntime::new(registry, SwarmConfig::default());
    let session = runtime.session("c1", "s").unwrap();

    let (tx, rx) = flume::unbounded();
    runtime
        .listen_bus_event("c1", EventSource::ExecutionBus, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.kind);
            }
        })
        .unwrap();

    let abandoned = tokio::time::timeout(Duration::from_millis(100), session.complete("go")).await;
    assert!(abandoned.is_err());

    assert_eq!(runtime.perf().open_executions("c1"), 0);
    assert_eq!(recv(&rx).await, "commit-execution-begin");
    assert_eq!(recv(&rx).await, "commit-execution-end");
}

#[tokio::test]
async fn test_run_stateless_leaves_history_untouched() {
    let runtime = echo_runtime();
    let session = runtime.session("c1", "s").unwrap();
    session.complete("first").await.unwrap();
    let before = runtime.get_raw_history("c1").await.unwrap().len();

    let out = runtime.run_stateless_force("lookup", "c1").await.unwrap();
    assert_eq!(out, "a: lookup");
    assert_eq!(runtime.get_raw_history("c1").await.unwrap().len(), before);
    assert_eq!(
        runtime.get_last_assistant_message("c1").await.unwrap().as_deref(),
        Some("a: first")
    );
}

#[tokio::test]
async fn test_empty_output_is_replaced_by_placeholder() {
    let silent = Arc::new(common::Scripted(Arc::new(|args: &sw_core::completion::CompletionArgs| {
        Ok(common::reply(args, "   "))
    })));
    let registry = Registry::builder()
        .agent(AgentSchema::new("a", "you are a", silent))
        .swarm(SwarmSchema::new("s", ["a"], "a"))
        .build()
        .unwrap();
    let mut config = SwarmConfig::default();
    config.completion.empty_output_placeholders = vec!["placeholder".into()];
    let runtime = SwarmRuntime::new(registry, config);
    let session = runtime.session("c1", "s").unwrap();

    assert_eq!(session.complete("hi").await.unwrap(), "placeholder");
    assert_eq!(runtime.get_last_assistant_message("c1").await.unwrap(), None);
}

// ===========================================================================
// Validation and modes
// ===========================================================================

#[tokio::test]
async fn test_unknown_entities_are_rejected() {
    let runtime = echo_runtime();
    assert!(matches!(
        runtime.session("c1", "nope").unwrap_err(),
        SwarmError::SwarmNotRegistered(_)
    ));
    assert!(matches!(
        runtime.execute_force("x", "ghost").await.unwrap_err(),
        SwarmError::SessionNotFound(_)
    ));

    let _session = runtime.session("c1", "s").unwrap();
    assert!(matches!(
        runtime.session("c1", "s").unwrap_err(),
        SwarmError::SessionExists(_)
    ));
    assert!(matches!(
        runtime
            .commit_assistant_message("x", "c1", "zed")
            .await
            .unwrap_err(),
        SwarmError::AgentNotRegistered(_)
    ));
}

#[tokio::test]
async fn test_output_surfaces_require_connection_mode() {
    let runtime = echo_runtime();
    let _session = runtime.session("c1", "s").unwrap();

    assert!(matches!(
        runtime.emit("hello", "c1", "a").await.unwrap_err(),
        SwarmError::ModeMismatch { method: "emit", .. }
    ));
    assert!(matches!(
        runtime.notify_force("hello", "c1").await.unwrap_err(),
        SwarmError::ModeMismatch { .. }
    ));
    assert!(matches!(
        runtime.cancel_output_force("c1").await.unwrap_err(),
        SwarmError::ModeMismatch { .. }
    ));
}

// ===========================================================================
// Payload and disposal
// ===========================================================================

#[derive(Debug, PartialEq)]
struct Ticket {
    id: u32,
}

#[tokio::test]
async fn test_payload_reaches_completion() {
    let (tx, rx) = flume::unbounded();
    let spy = Arc::new(common::Scripted(Arc::new(move |args: &sw_core::completion::CompletionArgs| {
        let id = sw_session::get_payload::<Ticket>().map(|t| t.id);
        let _ = tx.send(id);
        Ok(common::reply(args, "ok"))
    })));
    let registry = Registry::builder()
        .agent(AgentSchema::new("a", "you are a", spy))
        .swarm(SwarmSchema::new("s", ["a"], "a"))
        .build()
        .unwrap();
    let runtime = SwarmRuntime::new(registry, SwarmConfig::default());
    let session = runtime.session("c1", "s").unwrap();

    session
        .complete_with_payload("hi", Ticket { id: 7 })
        .await
        .unwrap();
    assert_eq!(recv(&rx).await, Some(7));

    session.complete("plain").await.unwrap();
    assert_eq!(recv(&rx).await, None);
}

#[tokio::test]
async fn test_dispose_releases_everything_once() {
    let runtime = echo_runtime();
    let session = runtime.session("c1", "s").unwrap();
    runtime
        .listen_event("c1", "orders", |_| async {})
        .unwrap();
    session.complete("hi").await.unwrap();
    runtime.change_to_agent("b", "c1").await.unwrap();

    session.dispose().await.unwrap();
    assert!(!session.is_mounted());
    assert!(!runtime.has_session("c1"));
    assert!(runtime.session_list().is_empty());
    assert_eq!(runtime.bus().total_subscribers(), 0);
    assert_eq!(runtime.perf().active_session_execution_count("c1"), 0);
    assert!(!runtime.navigation().has_navigation("c1", "s", "b"));
    assert!(matches!(
        runtime.get_agent_name("c1").unwrap_err(),
        SwarmError::SessionNotFound(_)
    ));

    session.dispose().await.unwrap();
    runtime.dispose_connection("c1", "s").await.unwrap();

    // The client id is free again and starts on the default agent.
    let again = runtime.session("c1", "s").unwrap();
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "a");
    assert!(runtime.get_raw_history("c1").await.unwrap().is_empty());
    again.dispose().await.unwrap();
}

#[tokio::test]
async fn test_system_prompts_follow_main_prompt() {
    let (tx, rx) = flume::unbounded();
    let spy = Arc::new(common::Scripted(Arc::new(move |args: &sw_core::completion::CompletionArgs| {
        let contents: Vec<String> = args.messages.iter().map(|m| m.content.clone()).collect();
        let _ = tx.send(contents);
        Ok(common::reply(args, "ok"))
    })));
    let registry = Registry::builder()
        .agent(
            AgentSchema::new("a", "you are a", spy)
                .with_system("rule one")
                .with_system("rule two"),
        )
        .swarm(SwarmSchema::new("s", ["a"], "a"))
        .build()
        .unwrap();
    let runtime = SwarmRuntime::new(registry, SwarmConfig::default());
    let session = runtime.session("c1", "s").unwrap();
    session.complete("hi").await.unwrap();

    assert_eq!(
        recv(&rx).await,
        vec!["you are a", "rule one", "rule two", "hi"]
    );
}
