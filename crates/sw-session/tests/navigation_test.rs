mod common;

use std::sync::Arc;

use sw_core::config::SwarmConfig;
use sw_core::types::MessageRole;
use sw_session::{
    AgentSchema, EventSource, NavigateOptions, Registry, SwarmError, SwarmRuntime, SwarmSchema,
    ToolContext,
};

use common::{echo, recv, tool_on, wide_runtime, FnTool};

/// Agent `a` calls `tool` on the message `go`; `b` echoes.
fn tool_runtime(tool: Arc<dyn sw_session::Tool>, tool_name: &'static str) -> SwarmRuntime {
    let registry = Registry::builder()
        .agent(
            AgentSchema::new("a", "you are a", tool_on("go", tool_name))
                .with_tools([tool_name])
                .with_dependencies(["b"]),
        )
        .agent(AgentSchema::new("b", "you are b", echo()))
        .swarm(SwarmSchema::new("s", ["a", "b"], "a"))
        .tool(tool)
        .build()
        .unwrap();
    SwarmRuntime::new(registry, SwarmConfig::default())
}

// ===========================================================================
// Dispatcher
// ===========================================================================

#[tokio::test]
async fn test_concurrent_changes_apply_in_submission_order() {
    let runtime = wide_runtime(SwarmConfig::default());
    let _session = runtime.session("c1", "s").unwrap();

    let (tx, rx) = flume::unbounded();
    runtime
        .listen_bus_event("c1", EventSource::SwarmBus, move |event| {
            let tx = tx.clone();
            async move {
                if event.kind == "set-agent-name" {
                    let name = event.input["agent_name"].as_str().unwrap_or_default().to_string();
                    let _ = tx.send(name);
                }
            }
        })
        .unwrap();

    let mut handles = Vec::new();
    for target in ["b", "c", "d", "e"] {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime.change_to_agent(target, "c1").await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap());
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(recv(&rx).await);
    }
    assert_eq!(seen, vec!["b", "c", "d", "e"]);
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "e");
}

#[tokio::test]
async fn test_revisit_in_one_turn_is_refused() {
    let runtime = wide_runtime(SwarmConfig::default());
    let session = runtime.session("c1", "s").unwrap();

    assert!(runtime.change_to_agent("b", "c1").await.unwrap());
    assert!(runtime.change_to_agent("c", "c1").await.unwrap());
    assert!(!runtime.change_to_agent("b", "c1").await.unwrap());
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "c");

    // A new user turn starts a fresh route.
    assert_eq!(session.complete("hi").await.unwrap(), "c: hi");
    assert!(runtime.change_to_agent("b", "c1").await.unwrap());
}

#[tokio::test]
async fn test_revisit_errors_when_configured() {
    let mut config = SwarmConfig::default();
    config.navigation.throw_on_recursion = true;
    let runtime = wide_runtime(config);
    let _session = runtime.session("c1", "s").unwrap();

    runtime.change_to_agent("b", "c1").await.unwrap();
    let err = runtime.change_to_agent("b", "c1").await.unwrap_err();
    assert!(matches!(
        err,
        SwarmError::NavigationRecursion { ref agent, .. } if agent == "b"
    ));
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "b");
}

#[tokio::test]
async fn test_agent_outside_swarm_is_skipped() {
    let registry = Registry::builder()
        .agent(AgentSchema::new("a", "you are a", echo()))
        .agent(AgentSchema::new("x", "you are x", echo()))
        .swarm(SwarmSchema::new("s", ["a"], "a"))
        .build()
        .unwrap();
    let runtime = SwarmRuntime::new(registry, SwarmConfig::default());
    let _session = runtime.session("c1", "s").unwrap();

    assert!(!runtime.change_to_agent("x", "c1").await.unwrap());
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "a");
    assert!(matches!(
        runtime.change_to_agent("nobody", "c1").await.unwrap_err(),
        SwarmError::AgentNotRegistered(_)
    ));
}

#[tokio::test]
async fn test_prev_agent_walks_the_stack_back_to_default() {
    let runtime = wide_runtime(SwarmConfig::default());
    let _session = runtime.session("c1", "s").unwrap();

    runtime.change_to_agent("b", "c1").await.unwrap();
    runtime.change_to_agent("c", "c1").await.unwrap();

    assert!(runtime.change_to_prev_agent("c1").await.unwrap());
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "b");
    assert!(runtime.change_to_prev_agent("c1").await.unwrap());
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "a");
    assert!(runtime.change_to_prev_agent("c1").await.unwrap());
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "a");
}

#[tokio::test]
async fn test_default_agent_change_counts_as_a_visit() {
    let runtime = wide_runtime(SwarmConfig::default());
    let _session = runtime.session("c1", "s").unwrap();

    runtime.change_to_agent("d", "c1").await.unwrap();
    assert!(runtime.change_to_default_agent("c1").await.unwrap());
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "a");
    assert!(!runtime.change_to_default_agent("c1").await.unwrap());
}

// ===========================================================================
// Navigation from tools
// ===========================================================================

#[tokio::test]
async fn test_navigate_tool_hands_turn_to_new_agent() {
    let nav = FnTool::new("nav_b", |ctx: ToolContext| async move {
        ctx.runtime
            .navigate_to_agent(&ctx.tool_id, &ctx.client_id, "b", &NavigateOptions::new())
            .await?;
        Ok::<(), SwarmError>(())
    });
    let runtime = tool_runtime(nav, "nav_b");
    let session = runtime.session("c1", "s").unwrap();

    assert_eq!(session.complete("go").await.unwrap(), "b: go");
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "b");

    let raw = runtime.get_raw_history("c1").await.unwrap();
    assert!(raw
        .iter()
        .any(|m| m.role == MessageRole::Tool && m.content == "Successfully navigated to b"));
}

#[tokio::test]
async fn test_navigate_twice_in_one_call_flushes() {
    let (tx, rx) = flume::unbounded();
    let nav = FnTool::new("nav_b", move |ctx: ToolContext| {
        let tx = tx.clone();
        async move {
            let options = NavigateOptions::new();
            let first = ctx
                .runtime
                .navigate_to_agent(&ctx.tool_id, &ctx.client_id, "b", &options)
                .await?;
            let second = ctx
                .runtime
                .navigate_to_agent(&ctx.tool_id, &ctx.client_id, "b", &options)
                .await?;
            let _ = tx.send(vec![first, second]);
            Ok::<(), SwarmError>(())
        }
    });
    let runtime = tool_runtime(nav, "nav_b");
    let session = runtime.session("c1", "s").unwrap();

    assert_eq!(session.complete("go").await.unwrap(), "b: go");
    assert_eq!(recv(&rx).await, vec![true, false]);

    let raw = runtime.get_raw_history("c1").await.unwrap();
    assert_eq!(raw.last().map(|m| m.role), Some(MessageRole::Flush));
}

#[tokio::test]
async fn test_navigate_with_emit_follow_up() {
    let nav = FnTool::new("nav_b", |ctx: ToolContext| async move {
        let options = NavigateOptions::new()
            .with_emit_message(|req| format!("{} here, how can I help", req.agent_name));
        ctx.runtime
            .navigate_to_agent(&ctx.tool_id, &ctx.client_id, "b", &options)
            .await?;
        Ok::<(), SwarmError>(())
    });
    let runtime = tool_runtime(nav, "nav_b");
    let session = runtime.session("c1", "s").unwrap();

    assert_eq!(
        session.complete("go").await.unwrap(),
        "b here, how can I help"
    );
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "b");
}

#[tokio::test]
async fn test_tool_can_run_nested_execute() {
    let nested = FnTool::new("lookup", |ctx: ToolContext| async move {
        let answer = ctx.runtime.execute_force("nested", &ctx.client_id).await?;
        assert_eq!(answer, "a: nested");
        Ok::<(), SwarmError>(())
    });
    let runtime = tool_runtime(nested, "lookup");
    let session = runtime.session("c1", "s").unwrap();

    assert_eq!(session.complete("go").await.unwrap(), "a: nested");
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "a");
}

#[derive(Debug)]
struct Order {
    sku: &'static str,
}

#[tokio::test]
async fn test_tool_sees_turn_payload() {
    let (tx, rx) = flume::unbounded();
    let peek = FnTool::new("peek", move |ctx: ToolContext| {
        let tx = tx.clone();
        async move {
            let sku = sw_session::get_payload::<Order>().map(|o| o.sku);
            let _ = tx.send(sku);
            ctx.runtime
                .commit_tool_output_force(&ctx.tool_id, "peeked", &ctx.client_id)
                .await?;
            ctx.runtime.execute_force("after", &ctx.client_id).await?;
            Ok::<(), SwarmError>(())
        }
    });
    let runtime = tool_runtime(peek, "peek");
    let session = runtime.session("c1", "s").unwrap();

    let reply = session
        .complete_with_payload("go", Order { sku: "sku-42" })
        .await
        .unwrap();
    assert_eq!(reply, "a: after");
    assert_eq!(recv(&rx).await, Some("sku-42"));
}

#[tokio::test]
async fn test_failing_tool_recovers_conversation() {
    let broken = FnTool::new("broken", |_ctx: ToolContext| async move {
        Err::<(), _>(SwarmError::Tool("backend down".into()))
    });
    let runtime = tool_runtime(broken, "broken");
    let session = runtime.session("c1", "s").unwrap();

    // The recovery prompt is answered by the echo branch of the script.
    let reply = session.complete("go").await.unwrap();
    assert!(reply.starts_with("a: "));
    assert_ne!(reply, "a: go");

    let raw = runtime.get_raw_history("c1").await.unwrap();
    assert!(raw.iter().any(|m| m.role == MessageRole::Flush));
    assert_eq!(runtime.get_agent_name("c1").unwrap(), "a");
}
