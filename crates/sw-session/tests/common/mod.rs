//! Scripted completions and tools shared by the runtime tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sw_core::completion::{Completion, CompletionArgs, CompletionError, ToolSchema};
use sw_core::config::SwarmConfig;
use sw_core::history::{HistoryAdapter, HistoryError, InMemoryHistory};
use sw_core::types::{MessageRole, ModelMessage, ToolCall};
use sw_session::{AgentSchema, Registry, SwarmRuntime, SwarmSchema, Tool, ToolContext};

pub type Script =
    Arc<dyn Fn(&CompletionArgs) -> Result<ModelMessage, CompletionError> + Send + Sync>;

/// Completion driven by a closure over the request.
pub struct Scripted(pub Script);

#[async_trait]
impl Completion for Scripted {
    async fn get_completion(&self, args: CompletionArgs) -> Result<ModelMessage, CompletionError> {
        (self.0)(&args)
    }
}

pub fn last_user(args: &CompletionArgs) -> String {
    args.messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

pub fn reply(args: &CompletionArgs, content: impl Into<String>) -> ModelMessage {
    ModelMessage::new(MessageRole::Assistant, args.agent_name.clone(), content, args.mode)
}

pub fn call_tool(args: &CompletionArgs, tool: &str) -> ModelMessage {
    reply(args, "").with_tool_calls(vec![ToolCall::new(tool, json!({}))])
}

/// Replies `"<agent>: <last user message>"`.
pub fn echo() -> Arc<dyn Completion> {
    Arc::new(Scripted(Arc::new(|args: &CompletionArgs| {
        Ok(reply(args, format!("{}: {}", args.agent_name, last_user(args))))
    })))
}

/// Calls `tool` when the last user message equals `trigger`, echoes
/// otherwise.
pub fn tool_on(trigger: &'static str, tool: &'static str) -> Arc<dyn Completion> {
    Arc::new(Scripted(Arc::new(move |args: &CompletionArgs| {
        if last_user(args) == trigger {
            Ok(call_tool(args, tool))
        } else {
            Ok(reply(args, format!("{}: {}", args.agent_name, last_user(args))))
        }
    })))
}

pub fn failing() -> Arc<dyn Completion> {
    Arc::new(Scripted(Arc::new(|_: &CompletionArgs| {
        Err(CompletionError::Provider("model offline".into()))
    })))
}

type ToolBody =
    Arc<dyn Fn(ToolContext) -> futures::future::BoxFuture<'static, sw_session::Result<()>> + Send + Sync>;

/// Tool whose body is a closure.
pub struct FnTool {
    pub name: &'static str,
    pub body: ToolBody,
}

impl FnTool {
    pub fn new<F, Fut>(name: &'static str, body: F) -> Arc<dyn Tool>
    where
        F: Fn(ToolContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = sw_session::Result<()>> + Send + 'static,
    {
        use futures::FutureExt;
        Arc::new(FnTool {
            name,
            body: Arc::new(move |ctx| body(ctx).boxed()),
        })
    }
}

#[async_trait]
impl Tool for FnTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.to_string(),
            description: format!("test tool {}", self.name),
            parameters: json!({}),
        }
    }

    async fn call(&self, ctx: ToolContext) -> sw_session::Result<()> {
        (self.body)(ctx).await
    }
}

/// Swarm `s` over echo agents `a` (default) and `b`.
pub fn echo_runtime() -> SwarmRuntime {
    let registry = Registry::builder()
        .agent(AgentSchema::new("a", "you are a", echo()).with_dependencies(["b"]))
        .agent(AgentSchema::new("b", "you are b", echo()))
        .swarm(SwarmSchema::new("s", ["a", "b"], "a"))
        .build()
        .unwrap();
    SwarmRuntime::new(registry, SwarmConfig::default())
}

/// Swarm `s` over echo agents `a` (default) through `e`.
pub fn wide_runtime(config: SwarmConfig) -> SwarmRuntime {
    let names = ["a", "b", "c", "d", "e"];
    let mut builder = Registry::builder();
    for name in names {
        builder = builder.agent(AgentSchema::new(name, format!("you are {name}"), echo()));
    }
    let registry = builder
        .swarm(SwarmSchema::new("s", names, "a"))
        .build()
        .unwrap();
    SwarmRuntime::new(registry, config)
}

/// In-memory history whose writes take `delay` to land.
pub struct SlowHistory {
    pub inner: InMemoryHistory,
    pub delay: Duration,
}

impl SlowHistory {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryHistory::new(),
            delay,
        })
    }
}

#[async_trait]
impl HistoryAdapter for SlowHistory {
    async fn push(&self, client_id: &str, message: ModelMessage) -> Result<(), HistoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.push(client_id, message).await
    }

    async fn list(&self, client_id: &str) -> Result<Vec<ModelMessage>, HistoryError> {
        self.inner.list(client_id).await
    }

    async fn dispose(&self, client_id: &str) -> Result<(), HistoryError> {
        self.inner.dispose(client_id).await
    }
}

pub async fn recv<T>(rx: &flume::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
        .await
        .expect("value within timeout")
        .expect("channel open")
}
