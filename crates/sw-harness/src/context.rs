use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Context records
// ---------------------------------------------------------------------------

/// Identifies one top-level execution (a `complete` or `execute` call) for
/// the instrumentation running beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub client_id: String,
    pub execution_id: String,
    pub process_id: String,
}

impl ExecutionContext {
    /// New context with a fresh execution id.
    pub fn new(client_id: impl Into<String>, process_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            execution_id: Uuid::new_v4().as_simple().to_string(),
            process_id: process_id.into(),
        }
    }
}

/// The public operation currently running and the entities it names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodContext {
    pub method_name: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_name: Option<String>,
}

impl MethodContext {
    pub fn new(method_name: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            method_name: method_name.into(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_swarm(mut self, swarm_name: impl Into<String>) -> Self {
        self.swarm_name = Some(swarm_name.into());
        self
    }
}

/// Caller-supplied object readable by tools and completions of one call.
#[derive(Clone)]
pub struct PayloadContext {
    pub client_id: String,
    payload: Arc<dyn Any + Send + Sync>,
}

impl PayloadContext {
    pub fn new<T: Any + Send + Sync>(client_id: impl Into<String>, payload: T) -> Self {
        Self {
            client_id: client_id.into(),
            payload: Arc::new(payload),
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payload.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for PayloadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadContext")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Task-local scopes
// ---------------------------------------------------------------------------

tokio::task_local! {
    static EXECUTION: Option<ExecutionContext>;
    static METHOD: Option<MethodContext>;
    static PAYLOAD: Option<PayloadContext>;
}

/// Run `fut` with `ctx` as the ambient execution context.
pub async fn run_in_execution<F: Future>(ctx: ExecutionContext, fut: F) -> F::Output {
    EXECUTION.scope(Some(ctx), fut).await
}

/// Run `fut` with `ctx` as the ambient method context.
pub async fn run_in_method<F: Future>(ctx: MethodContext, fut: F) -> F::Output {
    METHOD.scope(Some(ctx), fut).await
}

/// Run `fut` with `ctx` as the ambient payload.
pub async fn run_with_payload<F: Future>(ctx: PayloadContext, fut: F) -> F::Output {
    PAYLOAD.scope(Some(ctx), fut).await
}

/// Entry wrapper for public operations: hides any method or execution
/// context inherited from the caller. The payload stays visible.
pub async fn begin_context<F: Future>(fut: F) -> F::Output {
    EXECUTION.scope(None, METHOD.scope(None, fut)).await
}

/// Run `fut` detached from every ambient scope.
pub async fn run_out_of_context<F: Future>(fut: F) -> F::Output {
    EXECUTION
        .scope(None, METHOD.scope(None, PAYLOAD.scope(None, fut)))
        .await
}

/// Whether a method or execution scope is active.
pub fn has_context() -> bool {
    current_method().is_some() || current_execution().is_some()
}

pub fn current_execution() -> Option<ExecutionContext> {
    EXECUTION.try_with(|c| c.clone()).ok().flatten()
}

pub fn current_method() -> Option<MethodContext> {
    METHOD.try_with(|c| c.clone()).ok().flatten()
}

pub fn current_payload() -> Option<PayloadContext> {
    PAYLOAD.try_with(|c| c.clone()).ok().flatten()
}

/// Payload attached to the current call, if it has type `T`.
pub fn get_payload<T: Any + Send + Sync>() -> Option<Arc<T>> {
    current_payload().and_then(|p| p.downcast::<T>())
}

// ---------------------------------------------------------------------------
// ContextSnapshot
// ---------------------------------------------------------------------------

/// Captured ambient context, re-entered inside spawned tasks (task-locals do
/// not cross `tokio::spawn`).
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    execution: Option<ExecutionContext>,
    method: Option<MethodContext>,
    payload: Option<PayloadContext>,
}

impl ContextSnapshot {
    pub fn capture() -> Self {
        Self {
            execution: current_execution(),
            method: current_method(),
            payload: current_payload(),
        }
    }

    pub fn execution(&self) -> Option<&ExecutionContext> {
        self.execution.as_ref()
    }

    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        EXECUTION
            .scope(
                self.execution,
                METHOD.scope(self.method, PAYLOAD.scope(self.payload, fut)),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_context_outside_scope() {
        assert!(!has_context());
        assert!(current_execution().is_none());
        assert!(get_payload::<String>().is_none());
    }

    #[tokio::test]
    async fn execution_visible_in_nested_calls() {
        async fn deep() -> Option<String> {
            current_execution().map(|c| c.client_id)
        }
        let ctx = ExecutionContext::new("c1", "p1");
        let seen = run_in_execution(ctx, async { deep().await }).await;
        assert_eq!(seen.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn begin_context_escapes_inherited_scope() {
        let outer = MethodContext::new("execute", "c1").with_agent("a");
        let inner = run_in_method(outer, async {
            assert!(has_context());
            begin_context(async { (has_context(), current_method()) }).await
        })
        .await;
        assert!(!inner.0);
        assert!(inner.1.is_none());
    }

    #[tokio::test]
    async fn begin_context_keeps_payload() {
        let payload = PayloadContext::new("c1", 42u32);
        let seen = run_with_payload(payload, async {
            begin_context(async { get_payload::<u32>().map(|v| *v) }).await
        })
        .await;
        assert_eq!(seen, Some(42));
    }

    #[tokio::test]
    async fn run_out_of_context_drops_payload() {
        let payload = PayloadContext::new("c1", "data".to_string());
        let seen = run_with_payload(payload, async {
            run_out_of_context(async { get_payload::<String>() }).await
        })
        .await;
        assert!(seen.is_none());
    }

    #[tokio::test]
    async fn payload_type_mismatch_is_none() {
        let payload = PayloadContext::new("c1", 1u8);
        let seen = run_with_payload(payload, async { get_payload::<String>() }).await;
        assert!(seen.is_none());
    }

    #[tokio::test]
    async fn snapshot_crosses_spawn() {
        let ctx = ExecutionContext::new("c1", "p1");
        let expected = ctx.execution_id.clone();
        let handle = run_in_execution(ctx, async {
            let snapshot = ContextSnapshot::capture();
            tokio::spawn(snapshot.scope(async { current_execution().map(|c| c.execution_id) }))
        })
        .await;
        assert_eq!(handle.await.unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn sibling_scopes_do_not_bleed() {
        let a = tokio::spawn(run_in_method(MethodContext::new("a", "c1"), async {
            tokio::task::yield_now().await;
            current_method().map(|m| m.method_name)
        }));
        let b = tokio::spawn(async { current_method() });
        assert_eq!(a.await.unwrap().as_deref(), Some("a"));
        assert!(b.await.unwrap().is_none());
    }
}
