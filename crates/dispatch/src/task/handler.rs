//! Task bodies and their registry

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::TaskContext;
use crate::error::TaskError;
use crate::pool::WorkerId;

/// Boxed future returned by a task body
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send>>;

/// Type-erased task body
pub type TaskHandler = Arc<dyn Fn(TaskContext, Value) -> TaskFuture + Send + Sync>;

/// One-time worker initializer run before a worker reports ready
pub type WarmUpFn =
    Arc<dyn Fn(WorkerId) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>> + Send + Sync>;

/// A typed task body
///
/// # Example
///
/// ```ignore
/// struct Checksum;
///
/// #[async_trait]
/// impl TaskBody for Checksum {
///     const KIND: &'static str = "checksum";
///     type Input = ChecksumInput;
///     type Output = ChecksumOutput;
///
///     async fn run(&self, ctx: &TaskContext, input: ChecksumInput) -> Result<ChecksumOutput, TaskError> {
///         Ok(ChecksumOutput { crc: crc32(&input.bytes) })
///     }
/// }
///
/// engine.register_body(Checksum);
/// ```
#[async_trait]
pub trait TaskBody: Send + Sync + 'static {
    /// Kind name used at submission
    const KIND: &'static str;

    type Input: DeserializeOwned + Send;
    type Output: Serialize + Send;

    async fn run(&self, ctx: &TaskContext, input: Self::Input) -> Result<Self::Output, TaskError>;
}

/// Registry of task bodies by kind
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure as the body for `kind`
    pub fn register<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |ctx, input| handler(ctx, input).boxed());
        self.handlers.write().insert(kind.to_string(), handler);
    }

    /// Register a typed body under its `KIND`
    pub fn register_body<B: TaskBody>(&self, body: B) {
        let body = Arc::new(body);
        self.register(B::KIND, move |ctx, input| {
            let body = body.clone();
            async move {
                let input: B::Input = serde_json::from_value(input)?;
                let output = body.run(&ctx, input).await?;
                Ok::<Value, TaskError>(serde_json::to_value(output)?)
            }
        });
    }

    pub fn get(&self, kind: &str) -> Option<TaskHandler> {
        self.handlers.read().get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::INVALID_INPUT;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    struct Add;

    #[async_trait]
    impl TaskBody for Add {
        const KIND: &'static str = "add";
        type Input = AddInput;
        type Output = i64;

        async fn run(&self, _ctx: &TaskContext, input: AddInput) -> Result<i64, TaskError> {
            Ok(input.a + input.b)
        }
    }

    #[tokio::test]
    async fn test_register_closure() {
        let registry = HandlerRegistry::new();
        registry.register("echo", |_ctx, input| async move { Ok(input) });

        assert!(registry.contains("echo"));
        let handler = registry.get("echo").unwrap();
        let out = handler(TaskContext::detached("t", 1, 1), json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_register_typed_body() {
        let registry = HandlerRegistry::new();
        registry.register_body(Add);

        let handler = registry.get("add").unwrap();
        let out = handler(TaskContext::detached("t", 1, 1), json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn test_typed_body_rejects_bad_input() {
        let registry = HandlerRegistry::new();
        registry.register_body(Add);

        let handler = registry.get("add").unwrap();
        let err = handler(TaskContext::detached("t", 1, 1), json!({"a": "two"}))
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.kind(), Some(INVALID_INPUT));
    }

    #[test]
    fn test_kinds_sorted() {
        let registry = HandlerRegistry::new();
        registry.register("b", |_ctx, input| async move { Ok(input) });
        registry.register("a", |_ctx, input| async move { Ok(input) });
        assert_eq!(registry.kinds(), vec!["a".to_string(), "b".to_string()]);
    }
}
