use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use taskmesh_core::{Payload, TaskmeshResult};

/// Capability every agent brings: turn a task payload into a result.
///
/// The engine imposes nothing on what a handler does; an `Err` is recorded
/// on the task and drives the retry / dead-letter policy.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, payload: Payload) -> TaskmeshResult<Payload>;
}

/// Adapter that lets a plain async closure act as a [`TaskHandler`].
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = TaskmeshResult<Payload>> + Send + 'static,
{
    async fn execute(&self, payload: Payload) -> TaskmeshResult<Payload> {
        (self.func)(payload).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```ignore
/// let double = handler_fn(|p| async move {
///     Ok(serde_json::json!(p.as_i64().unwrap_or(0) * 2))
/// });
/// ```
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskmeshResult<Payload>> + Send + 'static,
{
    Arc::new(FnHandler { func })
}
