//! Registered handlers and the dispatch loop that drives them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::HershContext;
use crate::error::WatcherError;
use crate::message::Message;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub type Handler =
    Arc<dyn Fn(Message, Arc<HershContext>) -> BoxFuture<Result<(), WatcherError>> + Send + Sync>;

type CleanupFn = Box<dyn FnOnce(Arc<HershContext>) -> BoxFuture<()> + Send>;

/// A user handler registered via `Watcher::manage`, plus the cleanup it may
/// later attach through the returned [`ManagedHandle`].
pub struct ManagedFunction {
    pub label: String,
    handler: Handler,
    cleanup: Mutex<Option<CleanupFn>>,
    cleanup_ran: Mutex<bool>,
}

impl ManagedFunction {
    pub fn new(label: impl Into<String>, handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            handler,
            cleanup: Mutex::new(None),
            cleanup_ran: Mutex::new(false),
        })
    }

    pub async fn invoke(
        &self,
        msg: Message,
        ctx: Arc<HershContext>,
    ) -> Result<(), WatcherError> {
        (self.handler)(msg, ctx).await
    }

    /// Runs the attached cleanup exactly once. Safe to call multiple times;
    /// only the first call has effect, satisfying the "cleanup uniqueness"
    /// invariant regardless of how `Stop()` is driven.
    pub async fn run_cleanup(&self, ctx: Arc<HershContext>) {
        let mut ran = self.cleanup_ran.lock();
        if *ran {
            return;
        }
        *ran = true;
        let cleanup = self.cleanup.lock().take();
        drop(ran);
        if let Some(cleanup) = cleanup {
            cleanup(ctx).await;
        }
    }
}

/// Returned by `Watcher::manage`. Lets the caller attach a cleanup after the
/// fact without holding a reference to the Watcher itself.
#[derive(Clone)]
pub struct ManagedHandle {
    inner: Arc<ManagedFunction>,
}

impl ManagedHandle {
    pub(crate) fn new(inner: Arc<ManagedFunction>) -> Self {
        Self { inner }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn cleanup<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<HershContext>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.inner.cleanup.lock() = Some(Box::new(move |ctx| Box::pin(f(ctx))));
    }
}

pub(crate) fn boxed_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message, Arc<HershContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WatcherError>> + Send + 'static,
{
    Arc::new(move |msg, ctx| Box::pin(f(msg, ctx)))
}
