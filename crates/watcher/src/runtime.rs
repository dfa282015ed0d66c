//! The Watcher runtime: a single-consumer message dispatcher plus the
//! shared context it exposes to handlers and to the introspection API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::context::HershContext;
use crate::dispatcher::{boxed_handler, ManagedFunction, ManagedHandle};
use crate::error::{WatcherError, WatcherResult};
use crate::message::Message;
use crate::queue::MessageQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatcherState {
    Initialized = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WatcherState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WatcherState::Initialized,
            1 => WatcherState::Running,
            2 => WatcherState::Stopping,
            _ => WatcherState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherState::Initialized => "Initialized",
            WatcherState::Running => "Running",
            WatcherState::Stopping => "Stopping",
            WatcherState::Stopped => "Stopped",
        }
    }
}

/// A point-in-time view of the runtime's counters, as served by
/// `GET /watcher/status`.
#[derive(Debug, Clone)]
pub struct WatcherStatus {
    pub state: WatcherState,
    pub uptime_ms: u128,
    pub queue_depth: usize,
    pub messages_processed: u64,
    pub handler_errors: u64,
}

/// Core message-driven runtime a user program links and drives from its own
/// `main`. Owns the value store, the handler registry, and the dispatch
/// loop; the HTTP introspection API reads it through the narrow view in
/// [`crate::api`] rather than holding a second copy of this state.
pub struct Watcher {
    config: WatcherConfig,
    context: Arc<HershContext>,
    functions: RwLock<Vec<Arc<ManagedFunction>>>,
    queue: Arc<MessageQueue>,
    state: AtomicU8,
    sequence: AtomicU64,
    messages_processed: AtomicU64,
    handler_errors: AtomicU64,
    fault_counter: AtomicU64,
    started_at: RwLock<Option<Instant>>,
    dispatcher_handle: RwLock<Option<JoinHandle<()>>>,
    root_cancellation: CancellationToken,
}

impl Watcher {
    pub fn new(
        config: WatcherConfig,
        env: HashMap<String, String>,
        cancellation_scope: CancellationToken,
    ) -> Arc<Self> {
        let queue = Arc::new(MessageQueue::new(config.queue_capacity, config.drop_policy));
        let context = Arc::new(HershContext::new(env, cancellation_scope.clone()));

        Arc::new(Self {
            config,
            context,
            functions: RwLock::new(Vec::new()),
            queue,
            state: AtomicU8::new(WatcherState::Initialized as u8),
            sequence: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            fault_counter: AtomicU64::new(0),
            started_at: RwLock::new(None),
            dispatcher_handle: RwLock::new(None),
            root_cancellation: cancellation_scope,
        })
    }

    pub fn state(&self) -> WatcherState {
        WatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn context(&self) -> Arc<HershContext> {
        self.context.clone()
    }

    /// Registers a handler, returning a handle the caller can later attach a
    /// cleanup to. Handlers may be registered before or after `Start()`; the
    /// dispatcher reads the registry fresh for every message.
    pub fn manage<F, Fut>(&self, label: impl Into<String>, handler: F) -> ManagedHandle
    where
        F: Fn(Message, Arc<HershContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), WatcherError>> + Send + 'static,
    {
        let function = ManagedFunction::new(label, boxed_handler(handler));
        self.functions.write().push(function.clone());
        ManagedHandle::new(function)
    }

    pub fn start(self: &Arc<Self>) -> WatcherResult<()> {
        self.state
            .compare_exchange(
                WatcherState::Initialized as u8,
                WatcherState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| WatcherError::AlreadyRunning)?;

        *self.started_at.write() = Some(Instant::now());

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_dispatcher().await });
        *self.dispatcher_handle.write() = Some(handle);

        info!("watcher runtime started");
        Ok(())
    }

    async fn run_dispatcher(self: Arc<Self>) {
        loop {
            let msg = match self.queue.pop().await {
                Some(msg) => msg,
                None => break,
            };

            self.dispatch(msg).await;

            if self.state() == WatcherState::Stopping && self.queue.is_empty() {
                break;
            }
        }
        debug!("dispatcher loop exited");
    }

    async fn dispatch(&self, msg: Message) {
        let functions: Vec<Arc<ManagedFunction>> = self.functions.read().clone();
        let ctx = self.context.clone();

        for function in functions {
            let label = function.label.clone();
            let msg = msg.clone();
            let ctx = ctx.clone();
            let timeout = self.config.default_timeout;

            let outcome = tokio::time::timeout(
                timeout,
                tokio::spawn(async move { function.invoke(msg, ctx).await }),
            )
            .await;

            match outcome {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    self.handler_errors.fetch_add(1, Ordering::SeqCst);
                    warn!(handler = %label, error = %err, "handler returned an error");
                }
                Ok(Err(join_err)) => {
                    self.handler_errors.fetch_add(1, Ordering::SeqCst);
                    self.fault_counter.fetch_add(1, Ordering::SeqCst);
                    error!(handler = %label, error = %join_err, "handler panicked");
                }
                Err(_elapsed) => {
                    self.handler_errors.fetch_add(1, Ordering::SeqCst);
                    warn!(handler = %label, timeout_ms = ?timeout.as_millis(), "handler timed out");
                }
            }
        }

        self.messages_processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Enqueues a message for dispatch, honoring the configured drop
    /// policy. Returns `true` if accepted.
    pub async fn send_message(&self, content: impl Into<String>) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let msg = Message::new(content.into(), sequence);
        self.queue.push(msg).await
    }

    pub fn get_value(&self, key: &str) -> WatcherResult<crate::context::Value> {
        self.context.get_value(key)
    }

    pub fn set_value(&self, key: impl Into<String>, value: crate::context::Value) {
        self.context.set_value(key, value);
    }

    pub fn status(&self) -> WatcherStatus {
        let uptime_ms = self
            .started_at
            .read()
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);

        WatcherStatus {
            state: self.state(),
            uptime_ms,
            queue_depth: self.queue.depth(),
            messages_processed: self.messages_processed.load(Ordering::SeqCst),
            handler_errors: self.handler_errors.load(Ordering::SeqCst),
        }
    }

    /// Transitions to Stopping, cancels the root scope, waits for the queue
    /// to drain up to `drain_timeout`, runs every cleanup exactly once in
    /// reverse registration order, joins the dispatcher, and transitions to
    /// Stopped. Safe to call more than once; only the first call acts.
    pub async fn stop(&self) {
        let was_running = self
            .state
            .compare_exchange(
                WatcherState::Running as u8,
                WatcherState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if !was_running {
            return;
        }

        info!("watcher stopping");
        self.root_cancellation.cancel();
        self.queue.close();

        let handle = self.dispatcher_handle.write().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.config.drain_timeout, handle).await {
                Ok(_) => {}
                Err(_) => {
                    let discarded = self.queue.discard_remaining();
                    warn!(discarded, "drain_timeout elapsed, discarding remaining messages");
                }
            }
        }

        let functions: Vec<Arc<ManagedFunction>> = self.functions.read().clone();
        for function in functions.into_iter().rev() {
            function.run_cleanup(self.context.clone()).await;
        }

        self.state.store(WatcherState::Stopped as u8, Ordering::SeqCst);
        info!("watcher stopped");
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Value;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn start_twice_fails() {
        let watcher = Watcher::new(WatcherConfig::default(), HashMap::new(), CancellationToken::new());
        watcher.start().unwrap();
        assert!(matches!(watcher.start(), Err(WatcherError::AlreadyRunning)));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn counter_scenario() {
        let watcher = Watcher::new(WatcherConfig::default(), HashMap::new(), CancellationToken::new());
        let cleanup_ran = Arc::new(AtomicUsize::new(0));
        let cleanup_ran_clone = cleanup_ran.clone();

        let handle = watcher.manage("tick-counter", |msg, ctx| async move {
            if msg.content == "tick" {
                let next = match ctx.get_value("COUNTER") {
                    Ok(Value::Int64(n)) => n + 1,
                    _ => 1,
                };
                ctx.set_value("COUNTER", Value::Int64(next));
            }
            Ok(())
        });
        handle.cleanup(move |_ctx| {
            let counter = cleanup_ran_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        watcher.start().unwrap();
        for _ in 0..5 {
            watcher.send_message("tick").await;
        }

        // give the dispatcher a chance to drain the five ticks
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(watcher.get_value("COUNTER").unwrap(), Value::Int64(5));
        assert!(watcher.status().messages_processed >= 5);

        watcher.stop().await;
        assert_eq!(cleanup_ran.load(Ordering::SeqCst), 1);

        // calling stop again must not re-run cleanup
        watcher.stop().await;
        assert_eq!(cleanup_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_panic_is_recovered() {
        let watcher = Watcher::new(WatcherConfig::default(), HashMap::new(), CancellationToken::new());
        watcher.manage("panics", |_msg, _ctx| async move {
            panic!("boom");
        });
        watcher.start().unwrap();
        watcher.send_message("x").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(watcher.status().handler_errors >= 1);
        watcher.stop().await;
    }
}
