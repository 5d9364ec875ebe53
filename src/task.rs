//! Cancelable handles for in-flight commands.
//!
//! A [`CancelableTask`] is what every `exec` call hands back. The body of the
//! task runs as a spawned Tokio task, so the code behind it never starts on the
//! caller's stack. Cancellation is cooperative: [`CancelableTask::cancel`] runs
//! the teardown callbacks the body registered, fires the task's cancellation
//! token, and then settles the task according to its [`CancelPolicy`].

use crate::error::{ExecError, TaskResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::trace;

/// What happens to a task that is canceled before it settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Settle fulfilled with `null` once the teardown callbacks have run.
    #[default]
    Fulfill,
    /// Settle rejected with [`ExecError::Canceled`].
    Reject,
    /// Leave settlement to the body. Teardown is expected to make it finish.
    Drain,
}

/// Lifecycle of a task. `Canceled` is the fulfilled-by-cancellation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Fulfilled,
    Rejected,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Fulfilled | TaskState::Rejected | TaskState::Canceled
        )
    }
}

type Teardown = Box<dyn FnOnce() + Send>;

struct Lifecycle {
    state: TaskState,
    canceled: bool,
    teardown: Vec<Teardown>,
    outcome: Option<oneshot::Sender<TaskResult>>,
}

struct TaskCore {
    policy: CancelPolicy,
    token: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl TaskCore {
    fn new(policy: CancelPolicy) -> (Arc<Self>, oneshot::Receiver<TaskResult>) {
        let (tx, rx) = oneshot::channel();
        let core = TaskCore {
            policy,
            token: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::Pending,
                canceled: false,
                teardown: Vec::new(),
                outcome: Some(tx),
            }),
        };
        (Arc::new(core), rx)
    }

    // Callbacks never run under this lock, so poisoning only means a panic
    // elsewhere; the bookkeeping itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move from pending to running. Returns `false` if the body must not run.
    fn begin(&self) -> bool {
        let mut lifecycle = self.lock();
        if lifecycle.canceled || lifecycle.state.is_terminal() {
            return false;
        }
        lifecycle.state = TaskState::Running;
        true
    }

    /// First settlement wins; later calls return `false`.
    fn settle(&self, result: TaskResult) -> bool {
        let mut lifecycle = self.lock();
        let Some(outcome) = lifecycle.outcome.take() else {
            return false;
        };
        lifecycle.state = match (&result, lifecycle.canceled) {
            (Err(_), _) => TaskState::Rejected,
            (Ok(_), true) => TaskState::Canceled,
            (Ok(_), false) => TaskState::Fulfilled,
        };
        let stale = std::mem::take(&mut lifecycle.teardown);
        drop(lifecycle);
        drop(stale);

        let _ = outcome.send(result);
        true
    }

    fn settle_canceled(&self) {
        let result = match self.policy {
            CancelPolicy::Reject => Err(ExecError::Canceled),
            CancelPolicy::Fulfill | CancelPolicy::Drain => Ok(Value::Null),
        };
        self.settle(result);
    }

    fn cancel(&self) {
        let (teardown, state) = {
            let mut lifecycle = self.lock();
            if lifecycle.canceled || lifecycle.state.is_terminal() {
                return;
            }
            lifecycle.canceled = true;
            (std::mem::take(&mut lifecycle.teardown), lifecycle.state)
        };
        trace!(callbacks = teardown.len(), ?state, "canceling task");

        self.token.cancel();
        for callback in teardown {
            callback();
        }

        if self.policy != CancelPolicy::Drain || state == TaskState::Pending {
            self.settle_canceled();
        }
    }

    fn on_cancel(&self, callback: Teardown) {
        let mut lifecycle = self.lock();
        if lifecycle.state.is_terminal() {
            return;
        }
        if lifecycle.canceled {
            drop(lifecycle);
            callback();
            return;
        }
        lifecycle.teardown.push(callback);
    }

    fn state(&self) -> TaskState {
        self.lock().state
    }
}

/// Hooks handed to the body of a task.
///
/// `resolve` and `reject` settle the task early (the first settlement wins,
/// including the value the body eventually returns). `on_cancel` registers a
/// teardown callback for [`CancelableTask::cancel`].
#[derive(Clone)]
pub struct TaskContext {
    core: Arc<TaskCore>,
}

impl TaskContext {
    pub fn resolve(&self, value: Value) -> bool {
        self.core.settle(Ok(value))
    }

    pub fn reject(&self, err: ExecError) -> bool {
        self.core.settle(Err(err))
    }

    /// Register a teardown callback.
    ///
    /// Runs immediately if the task is already being canceled and is dropped
    /// if the task has settled.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.on_cancel(Box::new(callback));
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.token.is_cancelled()
    }

    /// Completes once `cancel` has been called on the task.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.core.token.cancelled()
    }

    /// Await `inner`, forwarding cancellation of this task into it.
    pub async fn forward(&self, inner: CancelableTask) -> TaskResult {
        let handle = inner.clone();
        self.on_cancel(move || handle.cancel());
        inner.await
    }
}

/// Handle to an asynchronous computation that can be canceled from outside.
///
/// Cloning the handle does not re-run anything: every clone observes the same
/// settlement, so several consumers can await one task.
#[derive(Clone)]
pub struct CancelableTask {
    core: Arc<TaskCore>,
    outcome: Shared<BoxFuture<'static, TaskResult>>,
}

impl CancelableTask {
    /// Spawn `body` with the default [`CancelPolicy::Fulfill`] policy.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self::with_policy(CancelPolicy::default(), body)
    }

    pub fn with_policy<F, Fut>(policy: CancelPolicy, body: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let (core, outcome) = TaskCore::new(policy);
        let task = Self::from_parts(core.clone(), outcome);

        tokio::spawn(async move {
            if !core.begin() {
                core.settle_canceled();
                return;
            }
            let ctx = TaskContext { core: core.clone() };
            let result = AssertUnwindSafe(async move { body(ctx).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(ExecError::handler(anyhow::anyhow!(
                        "command panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            core.settle(result);
        });

        task
    }

    /// A task that mirrors `inner` and forwards cancellation into it.
    ///
    /// `inner` is already in flight, so the returned task starts out running
    /// with the forwarding teardown in place: a cancel issued right away still
    /// reaches `inner`, and the result is whatever `inner` settles with.
    pub fn forward(inner: CancelableTask) -> Self {
        let (core, outcome) = TaskCore::new(CancelPolicy::Drain);
        core.lock().state = TaskState::Running;
        let handle = inner.clone();
        core.on_cancel(Box::new(move || handle.cancel()));

        let task = Self::from_parts(core.clone(), outcome);
        tokio::spawn(async move {
            let result = inner.await;
            core.settle(result);
        });
        task
    }

    /// An already fulfilled task.
    pub fn resolved(value: Value) -> Self {
        Self::settled(Ok(value))
    }

    /// An already rejected task.
    pub fn rejected(err: ExecError) -> Self {
        Self::settled(Err(err))
    }

    fn settled(result: TaskResult) -> Self {
        let (core, outcome) = TaskCore::new(CancelPolicy::default());
        core.settle(result);
        Self::from_parts(core, outcome)
    }

    fn from_parts(core: Arc<TaskCore>, outcome: oneshot::Receiver<TaskResult>) -> Self {
        let outcome = outcome
            .map(|received| {
                received.unwrap_or_else(|_| {
                    Err(ExecError::handler(anyhow::anyhow!(
                        "task was dropped before it settled"
                    )))
                })
            })
            .boxed()
            .shared();
        Self { core, outcome }
    }

    /// Request cancellation. Idempotent, and a no-op once the task settled.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.token.is_cancelled()
    }

    pub fn is_settled(&self) -> bool {
        self.state().is_terminal()
    }
}

impl Future for CancelableTask {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TaskResult> {
        self.outcome.poll_unpin(cx)
    }
}

impl fmt::Debug for CancelableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelableTask")
            .field("state", &self.state())
            .field("policy", &self.core.policy)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
