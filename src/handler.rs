use crate::config::ProjectConfig;
use crate::process::ProcessCommand;
use crate::task::CancelableTask;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// One-shot action run to completion on the executor's task.
pub type SyncFn = dyn Fn(&ProjectConfig, &Value) -> anyhow::Result<Value> + Send + Sync;

/// Asynchronous action that cannot be interrupted once started.
pub type AsyncFn =
    dyn Fn(Arc<ProjectConfig>, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// Action that produces its own [`CancelableTask`].
pub type CancelableFn = dyn Fn(Arc<ProjectConfig>, Value) -> CancelableTask + Send + Sync;

/// A resource whose lifetime has to be ended explicitly.
///
/// `start` resolves when the resource has finished. `stop` asks it to finish;
/// it must not settle anything itself, it only has to make the pending `start`
/// return. An implementation owns its lifecycle state and is never started
/// twice concurrently by the same executor.
#[async_trait]
pub trait ManagedCommand: Send + Sync {
    async fn start(&self, config: Arc<ProjectConfig>, args: Value) -> anyhow::Result<Value>;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// The implementation bound to a command name.
///
/// The shape is decided once, when the registry is built, so dispatch is a
/// single match.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
    Cancelable(Arc<CancelableFn>),
    Managed(Arc<dyn ManagedCommand>),
    /// A registry value of a shape no variant accepts. Carries a description
    /// of what was found.
    Invalid(String),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&ProjectConfig, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<ProjectConfig>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Handler::Async(Arc::new(move |config, args| f(config, args).boxed()))
    }

    pub fn cancelable<F>(f: F) -> Self
    where
        F: Fn(Arc<ProjectConfig>, Value) -> CancelableTask + Send + Sync + 'static,
    {
        Handler::Cancelable(Arc::new(f))
    }

    pub fn managed<M>(command: M) -> Self
    where
        M: ManagedCommand + 'static,
    {
        Handler::Managed(Arc::new(command))
    }

    /// Build a handler from a value found in a project file.
    ///
    /// Strings, argv arrays and `{"run": ...}` objects become process
    /// commands; everything else is kept as [`Handler::Invalid`] and rejected
    /// when the command is executed.
    pub fn probe(value: &Value) -> Self {
        match ProcessCommand::from_value(value) {
            Some(command) => Handler::managed(command),
            None => Handler::Invalid(value.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Sync(_) => "sync",
            Handler::Async(_) => "async",
            Handler::Cancelable(_) => "cancelable",
            Handler::Managed(_) => "managed",
            Handler::Invalid(_) => "invalid",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Invalid(found) => f.debug_tuple("Invalid").field(found).finish(),
            other => f.write_str(other.kind()),
        }
    }
}
