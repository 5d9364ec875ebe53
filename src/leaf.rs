use crate::config::ProjectConfig;
use crate::error::{ExecError, TaskResult};
use crate::executor::Executor;
use crate::handler::{Handler, ManagedCommand};
use crate::task::{CancelPolicy, CancelableTask, TaskContext};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Mapping from command name to handler, owned by one [`LeafExecutor`].
#[derive(Clone, Debug, Default)]
pub struct Registry {
    handlers: BTreeMap<String, Handler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Registry::insert`].
    pub fn with(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.insert(name, handler);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers.insert(name.into(), handler)
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Build a registry from a JSON object, probing each value for its
    /// handler shape.
    pub fn from_value(value: &Value) -> Result<Self, ExecError> {
        match value {
            Value::Object(commands) => Ok(commands
                .iter()
                .map(|(name, spec)| (name.clone(), Handler::probe(spec)))
                .collect()),
            Value::Array(_) => Err(ExecError::InvalidRegistry(
                "command map may not be an array. Did you mean to use a CompositeExecutor?"
                    .to_string(),
            )),
            other => Err(ExecError::InvalidRegistry(format!(
                "invalid command map: {}",
                other
            ))),
        }
    }
}

impl<S: Into<String>> FromIterator<(S, Handler)> for Registry {
    fn from_iter<I: IntoIterator<Item = (S, Handler)>>(iter: I) -> Self {
        Self {
            handlers: iter
                .into_iter()
                .map(|(name, handler)| (name.into(), handler))
                .collect(),
        }
    }
}

/// Executor backed by a [`Registry`].
///
/// Every handler shape is normalized into one [`CancelableTask`]:
/// - sync handlers settle with their return value;
/// - async handlers settle with their output, and canceling them rejects with
///   [`ExecError::NotCancelable`];
/// - handlers returning a task get the cancellation forwarded to that task;
/// - managed handlers are stopped on cancel and settle once `start` returns.
pub struct LeafExecutor {
    registry: Arc<Registry>,
    config: Arc<ProjectConfig>,
}

impl LeafExecutor {
    pub fn new(registry: Registry) -> Self {
        Self::with_config(registry, Arc::new(ProjectConfig::default()))
    }

    pub fn with_config(registry: Registry, config: Arc<ProjectConfig>) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    /// Coerce a raw JSON command map into an executor.
    ///
    /// Fails right away for arrays and other non-objects.
    pub fn from_value(value: &Value, config: Arc<ProjectConfig>) -> Result<Self, ExecError> {
        Ok(Self::with_config(Registry::from_value(value)?, config))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Arc<ProjectConfig> {
        &self.config
    }
}

#[async_trait]
impl Executor for LeafExecutor {
    async fn list_commands(&self) -> Result<Vec<String>, ExecError> {
        Ok(self.registry.names().map(str::to_string).collect())
    }

    fn exec(&self, command: &str, args: Value) -> CancelableTask {
        let Some(handler) = self.registry.get(command) else {
            trace!(command, "command not found");
            return CancelableTask::rejected(ExecError::CommandNotFound(command.to_string()));
        };
        trace!(command, kind = handler.kind(), "dispatching command");

        let config = self.config.clone();
        match handler.clone() {
            Handler::Sync(run) => CancelableTask::new(move |_ctx| async move {
                run(config.as_ref(), &args).map_err(ExecError::handler)
            }),
            Handler::Async(run) => CancelableTask::new(move |ctx| async move {
                let guard = ctx.clone();
                ctx.on_cancel(move || {
                    guard.reject(ExecError::NotCancelable);
                });
                run(config, args).await.map_err(ExecError::handler)
            }),
            Handler::Cancelable(run) => {
                CancelableTask::with_policy(CancelPolicy::Drain, move |ctx| async move {
                    ctx.forward(run(config, args)).await
                })
            }
            Handler::Managed(managed) => {
                CancelableTask::with_policy(CancelPolicy::Drain, move |ctx| {
                    run_managed(ctx, managed, config, args)
                })
            }
            Handler::Invalid(_) => {
                CancelableTask::rejected(ExecError::InvalidHandler(command.to_string()))
            }
        }
    }
}

async fn run_managed(
    ctx: TaskContext,
    managed: Arc<dyn ManagedCommand>,
    config: Arc<ProjectConfig>,
    args: Value,
) -> TaskResult {
    let mut start = managed.start(config, args);
    tokio::select! {
        biased;
        result = &mut start => return result.map_err(ExecError::handler),
        _ = ctx.cancelled() => {}
    }

    trace!("stopping managed command");
    let (stopped, result) = tokio::join!(managed.stop(), &mut start);
    stopped.map_err(ExecError::handler)?;
    result.map_err(ExecError::handler)
}
