use crate::catalog::ExecutorCatalog;
use crate::composite::{CompositeExecutor, Member};
use crate::config::{ConfigSource, Manifest, ProjectConfig};
use crate::error::ExecError;
use crate::executor::Executor;
use crate::leaf::LeafExecutor;
use crate::task::CancelableTask;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A project together with the executor that runs its commands.
///
/// Built from a project directory containing `mrpo.json`, or from an inline
/// description:
///
/// ```no_run
/// # async fn demo() -> Result<(), mrpo::ExecError> {
/// use mrpo::{ExecutorCatalog, MrPo};
/// use serde_json::json;
///
/// let mrpo = MrPo::build(
///     json!({"name": "demo", "executor": {"hello": "echo hello"}}),
///     &ExecutorCatalog::new(),
/// )
/// .await?;
/// assert_eq!(mrpo.list_commands().await?, vec!["hello"]);
/// mrpo.exec("hello", json!({})).await?;
/// # Ok(())
/// # }
/// ```
pub struct MrPo {
    config: Arc<ProjectConfig>,
    executor: Arc<dyn Executor>,
}

impl MrPo {
    pub fn new(config: ProjectConfig, executor: Arc<dyn Executor>) -> Self {
        Self {
            config: Arc::new(config),
            executor,
        }
    }

    /// Compose `members` into one executor. Raw command maps get `config`.
    pub fn with_executors(config: ProjectConfig, members: Vec<Member>) -> Result<Self, ExecError> {
        let config = Arc::new(config);
        let executor = CompositeExecutor::with_config(members, config.clone())?;
        Ok(Self {
            config,
            executor: Arc::new(executor),
        })
    }

    /// Load a project description and resolve its executor.
    ///
    /// The description names either one `executor` or a list of `executors`.
    /// Each entry is the name of an executor in `catalog` or an inline command
    /// map; a list is composed into a [`CompositeExecutor`].
    pub async fn build(
        source: impl Into<ConfigSource>,
        catalog: &ExecutorCatalog,
    ) -> Result<Self, ExecError> {
        let Manifest {
            config,
            executor,
            executors,
        } = Manifest::load(source.into()).await?;
        debug!(cwd = %config.cwd.display(), name = ?config.name, "loaded project");

        match (executor, executors) {
            (Some(_), Some(_)) => Err(ExecError::Config(
                "only executor or executors may be given at the same time".to_string(),
            )),
            (None, None) => Err(ExecError::Config("invalid executor spec: null".to_string())),
            (Some(spec), None) => {
                let config = Arc::new(config);
                let executor = resolve(spec, &config, catalog)?;
                Ok(Self { config, executor })
            }
            (None, Some(specs)) => {
                let config = Arc::new(config);
                let members = specs
                    .into_iter()
                    .map(|spec| match spec {
                        Value::String(name) => catalog
                            .resolve(&name, config.clone())
                            .map(Member::Executor),
                        other => Ok(Member::Registry(other)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let executor = CompositeExecutor::with_config(members, config.clone())?;
                Ok(Self {
                    config,
                    executor: Arc::new(executor),
                })
            }
        }
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Command names in alphabetical order.
    pub async fn list_commands(&self) -> Result<Vec<String>, ExecError> {
        let mut names = self.executor.list_commands().await?;
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Run `command`. Canceling the returned task cancels the execution
    /// underneath it and may be repeated safely.
    pub fn exec(&self, command: &str, args: Value) -> CancelableTask {
        debug!(command, "executing");
        CancelableTask::forward(self.executor.exec(command, args))
    }
}

fn resolve(
    spec: Value,
    config: &Arc<ProjectConfig>,
    catalog: &ExecutorCatalog,
) -> Result<Arc<dyn Executor>, ExecError> {
    match spec {
        Value::String(name) => catalog.resolve(&name, config.clone()),
        spec @ Value::Object(_) => Ok(Arc::new(LeafExecutor::from_value(&spec, config.clone())?)),
        other => Err(ExecError::Config(format!("invalid executor spec: {}", other))),
    }
}

impl fmt::Debug for MrPo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MrPo").field("config", &self.config).finish()
    }
}
