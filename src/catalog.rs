use crate::config::ProjectConfig;
use crate::error::ExecError;
use crate::executor::Executor;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds an executor for one project.
pub type ExecutorFactory =
    Arc<dyn Fn(Arc<ProjectConfig>) -> Result<Arc<dyn Executor>, ExecError> + Send + Sync>;

/// Executors that a project file may refer to by name.
///
/// `"executor": "rust"` in `mrpo.json` is looked up here and the matching
/// factory is called with the project's settings.
#[derive(Clone, Default)]
pub struct ExecutorCatalog {
    factories: BTreeMap<String, ExecutorFactory>,
}

impl ExecutorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, E>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Arc<ProjectConfig>) -> Result<E, ExecError> + Send + Sync + 'static,
        E: Executor + 'static,
    {
        self.factories.insert(
            name.into(),
            Arc::new(
                move |config: Arc<ProjectConfig>| -> Result<Arc<dyn Executor>, ExecError> {
                    Ok(Arc::new(factory(config)?))
                },
            ),
        );
    }

    /// Builder-style [`ExecutorCatalog::register`].
    pub fn with<F, E>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Arc<ProjectConfig>) -> Result<E, ExecError> + Send + Sync + 'static,
        E: Executor + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Register a fixed command map under `name`, as a JSON object of
    /// handler shapes.
    pub fn with_registry(self, name: impl Into<String>, commands: serde_json::Value) -> Self {
        self.with(name, move |config| {
            crate::leaf::LeafExecutor::from_value(&commands, config)
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn resolve(
        &self,
        name: &str,
        config: Arc<ProjectConfig>,
    ) -> Result<Arc<dyn Executor>, ExecError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ExecError::Config(format!("could not resolve executor \"{}\"", name)))?;
        debug!(executor = name, "using executor");
        factory(config)
    }
}

impl fmt::Debug for ExecutorCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::handler::Handler;
    use crate::leaf::{LeafExecutor, Registry};
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_resolves_registered_executor() {
        let catalog = ExecutorCatalog::new().with("echo", |config: Arc<ProjectConfig>| {
            Ok(LeafExecutor::with_config(
                Registry::new().with(
                    "cwd",
                    Handler::sync(|config, _| Ok(json!(config.cwd))),
                ),
                config,
            ))
        });

        let executor = catalog
            .resolve("echo", Arc::new(ProjectConfig::new("/srv")))
            .unwrap();
        assert_eq!(executor.list_commands().await.unwrap(), vec!["cwd"]);
        assert_eq!(
            executor.exec("cwd", Value::Null).await.unwrap(),
            json!("/srv")
        );
    }

    #[tokio::test]
    async fn test_registry_entries_are_probed() {
        let catalog =
            ExecutorCatalog::new().with_registry("scripts", json!({"build": "true", "bad": 1}));
        assert!(catalog.contains("scripts"));

        let executor = catalog
            .resolve("scripts", Arc::new(ProjectConfig::default()))
            .unwrap();
        assert_eq!(executor.list_commands().await.unwrap(), vec!["bad", "build"]);
        let err = executor.exec("bad", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandlerShape);
    }

    #[test]
    fn test_unknown_executor() {
        let catalog = ExecutorCatalog::new().with_registry("a", json!({}));
        let err = catalog
            .resolve("b", Arc::new(ProjectConfig::default()))
            .err()
            .expect("resolution should fail");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.to_string(), "could not resolve executor \"b\"");
    }

    #[test]
    fn test_factory_errors_are_returned() {
        let catalog = ExecutorCatalog::new().with_registry("broken", json!([]));
        let err = catalog
            .resolve("broken", Arc::new(ProjectConfig::default()))
            .err()
            .expect("resolution should fail");
        assert_eq!(err.kind(), ErrorKind::InvalidRegistry);
    }
}
