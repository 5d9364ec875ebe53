use crate::config::ProjectConfig;
use crate::error::ExecError;
use crate::executor::Executor;
use crate::leaf::LeafExecutor;
use crate::task::{CancelPolicy, CancelableTask};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

/// A child of a [`CompositeExecutor`] before coercion.
pub enum Member {
    Executor(Arc<dyn Executor>),
    /// A raw JSON command map, turned into a [`LeafExecutor`].
    Registry(Value),
}

impl Member {
    pub fn executor(executor: impl Executor + 'static) -> Self {
        Member::Executor(Arc::new(executor))
    }
}

impl From<Arc<dyn Executor>> for Member {
    fn from(executor: Arc<dyn Executor>) -> Self {
        Member::Executor(executor)
    }
}

impl From<LeafExecutor> for Member {
    fn from(executor: LeafExecutor) -> Self {
        Member::executor(executor)
    }
}

impl From<CompositeExecutor> for Member {
    fn from(executor: CompositeExecutor) -> Self {
        Member::executor(executor)
    }
}

impl From<Value> for Member {
    fn from(value: Value) -> Self {
        Member::Registry(value)
    }
}

type CommandMap = BTreeMap<String, Vec<Arc<dyn Executor>>>;

struct Members {
    executors: Vec<Arc<dyn Executor>>,
    commands: OnceCell<CommandMap>,
}

impl Members {
    /// Command name to the executors declaring it, in member order.
    ///
    /// Built on first use and kept for the executor's lifetime; members are
    /// expected not to change their command sets afterwards.
    async fn commands(&self) -> Result<&CommandMap, ExecError> {
        self.commands
            .get_or_try_init(|| async {
                let listed = try_join_all(self.executors.iter().map(|executor| async move {
                    let names = executor.list_commands().await?;
                    Ok::<_, ExecError>((executor.clone(), names))
                }))
                .await?;

                let mut commands = CommandMap::new();
                for (executor, names) in listed {
                    for name in names {
                        commands.entry(name).or_default().push(executor.clone());
                    }
                }
                debug!(
                    members = self.executors.len(),
                    commands = commands.len(),
                    "built command map"
                );
                Ok::<_, ExecError>(commands)
            })
            .await
    }
}

/// Executor that fans each command out to every member declaring it.
///
/// The members run concurrently under one task. It fulfills with the members'
/// results (in member order) once all of them fulfilled, and rejects with the
/// first rejection as soon as it happens. A rejection does not cancel the
/// other members: they keep running, and since the composite task is settled
/// by then, canceling it no longer reaches them. Canceling the composite
/// before that cancels every member, nested composites included.
#[derive(Clone)]
pub struct CompositeExecutor {
    members: Arc<Members>,
}

impl CompositeExecutor {
    pub fn new(members: Vec<Member>) -> Result<Self, ExecError> {
        Self::with_config(members, Arc::new(ProjectConfig::default()))
    }

    /// Like [`CompositeExecutor::new`]; raw command maps get `config`.
    pub fn with_config(
        members: Vec<Member>,
        config: Arc<ProjectConfig>,
    ) -> Result<Self, ExecError> {
        let executors = members
            .into_iter()
            .map(|member| prepare(member, &config))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            members: Arc::new(Members {
                executors,
                commands: OnceCell::new(),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.members.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.executors.is_empty()
    }
}

fn prepare(member: Member, config: &Arc<ProjectConfig>) -> Result<Arc<dyn Executor>, ExecError> {
    match member {
        Member::Executor(executor) => Ok(executor),
        Member::Registry(value) if value.is_object() => {
            Ok(Arc::new(LeafExecutor::from_value(&value, config.clone())?))
        }
        Member::Registry(value) => Err(ExecError::InvalidRegistry(format!(
            "invalid executor provided for composition: {}",
            value
        ))),
    }
}

#[async_trait]
impl Executor for CompositeExecutor {
    /// Distinct command names across all members, sorted.
    async fn list_commands(&self) -> Result<Vec<String>, ExecError> {
        Ok(self.members.commands().await?.keys().cloned().collect())
    }

    fn exec(&self, command: &str, args: Value) -> CancelableTask {
        let members = self.members.clone();
        let command = command.to_string();

        CancelableTask::with_policy(CancelPolicy::Drain, move |ctx| async move {
            let executors = members
                .commands()
                .await?
                .get(&command)
                .cloned()
                .unwrap_or_default();
            if executors.is_empty() {
                return Err(ExecError::NoExecutors(command));
            }

            trace!(command = %command, fan_out = executors.len(), "fanning out command");
            let executions: Vec<CancelableTask> = executors
                .iter()
                .map(|executor| executor.exec(&command, args.clone()))
                .collect();

            let handles = executions.clone();
            ctx.on_cancel(move || handles.iter().for_each(CancelableTask::cancel));

            let results = try_join_all(executions).await?;
            Ok(Value::Array(results))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::handler::Handler;
    use crate::leaf::Registry;
    use crate::task::TaskState;
    use crate::test_support::Forever;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn noop() -> Handler {
        Handler::sync(|_, _| Ok(Value::Null))
    }

    fn leaf(names: &[&str]) -> Member {
        LeafExecutor::new(names.iter().map(|name| (*name, noop())).collect()).into()
    }

    fn counter(calls: &Arc<AtomicUsize>) -> Handler {
        let calls = calls.clone();
        Handler::sync(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("once"))
        })
    }

    /// Leaf executor that counts how often it is asked for its commands.
    struct Listing {
        inner: LeafExecutor,
        lists: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Executor for Listing {
        async fn list_commands(&self) -> Result<Vec<String>, ExecError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(5)).await;
            self.inner.list_commands().await
        }

        fn exec(&self, command: &str, args: Value) -> CancelableTask {
            self.inner.exec(command, args)
        }
    }

    #[tokio::test]
    async fn test_can_be_created_with_a_single_executor() {
        let composite = CompositeExecutor::new(vec![leaf(&["test"])]).unwrap();
        assert_eq!(composite.len(), 1);
        assert_eq!(composite.list_commands().await.unwrap(), vec!["test"]);
    }

    #[tokio::test]
    async fn test_turns_objects_into_leaf_executors() {
        let composite = CompositeExecutor::new(vec![json!({"test": "true"}).into()]).unwrap();
        assert_eq!(composite.list_commands().await.unwrap(), vec!["test"]);
    }

    #[test]
    fn test_rejects_members_that_are_not_command_maps() {
        for value in [json!([]), json!(42), json!("named")] {
            let err = CompositeExecutor::new(vec![leaf(&["a"]), value.clone().into()])
                .err()
                .expect("construction should fail");
            assert_eq!(err.kind(), ErrorKind::InvalidRegistry);
            assert_eq!(
                err.to_string(),
                format!("invalid executor provided for composition: {}", value)
            );
        }
    }

    #[tokio::test]
    async fn test_only_returns_unique_sorted_names() {
        let composite = CompositeExecutor::new(vec![leaf(&["b", "a"]), leaf(&["a"])]).unwrap();
        assert_eq!(composite.list_commands().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_command_map_is_built_once() {
        let lists = Arc::new(AtomicUsize::new(0));
        let listing = Listing {
            inner: LeafExecutor::new(Registry::new().with("a", noop())),
            lists: lists.clone(),
        };
        let composite = CompositeExecutor::new(vec![Member::executor(listing)]).unwrap();

        let (first, second) = tokio::join!(composite.list_commands(), composite.list_commands());
        assert_eq!(first.unwrap(), second.unwrap());
        composite.exec("a", json!({})).await.unwrap();
        composite.list_commands().await.unwrap();

        assert_eq!(lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_command_rejects() {
        let composite = CompositeExecutor::new(vec![leaf(&["a"])]).unwrap();

        let err = composite.exec("b", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandNotFound);
        assert_eq!(err.to_string(), "no executors found for command: b");
    }

    #[tokio::test]
    async fn test_executes_all_composed_commands() {
        let sync_calls = Arc::new(AtomicUsize::new(0));
        let managed = Arc::new(Forever::default());
        let composite = CompositeExecutor::new(vec![
            LeafExecutor::new(Registry::new().with("test", counter(&sync_calls))).into(),
            LeafExecutor::new(Registry::new().with("test", Handler::Managed(managed.clone())))
                .into(),
        ])
        .unwrap();

        let task = composite.exec("test", json!({}));
        sleep(Duration::from_millis(20)).await;
        task.cancel();

        assert_eq!(task.await.unwrap(), json!(["once", "stopped"]));
        assert_eq!(sync_calls.load(Ordering::SeqCst), 1);
        assert!(managed.ticks() > 0);
    }

    #[tokio::test]
    async fn test_runs_parallel_cancelable_commands() {
        let a = Arc::new(Forever::default());
        let b = Arc::new(Forever::default());
        let composite = CompositeExecutor::new(vec![
            LeafExecutor::new(Registry::new().with("test", Handler::Managed(a.clone()))).into(),
            LeafExecutor::new(Registry::new().with("test", Handler::Managed(b.clone()))).into(),
        ])
        .unwrap();

        let task = composite.exec("test", json!({}));
        sleep(Duration::from_millis(100)).await;
        task.cancel();
        task.clone().await.unwrap();

        assert_eq!(task.state(), TaskState::Canceled);
        assert!(a.ticks() > 10);
        assert!(b.ticks() > 10);
        assert_eq!((a.stops(), b.stops()), (1, 1));
    }

    #[tokio::test]
    async fn test_runs_forever_and_finite_actions_together() {
        let forever = Arc::new(Forever::default());
        let sync_calls = Arc::new(AtomicUsize::new(0));
        let async_calls = Arc::new(AtomicUsize::new(0));
        let async_counter = async_calls.clone();

        let composite = CompositeExecutor::new(vec![
            LeafExecutor::new(Registry::new().with("test", Handler::Managed(forever.clone())))
                .into(),
            LeafExecutor::new(Registry::new().with("test", counter(&sync_calls))).into(),
            LeafExecutor::new(Registry::new().with(
                "test",
                Handler::future(move |_, _| {
                    let calls = async_counter.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(json!("async"))
                    }
                }),
            ))
            .into(),
        ])
        .unwrap();

        let task = composite.exec("test", json!({}));
        sleep(Duration::from_millis(100)).await;
        task.cancel();

        assert_eq!(task.await.unwrap(), json!(["stopped", "once", "async"]));
        assert!(forever.ticks() > 10);
        assert_eq!(sync_calls.load(Ordering::SeqCst), 1);
        assert_eq!(async_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_failure_rejects_without_canceling_siblings() {
        let slow = Arc::new(Forever::default());
        let composite = CompositeExecutor::new(vec![
            LeafExecutor::new(Registry::new().with(
                "a",
                Handler::sync(|_, _| Err(anyhow::anyhow!("x"))),
            ))
            .into(),
            LeafExecutor::new(Registry::new().with("a", Handler::Managed(slow.clone()))).into(),
        ])
        .unwrap();

        let task = composite.exec("a", json!({}));
        let err = timeout(Duration::from_secs(1), task.clone())
            .await
            .expect("rejection should not wait for the slow sibling")
            .unwrap_err();
        assert_eq!(err.to_string(), "x");

        // Settled composites ignore cancel, so the sibling keeps running.
        task.cancel();
        let before = slow.ticks();
        sleep(Duration::from_millis(20)).await;
        assert!(slow.ticks() > before);
        assert_eq!(slow.stops(), 0);
    }

    #[tokio::test]
    async fn test_cancel_propagates_through_nested_composites() {
        let forever = Arc::new(Forever::default());
        let inner = CompositeExecutor::new(vec![
            LeafExecutor::new(Registry::new().with("dev", Handler::Managed(forever.clone())))
                .into(),
        ])
        .unwrap();
        let outer = CompositeExecutor::new(vec![inner.into(), leaf(&["build"])]).unwrap();

        assert_eq!(outer.list_commands().await.unwrap(), vec!["build", "dev"]);

        let task = outer.exec("dev", json!({}));
        sleep(Duration::from_millis(20)).await;
        task.cancel();
        task.cancel();

        assert_eq!(task.clone().await.unwrap(), json!([["stopped"]]));
        assert_eq!(forever.stops(), 1);
        task.cancel();
        assert_eq!(forever.stops(), 1);
    }

    #[tokio::test]
    async fn test_uncancelable_member_rejects_on_cancel() {
        let composite = CompositeExecutor::new(vec![
            LeafExecutor::new(Registry::new().with(
                "wait",
                Handler::future(|_, _| async {
                    sleep(Duration::from_secs(5)).await;
                    Ok::<_, anyhow::Error>(Value::Null)
                }),
            ))
            .into(),
        ])
        .unwrap();

        let task = composite.exec("wait", json!({}));
        sleep(Duration::from_millis(20)).await;
        task.cancel();

        let err = task.await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotCancelable);
    }
}
