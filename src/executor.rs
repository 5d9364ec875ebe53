use crate::error::ExecError;
use crate::task::CancelableTask;
use async_trait::async_trait;
use serde_json::Value;

/// Anything that can list and execute named commands.
///
/// Implemented by [`LeafExecutor`](crate::LeafExecutor), which owns a registry
/// of handlers, and by [`CompositeExecutor`](crate::CompositeExecutor), which
/// fans a command out to several executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Names of the commands this executor can run.
    async fn list_commands(&self) -> Result<Vec<String>, ExecError>;

    /// Start `command` with `args`.
    ///
    /// Never runs handler code before returning; failures, including unknown
    /// commands, are reported through the returned task.
    fn exec(&self, command: &str, args: Value) -> CancelableTask;
}
