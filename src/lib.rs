//! Run a project's named commands through pluggable executors.
//!
//! A project describes its commands in `mrpo.json`. Each command is dispatched
//! by an [`Executor`]: a [`LeafExecutor`] owns a registry of handlers, and a
//! [`CompositeExecutor`] fans one command out to several executors at once.
//! Every execution hands back a [`CancelableTask`], which can be awaited by
//! any number of consumers and canceled from outside.
//!
//! [`MrPo`] ties a project description to its executor and is what the `mrpo`
//! binary drives.

mod catalog;
mod composite;
mod config;
mod error;
mod executor;
mod handler;
mod leaf;
mod mrpo;
mod process;
mod task;
#[cfg(test)]
mod test_support;

pub use catalog::{ExecutorCatalog, ExecutorFactory};
pub use composite::{CompositeExecutor, Member};
pub use config::{CONFIG_FILE, ConfigSource, Manifest, ProjectConfig};
pub use error::{ErrorKind, ExecError, TaskResult};
pub use executor::Executor;
pub use handler::{AsyncFn, CancelableFn, Handler, ManagedCommand, SyncFn};
pub use leaf::{LeafExecutor, Registry};
pub use mrpo::MrPo;
pub use process::{ProcessCommand, find_program};
pub use task::{CancelPolicy, CancelableTask, TaskContext, TaskState};
