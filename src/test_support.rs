//! Handlers shared by the executor tests.

use crate::config::ProjectConfig;
use crate::handler::ManagedCommand;
use crate::task::{CancelPolicy, CancelableTask};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::interval;

/// Ticks every millisecond until stopped.
#[derive(Default)]
pub struct Forever {
    ticks: AtomicUsize,
    stops: AtomicUsize,
    stopped: AtomicBool,
    fail_with: Option<String>,
}

impl Forever {
    /// A managed command whose `start` fails right away.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagedCommand for Forever {
    async fn start(&self, _config: Arc<ProjectConfig>, _args: Value) -> anyhow::Result<Value> {
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{}", message);
        }

        self.stopped.store(false, Ordering::SeqCst);
        let mut ticker = interval(Duration::from_millis(1));
        loop {
            ticker.tick().await;
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(json!("stopped"));
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A task that counts ticks until it is canceled.
pub fn ticking_task(ticks: Arc<AtomicUsize>) -> CancelableTask {
    CancelableTask::with_policy(CancelPolicy::Drain, move |ctx| async move {
        let mut ticker = interval(Duration::from_millis(1));
        while !ctx.is_cancelled() {
            ticker.tick().await;
            ticks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(json!("ticked"))
    })
}
