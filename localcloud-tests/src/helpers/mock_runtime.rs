//! Scriptable in-memory container runtime

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use localcloud_lifecycle::runtime::{ContainerInspect, ResourceSnapshot};
use localcloud_lifecycle::{ContainerRef, ContainerRuntime, RuntimeError};
use parking_lot::Mutex;
use tokio::sync::watch;

/// A runtime operation observed by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(ContainerRef),
    Stop(ContainerRef),
    Remove(ContainerRef),
}

/// Container runtime whose containers run until the test says otherwise.
///
/// Exits are delivered through [`MockRuntime::exit`], or immediately for every
/// container once [`MockRuntime::set_auto_exit`] is set.
#[derive(Default)]
pub struct MockRuntime {
    exits: Mutex<HashMap<ContainerRef, watch::Sender<Option<i64>>>>,
    auto_exit: Mutex<Option<i64>>,
    inspect: Mutex<HashMap<ContainerRef, ContainerInspect>>,
    stats: Mutex<HashMap<ContainerRef, ResourceSnapshot>>,
    failing_stops: Mutex<HashSet<ContainerRef>>,
    calls: Mutex<Vec<RuntimeCall>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `container` exit with `code`, waking anyone waiting on it.
    pub fn exit(&self, container: impl Into<ContainerRef>, code: i64) {
        let container = container.into();
        self.exit_channel(&container).send_replace(Some(code));
    }

    /// Every container exits with `code` as soon as it is waited on.
    /// `None` restores normal behavior.
    pub fn set_auto_exit(&self, code: Option<i64>) {
        *self.auto_exit.lock() = code;
    }

    pub fn set_inspect(&self, container: impl Into<ContainerRef>, inspect: ContainerInspect) {
        self.inspect.lock().insert(container.into(), inspect);
    }

    pub fn set_stats(&self, container: impl Into<ContainerRef>, stats: ResourceSnapshot) {
        self.stats.lock().insert(container.into(), stats);
    }

    /// Stopping `container` will fail.
    pub fn fail_stop(&self, container: impl Into<ContainerRef>) {
        self.failing_stops.lock().insert(container.into());
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().clone()
    }

    pub fn stopped(&self) -> Vec<ContainerRef> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                RuntimeCall::Stop(container) => Some(container.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<ContainerRef> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                RuntimeCall::Remove(container) => Some(container.clone()),
                _ => None,
            })
            .collect()
    }

    fn exit_channel(&self, container: &ContainerRef) -> watch::Sender<Option<i64>> {
        self.exits
            .lock()
            .entry(container.clone())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    fn has_exited(&self, container: &ContainerRef) -> bool {
        self.exits
            .lock()
            .get(container)
            .is_some_and(|tx| tx.borrow().is_some())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn wait_exit(&self, container: &ContainerRef) -> Result<i64, RuntimeError> {
        if let Some(code) = *self.auto_exit.lock() {
            return Ok(code);
        }

        let mut rx = self.exit_channel(container).subscribe();
        let code = *rx
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| RuntimeError::NotFound(container.to_string()))?;
        Ok(code.unwrap_or_default())
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.calls.lock().push(RuntimeCall::Start(container.clone()));
        Ok(())
    }

    async fn stop(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.calls.lock().push(RuntimeCall::Stop(container.clone()));
        if self.failing_stops.lock().contains(container) {
            return Err(RuntimeError::Failed(format!("cannot stop {}", container)));
        }
        Ok(())
    }

    async fn remove(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        self.calls.lock().push(RuntimeCall::Remove(container.clone()));
        Ok(())
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerInspect, RuntimeError> {
        if let Some(inspect) = self.inspect.lock().get(container) {
            return Ok(inspect.clone());
        }
        Ok(ContainerInspect {
            running: !self.has_exited(container),
            health: None,
        })
    }

    async fn stats(&self, container: &ContainerRef) -> Result<ResourceSnapshot, RuntimeError> {
        Ok(self
            .stats
            .lock()
            .get(container)
            .copied()
            .unwrap_or_default())
    }
}
