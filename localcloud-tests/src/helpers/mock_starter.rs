//! Recording starters and provisioners

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use localcloud_lifecycle::{ContainerRef, Provisioner, RuntimeError, ServiceStarter};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Starter handing out `<prefix>-1`, `<prefix>-2`, ... and recording when it ran.
pub struct MockStarter {
    prefix: String,
    started: AtomicU32,
    failures_left: AtomicU32,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<Instant>>,
}

impl MockStarter {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            started: AtomicU32::new(0),
            failures_left: AtomicU32::new(0),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// The next `count` calls fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Later calls take `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of calls, failed ones included.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Time of every call, oldest first.
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }

    /// Reference the `n`th successful start returned (1-based).
    pub fn container(&self, n: u32) -> ContainerRef {
        ContainerRef::new(format!("{}-{}", self.prefix, n))
    }
}

#[async_trait]
impl ServiceStarter for MockStarter {
    async fn start(&self) -> Result<ContainerRef, RuntimeError> {
        self.calls.lock().push(Instant::now());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RuntimeError::Failed(format!("{} failed to start", self.prefix)));
        }

        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.container(n))
    }
}

/// Provisioner that counts calls and optionally fails.
#[derive(Default)]
pub struct MockProvisioner {
    calls: AtomicU32,
    fail: bool,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail: true,
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(&self) -> Result<(), RuntimeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RuntimeError::Failed("network create failed".to_string()));
        }
        Ok(())
    }
}
