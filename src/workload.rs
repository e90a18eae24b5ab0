//! Workload driven by the service controller

use crate::controller::ServiceView;
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// The long-running unit of work behind a service.
///
/// `start` must return once the workload is running (spawning whatever it
/// needs); `stop` must return once it has shut down. Both receive a
/// read-only view of the service they run under.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn start(&self, service: &ServiceView) -> Result<()>;
    async fn stop(&self, service: &ServiceView) -> Result<()>;
}

/// Sample workload that logs a heartbeat on a fixed interval
pub struct Heartbeat {
    interval: Duration,
    shutdown: Arc<Notify>,
    beats: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            shutdown: Arc::new(Notify::new()),
            beats: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Workload for Heartbeat {
    async fn start(&self, service: &ServiceView) -> Result<()> {
        let mut task = self
            .task
            .lock()
            .map_err(|_| anyhow::anyhow!("heartbeat task lock poisoned"))?;
        if task.is_some() {
            anyhow::bail!("heartbeat for {} is already running", service.name());
        }

        info!("🚀 Starting heartbeat for {} every {:?}", service, self.interval);

        let shutdown = self.shutdown.clone();
        let beats = self.beats.clone();
        let interval = self.interval;
        let name = service.name().to_string();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let count = beats.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!("{} heartbeat {}", name, count);
                    }
                    _ = shutdown.notified() => break,
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self, service: &ServiceView) -> Result<()> {
        info!("🛑 Stopping heartbeat for {}", service);

        let task = self
            .task
            .lock()
            .map_err(|_| anyhow::anyhow!("heartbeat task lock poisoned"))?
            .take();
        match task {
            Some(task) => {
                // Stored as a permit if the task is between ticks
                self.shutdown.notify_one();
                if let Err(e) = task.await {
                    warn!("Heartbeat task ended abnormally: {}", e);
                }
                info!("✅ Heartbeat stopped after {} beats", self.beats());
            }
            None => debug!("Heartbeat for {} was not running", service.name()),
        }
        Ok(())
    }
}
