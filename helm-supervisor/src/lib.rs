//! Supervision of long-running units: crash-restart with exponential
//! back-off, graceful shutdown with a bounded drain, and lifecycle
//! notifications.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use helm_config::SupervisorConfig;
use reqwest::Client;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A unit exiting faster than this counts as a fast crash.
const FAST_CRASH_WINDOW: Duration = Duration::from_secs(60);
/// Upper bound on the restart back-off.
const MAX_BACKOFF_SECS: u64 = 60;

/// Lifecycle transitions reported for every unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    Start,
    Crash,
    Restart,
    Stop,
}

impl Lifecycle {
    fn label(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Crash => "crash",
            Self::Restart => "restart",
            Self::Stop => "stop",
        }
    }
}

/// An independently restartable long-running task.
///
/// `run` must watch the shutdown receiver and return promptly once it flips
/// to `true`; returning `Err` (or returning early without shutdown) counts
/// as a crash.
#[async_trait]
pub trait Unit: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()>;
}

/// Posts lifecycle events to an optional webhook, in addition to the log.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    webhook: Option<String>,
}

impl Notifier {
    #[must_use]
    pub fn new(webhook: Option<String>) -> Self {
        Self {
            client: Client::builder().build().expect("reqwest client"),
            webhook: webhook.and_then(|url| {
                let trimmed = url.trim().to_string();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed)
                }
            }),
        }
    }

    /// Post an operational alert outside the lifecycle stream.
    pub async fn alert(&self, title: &str, message: &str) {
        warn!(%title, %message, "alert raised");
        let Some(url) = self.webhook.as_ref() else {
            return;
        };
        let payload = json!({ "title": title, "message": message });
        if let Err(err) = self.client.post(url).json(&payload).send().await {
            error!(error = %err, "failed to send alert webhook");
        }
    }

    async fn lifecycle(&self, unit: &str, event: Lifecycle, detail: &str) {
        info!(unit, event = event.label(), detail, "lifecycle event");
        let Some(url) = self.webhook.as_ref() else {
            return;
        };
        let payload = json!({
            "unit": unit,
            "event": event.label(),
            "detail": detail,
        });
        if let Err(err) = self.client.post(url).json(&payload).send().await {
            error!(error = %err, "failed to post lifecycle webhook");
        }
    }
}

/// Restart delay after `fails` consecutive fast crashes:
/// `min(2^(fails-1), 60)` seconds.
#[must_use]
pub fn backoff_secs(fails: u32) -> u64 {
    if fails <= 1 {
        return 1;
    }
    1u64.checked_shl(fails - 1)
        .map_or(MAX_BACKOFF_SECS, |secs| secs.min(MAX_BACKOFF_SECS))
}

/// Owns the registered units and the shutdown signal.
pub struct Supervisor {
    config: SupervisorConfig,
    units: Vec<Arc<dyn Unit>>,
    notifier: Notifier,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        let notifier = Notifier::new(config.webhook_url.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            units: Vec::new(),
            notifier,
            shutdown_tx,
        }
    }

    /// Register a unit for supervised execution.
    pub fn register(&mut self, unit: Arc<dyn Unit>) {
        self.units.push(unit);
    }

    /// A receiver other components can use to observe shutdown.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Run all units until an external termination signal arrives, then
    /// drain and stop. Returns once every unit has ended.
    pub async fn run(self) -> anyhow::Result<()> {
        self.write_pid_file()?;
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            handles.push(spawn_supervised(
                unit.clone(),
                self.shutdown_tx.subscribe(),
                self.notifier.clone(),
            ));
        }

        tokio::signal::ctrl_c().await.ok();
        info!("termination signal received; beginning graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let drain = Duration::from_secs(self.config.drain_secs);
        let all_done = async {
            for handle in &mut handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(drain, all_done).await.is_err() {
            warn!(drain_secs = self.config.drain_secs, "drain expired; aborting units");
            for handle in &handles {
                handle.abort();
            }
        }
        self.remove_pid_file();
        info!("supervisor stopped cleanly");
        Ok(())
    }

    fn write_pid_file(&self) -> anyhow::Result<()> {
        let path: &PathBuf = &self.config.pid_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, std::process::id().to_string())?;
        Ok(())
    }

    fn remove_pid_file(&self) {
        if let Err(err) = std::fs::remove_file(&self.config.pid_path) {
            warn!(error = %err, path = %self.config.pid_path.display(), "failed to remove pid file");
        }
    }
}

fn spawn_supervised(
    unit: Arc<dyn Unit>,
    shutdown: watch::Receiver<bool>,
    notifier: Notifier,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        supervise(unit, shutdown, notifier).await;
    })
}

/// Drive one unit forever: restart on crash with back-off, stop on shutdown.
async fn supervise(unit: Arc<dyn Unit>, mut shutdown: watch::Receiver<bool>, notifier: Notifier) {
    let mut fast_crashes: u32 = 0;
    let mut first_run = true;
    loop {
        if *shutdown.borrow() {
            notifier.lifecycle(unit.name(), Lifecycle::Stop, "shutdown").await;
            return;
        }
        let event = if first_run {
            Lifecycle::Start
        } else {
            Lifecycle::Restart
        };
        notifier.lifecycle(unit.name(), event, "").await;
        first_run = false;

        let started = Instant::now();
        let result = unit.run(shutdown.clone()).await;
        if *shutdown.borrow() {
            notifier.lifecycle(unit.name(), Lifecycle::Stop, "shutdown").await;
            return;
        }
        let elapsed = started.elapsed();
        if elapsed < FAST_CRASH_WINDOW {
            fast_crashes += 1;
        } else {
            fast_crashes = 1;
        }
        let detail = match &result {
            Ok(()) => "unit returned unexpectedly".to_string(),
            Err(err) => err.to_string(),
        };
        let wait = backoff_secs(fast_crashes);
        warn!(
            unit = unit.name(),
            %detail,
            fast_crashes,
            backoff_secs = wait,
            "unit crashed; restarting after back-off"
        );
        notifier.lifecycle(unit.name(), Lifecycle::Crash, &detail).await;

        let sleep = tokio::time::sleep(Duration::from_secs(wait));
        tokio::pin!(sleep);
        tokio::select! {
            () = &mut sleep => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    notifier.lifecycle(unit.name(), Lifecycle::Stop, "shutdown").await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps_at_sixty() {
        assert_eq!(backoff_secs(1), 1);
        assert_eq!(backoff_secs(2), 2);
        assert_eq!(backoff_secs(3), 4);
        assert_eq!(backoff_secs(6), 32);
        assert_eq!(backoff_secs(7), 60);
        assert_eq!(backoff_secs(30), 60);
    }

    struct CrashyUnit {
        runs: AtomicU32,
        crash_times: u32,
    }

    #[async_trait]
    impl Unit for CrashyUnit {
        fn name(&self) -> &str {
            "crashy"
        }

        async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.crash_times {
                anyhow::bail!("boom #{run}");
            }
            // Healthy after the initial crashes: wait for shutdown.
            loop {
                shutdown.changed().await.ok();
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn crashes_restart_with_backoff_then_stop_cleanly() {
        let unit = Arc::new(CrashyUnit {
            runs: AtomicU32::new(0),
            crash_times: 3,
        });
        let (tx, rx) = watch::channel(false);
        let notifier = Notifier::new(None);
        let handle = spawn_supervised(unit.clone(), rx, notifier);

        // Paused time: advance past the 1s, 2s, and 4s back-offs.
        for _ in 0..40 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(unit.runs.load(Ordering::SeqCst), 4, "three crashes then healthy");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("unit stops after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn pid_file_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("helm.pid");
        let config = SupervisorConfig {
            pid_path: pid_path.clone(),
            drain_secs: 1,
            webhook_url: None,
            log_path: None,
        };
        let supervisor = Supervisor::new(config);
        supervisor.write_pid_file().unwrap();
        assert!(pid_path.exists());
        let written: u32 = std::fs::read_to_string(&pid_path).unwrap().parse().unwrap();
        assert_eq!(written, std::process::id());
        supervisor.remove_pid_file();
        assert!(!pid_path.exists());
    }
}
