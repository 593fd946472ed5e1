use super::{PassSummary, ReconcileError, Reconciler};
use crate::config::{ReconcileConfig, SettingsSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Starting,
    Disabled,
    RunningPass,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Settings in effect for the current iteration
    pub settings: ReconcileConfig,
    pub passes: u64,
    pub last_pass: Option<PassSummary>,
    pub last_error: Option<String>,
}

/// Observes the scheduler from the web API and tests.
pub type SchedulerHandle = watch::Receiver<SchedulerStatus>;

/// Periodic driver for reconciliation passes.
pub struct Scheduler {
    reconciler: Reconciler,
    settings: Arc<dyn SettingsSource>,
    initial: ReconcileConfig,
    status_tx: watch::Sender<SchedulerStatus>,
}

impl Scheduler {
    /// `initial` is used for the warm-up delay and as the fallback until the
    /// settings source answers successfully.
    pub fn new(
        reconciler: Reconciler,
        settings: Arc<dyn SettingsSource>,
        initial: ReconcileConfig,
    ) -> (Self, SchedulerHandle) {
        let (status_tx, status_rx) = watch::channel(SchedulerStatus {
            state: SchedulerState::Starting,
            settings: initial.clone(),
            passes: 0,
            last_pass: None,
            last_error: None,
        });

        (
            Self {
                reconciler,
                settings,
                initial,
                status_tx,
            },
            status_rx,
        )
    }

    /// Runs until `shutdown` turns true. Sleeps and a pass in progress are
    /// dropped as soon as shutdown is signalled; a lot left half reaped is
    /// picked up by the next pass after restart.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut settings = self.initial.clone();
        info!(
            warmup_ms = settings.warmup.as_millis() as u64,
            update_interval_seconds = settings.update_interval_seconds,
            "Reconciliation scheduler started"
        );

        if sleep_or_shutdown(settings.warmup, &mut shutdown).await {
            loop {
                settings = self.refresh(settings).await;

                if !settings.enabled {
                    self.publish(SchedulerState::Disabled, &settings);
                    debug!(backoff_ms = settings.disabled_backoff.as_millis() as u64, "Reconciliation disabled");
                    if !sleep_or_shutdown(settings.disabled_backoff, &mut shutdown).await {
                        break;
                    }
                    continue;
                }

                self.publish(SchedulerState::RunningPass, &settings);
                let pass_shutdown = shutdown.clone();
                let result = tokio::select! {
                    result = self.reconciler.run_pass(&pass_shutdown) => result,
                    _ = shutdown.wait_for(|&stop| stop) => Err(ReconcileError::Cancelled),
                };
                match result {
                    Ok(summary) => self.status_tx.send_modify(|status| {
                        status.passes += 1;
                        status.last_pass = Some(summary);
                        status.last_error = None;
                    }),
                    Err(ReconcileError::Cancelled) => {
                        info!("Reconciliation pass interrupted by shutdown");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Reconciliation pass failed");
                        self.status_tx.send_modify(|status| status.last_error = Some(e.to_string()));
                    }
                }

                self.publish(SchedulerState::Sleeping, &settings);
                if !sleep_or_shutdown(settings.update_interval(), &mut shutdown).await {
                    break;
                }
            }
        }

        self.status_tx.send_modify(|status| status.state = SchedulerState::Stopped);
        info!("Reconciliation scheduler stopped");
    }

    async fn refresh(&self, last_known: ReconcileConfig) -> ReconcileConfig {
        match self.settings.current().await {
            Ok(settings) => {
                if settings.enabled != last_known.enabled
                    || settings.update_interval_seconds != last_known.update_interval_seconds
                {
                    info!(
                        enabled = settings.enabled,
                        update_interval_seconds = settings.update_interval_seconds,
                        "Reconcile settings changed"
                    );
                }
                settings
            }
            Err(e) => {
                warn!(error = %e, "Failed to read reconcile settings, keeping last known");
                last_known
            }
        }
    }

    fn publish(&self, state: SchedulerState, settings: &ReconcileConfig) {
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.settings = settings.clone();
        });
    }
}

/// Returns false if shutdown was signalled before the duration elapsed.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.wait_for(|&stop| stop) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::live::FixedSettings;
    use crate::config::ConfigError;
    use crate::reconcile::Clustering;
    use crate::storage::{DuckDbStorage, Storage};
    use async_trait::async_trait;
    use tokio::sync::RwLock;

    struct SharedSettings(RwLock<Result<ReconcileConfig, String>>);

    #[async_trait]
    impl SettingsSource for SharedSettings {
        async fn current(&self) -> Result<ReconcileConfig, ConfigError> {
            self.0.read().await.clone().map_err(ConfigError::Validation)
        }
    }

    fn fast_settings(enabled: bool) -> ReconcileConfig {
        ReconcileConfig {
            enabled,
            update_interval_seconds: 1,
            warmup: Duration::ZERO,
            disabled_backoff: Duration::from_millis(10),
            ..ReconcileConfig::default()
        }
    }

    async fn empty_reconciler() -> Reconciler {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();
        Reconciler::new(Arc::new(storage), Clustering::default())
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_warmup() {
        let settings = ReconcileConfig {
            warmup: Duration::from_secs(3600),
            ..ReconcileConfig::default()
        };
        let source = Arc::new(SharedSettings(RwLock::new(Ok(settings.clone()))));
        let (scheduler, status) = Scheduler::new(empty_reconciler().await, source, settings);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(scheduler.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(status.borrow().state, SchedulerState::Stopped);
        assert_eq!(status.borrow().passes, 0);
    }

    #[tokio::test]
    async fn test_runs_pass_then_sleeps() {
        let source = Arc::new(FixedSettings(fast_settings(true)));
        let (scheduler, mut status) = Scheduler::new(empty_reconciler().await, source, fast_settings(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.passes >= 1))
            .await
            .unwrap()
            .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        let status = status.borrow();
        assert_eq!(status.state, SchedulerState::Stopped);
        assert_eq!(status.last_pass.as_ref().map(|p| p.equipment), Some(0));
    }

    #[tokio::test]
    async fn test_disabled_then_reenabled() {
        let source = Arc::new(SharedSettings(RwLock::new(Ok(fast_settings(false)))));
        let (scheduler, mut status) =
            Scheduler::new(empty_reconciler().await, source.clone(), fast_settings(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.state == SchedulerState::Disabled),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status.borrow().passes, 0);

        *source.0.write().await = Ok(fast_settings(true));
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.passes >= 1))
            .await
            .unwrap()
            .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_settings_failure_keeps_last_known() {
        let source = Arc::new(SharedSettings(RwLock::new(Err("unreadable".to_string()))));
        let (scheduler, mut status) = Scheduler::new(empty_reconciler().await, source, fast_settings(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.passes >= 1))
            .await
            .unwrap()
            .unwrap();
        assert!(status.borrow().settings.enabled);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
