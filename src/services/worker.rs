use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};

use crate::services::intake::{FileAssembled, IntakeService};

/// Drains assembled files and runs each through the moderation pipeline.
pub struct AnalysisWorker {
    intake: Arc<IntakeService>,
    events: mpsc::UnboundedReceiver<FileAssembled>,
    shutdown: watch::Receiver<bool>,
}

impl AnalysisWorker {
    pub fn new(
        intake: Arc<IntakeService>,
        events: mpsc::UnboundedReceiver<FileAssembled>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            intake,
            events,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Analysis worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Analysis worker shutting down");
                    break;
                }
                event = self.events.recv() => {
                    let Some(FileAssembled { key }) = event else {
                        tracing::info!("Assembly queue closed, analysis worker exiting");
                        break;
                    };
                    let intake = self.intake.clone();
                    tokio::spawn(async move {
                        match intake.process_file(&key).await {
                            Ok(outcome) => tracing::debug!("{} -> {:?}", key, outcome.status),
                            Err(e) => tracing::warn!("Analysis of {} failed: {}", key, e),
                        }
                    });
                }
            }
        }
    }
}

/// Periodically expires idle sessions and drops retired ones.
pub struct ExpiryWorker {
    intake: Arc<IntakeService>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ExpiryWorker {
    pub fn new(intake: Arc<IntakeService>, shutdown: watch::Receiver<bool>) -> Self {
        let interval = Duration::from_secs(intake.config().expiry_sweep_interval_secs.max(1));
        Self {
            intake,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Expiry worker started (every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Expiry worker shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    let report = self.intake.sweep(Utc::now()).await;
                    if !report.is_empty() {
                        tracing::info!(
                            "🧹 Sweep: {} expired, {} finalized, {} blobs purged, {} retired",
                            report.expired.len(),
                            report.finalized.len(),
                            report.purged_blobs,
                            report.retired.len()
                        );
                    }
                }
            }
        }
    }
}
