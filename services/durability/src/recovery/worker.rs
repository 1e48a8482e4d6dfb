use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use super::{
    DeadLetterReplay, DurabilityJob, HandledSweeper, IncomingRecovery, OutgoingRecovery,
    ScheduledJobPoller,
};
use crate::config::DurabilitySettings;
use crate::sending::SendingAgents;
use crate::store::MessageStore;
use crate::transport::LocalQueue;

/// Upper bound on back-to-back passes within one tick.
const MAX_RETRIGGERS: usize = 50;

/// Runs a set of durability jobs on an interval until shutdown.
pub struct DurabilityWorker {
    name: String,
    interval: Duration,
    jobs: Vec<Arc<dyn DurabilityJob>>,
}

impl DurabilityWorker {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            jobs: Vec::new(),
        }
    }

    /// Store-wide singleton work: scheduled dispatch, handled sweeping and
    /// dead-letter replay.
    pub fn for_store(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn LocalQueue>,
        node_number: i32,
        settings: &DurabilitySettings,
    ) -> Self {
        Self::new(store.name().to_string(), settings.scheduled_job_polling_time)
            .with_job(ScheduledJobPoller::new(
                store.clone(),
                queue,
                node_number,
                settings.recovery_batch_size,
            ))
            .with_job(HandledSweeper::new(store.clone(), settings.handled_sweep_batch_size))
            .with_job(DeadLetterReplay::new(store, settings.dead_letter_replay_batch))
    }

    /// Per-node recovery of envelopes orphaned by crashed nodes.
    pub fn for_node(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn LocalQueue>,
        senders: Arc<SendingAgents>,
        node_number: i32,
        settings: &DurabilitySettings,
    ) -> Self {
        Self::new(format!("{}-recovery", store.name()), settings.scheduled_job_polling_time)
            .with_job(IncomingRecovery::new(
                store.clone(),
                queue,
                node_number,
                settings.recovery_batch_size,
            ))
            .with_job(OutgoingRecovery::new(
                store,
                senders,
                node_number,
                settings.recovery_batch_size,
            ))
    }

    pub fn with_job(mut self, job: impl DurabilityJob + 'static) -> Self {
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs every job once, repeating a job while it reports a full page.
    /// Returns the number of items processed.
    pub async fn run_pass(&self) -> usize {
        let mut total = 0;
        for job in &self.jobs {
            for _ in 0..MAX_RETRIGGERS {
                match job.run_once().await {
                    Ok(report) => {
                        total += report.processed;
                        if !report.should_retrigger {
                            break;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        warn!(worker = %self.name, job = job.name(), error = %e, "Durability job failed; retrying next tick");
                        break;
                    }
                    Err(e) => {
                        error!(worker = %self.name, job = job.name(), error = %e, "Durability job failed");
                        break;
                    }
                }
            }
        }
        total
    }

    #[instrument(skip(self, shutdown), fields(worker = %self.name))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            jobs = self.jobs.len(),
            "Starting durability worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Durability worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
