use crate::errors::QueueError;
use crate::identifier::JobIdentifier;
use crate::job_registry::JobRegistry;
use crate::queue::JobQueue;
use crate::schema::JobData;
use crate::util::try_to_extract_panic_info;
use futures_util::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<Context> {
    pub(crate) queue: JobQueue,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run background jobs forever, or until the queue is empty if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending background worker jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!(
                        "No pending background worker jobs found. Polling again in {sleep_duration:?}…",
                    );
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if the queue could not be used
    #[allow(clippy::cognitive_complexity)]
    async fn run_next_job(&self) -> Result<Option<JobIdentifier>, QueueError> {
        trace!("Looking for next background worker job…");

        let mut skipped = Vec::new();
        let next = self.claim_supported(&mut skipped).await;
        self.hand_back(&skipped).await?;

        let Some((job_id, data)) = next? else {
            return Ok(None);
        };

        let span = info_span!("job", job.id = %job_id, job.name = %data.job_name);
        self.process(&job_id, data).instrument(span).await?;

        Ok(Some(job_id))
    }

    /// Claim jobs until one has a payload this worker understands.
    ///
    /// Jobs written by a newer version stay claimed in `skipped`, so the
    /// next `pop` moves past them instead of returning the same job again.
    async fn claim_supported(
        &self,
        skipped: &mut Vec<JobIdentifier>,
    ) -> Result<Option<(JobIdentifier, JobData)>, QueueError> {
        while let Some(job_id) = self.queue.pop().await? {
            let data = self.queue.get(&job_id).await?;
            if data.version <= JobData::CURRENT_VERSION {
                return Ok(Some((job_id, data)));
            }

            warn!(job.id = %job_id, version = data.version, "Unsupported payload version, skipping…");
            skipped.push(job_id);
        }

        Ok(None)
    }

    /// Return skipped jobs to the pending state for newer workers.
    async fn hand_back(&self, skipped: &[JobIdentifier]) -> Result<(), QueueError> {
        for job_id in skipped {
            debug!(job.id = %job_id, "Requeueing skipped job…");
            self.queue.push(job_id).await?;
        }
        Ok(())
    }

    /// Run a claimed job and settle it on the queue.
    async fn process(&self, job_id: &JobIdentifier, mut data: JobData) -> Result<(), QueueError> {
        let Some(run_task_fn) = self.job_registry.get(&data.job_name) else {
            error!("Unknown job type {}, discarding it…", data.job_name);
            self.queue.clear(job_id).await?;
            return Ok(());
        };

        debug!("Running job…");
        let result = AssertUnwindSafe(run_task_fn(self.context.clone(), data.payload.clone()))
            .catch_unwind()
            .await
            .map_err(|e| try_to_extract_panic_info(&*e))
            // TODO: Replace with flatten() once that stabilizes
            .and_then(std::convert::identity);

        match result {
            Ok(()) => {
                debug!("Clearing successful job…");
                self.queue.clear(job_id).await?;
            }
            Err(error) if data.has_retries_left() => {
                data.attempts += 1;
                warn!(attempt = data.attempts, "Failed to run job, requeueing: {error}");
                // Overwriting re-arms the job, so it is already pending again
                // when this returns.
                self.queue.set(job_id, &data).await?;
            }
            Err(error) => {
                error!(attempts = data.attempts + 1, "Failed to run job, giving up: {error}");
                self.queue.clear(job_id).await?;
            }
        }

        Ok(())
    }
}
