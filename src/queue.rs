use crate::errors::{QueueError, StoreUnavailable};
use crate::identifier::JobIdentifier;
use crate::lock::ClaimStrategy;
use crate::schema::{JobData, JobInfo, JobState, JobTable};
use crate::storage;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// One named queue on top of the job table.
///
/// Created by [`JobsDriver::queue`](crate::JobsDriver::queue). Cloning is
/// cheap, and the queue itself holds no state besides its configuration, so
/// any number of clones may be used concurrently from any number of
/// processes.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pub(crate) pool: Option<PgPool>,
    pub(crate) table: JobTable,
    pub(crate) name: String,
    pub(crate) soft_deletes: bool,
    pub(crate) strategy: Arc<dyn ClaimStrategy>,
}

impl JobQueue {
    /// The name of this queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn pool(&self) -> Result<&PgPool, QueueError> {
        self.pool
            .as_ref()
            .ok_or(QueueError::StoreUnavailable(StoreUnavailable::NotConfigured))
    }

    /// Fetch the payload of a job.
    ///
    /// Jobs that were cleared are reported as [`QueueError::MissingJob`],
    /// even when soft deletes keep their row around.
    #[instrument(name = "jobs.get", skip(self), fields(queue = %self.name))]
    pub async fn get(&self, id: &JobIdentifier) -> Result<JobData, QueueError> {
        let pool = self.pool()?;
        let uuid = id.to_uuid()?;

        storage::find(pool, &self.table, uuid, false)
            .await?
            .map(|record| record.data)
            .ok_or_else(|| QueueError::MissingJob(id.clone()))
    }

    /// Store `data` under `id` as a pending job of this queue.
    ///
    /// An existing job gets its payload replaced and is re-armed; it keeps
    /// its original queue and creation time.
    #[instrument(name = "jobs.set", skip(self, data), fields(queue = %self.name, job.name = %data.job_name))]
    pub async fn set(&self, id: &JobIdentifier, data: &JobData) -> Result<(), QueueError> {
        let pool = self.pool()?;
        let uuid = id.to_uuid()?;

        storage::upsert(pool, &self.table, uuid, &self.name, data).await
    }

    /// Put a job back into the pending state, whatever state it is in.
    ///
    /// This also revives jobs that were soft-deleted by [`Self::clear`].
    #[instrument(name = "jobs.push", skip(self), fields(queue = %self.name))]
    pub async fn push(&self, id: &JobIdentifier) -> Result<(), QueueError> {
        let pool = self.pool()?;
        let uuid = id.to_uuid()?;

        debug!("Requeueing job…");
        storage::requeue(pool, &self.table, uuid)
            .await
            .map_err(|error| match error {
                QueueError::MissingJob(_) => QueueError::MissingJob(id.clone()),
                error => error,
            })
    }

    /// Retire a job that has not completed yet.
    ///
    /// With soft deletes the job is marked completed and kept, otherwise the
    /// row is deleted. Clearing a job twice fails with
    /// [`QueueError::MissingJob`] and changes nothing.
    #[instrument(name = "jobs.clear", skip(self), fields(queue = %self.name))]
    pub async fn clear(&self, id: &JobIdentifier) -> Result<(), QueueError> {
        let pool = self.pool()?;
        let uuid = id.to_uuid()?;

        let record = storage::find(pool, &self.table, uuid, false)
            .await?
            .filter(|record| record.state.can_transition_to(JobState::Completed))
            .ok_or_else(|| QueueError::MissingJob(id.clone()))?;

        let hard = !self.soft_deletes;
        debug!(from = %record.state, hard, "Clearing job…");
        storage::retire(pool, &self.table, uuid, hard)
            .await
            .map_err(|error| match error {
                QueueError::MissingJob(_) => QueueError::MissingJob(id.clone()),
                error => error,
            })
    }

    /// Claim the oldest pending job of this queue.
    ///
    /// Returns `Ok(None)` when there is nothing to do, which is the normal
    /// result of most polls.
    #[instrument(name = "jobs.pop", skip(self), fields(queue = %self.name, strategy = %self.strategy.kind()))]
    pub async fn pop(&self) -> Result<Option<JobIdentifier>, QueueError> {
        let pool = self.pool()?;

        let claimed = self.strategy.claim(pool, &self.table, &self.name).await?;
        match claimed {
            Some(id) => debug!(job.id = %id, "Claimed job"),
            None => trace!("No pending jobs"),
        }

        Ok(claimed.map(JobIdentifier::from))
    }

    /// Payloads of all jobs in `state`, from one queue or from all of them.
    ///
    /// This is a diagnostic snapshot: it takes no locks and includes jobs
    /// that were soft-deleted.
    #[instrument(name = "jobs.list", skip(self))]
    pub async fn list(&self, queue: Option<&str>, state: JobState) -> Result<Vec<JobData>, QueueError> {
        let pool = self.pool()?;

        let records = storage::list(pool, &self.table, queue, state).await?;
        Ok(records.into_iter().map(|record| record.data).collect())
    }

    /// Summary of a job, including jobs that were soft-deleted.
    #[instrument(name = "jobs.info", skip(self), fields(queue = %self.name))]
    pub async fn info(&self, id: &JobIdentifier) -> Result<JobInfo, QueueError> {
        let pool = self.pool()?;
        let uuid = id.to_uuid()?;

        storage::find(pool, &self.table, uuid, true)
            .await?
            .map(JobInfo::from)
            .ok_or_else(|| QueueError::MissingJob(id.clone()))
    }
}
