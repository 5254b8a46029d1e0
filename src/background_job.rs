use crate::driver::JobsDriver;
use crate::errors::QueueError;
use crate::identifier::JobIdentifier;
use crate::schema::JobData;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// How many times a failing job is requeued before it is given up.
    const MAX_RETRY_COUNT: u32 = 0;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the identifier of the new job.
    #[instrument(name = "jobs.enqueue", skip(self, driver), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(
        &'a self,
        driver: &'a JobsDriver,
    ) -> BoxFuture<'a, Result<JobIdentifier, QueueError>> {
        let payload = match serde_json::to_value(self) {
            Ok(payload) => payload,
            Err(err) => return async move { Err(QueueError::Serialization(err)) }.boxed(),
        };
        let data = JobData::new(Self::JOB_NAME, payload).with_max_retry_count(Self::MAX_RETRY_COUNT);
        let queue = driver.queue(Self::QUEUE);

        async move {
            let id = JobIdentifier::generate();
            queue.set(&id, &data).await?;
            Ok(id)
        }
        .boxed()
    }
}
