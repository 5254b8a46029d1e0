use crate::background_job::DEFAULT_QUEUE;
use crate::driver::JobsDriver;
use crate::job_registry::JobRegistry;
use crate::worker::Worker;
use crate::BackgroundJob;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// Polls queues and runs the jobs it claims.
///
/// Each worker follows the queue protocol: `pop` a job, `get` its payload,
/// run it, then `clear` it, or `set` it again with one more attempt counted
/// if it failed and has retries left.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    driver: JobsDriver,
    queues: HashMap<String, Queue<Context, Configured>>,
    context: Context,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("context", &self.context)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given driver and context.
    pub fn new(driver: JobsDriver, context: Context) -> Self {
        Self {
            driver,
            queues: HashMap::new(),
            context,
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Configure a queue
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context, Configured>,
    ) -> Runner<Context, Configured> {
        self.queues
            .insert(queue_name.into(), config_fn(Queue::default()));
        self.into_configured()
    }

    /// Register a job type on the queue named by [`BackgroundJob::QUEUE`].
    ///
    /// Settings of an already configured queue are kept.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        let queue = match self.queues.remove(J::QUEUE) {
            Some(queue) => queue.register::<J>(),
            None => Queue::default().register::<J>(),
        };
        self.queues.insert(J::QUEUE.into(), queue);
        self.into_configured()
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    fn into_configured(self) -> Runner<Context, Configured> {
        Runner {
            driver: self.driver,
            queues: self.queues,
            context: self.context,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Configure the queue jobs use unless they name another one.
    pub fn configure_default_queue(
        mut self,
        config_fn: impl FnOnce(Queue<Context, Configured>) -> Queue<Context, Configured>,
    ) -> Self {
        if let Some(queue) = self.queues.remove(DEFAULT_QUEUE) {
            self.queues.insert(DEFAULT_QUEUE.into(), config_fn(queue));
        }
        self
    }

    /// Start the background workers.
    ///
    /// This returns a `RunHandle` which can be used to wait for the workers to shutdown.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::new();
        for (queue_name, queue) in &self.queues {
            let job_registry = Arc::new(queue.job_registry.clone());

            for i in 1..=queue.num_workers {
                let name = format!("background-worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    queue: self.driver.queue(queue_name.as_str()),
                    context: self.context.clone(),
                    job_registry: job_registry.clone(),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: queue.poll_interval,
                    jitter: queue.jitter,
                };

                let span = info_span!("worker", worker.name = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
            }
        }

        RunHandle { handles }
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }

    /// Stop all workers without waiting for the jobs they are running.
    ///
    /// A job interrupted this way stays in the processing state until it is
    /// pushed back onto its queue.
    pub fn abort(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Configuration and state for a job queue
#[derive(Debug)]
pub struct Queue<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    job_registry: JobRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    _state: PhantomData<State>,
}

impl<Context: Clone + Send + Sync + 'static> Default for Queue<Context, Unconfigured> {
    fn default() -> Self {
        Self {
            job_registry: JobRegistry::default(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Queue<Context, State> {
    /// Set the number of workers for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Configure a job to run as part of this queue.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Queue<Context, Configured> {
        self.job_registry.register::<J>();
        Queue {
            job_registry: self.job_registry,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            _state: PhantomData,
        }
    }
}
