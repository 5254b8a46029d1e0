use crate::BackgroundJob;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type RunTaskFn<Context> =
    Arc<dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps job names to the function that deserializes and runs them.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, RunTaskFn<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.job_names())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run_task_fn: RunTaskFn<Context> = Arc::new(|context: Context, payload: Value| {
            async move {
                let job: J = serde_json::from_value(payload)?;
                job.run(context).await
            }
            .boxed()
        });

        self.entries.insert(J::JOB_NAME.to_owned(), run_task_fn);
    }
}

impl<Context> JobRegistry<Context> {
    pub(crate) fn get(&self, job_name: &str) -> Option<&RunTaskFn<Context>> {
        self.entries.get(job_name)
    }

    pub(crate) fn job_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Add {
        left: i64,
        right: i64,
    }

    impl BackgroundJob for Add {
        const JOB_NAME: &'static str = "add";
        type Context = i64;

        async fn run(&self, expected: Self::Context) -> anyhow::Result<()> {
            anyhow::ensure!(self.left + self.right == expected, "wrong sum");
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_by_job_name() {
        let mut registry = JobRegistry::default();
        registry.register::<Add>();

        assert_eq!(registry.job_names(), vec!["add"]);
        assert!(registry.get("subtract").is_none());

        let run = registry.get("add").unwrap();
        run(3, json!({"left": 1, "right": 2})).await.unwrap();
        assert!(run(4, json!({"left": 1, "right": 2})).await.is_err());
        assert!(run(3, json!({"left": "one"})).await.is_err());
    }
}
