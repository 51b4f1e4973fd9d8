use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::model::{Args, TaskId};

/// Outcome of a single task invocation, surfaced to the Worker as either
/// `JobCompleted(return_value)` or, on error, `JobFailed`.
pub type TaskOutput = CoreResult<serde_json::Value>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered callable: takes the job's bound arguments and produces a
/// JSON return value (or fails).
pub trait Task: Send + Sync {
    fn call<'a>(&'a self, args: &'a Args) -> BoxFuture<'a, TaskOutput>;
}

impl<F, Fut> Task for F
where
    F: Fn(&Args) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutput> + Send + 'static,
{
    fn call<'a>(&'a self, args: &'a Args) -> BoxFuture<'a, TaskOutput> {
        Box::pin((self)(args))
    }
}

/// Process-local map from `task_id` to the callable it names.
///
/// Populated by the embedding application before the Scheduler or Worker
/// starts; a lookup miss is a recoverable [`CoreError::TaskNotFound`], not a
/// panic, since schedules/jobs referencing an unregistered task id can
/// always arrive from a data store shared with other deployments.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_id: impl Into<TaskId>, task: impl Task + 'static) -> &mut Self {
        self.tasks.insert(task_id.into(), Arc::new(task));
        self
    }

    pub fn get(&self, task_id: &TaskId) -> CoreResult<Arc<dyn Task>> {
        self.tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound(task_id.0.clone()))
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_miss_is_task_not_found() {
        let registry = TaskRegistry::new();
        let err = registry.get(&TaskId::new("missing")).unwrap_err();
        assert!(matches!(err, CoreError::TaskNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn registered_task_is_invocable() {
        let mut registry = TaskRegistry::new();
        registry.register("tasks::answer", |_args: &Args| async {
            Ok(serde_json::json!(42))
        });

        let task = registry.get(&TaskId::new("tasks::answer")).unwrap();
        let output = task.call(&Args::new()).await.unwrap();
        assert_eq!(output, serde_json::json!(42));
    }
}
