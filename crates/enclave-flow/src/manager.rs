//! Process-wide registry of tasks.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use enclave_core::TaskId;

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::task::{Task, TaskRecord, TaskStatus};

/// Creates, indexes and lists tasks.
///
/// Indexes are dense and assigned in creation order starting at zero.
#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: RwLock<Vec<Arc<Task>>>,
    metrics: FlowMetrics,
}

fn poison_err<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Core(enclave_core::Error::Internal {
        message: "task registry lock poisoned".into(),
    })
}

impl TaskManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<Arc<Task>>>> {
        self.tasks.read().map_err(poison_err)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Arc<Task>>>> {
        self.tasks.write().map_err(poison_err)
    }

    /// Creates a working task under the next index.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn new_task(&self, description: impl Into<String>) -> Result<Arc<Task>> {
        let mut tasks = self.write()?;
        let index = tasks.len() as u64;
        let task = Arc::new(Task::new(index, description));
        tasks.push(Arc::clone(&task));
        self.metrics.record_task("created");
        tracing::debug!(task = %task.id(), index, description = task.description(), "task created");
        Ok(task)
    }

    /// Looks up a task by identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown identifier.
    pub fn get(&self, task_id: TaskId) -> Result<Arc<Task>> {
        self.read()?
            .iter()
            .find(|task| task.id() == task_id)
            .cloned()
            .ok_or(Error::TaskNotFound { task_id })
    }

    /// Lists all tasks, most recently created first.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn list(&self) -> Result<Vec<Arc<Task>>> {
        let tasks = self.read()?;
        let working = tasks
            .iter()
            .filter(|task| task.status() == TaskStatus::Working)
            .count();
        self.metrics.set_active_tasks(working);
        Ok(tasks.iter().rev().cloned().collect())
    }

    /// Exports every task without its subscribers, in index order.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.read()?.iter().map(|task| task.record()).collect())
    }

    /// Rebuilds a manager from exported records.
    ///
    /// Records are reindexed densely in their original index order. Tasks
    /// still `working` belonged to operations abandoned by the previous
    /// process and will never close; they are kept for audit and logged.
    #[must_use]
    pub fn restore(mut records: Vec<TaskRecord>) -> Self {
        records.sort_by_key(|record| record.index);
        let tasks = records
            .into_iter()
            .enumerate()
            .map(|(index, mut record)| {
                record.index = index as u64;
                if record.status == TaskStatus::Working {
                    tracing::warn!(
                        task = %record.id,
                        description = %record.description,
                        "restored task was abandoned while working"
                    );
                }
                Arc::new(Task::from_record(record))
            })
            .collect();

        Self {
            tasks: RwLock::new(tasks),
            metrics: FlowMetrics::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_are_dense_and_monotonic() {
        let manager = TaskManager::new();
        let a = manager.new_task("a").unwrap();
        let b = manager.new_task("b").unwrap();
        let c = manager.new_task("c").unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert_eq!(manager.list().unwrap().len(), 3);
    }

    #[test]
    fn list_is_newest_first() {
        let manager = TaskManager::new();
        manager.new_task("a").unwrap();
        manager.new_task("b").unwrap();
        let descriptions: Vec<_> = manager
            .list()
            .unwrap()
            .iter()
            .map(|t| t.description().to_string())
            .collect();
        assert_eq!(descriptions, vec!["b", "a"]);
    }

    #[test]
    fn lookup_by_id() {
        let manager = TaskManager::new();
        let task = manager.new_task("a").unwrap();
        assert_eq!(manager.get(task.id()).unwrap().index(), 0);

        let err = manager.get(TaskId::generate()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn snapshot_and_restore_keep_tasks() {
        let manager = TaskManager::new();
        let done = manager.new_task("done").unwrap();
        done.add_info("test", "step", "");
        done.close_ok("test", "ok", "");
        let orphan = manager.new_task("orphan").unwrap();
        let _live = orphan.subscribe();

        let json = serde_json::to_string(&manager.snapshot().unwrap()).unwrap();
        let restored = TaskManager::restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.snapshot().unwrap().len(), 2);
        let done = restored.get(done.id()).unwrap();
        assert_eq!(done.status(), TaskStatus::Finished);
        assert_eq!(done.history().len(), 2);

        let orphan = restored.get(orphan.id()).unwrap();
        assert_eq!(orphan.status(), TaskStatus::Working);
        assert_eq!(orphan.subscriber_count(), 0);

        assert_eq!(restored.new_task("next").unwrap().index(), 2);
    }
}
