//! Registry of in-flight tasks per environment.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DockershipError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Deploy,
    Clean,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Deploy => f.write_str("deploy"),
            Task::Clean => f.write_str("clean"),
        }
    }
}

pub type Tasks = HashMap<String, HashMap<Task, DateTime<Utc>>>;

/// Environment name → task → start time.
///
/// Cloning yields another handle to the **same** registry. An environment
/// with no running task has no entry at all.
#[derive(Debug, Clone, Default)]
pub struct TaskStatus {
    inner: Arc<Mutex<Tasks>>,
}

impl TaskStatus {
    fn lock(&self) -> MutexGuard<'_, Tasks> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `task` as running in `environment`.
    ///
    /// Fails with [`DockershipError::TaskInProgress`] when the same task is
    /// already running there. The returned guard stops the task on drop.
    pub fn start(&self, project: &str, environment: &str, task: Task) -> Result<TaskGuard> {
        let mut tasks = self.lock();
        let env = tasks.entry(environment.to_string()).or_default();
        if env.contains_key(&task) {
            return Err(DockershipError::TaskInProgress {
                project: project.to_string(),
                environment: environment.to_string(),
                task,
            });
        }

        env.insert(task, Utc::now());
        Ok(TaskGuard {
            status: self.clone(),
            environment: environment.to_string(),
            task,
        })
    }

    fn stop(&self, environment: &str, task: Task) {
        let mut tasks = self.lock();
        let Some(env) = tasks.get_mut(environment) else {
            return;
        };

        env.remove(&task);
        if env.is_empty() {
            tasks.remove(environment);
        }
    }

    pub fn is_running(&self, environment: &str, task: Task) -> bool {
        self.lock()
            .get(environment)
            .is_some_and(|env| env.contains_key(&task))
    }

    pub fn started_at(&self, environment: &str, task: Task) -> Option<DateTime<Utc>> {
        self.lock().get(environment).and_then(|env| env.get(&task)).copied()
    }

    /// Copy of the current registry contents.
    pub fn snapshot(&self) -> Tasks {
        self.lock().clone()
    }
}

/// Marks a running task; dropping it removes the registry entry.
#[derive(Debug)]
pub struct TaskGuard {
    status: TaskStatus,
    environment: String,
    task: Task,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.status.stop(&self.environment, self.task);
    }
}
