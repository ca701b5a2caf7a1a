//! Deploy event system for observability.
//!
//! Emits [`DeployEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (CLI output, log shippers, UIs) can follow deploy progress without
//! coupling to the pipeline internals. Emission is fire-and-forget.

use serde::{Deserialize, Serialize};

use dockership_types::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Events emitted while deploying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeployEvent {
    TaskStarted {
        project: String,
        environment: String,
        task: Task,
    },
    TaskFinished {
        project: String,
        environment: String,
        task: Task,
        errors: Vec<String>,
        duration_ms: u64,
    },
    DeploySkipped {
        project: String,
        endpoint: String,
        image: String,
    },
    ImagesPruned {
        project: String,
        endpoint: String,
        removed: usize,
    },
    ImageBuilt {
        project: String,
        endpoint: String,
        image: String,
    },
    ContainersRemoved {
        project: String,
        endpoint: String,
        removed: usize,
    },
    ContainerStarted {
        project: String,
        endpoint: String,
        container: String,
        image: String,
    },
    LinkedContainerRestarted {
        project: String,
        endpoint: String,
        container: String,
    },
    Log {
        level: LogLevel,
        message: String,
        project: Option<String>,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<DeployEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: DeployEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DeployEvent> {
        self.sender.subscribe()
    }

    /// Trace `message` at `level` and broadcast it as a [`DeployEvent::Log`].
    pub fn log(&self, level: LogLevel, project: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        let project_field = project.unwrap_or("-");
        match level {
            LogLevel::Debug => tracing::debug!(project = project_field, "{message}"),
            LogLevel::Info => tracing::info!(project = project_field, "{message}"),
            LogLevel::Warning => tracing::warn!(project = project_field, "{message}"),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(project = project_field, critical = level == LogLevel::Critical, "{message}")
            }
        }

        self.emit(DeployEvent::Log {
            level,
            message,
            project: project.map(String::from),
        });
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(DeployEvent::ImagesPruned {
            project: "web".into(),
            endpoint: "tcp://a:2375".into(),
            removed: 2,
        });

        match rx.recv().await.unwrap() {
            DeployEvent::ImagesPruned { project, removed, .. } => {
                assert_eq!(project, "web");
                assert_eq!(removed, 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn log_broadcasts_level_and_project() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.log(LogLevel::Warning, Some("web"), "Low Github request level");

        match rx.recv().await.unwrap() {
            DeployEvent::Log {
                level,
                message,
                project,
            } => {
                assert_eq!(level, LogLevel::Warning);
                assert_eq!(message, "Low Github request level");
                assert_eq!(project.as_deref(), Some("web"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(DeployEvent::TaskStarted {
            project: "web".into(),
            environment: "live".into(),
            task: Task::Deploy,
        });
        emitter.log(LogLevel::Critical, None, "nobody listening");
    }

    #[test]
    fn events_serialize_to_json() {
        let event = DeployEvent::TaskFinished {
            project: "web".into(),
            environment: "live".into(),
            task: Task::Deploy,
            errors: vec![],
            duration_ms: 12,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"TaskFinished\""));
        assert!(json.contains("\"task\":\"deploy\""));
    }
}
