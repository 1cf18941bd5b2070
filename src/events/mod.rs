//! Lifecycle events and event handling.
//!
//! This module provides event emission for run and task lifecycle events,
//! enabling observability into the engine without coupling it to a sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::interval::Interval;
use crate::core::types::{ResourceName, RunId, TaskName};
use crate::run::AttemptOutcome;

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A world was submitted as a new run.
    RunSubmitted {
        run_id: RunId,
        tag: String,
        timestamp: DateTime<Utc>,
    },

    /// A run was killed.
    RunKilled {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },

    /// A task was queued for an instant, by schedule or by retry.
    TaskQueued {
        run_id: RunId,
        task: TaskName,
        instant: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// An attempt was launched.
    TaskStarted {
        run_id: RunId,
        task: TaskName,
        instant: DateTime<Utc>,
        executor: String,
        timestamp: DateTime<Utc>,
    },

    /// An attempt succeeded and the task completed.
    TaskCompleted {
        run_id: RunId,
        task: TaskName,
        instant: DateTime<Utc>,
        duration: chrono::Duration,
        timestamp: DateTime<Utc>,
    },

    /// An attempt failed or was lost, and the task errored.
    TaskFailed {
        run_id: RunId,
        task: TaskName,
        instant: DateTime<Utc>,
        outcome: AttemptOutcome,
        error: String,
        exit_code: Option<i32>,
        timestamp: DateTime<Utc>,
    },

    /// A task was killed.
    TaskKilled {
        run_id: RunId,
        task: TaskName,
        timestamp: DateTime<Utc>,
    },

    /// A resource interval was recorded in the ledger.
    IntervalRecorded {
        run_id: RunId,
        resource: ResourceName,
        producer: TaskName,
        interval: Interval,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::RunSubmitted { timestamp, .. }
            | Event::RunKilled { timestamp, .. }
            | Event::TaskQueued { timestamp, .. }
            | Event::TaskStarted { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::TaskKilled { timestamp, .. }
            | Event::IntervalRecorded { timestamp, .. } => *timestamp,
        }
    }

    /// The run the event belongs to.
    pub fn run_id(&self) -> &RunId {
        match self {
            Event::RunSubmitted { run_id, .. }
            | Event::RunKilled { run_id, .. }
            | Event::TaskQueued { run_id, .. }
            | Event::TaskStarted { run_id, .. }
            | Event::TaskCompleted { run_id, .. }
            | Event::TaskFailed { run_id, .. }
            | Event::TaskKilled { run_id, .. }
            | Event::IntervalRecorded { run_id, .. } => run_id,
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes every event to the tracing log.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::RunSubmitted { run_id, tag, .. } => {
                info!(run_id = %run_id, tag = %tag, "run submitted");
            }
            Event::RunKilled { run_id, .. } => {
                warn!(run_id = %run_id, "run killed");
            }
            Event::TaskQueued {
                run_id,
                task,
                instant,
                ..
            } => {
                info!(run_id = %run_id, task = %task, instant = %instant, "task queued");
            }
            Event::TaskStarted {
                run_id,
                task,
                executor,
                ..
            } => {
                info!(run_id = %run_id, task = %task, executor = %executor, "task started");
            }
            Event::TaskCompleted {
                run_id,
                task,
                duration,
                ..
            } => {
                info!(
                    run_id = %run_id,
                    task = %task,
                    duration_ms = duration.num_milliseconds(),
                    "task completed"
                );
            }
            Event::TaskFailed {
                run_id,
                task,
                outcome,
                error,
                ..
            } => {
                warn!(run_id = %run_id, task = %task, outcome = %outcome, error = %error, "task failed");
            }
            Event::TaskKilled { run_id, task, .. } => {
                warn!(run_id = %run_id, task = %task, "task killed");
            }
            Event::IntervalRecorded {
                run_id,
                resource,
                interval,
                ..
            } => {
                info!(run_id = %run_id, resource = %resource, interval = %interval, "interval recorded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Test handler that records received events.
    struct RecordingHandler {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        async fn events(&self) -> Vec<Event> {
            self.events.lock().await.clone()
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &Event) {
            self.events.lock().await.push(event.clone());
        }
    }

    /// Test handler that counts events.
    struct CountingHandler {
        count: AtomicU32,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                count: AtomicU32::new(0),
            }
        }

        fn count(&self) -> u32 {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn started(task: &str) -> Event {
        Event::TaskStarted {
            run_id: RunId::new(),
            task: TaskName::new(task),
            instant: Utc::now(),
            executor: "local".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_emit_task_started_event() {
        let handler = Arc::new(RecordingHandler::new());
        let bus = EventBus::new();
        bus.register(handler.clone()).await;

        bus.emit(started("extract")).await;

        let events = handler.events().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::TaskStarted { task, executor, .. } => {
                assert_eq!(task.as_str(), "extract");
                assert_eq!(executor, "local");
            }
            _ => panic!("Expected TaskStarted event"),
        }
    }

    #[tokio::test]
    async fn test_emit_interval_recorded_event() {
        let handler = Arc::new(RecordingHandler::new());
        let bus = EventBus::new();
        bus.register(handler.clone()).await;

        let end = Utc::now();
        let run_id = RunId::new();
        bus.emit(Event::IntervalRecorded {
            run_id: run_id.clone(),
            resource: ResourceName::new("alpha"),
            producer: TaskName::new("task_a"),
            interval: Interval::new(end - chrono::Duration::hours(3), end),
            timestamp: end,
        })
        .await;

        let events = handler.events().await;
        assert_eq!(events[0].run_id(), &run_id);
        assert_eq!(events[0].timestamp(), end);
    }

    #[tokio::test]
    async fn test_multiple_handlers_receive_same_event() {
        let h1 = Arc::new(CountingHandler::new());
        let h2 = Arc::new(CountingHandler::new());
        let bus = EventBus::new();
        bus.register(h1.clone()).await;
        bus.register(h2.clone()).await;
        assert_eq!(bus.handler_count().await, 2);

        bus.emit(started("a")).await;
        bus.emit(started("b")).await;

        assert_eq!(h1.count(), 2);
        assert_eq!(h2.count(), 2);
    }

    #[tokio::test]
    async fn test_no_handlers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(started("a")).await;
        assert_eq!(bus.handler_count().await, 0);
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_every_event() {
        let run_id = RunId::new();
        let now = Utc::now();
        let events = vec![
            Event::RunSubmitted {
                run_id: run_id.clone(),
                tag: "t".into(),
                timestamp: now,
            },
            Event::TaskFailed {
                run_id: run_id.clone(),
                task: TaskName::new("a"),
                instant: now,
                outcome: AttemptOutcome::Failed,
                error: "exit 1".into(),
                exit_code: Some(1),
                timestamp: now,
            },
            Event::RunKilled {
                run_id,
                timestamp: now,
            },
        ];
        for event in &events {
            LoggingHandler.handle(event).await;
        }
    }
}
