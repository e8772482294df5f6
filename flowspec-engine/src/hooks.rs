//! Process-wide post-commit event dispatch (§4.K).
//!
//! Subscribers never run inside the engine's transaction — they are invoked
//! strictly after commit, in write order, and a subscriber panic/error never
//! unwinds back to the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use flowspec_core::models::{DetourId, FlowId, NodeId, TaskExecutionId, TaskId};

/// Typed post-commit notification. Dispatch order follows §4.F step 12's
/// write order: `TASK_STARTED`, `TASK_DONE`, `NODE_ACTIVATED*`, `FLOW_COMPLETED`.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TaskStarted { flow_id: FlowId, task_id: TaskId, iteration: i32, at: DateTime<Utc> },
    TaskDone { flow_id: FlowId, task_execution_id: TaskExecutionId, outcome: String, at: DateTime<Utc> },
    NodeActivated { flow_id: FlowId, node_id: NodeId, iteration: i32, at: DateTime<Utc> },
    FlowCompleted { flow_id: FlowId, at: DateTime<Utc> },
    DetourOpened { flow_id: FlowId, detour_id: DetourId, at: DateTime<Utc> },
}

pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Shared subscriber list. Dispatch takes a consistent snapshot of the list
/// per event so add/remove can race freely with dispatch (§5 "Shared state").
#[derive(Default)]
pub struct HookRegistry {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Dispatches every queued event to every subscriber, in order. Subscriber
    /// panics are caught so one bad hook can't drop the rest of the batch.
    pub fn dispatch(&self, events: &[EngineEvent]) {
        let snapshot = self.subscribers.read().clone();
        for event in events {
            for subscriber in &snapshot {
                let subscriber = subscriber.clone();
                let event = event.clone();
                if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    subscriber.on_event(&event);
                })) {
                    tracing::warn!(?panic, "hook subscriber panicked; suppressed");
                }
            }
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("subscriber_count", &self.subscribers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSubscriber(Arc<AtomicUsize>);
    impl EventSubscriber for CountingSubscriber {
        fn on_event(&self, _event: &EngineEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingSubscriber;
    impl EventSubscriber for PanickingSubscriber {
        fn on_event(&self, _event: &EngineEvent) {
            panic!("boom");
        }
    }

    #[test]
    fn dispatch_reaches_every_subscriber_in_order() {
        let registry = HookRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.subscribe(Arc::new(CountingSubscriber(count.clone())));
        registry.subscribe(Arc::new(CountingSubscriber(count.clone())));

        registry.dispatch(&[EngineEvent::FlowCompleted { flow_id: 1, at: Utc::now() }]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_panicking_subscriber_does_not_suppress_the_rest() {
        let registry = HookRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.subscribe(Arc::new(PanickingSubscriber));
        registry.subscribe(Arc::new(CountingSubscriber(count.clone())));

        registry.dispatch(&[EngineEvent::FlowCompleted { flow_id: 1, at: Utc::now() }]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
