//! Observable events raised by the bridge.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one dispatched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    /// Create a new random call ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The call returned a value.
    Success,
    /// The call failed.
    Failed {
        /// Phase the call was in when it failed.
        phase: String,
        /// Error kind name.
        kind: String,
        /// Diagnostic text.
        message: String,
    },
}

impl CallOutcome {
    /// Check if the call succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success)
    }
}

/// Events that can be observed while the bridge runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A module was instantiated and registered.
    InstanceLoaded {
        /// The new instance.
        instance_id: u32,
        /// Time spent compiling and instantiating.
        duration_us: u64,
    },
    /// A load failed and left nothing behind.
    LoadFailed {
        /// Error kind name.
        kind: String,
        /// Diagnostic text.
        message: String,
    },
    /// An instance was removed.
    InstanceUnloaded {
        /// The removed instance.
        instance_id: u32,
        /// Callback slots that were still live.
        callbacks_invalidated: usize,
    },
    /// A call entered the dispatcher.
    CallStarted {
        /// Call identifier.
        call_id: CallId,
        /// Target instance.
        instance_id: u32,
        /// Export name.
        function: String,
    },
    /// A call left the dispatcher.
    CallCompleted {
        /// Call identifier.
        call_id: CallId,
        /// Target instance.
        instance_id: u32,
        /// Export name.
        function: String,
        /// How it ended.
        outcome: CallOutcome,
        /// Wall time spent in the dispatcher.
        duration_us: u64,
    },
    /// A callback slot was handed out.
    CallbackRegistered {
        /// Owning instance.
        instance_id: u32,
        /// Slot index.
        slot: u32,
    },
    /// A callback slot was tombstoned by the host.
    CallbackReleased {
        /// Owning instance.
        instance_id: u32,
        /// Slot index.
        slot: u32,
    },
    /// The host invoked a callback.
    CallbackInvoked {
        /// Owning instance.
        instance_id: u32,
        /// Slot index.
        slot: u32,
        /// Name prepended to the arguments, if any.
        name_hint: Option<String>,
    },
    /// An instance stopped accepting calls.
    InstancePoisoned {
        /// The poisoned instance.
        instance_id: u32,
        /// The fault that poisoned it.
        message: String,
    },
    /// Running guest code was asked to stop.
    Interrupted,
}

impl BridgeEvent {
    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            BridgeEvent::InstanceLoaded { .. } => "instance_loaded",
            BridgeEvent::LoadFailed { .. } => "load_failed",
            BridgeEvent::InstanceUnloaded { .. } => "instance_unloaded",
            BridgeEvent::CallStarted { .. } => "call_started",
            BridgeEvent::CallCompleted { .. } => "call_completed",
            BridgeEvent::CallbackRegistered { .. } => "callback_registered",
            BridgeEvent::CallbackReleased { .. } => "callback_released",
            BridgeEvent::CallbackInvoked { .. } => "callback_invoked",
            BridgeEvent::InstancePoisoned { .. } => "instance_poisoned",
            BridgeEvent::Interrupted => "interrupted",
        }
    }
}

/// Subscriber for bridge events.
pub trait EventSubscriber: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &BridgeEvent);

    /// Filter for event types this subscriber is interested in.
    /// Returns `None` to receive all events.
    fn event_filter(&self) -> Option<Vec<&'static str>> {
        None
    }
}

/// A subscriber that forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct LoggingSubscriber;

impl LoggingSubscriber {
    /// Create a new logging subscriber.
    pub fn new() -> Self {
        Self
    }
}

impl EventSubscriber for LoggingSubscriber {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::InstanceLoaded { instance_id, duration_us } => {
                tracing::info!(
                    event = "instance_loaded",
                    instance_id,
                    duration_us,
                    "Instance loaded"
                );
            }
            BridgeEvent::LoadFailed { kind, message } => {
                tracing::warn!(event = "load_failed", kind = %kind, message = %message, "Load failed");
            }
            BridgeEvent::InstanceUnloaded {
                instance_id,
                callbacks_invalidated,
            } => {
                tracing::info!(
                    event = "instance_unloaded",
                    instance_id,
                    callbacks_invalidated,
                    "Instance unloaded"
                );
            }
            BridgeEvent::CallStarted {
                call_id,
                instance_id,
                function,
            } => {
                tracing::debug!(
                    event = "call_started",
                    call_id = %call_id,
                    instance_id,
                    function = %function,
                    "Call started"
                );
            }
            BridgeEvent::CallCompleted {
                call_id,
                instance_id,
                function,
                outcome,
                duration_us,
            } => match outcome {
                CallOutcome::Success => {
                    tracing::debug!(
                        event = "call_completed",
                        call_id = %call_id,
                        instance_id,
                        function = %function,
                        duration_us,
                        "Call completed"
                    );
                }
                CallOutcome::Failed {
                    phase,
                    kind,
                    message,
                } => {
                    tracing::warn!(
                        event = "call_completed",
                        call_id = %call_id,
                        instance_id,
                        function = %function,
                        phase = %phase,
                        kind = %kind,
                        duration_us,
                        "Call failed: {message}"
                    );
                }
            },
            BridgeEvent::CallbackRegistered { instance_id, slot } => {
                tracing::trace!(event = "callback_registered", instance_id, slot, "Callback registered");
            }
            BridgeEvent::CallbackReleased { instance_id, slot } => {
                tracing::trace!(event = "callback_released", instance_id, slot, "Callback released");
            }
            BridgeEvent::CallbackInvoked {
                instance_id,
                slot,
                name_hint,
            } => {
                tracing::debug!(
                    event = "callback_invoked",
                    instance_id,
                    slot,
                    name_hint = ?name_hint,
                    "Callback invoked"
                );
            }
            BridgeEvent::InstancePoisoned {
                instance_id,
                message,
            } => {
                tracing::warn!(
                    event = "instance_poisoned",
                    instance_id,
                    "Instance poisoned: {message}"
                );
            }
            BridgeEvent::Interrupted => {
                tracing::info!(event = "interrupted", "Guest execution interrupted");
            }
        }
    }
}

/// A subscriber that collects events for later analysis.
pub struct CollectingSubscriber {
    events: RwLock<Vec<(Instant, BridgeEvent)>>,
    max_events: usize,
}

impl CollectingSubscriber {
    /// Create a new collecting subscriber.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events,
        }
    }

    /// Get collected events.
    pub fn events(&self) -> Vec<(Instant, BridgeEvent)> {
        self.events.read().clone()
    }

    /// Get the collected event type names, in order.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.read().iter().map(|(_, e)| e.event_type()).collect()
    }

    /// Clear collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get event count.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventSubscriber for CollectingSubscriber {
    fn on_event(&self, event: &BridgeEvent) {
        let mut events = self.events.write();
        if events.len() < self.max_events {
            events.push((Instant::now(), event.clone()));
        }
    }
}

/// Event dispatcher that manages subscribers.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Remove all subscribers.
    pub fn clear_subscribers(&self) {
        self.subscribers.write().clear();
    }

    /// Get subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Emit an event to all subscribers.
    ///
    /// The subscriber list is snapshotted first, so a subscriber may
    /// subscribe or emit from inside `on_event`.
    pub fn emit(&self, event: BridgeEvent) {
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            if let Some(filter) = subscriber.event_filter() {
                if !filter.contains(&event.event_type()) {
                    continue;
                }
            }
            subscriber.on_event(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnloadOnly(CollectingSubscriber);

    impl EventSubscriber for UnloadOnly {
        fn on_event(&self, event: &BridgeEvent) {
            self.0.on_event(event);
        }

        fn event_filter(&self) -> Option<Vec<&'static str>> {
            Some(vec!["instance_unloaded"])
        }
    }

    #[test]
    fn test_event_type() {
        let event = BridgeEvent::InstanceLoaded {
            instance_id: 0,
            duration_us: 12,
        };
        assert_eq!(event.event_type(), "instance_loaded");
        assert_eq!(BridgeEvent::Interrupted.event_type(), "interrupted");
    }

    #[test]
    fn test_event_json_shape() {
        let event = BridgeEvent::CallCompleted {
            call_id: CallId::new(),
            instance_id: 1,
            function: "divide".to_string(),
            outcome: CallOutcome::Failed {
                phase: "executing".to_string(),
                kind: "trap".to_string(),
                message: "integer divide by zero".to_string(),
            },
            duration_us: 3,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "call_completed");
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["phase"], "executing");

        let back: BridgeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_collecting_subscriber_max_events() {
        let subscriber = CollectingSubscriber::new(2);

        for slot in 0..5 {
            subscriber.on_event(&BridgeEvent::CallbackRegistered {
                instance_id: 0,
                slot,
            });
        }

        assert_eq!(subscriber.len(), 2);
    }

    #[test]
    fn test_event_dispatcher_filters() {
        let dispatcher = EventDispatcher::new();
        let all = Arc::new(CollectingSubscriber::new(100));
        let unloads = Arc::new(UnloadOnly(CollectingSubscriber::new(100)));

        dispatcher.subscribe(Arc::clone(&all) as Arc<dyn EventSubscriber>);
        dispatcher.subscribe(Arc::clone(&unloads) as Arc<dyn EventSubscriber>);
        assert_eq!(dispatcher.subscriber_count(), 2);

        dispatcher.emit(BridgeEvent::Interrupted);
        dispatcher.emit(BridgeEvent::InstanceUnloaded {
            instance_id: 0,
            callbacks_invalidated: 1,
        });

        assert_eq!(all.event_types(), vec!["interrupted", "instance_unloaded"]);
        assert_eq!(unloads.0.event_types(), vec!["instance_unloaded"]);
    }
}
