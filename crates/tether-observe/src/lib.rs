//! Tether Observability
//!
//! Structured events for the Tether guest-module bridge:
//!
//! - [`BridgeEvent`]: what happened (loads, calls, callbacks, poisoning)
//! - [`EventDispatcher`]: fans events out to subscribers
//! - [`LoggingSubscriber`]: forwards events to `tracing`
//! - [`CollectingSubscriber`]: keeps events in memory for tests and tools
//!
//! # Event Subscription
//!
//! ```
//! use std::sync::Arc;
//! use tether_observe::{BridgeEvent, CollectingSubscriber, EventDispatcher, EventSubscriber};
//!
//! let dispatcher = EventDispatcher::new();
//! let collector = Arc::new(CollectingSubscriber::new(16));
//! dispatcher.subscribe(Arc::clone(&collector) as Arc<dyn EventSubscriber>);
//!
//! dispatcher.emit(BridgeEvent::Interrupted);
//! assert_eq!(collector.len(), 1);
//! ```

pub mod events;

pub use events::{
    BridgeEvent, CallId, CallOutcome, CollectingSubscriber, EventDispatcher, EventSubscriber,
    LoggingSubscriber,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::events::{BridgeEvent, EventDispatcher, EventSubscriber};
}
