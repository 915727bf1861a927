/*!
 * Event system for Device Orchestra.
 *
 * A synchronous publish/subscribe dispatcher keyed by event type strings.
 * Devices running background loops report readings and state changes
 * through it, and the registry and pipeline engine announce lifecycle
 * transitions. The bus is passed explicitly to the components that use it.
 *
 * Callbacks for one event type run in subscription order on the emitting
 * thread. A callback that returns an error or panics is logged and skipped;
 * the remaining callbacks still run and nothing is re-thrown to the emitter.
 */
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, trace};

use crate::types::{Id, Value};

/// Well-known event type tags
pub mod event_types {
    /// A device was added to a registry
    pub const DEVICE_REGISTERED: &str = "device.registered";
    /// A device was removed from a registry
    pub const DEVICE_UNREGISTERED: &str = "device.unregistered";
    /// A device started successfully
    pub const DEVICE_STARTED: &str = "device.started";
    /// A device stopped successfully
    pub const DEVICE_STOPPED: &str = "device.stopped";
    /// A device reported a failure
    pub const DEVICE_ERROR: &str = "device.error";
    /// A device produced a reading
    pub const DEVICE_DATA: &str = "device.data";
    /// A device changed its operating state
    pub const DEVICE_STATUS_CHANGED: &str = "device.status_changed";
    /// A thermometer crossed its overheat threshold
    pub const THERMOMETER_OVERHEAT: &str = "thermometer.overheat";
    /// A pipeline run began
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A pipeline step succeeded
    pub const PIPELINE_STEP_COMPLETED: &str = "pipeline.step_completed";
    /// A pipeline step failed
    pub const PIPELINE_STEP_FAILED: &str = "pipeline.step_failed";
    /// A pipeline run ended
    pub const PIPELINE_FINISHED: &str = "pipeline.finished";
}

/// A published event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Event type tag, e.g. `device.data`
    pub event_type: String,
    /// Id of the component that emitted the event
    pub source: Option<Id>,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub payload: Value,
}

impl Event {
    /// Create a new event stamped with the current time
    pub fn new<S: Into<String>>(event_type: S, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Set the source ID
    pub fn with_source(mut self, source: Id) -> Self {
        self.source = Some(source);
        self
    }
}

/// Subscriber callback handle
///
/// The same `Arc` returned from [`EventBus::subscribe`] is what
/// [`EventBus::unsubscribe`] matches against.
pub type EventCallback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure into an [`EventCallback`]
pub fn callback<F>(f: F) -> EventCallback
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Event bus for publishing and subscribing to events
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<EventCallback>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking subscriber runs outside the lock, so poisoning can only
    // come from a panic inside this module; the map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<EventCallback>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a callback for `event_type` and return its handle
    pub fn subscribe<S: Into<String>>(
        &self,
        event_type: S,
        callback: EventCallback,
    ) -> EventCallback {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "subscribing");
        self.lock()
            .entry(event_type)
            .or_default()
            .push(callback.clone());
        callback
    }

    /// Subscribe a closure, returning the handle needed to unsubscribe it
    pub fn subscribe_fn<S, F>(&self, event_type: S, f: F) -> EventCallback
    where
        S: Into<String>,
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(event_type, callback(f))
    }

    /// Remove the first registration of `callback` for `event_type`
    ///
    /// Returns whether a registration was removed. Unknown handles are a no-op.
    pub fn unsubscribe(&self, event_type: &str, callback: &EventCallback) -> bool {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(event_type) else {
            return false;
        };
        let Some(pos) = list.iter().position(|cb| Arc::ptr_eq(cb, callback)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            subscribers.remove(event_type);
        }
        true
    }

    /// Emit an event with no source
    ///
    /// Returns the number of callbacks that completed successfully.
    pub fn emit(&self, event_type: &str, payload: Value) -> usize {
        self.publish(Event::new(event_type, payload))
    }

    /// Emit an event on behalf of `source`
    pub fn emit_from(&self, source: &Id, event_type: &str, payload: Value) -> usize {
        self.publish(Event::new(event_type, payload).with_source(source.clone()))
    }

    /// Deliver a fully built event to every subscriber of its type
    ///
    /// Returns the number of callbacks that completed successfully.
    pub fn publish(&self, event: Event) -> usize {
        let snapshot: Vec<EventCallback> = match self.lock().get(&event.event_type) {
            Some(list) => list.clone(),
            None => {
                trace!(event_type = %event.event_type, "no subscribers for event");
                return 0;
            }
        };

        let mut delivered = 0;
        for cb in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| cb(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(event_type = %event.event_type, error = %e, "event subscriber failed");
                }
                Err(payload) => {
                    error!(
                        event_type = %event.event_type,
                        panic = %panic_message(payload.as_ref()),
                        "event subscriber panicked"
                    );
                }
            }
        }
        trace!(event_type = %event.event_type, delivered, "event dispatched");
        delivered
    }

    /// Number of callbacks subscribed to `event_type`
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.lock().get(event_type).map_or(0, Vec::len)
    }

    /// Drop every subscription
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<String, usize> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }
}

impl Deref for SharedEventBus {
    type Target = EventBus;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<EventBus> for SharedEventBus {
    fn from(bus: EventBus) -> Self {
        Self(Arc::new(bus))
    }
}
