//! Typed event bus.
//!
//! Subscribers register for one event kind; dispatch delivers an event to
//! every handler registered for its kind. A handler that returns an error or
//! panics is logged and counted but never prevents the remaining handlers
//! from running.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    panic::{AssertUnwindSafe, catch_unwind},
};

use tracing::{error, warn};

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed event handler.
pub type Handler<Ev> = Box<dyn FnMut(&Ev) -> Result<(), HandlerError> + Send>;

/// An event that can be routed by its discriminant.
pub trait BusEvent {
    /// Discriminant used as the subscription key.
    type Kind: Copy + Eq + Hash + fmt::Debug;

    /// Kind of this event.
    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Per-dispatch delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that returned `Ok`
    pub delivered: usize,
    /// Handlers that returned `Err`
    pub failed: usize,
    /// Handlers that panicked
    pub panicked: usize,
}

/// Event bus keyed by [`BusEvent::Kind`].
pub struct EventBus<Ev: BusEvent> {
    handlers: HashMap<Ev::Kind, Vec<(SubscriptionId, Handler<Ev>)>>,
    next_id: u64,
}

impl<Ev: BusEvent> Default for EventBus<Ev> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ev: BusEvent> EventBus<Ev> {
    /// Empty bus.
    pub fn new() -> Self {
        Self { handlers: HashMap::new(), next_id: 0 }
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<F>(&mut self, kind: Ev::Kind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Ev) -> Result<(), HandlerError> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.handlers.entry(kind).or_default().push((id, Box::new(handler)));
        id
    }

    /// Remove one subscription. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for handlers in self.handlers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sid, _)| *sid == id) {
                let _removed = handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove every subscription.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Number of handlers registered for `kind`.
    pub fn subscriber_count(&self, kind: Ev::Kind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler of its kind, in registration order.
    pub fn dispatch(&mut self, event: &Ev) -> DispatchReport {
        let kind = event.kind();
        let mut report = DispatchReport::default();

        let Some(handlers) = self.handlers.get_mut(&kind) else {
            return report;
        };

        for (id, handler) in handlers.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(?kind, subscription = id.0, error = %e, "event handler failed");
                    report.failed += 1;
                },
                Err(_) => {
                    error!(?kind, subscription = id.0, "event handler panicked");
                    report.panicked += 1;
                },
            }
        }

        report
    }
}

impl<Ev: BusEvent> fmt::Debug for EventBus<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self.handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Tick,
        Tock,
    }

    enum Event {
        Tick(u32),
        Tock,
    }

    impl BusEvent for Event {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            match self {
                Self::Tick(_) => Kind::Tick,
                Self::Tock => Kind::Tock,
            }
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(&Event) -> Result<(), HandlerError> + Send) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move |_: &Event| {
            handle.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn dispatch_reaches_only_matching_kind() {
        let mut bus = EventBus::new();
        let (ticks, on_tick) = counter();
        let (tocks, on_tock) = counter();
        bus.subscribe(Kind::Tick, on_tick);
        bus.subscribe(Kind::Tock, on_tock);

        bus.dispatch(&Event::Tick(1));
        bus.dispatch(&Event::Tick(2));
        bus.dispatch(&Event::Tock);

        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert_eq!(tocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let mut bus = EventBus::new();
        let (count, on_tick) = counter();

        bus.subscribe(Kind::Tick, |_: &Event| Err("boom".into()));
        bus.subscribe(Kind::Tick, on_tick);

        let report = bus.dispatch(&Event::Tick(1));

        assert_eq!(report, DispatchReport { delivered: 1, failed: 1, panicked: 0 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let mut bus = EventBus::new();
        let (count, on_tick) = counter();

        bus.subscribe(Kind::Tick, |event: &Event| match event {
            Event::Tick(0) => panic!("handler bug"),
            _ => Ok(()),
        });
        bus.subscribe(Kind::Tick, on_tick);

        let report = bus.dispatch(&Event::Tick(0));
        assert_eq!(report.panicked, 1);
        assert_eq!(report.delivered, 1);

        // Panicking handler stays registered and keeps working
        let report = bus.dispatch(&Event::Tick(1));
        assert_eq!(report.delivered, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_and_clear() {
        let mut bus = EventBus::new();
        let (_, on_tick) = counter();
        let (_, on_tock) = counter();
        let id = bus.subscribe(Kind::Tick, on_tick);
        bus.subscribe(Kind::Tock, on_tock);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(Kind::Tick), 0);
        assert_eq!(bus.subscriber_count(Kind::Tock), 1);

        bus.clear();
        assert_eq!(bus.subscriber_count(Kind::Tock), 0);
        assert_eq!(bus.dispatch(&Event::Tock), DispatchReport::default());
    }
}
