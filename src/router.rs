//! Event subscription table and fan-out.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::message::Message;

/// An opaque handle returned by [`EventRouter::register`], used to later
/// [`EventRouter::deregister`] the subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    callback: Callback,
}

/// Tracks which event names FreeSWITCH has been asked to deliver, so
/// `register` only emits `event plain …` once per name (or not at all
/// once `all` or `myevents` is in effect).
#[derive(Default)]
pub(crate) struct SubscribedEvents {
    all: bool,
    myevents: bool,
    names: std::collections::HashSet<String>,
}

impl SubscribedEvents {
    pub(crate) fn covers(&self, event_name: &str) -> bool {
        self.all || self.myevents || self.names.contains(event_name)
    }

    pub(crate) fn mark_all(&mut self) {
        self.all = true;
    }

    pub(crate) fn mark_myevents(&mut self) {
        self.myevents = true;
    }

    pub(crate) fn mark(&mut self, event_name: &str) {
        self.names.insert(event_name.to_string());
    }
}

/// Subscription table plus `BACKGROUND_JOB`-aware fan-out.
///
/// Plain event names and `CUSTOM` subclasses are tracked in separate
/// tables, since a `CUSTOM` event is identified by its `Event-Subclass`
/// header rather than `Event-Name`.
pub(crate) struct EventRouter {
    next_id: u64,
    by_event_name: HashMap<String, Vec<Subscription>>,
    by_custom_subclass: HashMap<String, Vec<Subscription>>,
}

// SubscriptionId doesn't record which table it lives in, so deregister
// scans both; subscriber counts per connection are small in practice.
impl EventRouter {
    pub(crate) fn new() -> EventRouter {
        EventRouter {
            next_id: 0,
            by_event_name: HashMap::new(),
            by_custom_subclass: HashMap::new(),
        }
    }

    fn next_subscription_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a callback for `event_name`. If `event_name` is
    /// `"CUSTOM <subclass>"`, it is registered under that subclass in the
    /// custom-event table; otherwise under the plain event-name table.
    pub(crate) fn register(
        &mut self,
        event_name: &str,
        callback: Callback,
    ) -> SubscriptionId {
        let id = self.next_subscription_id();
        let subscription = Subscription { id, callback };
        match event_name.strip_prefix("CUSTOM ") {
            Some(subclass) => {
                self.by_custom_subclass
                    .entry(subclass.to_string())
                    .or_default()
                    .push(subscription);
            }
            None => {
                self.by_event_name
                    .entry(event_name.to_string())
                    .or_default()
                    .push(subscription);
            }
        }
        id
    }

    /// Remove a subscription by id. Logs and does nothing if the id is
    /// not found (tolerates double-deregistration).
    pub(crate) fn deregister(&mut self, id: SubscriptionId) {
        for bucket in self.by_event_name.values_mut() {
            if let Some(pos) = bucket.iter().position(|s| s.id == id) {
                bucket.remove(pos);
                return;
            }
        }
        for bucket in self.by_custom_subclass.values_mut() {
            if let Some(pos) = bucket.iter().position(|s| s.id == id) {
                bucket.remove(pos);
                return;
            }
        }
        error!(?id, "deregister called with unknown subscription id");
    }

    /// Dispatch an already-demultiplexed event `Message` to matching
    /// subscribers. `CUSTOM` events are matched by `Event-Subclass`;
    /// everything else by `Event-Name`. The message should already be
    /// URL-decoded for `CUSTOM` events before this is called.
    pub(crate) fn dispatch(&self, message: &Message) {
        let event_name = match message.header("Event-Name") {
            Some(name) => name,
            None => return,
        };

        let bucket = if event_name == "CUSTOM" {
            message
                .header("Event-Subclass")
                .and_then(|subclass| self.by_custom_subclass.get(subclass))
        } else {
            self.by_event_name.get(event_name)
        };

        let Some(subscriptions) = bucket else {
            return;
        };

        for subscription in subscriptions {
            let callback = subscription.callback.clone();
            let result = catch_unwind(AssertUnwindSafe(|| callback(message)));
            if result.is_err() {
                error!(event_name, "event callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(pairs: &[(&str, &str)]) -> Message {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(*k, *v);
        }
        Message::new(headers, Default::default())
    }

    #[test]
    fn plain_event_dispatches_to_registered_callback() {
        let mut router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        router.register("CHANNEL_ANSWER", Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        router.dispatch(&event(&[("Event-Name", "CHANNEL_ANSWER")]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_event_dispatches_by_subclass_only() {
        let mut router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        router.register("CUSTOM conference::maintenance", Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        router.dispatch(&event(&[
            ("Event-Name", "CUSTOM"),
            ("Event-Subclass", "sofia::register"),
        ]));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        router.dispatch(&event(&[
            ("Event-Name", "CUSTOM"),
            ("Event-Subclass", "conference::maintenance"),
        ]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregistered_subscription_no_longer_fires() {
        let mut router = EventRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let id = router.register("CHANNEL_HANGUP", Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        router.deregister(id);
        router.dispatch(&event(&[("Event-Name", "CHANNEL_HANGUP")]));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn double_deregister_does_not_panic() {
        let mut router = EventRouter::new();
        let id = router.register("CHANNEL_HANGUP", Arc::new(|_| {}));
        router.deregister(id);
        router.deregister(id);
    }

    #[test]
    fn panicking_callback_does_not_prevent_others_from_firing() {
        let mut router = EventRouter::new();
        router.register("CHANNEL_HANGUP", Arc::new(|_| panic!("boom")));
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        router.register("CHANNEL_HANGUP", Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        router.dispatch(&event(&[("Event-Name", "CHANNEL_HANGUP")]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribed_events_suppresses_redundant_subscription() {
        let mut subscribed = SubscribedEvents::default();
        assert!(!subscribed.covers("CHANNEL_ANSWER"));
        subscribed.mark_all();
        assert!(subscribed.covers("CHANNEL_ANSWER"));
        assert!(subscribed.covers("anything"));
    }
}
