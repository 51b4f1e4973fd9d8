use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::Event;

/// Opaque handle returned by [`EventHub::subscribe`], used to later call
/// [`EventHub::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionToken(u64);

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    token: SubscriptionToken,
    /// `None` means "subscribed to every event kind".
    kinds: Option<Vec<&'static str>>,
    callback: Callback,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        match &self.kinds {
            None => true,
            Some(kinds) => kinds.contains(&event.kind()),
        }
    }
}

struct Shared {
    subscriptions: RwLock<Vec<Subscription>>,
    next_token: AtomicU64,
}

/// A process-local, thread-safe publish/subscribe bus.
///
/// A dedicated dispatch task owns the receiving half of a bounded channel;
/// `publish` only ever enqueues, so no subscriber lock is ever held across a
/// user callback, and subscriber lists can be mutated freely mid-dispatch —
/// each `publish` dispatches against a snapshot taken at drain time.
pub struct EventHub {
    shared: Arc<Shared>,
    sender: mpsc::Sender<Event>,
    dispatcher: Option<JoinHandle<()>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            subscriptions: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(0),
        });

        let (sender, mut receiver) = mpsc::channel::<Event>(capacity);
        let dispatch_shared = shared.clone();

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                // Snapshot: cheap since callbacks are boxed once and the list
                // is only read here, never mutated from within a callback.
                let matching: Vec<usize> = {
                    let subs = dispatch_shared.subscriptions.read();
                    subs.iter()
                        .enumerate()
                        .filter(|(_, s)| s.matches(&event))
                        .map(|(i, _)| i)
                        .collect()
                };

                for index in matching {
                    let subs = dispatch_shared.subscriptions.read();
                    let Some(sub) = subs.get(index) else {
                        continue;
                    };
                    let callback = &sub.callback;
                    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                        tracing::error!(?panic, event = event.kind(), "event subscriber panicked");
                    }
                }
            }
        });

        Self {
            shared,
            sender,
            dispatcher: Some(dispatcher),
        }
    }

    /// Subscribe to every event, or only to the named kinds if `kinds` is `Some`.
    pub fn subscribe<F>(&self, kinds: Option<Vec<&'static str>>, callback: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared.subscriptions.write().push(Subscription {
            token,
            kinds,
            callback: Box::new(callback),
        });
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.shared
            .subscriptions
            .write()
            .retain(|sub| sub.token != token);
    }

    /// Enqueue an event for dispatch. Resolves once the event has been
    /// handed to the dispatcher, not once every subscriber has run.
    pub async fn publish(&self, event: Event) {
        if self.sender.send(event).await.is_err() {
            tracing::error!("event dispatcher task is gone; dropping published event");
        }
    }

    /// Subscribe this hub's `publish` to every event from `other`, with no
    /// type filter. Used so the Scheduler/Worker's own hub sees every event
    /// their Data Store emits.
    pub fn relay_events_from(self: &Arc<Self>, other: &EventHub) -> SubscriptionToken {
        let sender = self.sender.clone();
        other.subscribe(None, move |event| {
            // A synchronous send directly into the channel, not a spawned
            // task: spawned tasks give no guarantee about relative completion
            // order, which would let two events published back-to-back on
            // `other` land out of order in this hub.
            if sender.try_send(event.clone()).is_err() {
                tracing::error!(event = event.kind(), "relay target hub is full or gone; dropping event");
            }
        })
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventHub {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();

        hub.subscribe(None, move |_event| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        hub.publish(Event::scheduler_started()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn type_filter_only_matches_named_kinds() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();

        hub.subscribe(Some(vec!["WorkerStarted"]), move |_event| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        hub.publish(Event::scheduler_started()).await;
        hub.publish(Event::worker_started()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();

        let token = hub.subscribe(None, move |_event| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        hub.unsubscribe(token);

        hub.publish(Event::scheduler_started()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn events_delivered_in_publish_order() {
        let hub = EventHub::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = order.clone();

        hub.subscribe(None, move |event| {
            seen.lock().push(event.kind());
        });

        hub.publish(Event::scheduler_started()).await;
        hub.publish(Event::worker_started()).await;
        hub.publish(Event::schedule_added("s1")).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(
            *order.lock(),
            vec!["SchedulerStarted", "WorkerStarted", "ScheduleAdded"]
        );
    }
}
