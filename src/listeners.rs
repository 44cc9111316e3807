use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::{Future, Stream};

use crate::error::CdpError;
use crate::types::Event;

/// One session's subscription table.
///
/// Patterns are matched in insertion order: either the exact event method,
/// or a prefix when the pattern ends with `*`. Registering a pattern again
/// replaces the earlier entry in place. Delivery is channel-backed, so
/// subscriber code always runs outside the broker.
#[derive(Debug, Default)]
pub struct Subscriptions {
    subs: Vec<Subscription>,
}

struct Subscription {
    pattern: String,
    sink: SubscriptionSink,
}

/// The delivery end of a subscription. The channel is created by whoever
/// keeps the receiving half; the broker only ever holds the sender.
#[derive(Debug)]
pub(crate) enum SubscriptionSink {
    /// A repeating subscription feeding an [`EventStream`].
    Stream(UnboundedSender<Arc<Event>>),
    /// A one-shot subscription, consumed by its first matching event.
    Once(oneshot::Sender<Arc<Event>>),
}

impl Subscriptions {
    /// Register a repeating subscription and return the receiving stream.
    pub fn subscribe(&mut self, pattern: impl Into<String>) -> EventStream {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        self.insert(pattern.into(), SubscriptionSink::Stream(tx));
        EventStream { events: rx }
    }

    /// Register a one-shot subscription resolving with the first matching
    /// event; the entry is gone once it fires.
    pub fn subscribe_once(&mut self, pattern: impl Into<String>) -> NextEvent {
        let (tx, rx) = oneshot::channel();
        self.insert(pattern.into(), SubscriptionSink::Once(tx));
        NextEvent { event: rx }
    }

    /// Register an externally created sink, as the broker does for the
    /// user-facing handles.
    pub(crate) fn add(&mut self, pattern: String, sink: SubscriptionSink) {
        self.insert(pattern, sink);
    }

    fn insert(&mut self, pattern: String, sink: SubscriptionSink) {
        if let Some(sub) = self.subs.iter_mut().find(|s| s.pattern == pattern) {
            sub.sink = sink;
        } else {
            self.subs.push(Subscription { pattern, sink });
        }
    }

    /// Remove a subscription; returns whether the pattern was present.
    pub fn unsubscribe(&mut self, pattern: &str) -> bool {
        let before = self.subs.len();
        self.subs.retain(|s| s.pattern != pattern);
        before != self.subs.len()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.subs.iter().any(|s| s.pattern == pattern)
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Deliver an event to every matching subscriber, in insertion order,
    /// then strip one-shots that fired and streams whose receiver is gone.
    pub fn dispatch(&mut self, event: &Arc<Event>) {
        let mut spent = Vec::new();
        for (idx, sub) in self.subs.iter_mut().enumerate() {
            if !pattern_matches(&sub.pattern, &event.method) {
                continue;
            }
            match &mut sub.sink {
                SubscriptionSink::Stream(tx) => {
                    if tx.unbounded_send(Arc::clone(event)).is_err() {
                        // receiver dropped; an implicit unsubscribe
                        spent.push(idx);
                    }
                }
                SubscriptionSink::Once(_) => spent.push(idx),
            }
        }
        for idx in spent.into_iter().rev() {
            let sub = self.subs.remove(idx);
            if let SubscriptionSink::Once(tx) = sub.sink {
                let _ = tx.send(Arc::clone(event));
            }
        }
    }
}

/// `pattern` is either the exact method name or a `*`-terminated prefix.
/// No other metacharacters are honored.
pub fn pattern_matches(pattern: &str, method: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => method.starts_with(prefix),
        None => pattern == method,
    }
}

/// The receiver half of a repeating subscription.
pub struct EventStream {
    events: UnboundedReceiver<Arc<Event>>,
}

impl EventStream {
    pub(crate) fn new(events: UnboundedReceiver<Arc<Event>>) -> Self {
        Self { events }
    }
}

impl Stream for EventStream {
    type Item = Arc<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().events).poll_next(cx)
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish()
    }
}

/// The future half of a one-shot subscription.
pub struct NextEvent {
    event: oneshot::Receiver<Arc<Event>>,
}

impl NextEvent {
    pub(crate) fn new(event: oneshot::Receiver<Arc<Event>>) -> Self {
        Self { event }
    }
}

impl Future for NextEvent {
    type Output = Result<Arc<Event>, CdpError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().event)
            .poll(cx)
            .map(|res| res.map_err(CdpError::from))
    }
}

impl fmt::Debug for NextEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextEvent").finish()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .field(
                "repeating",
                &matches!(self.sink, SubscriptionSink::Stream(_)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn event(method: &str) -> Arc<Event> {
        Arc::new(Event {
            method: method.to_string(),
            session_id: None,
            params: None,
        })
    }

    #[test]
    fn exact_pattern_matches_only_its_method() {
        assert!(pattern_matches("Page.loadEventFired", "Page.loadEventFired"));
        assert!(!pattern_matches("Page.loadEventFired", "Page.loadEventFired2"));
        assert!(!pattern_matches("Page.loadEventFired", "Page.load"));
    }

    #[test]
    fn prefix_pattern_matches_the_domain() {
        assert!(pattern_matches("Page.*", "Page.enable"));
        assert!(pattern_matches("Page.*", "Page.reload"));
        assert!(!pattern_matches("Page.*", "Network.requestWillBeSent"));
        // the wildcard is only honored at the end
        assert!(!pattern_matches("*.enable", "Page.enable"));
        assert!(pattern_matches("*", "anything"));
    }

    #[tokio::test]
    async fn repeating_subscription_sees_every_match() {
        let mut subs = Subscriptions::default();
        let mut stream = subs.subscribe("Page.*");

        subs.dispatch(&event("Page.enable"));
        subs.dispatch(&event("Network.enable"));
        subs.dispatch(&event("Page.reload"));

        assert_eq!(stream.next().await.unwrap().method, "Page.enable");
        assert_eq!(stream.next().await.unwrap().method, "Page.reload");
        assert!(subs.contains("Page.*"));
    }

    #[tokio::test]
    async fn one_shot_fires_once_and_is_removed() {
        let mut subs = Subscriptions::default();
        let next = subs.subscribe_once("Page.*");

        subs.dispatch(&event("Page.enable"));
        subs.dispatch(&event("Page.reload"));

        let got = next.await.unwrap();
        assert_eq!(got.method, "Page.enable");
        assert!(!subs.contains("Page.*"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let mut subs = Subscriptions::default();
        let mut stream = subs.subscribe("Page.*");

        subs.dispatch(&event("Page.enable"));
        assert!(subs.unsubscribe("Page.*"));
        subs.dispatch(&event("Page.reload"));

        assert_eq!(stream.next().await.unwrap().method, "Page.enable");
        // the sender went away with the table entry
        assert!(stream.next().await.is_none());
        assert!(!subs.unsubscribe("Page.*"));
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_previous_entry() {
        let mut subs = Subscriptions::default();
        let mut first = subs.subscribe("Page.*");
        let mut second = subs.subscribe("Page.*");

        subs.dispatch(&event("Page.enable"));

        assert!(first.next().await.is_none());
        assert_eq!(second.next().await.unwrap().method, "Page.enable");
    }

    #[test]
    fn dropped_receiver_is_pruned_on_dispatch() {
        let mut subs = Subscriptions::default();
        let stream = subs.subscribe("Page.*");
        drop(stream);

        subs.dispatch(&event("Page.enable"));
        assert!(subs.is_empty());
    }
}
