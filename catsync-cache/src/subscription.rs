//! Subscriptions and the fan-out of cache changes to them.
//!
//! A subscriber owns a translator that maps one changed catalog value to the
//! local keys interested in it. Every key becomes one event on the
//! subscriber's channel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use catsync_core::{CancellationToken, NamespacedName};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Maps a changed catalog value to the local keys that depend on it.
pub type Translator<T> = Arc<dyn Fn(&T) -> Vec<NamespacedName> + Send + Sync>;

/// Default channel capacity for [`Delivery::Bounded`].
pub const DEFAULT_CAPACITY: usize = 256;

/// How events reach a subscriber whose channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Delivery {
    /// Wait for the subscriber. A slow reader stalls the topic's refresh loop.
    Backpressure,
    /// Drop the event and count it when the channel is full.
    Bounded { capacity: usize },
}

impl Default for Delivery {
    fn default() -> Self {
        Delivery::Bounded {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl Delivery {
    fn channel_capacity(self) -> usize {
        match self {
            Delivery::Backpressure => 1,
            Delivery::Bounded { capacity } => capacity.max(1),
        }
    }
}

/// Receiving half of a subscription. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<NamespacedName>,
    token: CancellationToken,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Next event, or `None` once the subscription is cancelled and drained
    /// or the cache has shut down.
    pub async fn recv(&mut self) -> Option<NamespacedName> {
        tokio::select! {
            biased;
            event = self.events.recv() => event,
            _ = self.token.cancelled() => self.events.try_recv().ok(),
        }
    }

    pub fn try_recv(&mut self) -> Option<NamespacedName> {
        self.events.try_recv().ok()
    }

    /// Stop receiving. The cache prunes the subscriber on its next pass.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Events discarded because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Sending half kept in the cache's subscriber registry.
pub(crate) struct Subscriber<T> {
    translator: Translator<T>,
    token: CancellationToken,
    sender: mpsc::Sender<NamespacedName>,
    dropped: Arc<AtomicU64>,
    delivery: Delivery,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            translator: Arc::clone(&self.translator),
            token: self.token.clone(),
            sender: self.sender.clone(),
            dropped: Arc::clone(&self.dropped),
            delivery: self.delivery,
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("delivery", &self.delivery)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T> Subscriber<T> {
    pub(crate) fn new(translator: Translator<T>, delivery: Delivery) -> (Self, Subscription) {
        let (sender, events) = mpsc::channel(delivery.channel_capacity());
        let token = CancellationToken::new();
        let dropped = Arc::new(AtomicU64::new(0));
        let subscriber = Self {
            translator,
            token: token.clone(),
            sender,
            dropped: Arc::clone(&dropped),
            delivery,
        };
        (
            subscriber,
            Subscription {
                events,
                token,
                dropped,
            },
        )
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.sender.is_closed()
    }

    /// Sends one event. Returns `false` when the subscriber is gone.
    async fn deliver(
        &self,
        topic: &str,
        key: NamespacedName,
        shutdown: &CancellationToken,
    ) -> bool {
        match self.delivery {
            Delivery::Backpressure => tokio::select! {
                biased;
                _ = shutdown.cancelled() => false,
                _ = self.token.cancelled() => false,
                sent = self.sender.send(key) => sent.is_ok(),
            },
            Delivery::Bounded { .. } => match self.sender.try_send(key) {
                Ok(()) => true,
                Err(TrySendError::Full(key)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("catsync_subscriber_dropped_total", "topic" => topic.to_owned())
                        .increment(1);
                    tracing::debug!(topic, key = %key, "subscriber channel full, dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
        }
    }
}

/// Delivers every change to every live subscriber, in change order.
///
/// Returns `true` when at least one subscriber turned out to be gone, so the
/// caller can prune the registry.
pub(crate) async fn fan_out<T>(
    topic: &str,
    subscribers: &[Subscriber<T>],
    changes: &[T],
    shutdown: &CancellationToken,
) -> bool {
    let mut pruned = false;
    for subscriber in subscribers {
        if !subscriber.is_live() {
            pruned = true;
            continue;
        }
        'changes: for change in changes {
            for key in (subscriber.translator)(change) {
                if shutdown.is_cancelled() {
                    return pruned;
                }
                if !subscriber.deliver(topic, key, shutdown).await {
                    pruned = true;
                    break 'changes;
                }
            }
        }
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Translator<String> {
        Arc::new(|value: &String| vec![NamespacedName::new("default", value.clone())])
    }

    #[tokio::test]
    async fn bounded_delivery_drops_and_counts_overflow() {
        let (subscriber, mut subscription) =
            Subscriber::new(echo(), Delivery::Bounded { capacity: 2 });
        let shutdown = CancellationToken::new();
        let changes: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

        let pruned = fan_out("http-route", &[subscriber], &changes, &shutdown).await;
        assert!(!pruned);
        assert_eq!(subscription.dropped(), 2);
        assert_eq!(subscription.try_recv().map(|k| k.name), Some("a".into()));
        assert_eq!(subscription.try_recv().map(|k| k.name), Some("b".into()));
        assert_eq!(subscription.try_recv(), None);
    }

    #[tokio::test]
    async fn translator_fans_one_change_into_many_events() {
        let translator: Translator<String> = Arc::new(|value: &String| {
            vec![
                NamespacedName::new("a", value.clone()),
                NamespacedName::new("b", value.clone()),
            ]
        });
        let (subscriber, mut subscription) = Subscriber::new(translator, Delivery::default());
        let shutdown = CancellationToken::new();

        fan_out("k", &[subscriber], &["x".to_string()], &shutdown).await;
        assert_eq!(subscription.try_recv(), Some(NamespacedName::new("a", "x")));
        assert_eq!(subscription.try_recv(), Some(NamespacedName::new("b", "x")));
    }

    #[tokio::test]
    async fn cancelled_subscriber_is_reported_for_pruning() {
        let (subscriber, subscription) = Subscriber::new(echo(), Delivery::default());
        subscription.cancel();
        let shutdown = CancellationToken::new();

        assert!(fan_out("k", &[subscriber.clone()], &["x".to_string()], &shutdown).await);
        assert!(!subscriber.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_send_observes_subscriber_cancellation() {
        let (subscriber, subscription) = Subscriber::new(echo(), Delivery::Backpressure);
        let shutdown = CancellationToken::new();
        let changes: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let sending = tokio::spawn({
            let subscriber = subscriber.clone();
            let shutdown = shutdown.clone();
            async move { fan_out("k", &[subscriber], &changes, &shutdown).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        subscription.cancel();

        assert!(sending.await.expect("join"));
    }

    #[test]
    fn delivery_parses_from_tagged_form() {
        let bounded: Delivery =
            serde_json::from_str(r#"{"mode":"bounded","capacity":8}"#).expect("parse");
        assert_eq!(bounded, Delivery::Bounded { capacity: 8 });
        let backpressure: Delivery =
            serde_json::from_str(r#"{"mode":"backpressure"}"#).expect("parse");
        assert_eq!(backpressure, Delivery::Backpressure);
    }
}
