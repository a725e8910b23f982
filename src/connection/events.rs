//! Per-instance event dispatch
//!
//! Every `Connection` and `ConnectionServer` owns one dispatcher. Callers
//! subscribe and receive events on an unbounded channel; publishing never
//! blocks the connection task. The final event of a session drops every
//! sender, so subscribers see their stream end right after it.

use std::sync::Mutex;
use tokio::sync::mpsc;

/// Fan-out of events to any number of subscribers.
#[derive(Debug)]
pub struct EventDispatcher<E> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> EventDispatcher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber.
    ///
    /// Subscribers whose receiver was dropped are pruned.
    pub fn publish(&self, event: E) {
        self.lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Delivers `event` and then drops every subscriber, under one lock so
    /// no subscription can slip in between.
    pub fn publish_final(&self, event: E) {
        let mut subscribers = self.lock();
        for tx in subscribers.drain(..) {
            let _ = tx.send(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<E>>> {
        // A panicking subscriber cannot leave the list half-updated
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let events = EventDispatcher::new();
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        events.publish(7u32);

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let events = EventDispatcher::new();
        let a = events.subscribe();
        let _b = events.subscribe();
        drop(a);

        events.publish(1u32);
        assert_eq!(events.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_final() {
        let events = EventDispatcher::new();
        let mut rx = events.subscribe();

        events.publish(2u8);
        events.publish_final(3u8);

        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(rx.recv().await, None);
        assert_eq!(events.subscriber_count(), 0);
    }
}
