//! Event queue interface and the in-process FIFO implementation.

use super::event::Event;
use crate::core::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Acknowledgement callbacks attached to a dequeued event.
///
/// Queues backed by a broker use this to confirm or reject delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, reason: &str) -> Result<()>;
}

/// An event taken off a queue, with optional ack/nack callbacks.
#[derive(Clone)]
pub struct Delivery {
    event: Event,
    acknowledger: Option<Arc<dyn Acknowledge>>,
}

impl Delivery {
    /// A delivery without acknowledgement callbacks.
    pub fn new(event: Event) -> Self {
        Self {
            event,
            acknowledger: None,
        }
    }

    pub fn with_acknowledger(event: Event, acknowledger: Arc<dyn Acknowledge>) -> Self {
        Self {
            event,
            acknowledger: Some(acknowledger),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }

    pub fn has_acknowledger(&self) -> bool {
        self.acknowledger.is_some()
    }

    /// Positive acknowledgement; a no-op without callbacks.
    pub async fn ack(&self) -> Result<()> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.ack().await,
            None => Ok(()),
        }
    }

    /// Negative acknowledgement; a no-op without callbacks.
    pub async fn nack(&self, reason: &str) -> Result<()> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.nack(reason).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("acknowledger", &self.acknowledger.is_some())
            .finish()
    }
}

impl From<Event> for Delivery {
    fn from(event: Event) -> Self {
        Delivery::new(event)
    }
}

/// Trait for event queue backends.
///
/// Reads must be FIFO. `dequeue` never blocks: an empty queue yields
/// `Ok(None)` and the orchestrator waits for the next `publish` to kick it.
#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn enqueue(&self, event: Event) -> Result<()>;

    async fn dequeue(&self) -> Result<Option<Delivery>>;

    async fn size(&self) -> Result<usize>;

    // ===== Optional inspection operations =====

    /// Returns the next event without removing it.
    async fn peek(&self) -> Result<Option<Event>> {
        Err(Error::state("peek is not supported by this queue"))
    }

    /// Removes every queued event.
    async fn clear(&self) -> Result<()> {
        Err(Error::state("clear is not supported by this queue"))
    }

    /// Returns a copy of every queued event in read order.
    async fn list(&self) -> Result<Vec<Event>> {
        Err(Error::state("list is not supported by this queue"))
    }

    /// Removes and returns every queued event in read order.
    async fn drain(&self) -> Result<Vec<Event>> {
        Err(Error::state("drain is not supported by this queue"))
    }
}

#[async_trait]
impl<Q: EventQueue + ?Sized> EventQueue for Arc<Q> {
    async fn enqueue(&self, event: Event) -> Result<()> {
        (**self).enqueue(event).await
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        (**self).dequeue().await
    }

    async fn size(&self) -> Result<usize> {
        (**self).size().await
    }

    async fn peek(&self) -> Result<Option<Event>> {
        (**self).peek().await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }

    async fn list(&self) -> Result<Vec<Event>> {
        (**self).list().await
    }

    async fn drain(&self) -> Result<Vec<Event>> {
        (**self).drain().await
    }
}

/// In-process FIFO queue. Not durable.
#[derive(Debug, Default)]
pub struct InMemoryEventQueue {
    events: Mutex<VecDeque<Event>>,
}

impl InMemoryEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    async fn enqueue(&self, event: Event) -> Result<()> {
        self.events().push_back(event);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        Ok(self.events().pop_front().map(Delivery::new))
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.events().len())
    }

    async fn peek(&self) -> Result<Option<Event>> {
        Ok(self.events().front().cloned())
    }

    async fn clear(&self) -> Result<()> {
        self.events().clear();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Event>> {
        Ok(self.events().iter().cloned().collect())
    }

    async fn drain(&self) -> Result<Vec<Event>> {
        Ok(self.events().drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(n: i64) -> Event {
        Event::new("tick", json!(n)).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryEventQueue::new();
        for n in 0..3 {
            queue.enqueue(event(n)).await.unwrap();
        }
        assert_eq!(queue.size().await.unwrap(), 3);
        assert_eq!(queue.peek().await.unwrap().unwrap().payload(), &json!(0));

        for n in 0..3 {
            let delivery = queue.dequeue().await.unwrap().unwrap();
            assert_eq!(delivery.event().payload(), &json!(n));
            assert!(!delivery.has_acknowledger());
        }
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_drain_clear() {
        let queue = InMemoryEventQueue::new();
        queue.enqueue(event(1)).await.unwrap();
        queue.enqueue(event(2)).await.unwrap();

        assert_eq!(queue.list().await.unwrap().len(), 2);
        assert_eq!(queue.drain().await.unwrap().len(), 2);
        assert_eq!(queue.size().await.unwrap(), 0);

        queue.enqueue(event(3)).await.unwrap();
        queue.clear().await.unwrap();
        assert!(queue.peek().await.unwrap().is_none());
    }

    struct MinimalQueue;

    #[async_trait]
    impl EventQueue for MinimalQueue {
        async fn enqueue(&self, _event: Event) -> Result<()> {
            Ok(())
        }

        async fn dequeue(&self) -> Result<Option<Delivery>> {
            Ok(None)
        }

        async fn size(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_optional_operations_default_to_state_error() {
        let queue = MinimalQueue;
        assert!(matches!(queue.peek().await, Err(Error::State(_))));
        assert!(matches!(queue.drain().await, Err(Error::State(_))));
    }

    #[derive(Default)]
    struct CountingAck {
        acks: AtomicUsize,
        nacks: AtomicUsize,
    }

    #[async_trait]
    impl Acknowledge for CountingAck {
        async fn ack(&self) -> Result<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self, _reason: &str) -> Result<()> {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivery_forwards_acknowledgements() {
        let ack = Arc::new(CountingAck::default());
        let delivery = Delivery::with_acknowledger(event(1), ack.clone());
        delivery.ack().await.unwrap();
        delivery.nack("failed").await.unwrap();
        assert_eq!(ack.acks.load(Ordering::SeqCst), 1);
        assert_eq!(ack.nacks.load(Ordering::SeqCst), 1);

        assert!(Delivery::new(event(2)).ack().await.is_ok());
    }
}
