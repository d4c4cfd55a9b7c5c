//! In-process broker
//!
//! Named queues with broker-side acknowledgment state: a delivery moves from
//! `ready` to `unacked` when handed out and leaves `unacked` only when it is
//! settled. Requeued messages go to the back of `ready` with their delivery
//! count bumped; rejected ones without requeue are dead-lettered. Deliveries
//! abandoned by a consumer stay in `unacked` until [`InMemoryBroker::recover`]
//! puts them back, which stands in for a broker noticing a lost channel.

use super::{Acknowledger, Delivery, QueueClient, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use postguard_core::{Error, PublishError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How often [`InMemoryBroker::wait_idle`] re-checks the queues
const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Bytes,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<String, StoredMessage>,
    acked: u64,
    dead: Vec<Bytes>,
}

struct BrokerInner {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_tag: AtomicU64,
    publish_faults: AtomicU32,
    closed: AtomicBool,
}

/// Shared handle to one in-process broker
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                next_tag: AtomicU64::new(1),
                publish_faults: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Append a message to `queue` (producer side, never fails)
    pub fn enqueue(&self, queue: &str, payload: impl Into<Bytes>) {
        self.push(
            queue,
            StoredMessage {
                payload: payload.into(),
                delivery_count: 0,
            },
        );
    }

    fn push(&self, queue: &str, message: StoredMessage) {
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(message);
        self.inner.notify.notify_waiters();
    }

    /// Payloads waiting in `queue`, oldest first
    pub fn messages(&self, queue: &str) -> Vec<Bytes> {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len())
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len())
    }

    pub fn acked_count(&self, queue: &str) -> u64 {
        self.with_queue(queue, |q| q.acked)
    }

    /// Payloads rejected without requeue
    pub fn dead_letters(&self, queue: &str) -> Vec<Bytes> {
        self.with_queue(queue, |q| q.dead.clone())
    }

    /// Nothing ready and nothing outstanding
    pub fn is_idle(&self, queue: &str) -> bool {
        self.with_queue(queue, |q| q.ready.is_empty() && q.unacked.is_empty())
    }

    /// Resolve once all of `queues` are idle at the same time
    pub async fn wait_idle(&self, queues: &[&str]) {
        while !queues.iter().all(|queue| self.is_idle(queue)) {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Make the next `count` publishes fail with `PublishError::Unavailable`
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.publish_faults.store(count, Ordering::SeqCst);
    }

    /// Return every unsettled delivery of `queue` to the ready list
    pub fn recover(&self, queue: &str) -> usize {
        let recovered = {
            let mut queues = self.inner.queues.lock();
            let Some(state) = queues.get_mut(queue) else {
                return 0;
            };
            let mut tags: Vec<String> = state.unacked.keys().cloned().collect();
            tags.sort_by_key(|tag| tag.parse::<u64>().unwrap_or(u64::MAX));
            for tag in &tags {
                if let Some(mut message) = state.unacked.remove(tag) {
                    message.delivery_count += 1;
                    state.ready.push_back(message);
                }
            }
            tags.len()
        };
        if recovered > 0 {
            tracing::debug!(queue, recovered, "Recovered unacknowledged deliveries");
            self.inner.notify.notify_waiters();
        }
        recovered
    }

    /// End every subscription; pending deliveries stay where they are
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> T {
        self.inner.queues.lock().get(queue).map(f).unwrap_or_default()
    }

    fn take_next(&self, queue: &str) -> Option<(String, StoredMessage)> {
        let mut queues = self.inner.queues.lock();
        let state = queues.get_mut(queue)?;
        let message = state.ready.pop_front()?;
        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        state.unacked.insert(tag.clone(), message.clone());
        Some((tag, message))
    }

    /// Wait for the next ready message of `queue`; `None` once closed
    async fn next_delivery(self, queue: String, acker: Arc<dyn Acknowledger>) -> Option<Delivery> {
        loop {
            // Registered before checking so a concurrent push cannot be missed.
            let notified = self.inner.notify.notified();

            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some((tag, message)) = self.take_next(&queue) {
                return Some(Delivery::new(
                    tag,
                    message.payload,
                    message.delivery_count,
                    Arc::clone(&acker),
                ));
            }

            notified.await;
        }
    }

    fn settle(&self, queue: &str, tag: &str, outcome: Settlement) -> Result<()> {
        let requeued = {
            let mut queues = self.inner.queues.lock();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| Error::queue(format!("unknown queue '{}'", queue)))?;
            let mut message = state
                .unacked
                .remove(tag)
                .ok_or_else(|| Error::queue(format!("unknown delivery tag '{}'", tag)))?;

            match outcome {
                Settlement::Ack => {
                    state.acked += 1;
                    false
                }
                Settlement::Requeue => {
                    message.delivery_count += 1;
                    state.ready.push_back(message);
                    true
                }
                Settlement::DeadLetter => {
                    state.dead.push(message.payload);
                    false
                }
            }
        };
        if requeued {
            self.inner.notify.notify_waiters();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.broker.settle(&self.queue, delivery.tag(), Settlement::Ack)
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let outcome = if requeue {
            Settlement::Requeue
        } else {
            Settlement::DeadLetter
        };
        self.broker.settle(&self.queue, delivery.tag(), outcome)
    }
}

#[async_trait]
impl QueueClient for InMemoryBroker {
    async fn consume(&self, queue: &str) -> Result<Subscription> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::queue("broker is closed"));
        }
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();

        let acker: Arc<dyn Acknowledger> = Arc::new(MemoryAcker {
            broker: self.clone(),
            queue: queue.to_string(),
        });
        let broker = self.clone();
        let queue = queue.to_string();

        let stream = futures::stream::unfold((), move |()| {
            let next = broker
                .clone()
                .next_delivery(queue.clone(), Arc::clone(&acker));
            async move { next.await.map(|delivery| (delivery, ())) }
        });
        Ok(Box::pin(stream))
    }

    async fn publish(&self, queue: &str, payload: Bytes) -> std::result::Result<(), PublishError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PublishError::unavailable("broker is closed"));
        }
        let faulted = self
            .inner
            .publish_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if faulted {
            return Err(PublishError::unavailable("injected publish failure"));
        }

        self.enqueue(queue, payload);
        Ok(())
    }
}
