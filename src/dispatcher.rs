//! Demand-coupled, filter-aware fan-out node between the replication
//! producer and shape consumers.
//!
//! Realized as a single-owner actor task with an unbounded in-queue,
//! modeled on `backend::pub_sub::inner::Inner` + `listener::Listener`'s
//! `Arc<Inner>` + spawned-task shape, but driven entirely by message
//! passing instead of a shared `Mutex` so the demand bookkeeping stays
//! single-threaded without needing a lock held across an `await`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::filter::Filter;
use crate::partitions::Partitions;
use crate::producer::{Event, LogCollector};
use crate::shape::Shape;
use crate::subscriber::SubscriberId;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("subscriber {0} is already subscribed")]
    AlreadySubscribed(SubscriberId),
    #[error("dispatcher actor is no longer running")]
    Closed,
}

/// Capacity of the per-consumer event channel: exactly one event may be
/// in flight to a consumer at a time (`max_demand = 1`).
const CONSUMER_CHANNEL_CAPACITY: usize = 1;

enum Msg {
    Subscribe {
        subscriber: SubscriberId,
        shape: Shape,
        sender: mpsc::Sender<Arc<Event>>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Cancel(SubscriberId),
    Ack(SubscriberId),
    Produced(Result<Option<Event>, crate::producer::ProducerError>),
}

#[derive(Default)]
struct State {
    waiting: usize,
    pending: HashSet<SubscriberId>,
    subscribers: HashSet<SubscriberId>,
    pids: HashSet<u64>,
    /// Subscribers that received at least one fragment of the
    /// currently-open transaction. The commit marker carries no relation
    /// for the Filter to match against, so it's routed to exactly this set.
    active_in_txn: HashSet<SubscriberId>,
}

/// Handle to a running Dispatcher actor.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Msg>,
}

impl Dispatcher {
    /// Spawn the actor task and return a handle to it.
    pub fn spawn(
        filter: Arc<Filter>,
        partitions: Arc<Partitions>,
        producer: Arc<dyn LogCollector>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            filter,
            partitions,
            producer,
            state: State::default(),
            consumers: HashMap::new(),
            self_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Subscribe `subscriber` with `shape`, wiring `sender` as its event
    /// channel. Rejects a second subscription from the same consumer.
    pub async fn subscribe(
        &self,
        subscriber: SubscriberId,
        shape: Shape,
        sender: mpsc::Sender<Arc<Event>>,
    ) -> Result<(), Error> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(Msg::Subscribe {
                subscriber,
                shape,
                sender,
                reply,
            })
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    /// Acknowledge durable processing of the current in-flight event.
    pub fn ask(&self, subscriber: SubscriberId) {
        let _ = self.tx.send(Msg::Ack(subscriber));
    }

    pub fn cancel(&self, subscriber: SubscriberId) {
        let _ = self.tx.send(Msg::Cancel(subscriber));
    }

    /// The channel capacity every consumer should dial when constructing
    /// its own event channel before calling [`Dispatcher::subscribe`].
    pub const fn consumer_channel_capacity() -> usize {
        CONSUMER_CHANNEL_CAPACITY
    }
}

struct Actor {
    filter: Arc<Filter>,
    partitions: Arc<Partitions>,
    producer: Arc<dyn LogCollector>,
    state: State,
    consumers: HashMap<SubscriberId, mpsc::Sender<Arc<Event>>>,
    self_tx: mpsc::UnboundedSender<Msg>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Subscribe {
                    subscriber,
                    shape,
                    sender,
                    reply,
                } => {
                    let result = self.handle_subscribe(subscriber, shape, sender);
                    let request_demand = result.is_ok() && self.state.subscribers.len() == 1;
                    let _ = reply.send(result);
                    if request_demand {
                        self.request_next();
                    }
                }
                Msg::Cancel(subscriber) => {
                    if self.handle_cancel(subscriber) {
                        self.request_next();
                    }
                }
                Msg::Ack(subscriber) => {
                    if self.handle_ack(subscriber) {
                        self.request_next();
                    }
                }
                Msg::Produced(Ok(Some(event))) => self.dispatch(event).await,
                Msg::Produced(Ok(None)) => break,
                Msg::Produced(Err(err)) => {
                    warn!("replication producer error, tearing down dispatcher: {err}");
                    break;
                }
            }
        }
    }

    fn handle_subscribe(
        &mut self,
        subscriber: SubscriberId,
        shape: Shape,
        sender: mpsc::Sender<Arc<Event>>,
    ) -> Result<(), Error> {
        if !self.state.pids.insert(subscriber.consumer) {
            return Err(Error::AlreadySubscribed(subscriber));
        }
        self.state.subscribers.insert(subscriber);
        self.filter.add_shape(subscriber, shape);
        self.consumers.insert(subscriber, sender);
        Ok(())
    }

    /// Returns whether this cancellation closed out the current wait,
    /// releasing one unit of upstream demand.
    fn handle_cancel(&mut self, subscriber: SubscriberId) -> bool {
        self.state.subscribers.remove(&subscriber);
        self.state.pids.remove(&subscriber.consumer);
        self.state.active_in_txn.remove(&subscriber);
        self.filter.remove_shape(subscriber);
        self.consumers.remove(&subscriber);

        if !self.state.pending.remove(&subscriber) {
            return false;
        }
        if self.state.waiting <= 1 {
            self.state.waiting = 0;
            self.state.pending.clear();
            true
        } else {
            self.state.waiting -= 1;
            false
        }
    }

    /// Applies the ack bookkeeping rules. Returns whether upstream demand
    /// was just renewed.
    fn handle_ack(&mut self, from: SubscriberId) -> bool {
        if self.state.waiting == 0 {
            return false; // duplicate or premature ack
        }
        if self.state.waiting == 1 {
            if !self.state.pending.contains(&from) {
                return false;
            }
            self.state.waiting = 0;
            self.state.pending.clear();
            return true;
        }
        self.state.waiting -= 1;
        self.state.pending.remove(&from);
        false
    }

    fn request_next(&self) {
        let producer = self.producer.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = producer.ask(1).await;
            let _ = tx.send(Msg::Produced(result));
        });
    }

    fn rewrite(&self, event: Event) -> Event {
        match event {
            Event::Fragment {
                lsn,
                changes,
                is_final,
            } => {
                let changes = changes
                    .into_iter()
                    .map(|c| self.partitions.handle_event(c))
                    .collect();
                Event::Fragment {
                    lsn,
                    changes,
                    is_final,
                }
            }
            other => other,
        }
    }

    async fn dispatch(&mut self, event: Event) {
        let event = self.rewrite(event);

        match &event {
            Event::TransactionStart { .. } => {
                self.state.active_in_txn.clear();
                self.zero_match();
            }
            Event::Fragment { changes, .. } => {
                let mut affected = HashSet::new();
                for change in changes {
                    affected.extend(self.filter.affected_shapes(change));
                }
                self.state.active_in_txn.extend(affected.iter().copied());

                if affected.is_empty() {
                    self.zero_match();
                    return;
                }
                self.send_to(affected, Arc::new(event)).await;
            }
            Event::Commit { .. } => {
                let targets: HashSet<_> = self.state.active_in_txn.drain().collect();
                if targets.is_empty() {
                    self.zero_match();
                    return;
                }
                self.send_to(targets, Arc::new(event)).await;
            }
        }
    }

    async fn send_to(&mut self, targets: HashSet<SubscriberId>, event: Arc<Event>) {
        let mut sent = HashSet::new();
        let mut gone = Vec::new();
        for target in targets {
            match self.consumers.get(&target) {
                Some(sender) if sender.send(event.clone()).await.is_ok() => {
                    sent.insert(target);
                }
                _ => gone.push(target),
            }
        }
        for target in gone {
            self.handle_cancel(target);
        }

        if sent.is_empty() {
            self.zero_match();
            return;
        }
        self.state.waiting = sent.len();
        self.state.pending = sent;
    }

    /// Zero-match edge case: pick an arbitrary live subscriber and feed it
    /// a synthetic self-ack so the demand loop never stalls.
    fn zero_match(&mut self) {
        let Some(chosen) = self.state.subscribers.iter().next().copied() else {
            return;
        };
        self.state.waiting = 1;
        self.state.pending = HashSet::from([chosen]);
        let renewed = self.handle_ack(chosen);
        debug_assert!(renewed);
        self.request_next();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::relation::Relation;
    use crate::shape::Shape;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{timeout, Duration};

    /// Wraps [`crate::producer::TestProducer`] to count `ask` calls, so
    /// tests can assert the demand loop actually closes even on a
    /// zero-match dispatch.
    struct CountingProducer {
        inner: crate::producer::TestProducer,
        asks: AtomicUsize,
    }

    impl CountingProducer {
        fn new(events: Vec<Event>) -> Self {
            Self {
                inner: crate::producer::TestProducer::new(events),
                asks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LogCollector for CountingProducer {
        async fn ask(&self, n: u32) -> Result<Option<Event>, crate::producer::ProducerError> {
            self.asks.fetch_add(1, Ordering::SeqCst);
            // Gives tests a window to finish subscribing before the first
            // event is actually handed back, so subscriber registration
            // order in a test is never racing the spawned `request_next`
            // task.
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.inner.ask(n).await
        }
    }

    fn sub(id: u64) -> SubscriberId {
        SubscriberId::new(id, 0)
    }

    fn insert(relation: Relation, op_index: u32) -> crate::change::Change {
        crate::change::Change::Insert {
            relation,
            op_index,
            new: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_rejected() {
        let filter = Arc::new(Filter::new());
        let partitions = Arc::new(Partitions::new());
        let producer = Arc::new(CountingProducer::new(vec![]));
        let dispatcher = Dispatcher::spawn(filter, partitions, producer);

        let (tx, _rx) = mpsc::channel(1);
        dispatcher
            .subscribe(sub(1), Shape::without_predicate(Relation::public("users")), tx.clone())
            .await
            .unwrap();

        let err = dispatcher
            .subscribe(sub(1), Shape::without_predicate(Relation::public("users")), tx)
            .await
            .unwrap_err();
        assert_eq!(err, Error::AlreadySubscribed(sub(1)));
    }

    #[tokio::test]
    async fn test_zero_match_still_asks_for_next_event() {
        let filter = Arc::new(Filter::new());
        let partitions = Arc::new(Partitions::new());
        let producer = Arc::new(CountingProducer::new(vec![
            Event::TransactionStart { lsn: 1 },
            Event::Fragment {
                lsn: 1,
                changes: vec![insert(Relation::public("irrelevant_table"), 0)],
                is_final: true,
            },
            Event::Commit { lsn: 1 },
        ]));
        let dispatcher = Dispatcher::spawn(filter, partitions, producer.clone());

        let (tx, mut rx) = mpsc::channel(1);
        dispatcher
            .subscribe(sub(1), Shape::without_predicate(Relation::public("users")), tx)
            .await
            .unwrap();

        // Nobody cares about `irrelevant_table`, and the consumer never
        // receives anything — but the producer must still have been asked
        // for every one of the three events plus one more to notice
        // exhaustion.
        let got = timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(got.is_err() || got.unwrap().is_none());

        // Give the actor a moment to drain the fixed event sequence.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(producer.asks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_ack_before_next_event() {
        let filter = Arc::new(Filter::new());
        let partitions = Arc::new(Partitions::new());
        let producer = Arc::new(CountingProducer::new(vec![
            Event::Fragment {
                lsn: 1,
                changes: vec![insert(Relation::public("users"), 0)],
                is_final: true,
            },
            Event::Fragment {
                lsn: 2,
                changes: vec![insert(Relation::public("users"), 0)],
                is_final: true,
            },
        ]));
        let dispatcher = Dispatcher::spawn(filter, partitions, producer);

        let (tx1, mut rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        // The `CountingProducer`'s artificial delay guarantees both
        // subscriptions land before the first event is handed back.
        dispatcher
            .subscribe(sub(1), Shape::without_predicate(Relation::public("users")), tx1)
            .await
            .unwrap();
        dispatcher
            .subscribe(sub(2), Shape::without_predicate(Relation::public("users")), tx2)
            .await
            .unwrap();

        let e1a = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        let e1b = timeout(Duration::from_secs(1), rx2.recv()).await.unwrap().unwrap();
        assert_eq!(e1a.lsn(), 1);
        assert_eq!(e1b.lsn(), 1);

        // Only subscriber 1 has acked; the second event must not appear yet.
        dispatcher.ask(sub(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());

        // Once both ack, demand renews and the next event reaches both.
        dispatcher.ask(sub(2));
        let e2a = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        let e2b = timeout(Duration::from_secs(1), rx2.recv()).await.unwrap().unwrap();
        assert_eq!(e2a.lsn(), 2);
        assert_eq!(e2b.lsn(), 2);
    }

    #[tokio::test]
    async fn test_cancel_releases_pending_demand() {
        let filter = Arc::new(Filter::new());
        let partitions = Arc::new(Partitions::new());
        let producer = Arc::new(CountingProducer::new(vec![
            Event::Fragment {
                lsn: 1,
                changes: vec![insert(Relation::public("users"), 0)],
                is_final: true,
            },
            Event::Fragment {
                lsn: 2,
                changes: vec![insert(Relation::public("users"), 0)],
                is_final: true,
            },
        ]));
        let dispatcher = Dispatcher::spawn(filter, partitions, producer.clone());

        let (tx1, mut rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        dispatcher
            .subscribe(sub(1), Shape::without_predicate(Relation::public("users")), tx1)
            .await
            .unwrap();
        dispatcher
            .subscribe(sub(2), Shape::without_predicate(Relation::public("users")), tx2)
            .await
            .unwrap();

        let _ = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap();
        let _ = timeout(Duration::from_secs(1), rx2.recv()).await.unwrap();

        // Subscriber 2 never acks; canceling it must still close the
        // demand loop, now that subscriber 1 is the only one left pending.
        dispatcher.cancel(sub(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx1.try_recv().is_err());

        dispatcher.ask(sub(1));
        let next = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        assert_eq!(next.lsn(), 2);
    }
}
