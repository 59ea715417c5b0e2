//! In-process broker with AMQP-like queues, a default direct exchange and
//! exact-match topic bindings.
//!
//! Used by the standalone role and by tests, which can also sever every open
//! connection or refuse dials to exercise the router's reconnect path.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use super::{Acker, BrokerError, Channel, Connector, Delivery, DeliveryStream};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<String, Queue>,
    bindings: HashMap<(String, String), BTreeSet<String>>,
    connections: Vec<Arc<watch::Sender<bool>>>,
    refused_dials: usize,
    dials: usize,
    acked: usize,
    prefetch: Option<u16>,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<Vec<u8>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { broker: self.clone() }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close every open connection, as a broker restart would
    pub fn sever(&self) {
        let connections = std::mem::take(&mut self.state().connections);
        for closed in connections {
            let _ = closed.send(true);
        }
    }

    /// Make the next `count` dials fail
    pub fn refuse_dials(&self, count: usize) {
        self.state().refused_dials = count;
    }

    pub fn dials(&self) -> usize {
        self.state().dials
    }

    pub fn acked(&self) -> usize {
        self.state().acked
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state().prefetch
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state().queues.keys().cloned().collect()
    }

    pub fn bound_queues(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        self.state()
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.messages.len()).unwrap_or(0)
    }

    /// Remove and return every message waiting in `queue`
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get_mut(queue)
            .map(|q| q.messages.drain(..).collect())
            .unwrap_or_default()
    }

    fn route(&self, exchange: &str, routing_key: &str, body: &[u8]) {
        let mut state = self.state();
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            state
                .bindings
                .get(&(exchange.to_string(), routing_key.to_string()))
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default()
        };
        // unroutable messages are dropped, as with an unbound AMQP exchange
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.messages.push_back(body.to_vec());
                queue.notify.notify_waiters();
            }
        }
    }

    fn notifier(&self, queue: &str) -> Option<Arc<Notify>> {
        self.state().queues.get(queue).map(|q| q.notify.clone())
    }

    fn pop(&self, queue: &str) -> Option<Vec<u8>> {
        self.state().queues.get_mut(queue).and_then(|q| q.messages.pop_front())
    }
}

pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Channel>, BrokerError> {
        let mut state = self.broker.state();
        if state.refused_dials > 0 {
            state.refused_dials -= 1;
            return Err(BrokerError::Connect("connection refused".into()));
        }
        state.dials += 1;
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        state.connections.push(closed_tx.clone());
        drop(state);

        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            closed_tx,
            closed_rx,
            consumers: Mutex::new(HashMap::new()),
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
    consumers: Mutex<HashMap<String, CancellationToken>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() { Err(BrokerError::Closed) } else { Ok(()) }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.state().acked += 1;
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.state().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .state()
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.state().prefetch = Some(count);
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.route(exchange, routing_key, body);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        if self.broker.notifier(queue).is_none() {
            return Err(BrokerError::op("consume", format!("queue `{queue}` does not exist")));
        }
        let token = CancellationToken::new();
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(consumer_tag.to_string(), token.clone());

        let seed = (self.broker.clone(), queue.to_string(), token, self.closed_rx.clone());
        let stream = futures::stream::unfold(seed, |(broker, queue, token, mut closed)| async move {
            loop {
                let notify = broker.notifier(&queue)?;
                let notified = notify.notified();
                if token.is_cancelled() || *closed.borrow() {
                    return None;
                }
                if let Some(body) = broker.pop(&queue) {
                    let acker = Box::new(MemoryAcker { broker: broker.clone() });
                    return Some((Ok(Delivery::new(body, acker)), (broker, queue, token, closed)));
                }
                tokio::select! {
                    _ = notified => {}
                    _ = token.cancelled() => {}
                    _ = closed.changed() => {}
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let token = self.consumers.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(consumer_tag);
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut closed = self.closed_rx.clone();
        Box::pin(async move {
            let _ = closed.wait_for(|closed| *closed).await;
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let _ = self.closed_tx.send(true);
        Ok(())
    }
}
