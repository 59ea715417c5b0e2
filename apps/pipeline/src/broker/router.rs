use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BrokerError, Channel, Connector, Delivery, DeliveryStream, QueueSet, Topology};
use crate::monitoring::types::RegionTarget;

/// One connection/channel pair plus the queues it redeclares on every dial
struct Link {
    name: &'static str,
    queues: QueueSet,
    prefetch: Option<u16>,
    channel: tokio::sync::Mutex<Box<dyn Channel>>,
}

impl Link {
    async fn dial(
        name: &'static str,
        queues: &QueueSet,
        prefetch: Option<u16>,
        connector: &dyn Connector,
        topology: &Topology,
    ) -> Result<Box<dyn Channel>, BrokerError> {
        let channel = connector.connect().await?;
        if let Some(count) = prefetch {
            channel.set_prefetch(count).await?;
        }
        topology.declare(channel.as_ref(), queues).await?;
        debug!(link = name, "Broker link ready");
        Ok(channel)
    }

    /// Replace the channel behind `guard` unless someone else already did
    async fn redial(
        &self,
        guard: &mut Box<dyn Channel>,
        connector: &dyn Connector,
        topology: &Topology,
    ) -> Result<(), BrokerError> {
        if !guard.is_closed() {
            return Ok(());
        }
        let channel = Self::dial(self.name, &self.queues, self.prefetch, connector, topology)
            .await
            .map_err(|e| BrokerError::Reconnect { link: self.name, reason: e.to_string() })?;
        *guard = channel;
        info!(link = self.name, "Reconnected to broker");
        Ok(())
    }
}

struct ConsumerTask {
    token: CancellationToken,
    handle: JoinHandle<Result<(), BrokerError>>,
}

/// Publishes jobs/outcomes and feeds consumer deliveries into bounded channels.
///
/// Publisher and consumer use separate connections. A publish that fails on a
/// closed connection is retried exactly once after redialing. A consumer whose
/// connection drops is resubscribed by its forwarding task. Failing to recover
/// in either path cancels `shutdown`.
pub struct MessageRouter {
    connector: Arc<dyn Connector>,
    topology: Arc<Topology>,
    backoff: Duration,
    shutdown: CancellationToken,
    publisher: OnceLock<Arc<Link>>,
    consumer: OnceLock<Arc<Link>>,
    consumers: Mutex<HashMap<String, ConsumerTask>>,
}

impl MessageRouter {
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: Arc<Topology>,
        backoff: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            topology,
            backoff,
            shutdown,
            publisher: OnceLock::new(),
            consumer: OnceLock::new(),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Open the publishing link and declare `queues` on it
    pub async fn init_publisher(&self, queues: QueueSet) -> Result<(), BrokerError> {
        self.init_link(&self.publisher, "publisher", queues, None).await
    }

    /// Open the consuming link.
    ///
    /// A worker passes its own region and only that job queue is declared;
    /// without a region the outcome queue is declared instead.
    pub async fn init_consumer(&self, target: Option<RegionTarget>) -> Result<(), BrokerError> {
        let queues = match target {
            Some(target) => QueueSet::Requests(target),
            None => QueueSet::Responses,
        };
        let prefetch = Some(self.topology.prefetch_count);
        self.init_link(&self.consumer, "consumer", queues, prefetch).await
    }

    async fn init_link(
        &self,
        slot: &OnceLock<Arc<Link>>,
        name: &'static str,
        queues: QueueSet,
        prefetch: Option<u16>,
    ) -> Result<(), BrokerError> {
        if slot.get().is_some() {
            return Err(BrokerError::AlreadyInitialised(name));
        }
        let channel = Link::dial(name, &queues, prefetch, self.connector.as_ref(), &self.topology).await?;
        let link = Arc::new(Link { name, queues, prefetch, channel: tokio::sync::Mutex::new(channel) });
        slot.set(link).map_err(|_| BrokerError::AlreadyInitialised(name))
    }

    /// Publish through the default exchange straight to `queue`
    pub async fn publish_direct(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.publish("", queue, body).await
    }

    /// Publish to the shared topic exchange with a `region.subregion` key
    pub async fn publish_topic(&self, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        let exchange = self.topology.exchange.clone();
        self.publish(&exchange, routing_key, body).await
    }

    async fn publish(&self, exchange: &str, key: &str, body: &[u8]) -> Result<(), BrokerError> {
        let link = self.publisher.get().ok_or(BrokerError::NotInitialised("publisher"))?;
        let mut channel = link.channel.lock().await;

        let first = match channel.publish(exchange, key, body).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if !channel.is_closed() {
            return Err(first);
        }

        warn!(routing_key = %key, error = %first, "Publish failed on a closed connection, reconnecting");
        tokio::time::sleep(self.backoff).await;
        link.redial(&mut channel, self.connector.as_ref(), &self.topology).await?;
        channel
            .publish(exchange, key, body)
            .await
            .map_err(|e| BrokerError::PublishRetry { key: key.to_string(), reason: e.to_string() })?;
        info!(routing_key = %key, "Publish succeeded after reconnecting");
        Ok(())
    }

    /// Start forwarding deliveries from `queue` into `sink`.
    ///
    /// Empty bodies are dropped. Forwarding stops when the tag is cancelled,
    /// the router is closed, `shutdown` fires or the receiving half is dropped.
    pub async fn start_consuming(
        &self,
        consumer_tag: &str,
        queue: &str,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<(), BrokerError> {
        let link = self.consumer.get().ok_or(BrokerError::NotInitialised("consumer"))?.clone();
        let (stream, closed) = {
            let channel = link.channel.lock().await;
            (channel.consume(queue, consumer_tag).await?, channel.closed())
        };

        let token = self.shutdown.child_token();
        let forwarder = Forwarder {
            link,
            connector: self.connector.clone(),
            topology: self.topology.clone(),
            backoff: self.backoff,
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            sink,
            token: token.clone(),
        };
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = forwarder.run(stream, closed).await;
            if let Err(e) = &result {
                error!(error = %e, "Consumer could not recover, shutting down");
                shutdown.cancel();
            }
            result
        });

        let previous = self
            .consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(consumer_tag.to_string(), ConsumerTask { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        info!(consumer = consumer_tag, queue = queue, "Started consuming");
        Ok(())
    }

    /// Stop a consumer and wait for its forwarding task
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let task = self.consumers.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(consumer_tag);
        let Some(task) = task else {
            return Ok(());
        };
        task.token.cancel();
        if let Some(link) = self.consumer.get() {
            let channel = link.channel.lock().await;
            if !channel.is_closed() {
                if let Err(e) = channel.cancel(consumer_tag).await {
                    warn!(consumer = consumer_tag, error = %e, "Failed to cancel consumer on the broker");
                }
            }
        }
        join(task.handle).await
    }

    /// Cancel every consumer and close both links.
    ///
    /// Returns the first error a consumer task ended with.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let tags: Vec<String> = self
            .consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();

        let mut first_error = None;
        for tag in tags {
            if let Err(e) = self.cancel(&tag).await {
                first_error.get_or_insert(e);
            }
        }
        for link in [self.publisher.get(), self.consumer.get()].into_iter().flatten() {
            if let Err(e) = link.channel.lock().await.close().await {
                debug!(link = link.name, error = %e, "Error while closing link");
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn join(handle: JoinHandle<Result<(), BrokerError>>) -> Result<(), BrokerError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(BrokerError::op("consumer task", e)),
    }
}

struct Forwarder {
    link: Arc<Link>,
    connector: Arc<dyn Connector>,
    topology: Arc<Topology>,
    backoff: Duration,
    tag: String,
    queue: String,
    sink: mpsc::Sender<Delivery>,
    token: CancellationToken,
}

impl Forwarder {
    async fn run(&self, mut stream: DeliveryStream, mut closed: BoxFuture<'static, ()>) -> Result<(), BrokerError> {
        loop {
            let lost = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                _ = &mut closed => true,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        if delivery.body.is_empty() {
                            debug!(consumer = %self.tag, "Skipping empty delivery");
                            continue;
                        }
                        tokio::select! {
                            _ = self.token.cancelled() => return Ok(()),
                            sent = self.sink.send(delivery) => {
                                if sent.is_err() {
                                    debug!(consumer = %self.tag, "Delivery receiver dropped, stopping");
                                    return Ok(());
                                }
                            }
                        }
                        false
                    }
                    Some(Err(e)) => {
                        warn!(consumer = %self.tag, error = %e, "Consumer stream error");
                        true
                    }
                    None => true,
                },
            };

            if lost {
                if self.token.is_cancelled() {
                    return Ok(());
                }
                (stream, closed) = self.resubscribe().await?;
            }
        }
    }

    async fn resubscribe(&self) -> Result<(DeliveryStream, BoxFuture<'static, ()>), BrokerError> {
        warn!(consumer = %self.tag, "Consumer connection lost, reconnecting");
        tokio::select! {
            _ = self.token.cancelled() => return Err(BrokerError::Closed),
            _ = tokio::time::sleep(self.backoff) => {}
        }

        let mut channel = self.link.channel.lock().await;
        if !channel.is_closed() {
            // the old stream may have ended while the connection stayed up
            channel.close().await.ok();
        }
        self.link.redial(&mut channel, self.connector.as_ref(), &self.topology).await?;
        let stream = channel
            .consume(&self.queue, &self.tag)
            .await
            .map_err(|e| BrokerError::Reconnect { link: self.link.name, reason: e.to_string() })?;
        info!(consumer = %self.tag, queue = %self.queue, "Resumed consuming");
        Ok((stream, channel.closed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn topology() -> Arc<Topology> {
        Arc::new(Topology {
            exchange: "amq.topic".into(),
            request_queue_base: "requests".into(),
            response_queue: "responses".into(),
            prefetch_count: 5,
            targets: vec![RegionTarget::new("eu", "a"), RegionTarget::new("us", "x")],
        })
    }

    fn router(broker: &MemoryBroker) -> MessageRouter {
        MessageRouter::new(
            Arc::new(broker.connector()),
            topology(),
            Duration::from_millis(10),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_publish_requires_initialised_link() {
        let broker = MemoryBroker::default();
        let router = router(&broker);
        assert!(matches!(
            router.publish_direct("responses", b"x").await,
            Err(BrokerError::NotInitialised("publisher"))
        ));
        router.init_publisher(QueueSet::Responses).await.unwrap();
        assert!(matches!(
            router.init_publisher(QueueSet::Responses).await,
            Err(BrokerError::AlreadyInitialised("publisher"))
        ));
    }

    #[tokio::test]
    async fn test_topic_publish_reaches_region_queue() {
        let broker = MemoryBroker::default();
        let router = router(&broker);
        router.init_publisher(QueueSet::AllRequests).await.unwrap();
        router.publish_topic("us.x", b"job").await.unwrap();
        assert_eq!(broker.queue_len("requests.us.x"), 1);
        assert_eq!(broker.queue_len("requests.eu.a"), 0);
    }

    #[tokio::test]
    async fn test_publish_recovers_once_after_connection_loss() {
        let broker = MemoryBroker::default();
        let router = router(&broker);
        router.init_publisher(QueueSet::Responses).await.unwrap();

        broker.sever();
        router.publish_direct("responses", b"after-loss").await.unwrap();
        assert_eq!(broker.drain("responses"), vec![b"after-loss".to_vec()]);
        assert_eq!(broker.dials(), 2);
    }

    #[tokio::test]
    async fn test_publish_fails_when_redial_is_refused() {
        let broker = MemoryBroker::default();
        let router = router(&broker);
        router.init_publisher(QueueSet::Responses).await.unwrap();

        broker.sever();
        broker.refuse_dials(1);
        let result = router.publish_direct("responses", b"lost").await;
        assert!(matches!(result, Err(BrokerError::Reconnect { link: "publisher", .. })));
    }

    #[tokio::test]
    async fn test_consumer_survives_connection_loss() {
        let broker = MemoryBroker::default();
        let router = router(&broker);
        router.init_publisher(QueueSet::Responses).await.unwrap();
        router.init_consumer(None).await.unwrap();
        assert_eq!(broker.prefetch(), Some(5));

        let (tx, mut rx) = mpsc::channel(4);
        router.start_consuming("collector", "responses", tx).await.unwrap();

        router.publish_direct("responses", b"").await.unwrap();
        router.publish_direct("responses", b"first").await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.body, b"first");

        broker.sever();
        tokio::time::sleep(Duration::from_millis(50)).await;
        router.publish_direct("responses", b"second").await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.body, b"second");

        router.close().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_consumer_reconnect_failure_cancels_shutdown_token() {
        let broker = MemoryBroker::default();
        let shutdown = CancellationToken::new();
        let router = MessageRouter::new(
            Arc::new(broker.connector()),
            topology(),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        router.init_consumer(Some(RegionTarget::new("eu", "a"))).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        router.start_consuming("worker", "requests.eu.a", tx).await.unwrap();

        broker.refuse_dials(1);
        broker.sever();
        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled()).await.unwrap();
        assert!(router.close().await.is_err());
    }
}
