use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::warn;

use super::{Acker, BrokerError, Channel, Connector, Delivery, DeliveryStream};

const PERSISTENT: u8 = 2;

/// Dials a RabbitMQ broker over AMQP 0-9-1
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn Channel>, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let (lost_tx, lost_rx) = watch::channel(false);
        connection.on_error(move |error| {
            warn!(error = %error, "AMQP connection error");
            let _ = lost_tx.send(true);
        });

        let channel = connection.create_channel().await.map_err(|e| BrokerError::op("create_channel", e))?;
        Ok(Box::new(AmqpChannel { connection: Arc::new(connection), channel, lost: lost_rx }))
    }
}

struct AmqpChannel {
    connection: Arc<Connection>,
    channel: lapin::Channel,
    lost: watch::Receiver<bool>,
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await.map_err(|e| BrokerError::op("basic_ack", e))
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions { durable: true, ..Default::default() };
        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::op("queue_declare", e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BrokerError::op("queue_bind", e))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::op("basic_qos", e))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
        self.channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| BrokerError::op("basic_publish", e))?
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::op("basic_publish", e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BrokerError::op("basic_consume", e))?;

        let stream = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(Delivery::new(delivery.data, Box::new(AmqpAcker(delivery.acker)))),
            Err(e) => Err(BrokerError::op("consume", e)),
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::op("basic_cancel", e))
    }

    fn is_closed(&self) -> bool {
        *self.lost.borrow() || !self.connection.status().connected()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut lost = self.lost.clone();
        Box::pin(async move {
            let _ = lost.wait_for(|lost| *lost).await;
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Ok(());
        }
        self.connection.close(200, "closing").await.map_err(|e| BrokerError::op("close", e))
    }
}
