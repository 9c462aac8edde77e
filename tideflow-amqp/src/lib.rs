#![forbid(unsafe_code)]

//! RabbitMQ adapter for the `tideflow` broker ports (companion crate).
//!
//! Bring your own `lapin::Connection`; this crate maps the core's
//! [`QueuePublisher`] / [`QueueSubscriber`] ports onto channels, with a
//! dedicated channel per subscription and per bounded drain. Queues are
//! declared durable and idempotently before use; confirmed publishes open
//! the channel in confirm mode and wait for the broker's verdict within
//! the caller's deadline.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation as AmqpConfirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection};
use std::sync::Arc;
use std::time::Duration;
use tideflow::{
    Acknowledger, Confirmation, Delivery, Error, HeaderValue, Headers, QueuePublisher,
    QueueSubscriber,
};
use tokio::sync::mpsc;

const CONSUMER_TAG: &str = "tideflow-consumer";
const PERSISTENT: u8 = 2;

/// Broker adapter over an established AMQP connection.
#[derive(Clone)]
pub struct AmqpBroker {
    connection: Arc<Connection>,
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AmqpBroker")
    }
}

impl AmqpBroker {
    pub fn new(connection: Connection) -> Self {
        Self { connection: Arc::new(connection) }
    }

    async fn channel(&self) -> Result<Channel, Error> {
        self.connection.create_channel().await.map_err(broker_err)
    }

    async fn declare(&self, channel: &Channel, queue: &str) -> Result<(), Error> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() },
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        Ok(())
    }
}

fn broker_err(err: lapin::Error) -> Error {
    Error::Broker(err.to_string())
}

fn properties(headers: &Headers) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_headers(to_field_table(headers))
}

pub(crate) fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers.iter() {
        let amqp = match value {
            HeaderValue::Text(text) => AMQPValue::LongString(text.as_str().into()),
            HeaderValue::Int32(v) => AMQPValue::LongInt(*v),
            HeaderValue::Int64(v) => AMQPValue::LongLongInt(*v),
        };
        table.insert(ShortString::from(name), amqp);
    }
    table
}

pub(crate) fn from_field_table(table: &FieldTable) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in table.inner() {
        // Integer widths vary by producing client; both land on the
        // normalizing accessor in the core.
        let converted = match value {
            AMQPValue::LongString(text) => Some(HeaderValue::Text(text.to_string())),
            AMQPValue::ShortString(text) => Some(HeaderValue::Text(text.to_string())),
            AMQPValue::LongInt(v) => Some(HeaderValue::Int32(*v)),
            AMQPValue::LongLongInt(v) => Some(HeaderValue::Int64(*v)),
            AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int64(i64::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValue::Int64(i64::from(*v))),
            AMQPValue::LongUInt(v) => Some(HeaderValue::Int64(i64::from(*v))),
            AMQPValue::Timestamp(v) => Some(HeaderValue::Int64(*v as i64)),
            _ => None,
        };
        if let Some(converted) = converted {
            headers.insert(name.as_str(), converted);
        }
    }
    headers
}

struct AmqpAcker {
    delivery: AmqpDelivery,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), Error> {
        self.delivery.acker.ack(BasicAckOptions::default()).await.map_err(broker_err)
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), Error> {
        self.delivery
            .acker
            .nack(BasicNackOptions { requeue, ..BasicNackOptions::default() })
            .await
            .map_err(broker_err)
    }
}

fn to_delivery(queue: &str, amqp: AmqpDelivery) -> Delivery {
    let headers = amqp
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();
    let body = amqp.data.clone();
    Delivery::new(queue, body, headers, Box::new(AmqpAcker { delivery: amqp }))
}

#[async_trait]
impl QueuePublisher for AmqpBroker {
    async fn publish(&self, queue: &str, body: &[u8], headers: &Headers) -> Result<(), Error> {
        let channel = self.channel().await?;
        self.declare(&channel, queue).await?;
        channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties(headers))
            .await
            .map_err(broker_err)?
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        queue: &str,
        body: &[u8],
        headers: &Headers,
        timeout: Duration,
    ) -> Result<Confirmation, Error> {
        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_err)?;
        self.declare(&channel, queue).await?;

        let confirm = channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties(headers))
            .await
            .map_err(broker_err)?;

        match tokio::time::timeout(timeout, confirm).await {
            Ok(Ok(AmqpConfirmation::Ack(_))) | Ok(Ok(AmqpConfirmation::NotRequested)) => {
                Ok(Confirmation::Acked)
            }
            Ok(Ok(AmqpConfirmation::Nack(_))) => Ok(Confirmation::Nacked),
            Ok(Err(err)) => Err(broker_err(err)),
            Err(_) => Ok(Confirmation::TimedOut),
        }
    }
}

#[async_trait]
impl QueueSubscriber for AmqpBroker {
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, Error> {
        let channel = self.channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(broker_err)?;
        self.declare(&channel, queue).await?;

        let mut consumer = channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;

        let (tx, rx) = mpsc::channel(prefetch.max(1) as usize);
        let queue = queue.to_string();
        tokio::spawn(async move {
            // The channel closes with this task when the receiver drops.
            let _channel = channel;
            while let Some(received) = consumer.next().await {
                match received {
                    Ok(amqp) => {
                        if tx.send(to_delivery(&queue, amqp)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%queue, %err, "amqp consume stream error");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn pull(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, Error> {
        let channel = self.channel().await?;
        self.declare(&channel, queue).await?;

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            match channel
                .basic_get(queue, BasicGetOptions::default())
                .await
                .map_err(broker_err)?
            {
                Some(message) => deliveries.push(to_delivery(queue, message.delivery)),
                None => break,
            }
        }
        Ok(deliveries)
    }
}
