// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes opaque bodies to the target resolved from a `QueueExchange`: the
//! exchange and routing key when both are set, otherwise the default exchange
//! addressed by queue name. The topology is declared before every publish.
//! Publishing is fire-and-forget; a failure is logged and returned, never retried.

use crate::{
    broker::AmqpChannel,
    channel::{close_channel, ConnectionHandle},
    errors::AmqpError,
    otel,
    queue::QueueExchange,
    topology::AmqpTopology,
};
use lapin::types::FieldTable;
use opentelemetry::Context;
use serde::Serialize;
use tracing::{debug, error};

/// Publishes messages on a borrowed channel.
pub struct Publisher<'p, C: AmqpChannel + ?Sized> {
    channel: &'p C,
}

impl<'p, C: AmqpChannel + ?Sized> Publisher<'p, C> {
    /// Creates a publisher on `channel`.
    ///
    /// # Parameters
    /// * `channel` - The channel used to declare topology and publish
    pub fn new(channel: &'p C) -> Publisher<'p, C> {
        Publisher { channel }
    }

    /// Declares the descriptor's topology, then publishes `body` with `headers`
    /// and the trace context of `ctx`.
    pub async fn publish(
        &self,
        ctx: &Context,
        def: &QueueExchange,
        body: &[u8],
        headers: FieldTable,
    ) -> Result<(), AmqpError> {
        AmqpTopology::new(self.channel, def).install().await?;

        let (exchange, routing_key) = def.publish_target();
        debug!(
            queue = def.queue_name(),
            exchange, routing_key, "publishing message"
        );

        self.channel
            .publish(exchange, routing_key, body, otel::inject(ctx, headers))
            .await
    }
}

/// Sends one message: opens a connection and a channel to the descriptor's broker,
/// publishes `body`, then closes both before returning.
///
/// The connection announces [`QueueExchange::connection_name`] to the broker.
pub async fn send(def: &QueueExchange, body: &[u8]) -> Result<(), AmqpError> {
    let conn = ConnectionHandle::connect(def.address(), def.connection_name()).await?;

    let result = match conn.open_channel().await {
        Ok(channel) => {
            let published = Publisher::new(&channel)
                .publish(&Context::current(), def, body, FieldTable::default())
                .await;
            let closed = close_channel(channel).await;
            published.and(closed)
        }
        Err(err) => Err(err),
    };

    if let Err(err) = &result {
        error!(
            error = err.to_string(),
            queue = def.queue_name(),
            routing_key = def.routing_key(),
            "failure to send message"
        );
    }

    let closed = conn.close().await;
    result.and(closed)
}

/// Serializes `payload` as JSON and sends it like [`send`].
pub async fn send_json<T: Serialize + ?Sized>(
    def: &QueueExchange,
    payload: &T,
) -> Result<(), AmqpError> {
    let body = serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::SerializePayloadError
    })?;

    send(def, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockAmqpChannel;
    use lapin::types::{AMQPValue, ShortString};
    use mockall::predicate::eq;

    #[tokio::test]
    async fn publishes_to_queue_through_default_exchange() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_exchange_declare().never();
        channel
            .expect_queue_declare()
            .with(eq("q1"), eq(FieldTable::default()))
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, key, body, _| exchange.is_empty() && key == "q1" && body == b"job-1")
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let def = QueueExchange::new("q1");

        Publisher::new(&channel)
            .publish(&Context::new(), &def, b"job-1", FieldTable::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publishes_to_exchange_with_routing_key_and_headers() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_exchange_declare().times(1).returning(|_, _| Ok(()));
        channel.expect_queue_declare().times(1).returning(|_, _| Ok(()));
        channel.expect_queue_bind().times(1).returning(|_, _, _| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, key, _, headers| {
                exchange == "orders"
                    && key == "orders.created"
                    && headers.inner().get("tenant")
                        == Some(&AMQPValue::LongInt(7))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let def = QueueExchange::new("q1")
            .with_exchange("orders")
            .with_routing_key("orders.created");
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from("tenant"), AMQPValue::LongInt(7));

        Publisher::new(&channel)
            .publish(&Context::new(), &def, b"{}", headers)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn declaration_failure_skips_publish() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_queue_declare()
            .returning(|name, _| Err(AmqpError::DeclareQueueError(name.to_owned())));
        channel.expect_publish().never();

        let def = QueueExchange::new("q1");

        let err = Publisher::new(&channel)
            .publish(&Context::new(), &def, b"job-1", FieldTable::default())
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::DeclareQueueError("q1".to_owned()));
    }

    #[tokio::test]
    async fn publish_failure_is_returned() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_queue_declare().returning(|_, _| Ok(()));
        channel
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));

        let def = QueueExchange::new("q1");

        let err = Publisher::new(&channel)
            .publish(&Context::new(), &def, b"job-1", FieldTable::default())
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::PublishingError);
    }
}
