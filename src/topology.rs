// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Declaration
//!
//! Ensures the exchange, queue and binding described by a `QueueExchange` exist before
//! anything is published or consumed. The declaration runs on every send and every
//! worker start, so it must be a no-op when the broker already holds the same topology:
//! arguments are kept in an ordered table and stay identical for a given descriptor.

use crate::{broker::AmqpChannel, errors::AmqpError, queue::QueueExchange};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use tracing::debug;

/// Queue argument naming the exchange expired or rejected messages are sent to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument for the per-message time-to-live, in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Builds the queue arguments of a dead-lettering queue.
pub fn dead_letter_args(exchange: &str, routing_key: &str, ttl_millis: i64) -> FieldTable {
    let mut args = FieldTable::default();

    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(exchange)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(routing_key)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        AMQPValue::LongLongInt(LongLongInt::from(ttl_millis)),
    );

    args
}

/// Declares the topology of one descriptor on a channel.
pub struct AmqpTopology<'tp, C: AmqpChannel + ?Sized> {
    channel: &'tp C,
    def: &'tp QueueExchange,
    queue_args: FieldTable,
}

impl<'tp, C: AmqpChannel + ?Sized> AmqpTopology<'tp, C> {
    pub fn new(channel: &'tp C, def: &'tp QueueExchange) -> AmqpTopology<'tp, C> {
        AmqpTopology {
            channel,
            def,
            queue_args: FieldTable::default(),
        }
    }

    /// Sets extra arguments for the queue declaration.
    pub fn queue_args(mut self, args: FieldTable) -> Self {
        self.queue_args = args;
        self
    }

    /// Declares the exchange (if named), the queue and the binding (if both an
    /// exchange and a routing key are set), in that order.
    pub async fn install(self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queue().await
    }

    async fn install_exchange(&self) -> Result<(), AmqpError> {
        if !self.def.has_exchange() {
            return Ok(());
        }

        debug!(
            exchange = self.def.exchange_name(),
            kind = %self.def.exchange_kind(),
            "declaring exchange"
        );

        self.channel
            .exchange_declare(self.def.exchange_name(), self.def.exchange_kind())
            .await
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        debug!(queue = self.def.queue_name(), "declaring queue");

        self.channel
            .queue_declare(self.def.queue_name(), self.queue_args.clone())
            .await
    }

    async fn binding_queue(&self) -> Result<(), AmqpError> {
        let Some(binding) = self.def.binding() else {
            return Ok(());
        };

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
            )
            .await
    }
}
