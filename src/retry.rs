// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Retry
//!
//! A failed message is republished to a parallel retry queue that nobody consumes.
//! The retry queue carries a message TTL and dead-letter arguments pointing back at
//! the original queue, so the broker itself returns the message after the delay.
//! The attempt count travels in the `retry_nums` header; no retry state is kept
//! in process.

use crate::{
    broker::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeKind,
    otel,
    queue::QueueExchange,
    topology::{dead_letter_args, AmqpTopology},
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::Context;
use tracing::warn;

/// Header carrying the number of times a message has been republished for retry
pub const RETRY_NUMS_HEADER: &str = "retry_nums";
/// Number of retries before a message is handed to the terminal-failure callback
pub const MAX_RETRIES: i32 = 3;
/// Delay, in milliseconds, a message spends in the retry queue
pub const RETRY_TTL_MILLIS: i64 = 20000;
/// Suffix appended to the queue name (and routing key) of the retry queue
pub const RETRY_SUFFIX: &str = "_retry_3";

/// Reads `retry_nums` from message headers. Absent or non-integer values count as 0.
pub fn retry_nums(headers: &FieldTable) -> i32 {
    let Some(value) = headers.inner().get(RETRY_NUMS_HEADER) else {
        return 0;
    };

    let count = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => 0,
    };

    i32::try_from(count.max(0)).unwrap_or(i32::MAX)
}

/// Returns a copy of `headers` with `retry_nums` set to `count`.
pub fn with_retry_nums(headers: &FieldTable, count: i32) -> FieldTable {
    let mut headers = headers.clone();
    headers.insert(
        ShortString::from(RETRY_NUMS_HEADER),
        AMQPValue::LongInt(count),
    );
    headers
}

/// Retry topology derived from an original descriptor.
///
/// A pure function of the descriptor: deriving never touches the original, and
/// declaring the result again is a no-op on the broker. The dead-letter pair is the
/// same `(exchange, routing_key)` the publisher resolves for the original queue, so
/// an expired retry lands where a fresh publish would. Fanout and headers exchanges
/// ignore the key and would copy the message to every bound queue, so those retries
/// dead-letter straight to the original queue through the default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryQueueSpec {
    pub queue_name: String,
    pub routing_key: String,
    pub dead_letter_exchange: String,
    pub dead_letter_routing_key: String,
    pub ttl_millis: i64,
}

impl RetryQueueSpec {
    /// Derives the retry topology of `def`.
    ///
    /// # Parameters
    /// * `def` - The descriptor of the queue whose messages are retried
    ///
    /// # Returns
    /// The retry queue name, its binding key and the dead-letter target pointing
    /// back at `def`
    pub fn derive(def: &QueueExchange) -> RetryQueueSpec {
        let queue_name = format!("{}{}", def.queue_name(), RETRY_SUFFIX);

        // the routing key only counts when the original is bound to an exchange
        let routing_key = match def.binding() {
            Some(binding) => format!("{}{}", binding.routing_key, RETRY_SUFFIX),
            None => queue_name.clone(),
        };

        let (dead_letter_exchange, dead_letter_routing_key) =
            if routes_by_key(def.exchange_kind()) {
                def.publish_target()
            } else {
                ("", def.queue_name())
            };

        RetryQueueSpec {
            queue_name,
            routing_key,
            dead_letter_exchange: dead_letter_exchange.to_owned(),
            dead_letter_routing_key: dead_letter_routing_key.to_owned(),
            ttl_millis: RETRY_TTL_MILLIS,
        }
    }

    /// Descriptor of the retry queue itself.
    ///
    /// The retry queue is bound to the original exchange only when that exchange
    /// routes by key. A fanout or headers exchange would copy every fresh publish
    /// into the retry queue, so the retry queue stays unbound there.
    pub fn descriptor(&self, original: &QueueExchange) -> QueueExchange {
        let retry_def = QueueExchange::new(&self.queue_name).with_address(original.address());

        if original.binding().is_none() || !routes_by_key(original.exchange_kind()) {
            return retry_def;
        }

        retry_def
            .with_exchange(original.exchange_name())
            .with_kind(original.exchange_kind().clone())
            .with_routing_key(&self.routing_key)
    }

    /// Dead-letter and TTL arguments of the retry queue.
    pub fn queue_args(&self) -> FieldTable {
        dead_letter_args(
            &self.dead_letter_exchange,
            &self.dead_letter_routing_key,
            self.ttl_millis,
        )
    }
}

fn routes_by_key(kind: &ExchangeKind) -> bool {
    !matches!(kind, ExchangeKind::Fanout | ExchangeKind::Headers)
}

/// Republishes failed messages to their retry queue.
pub struct RetryCoordinator<'r, C: AmqpChannel + ?Sized> {
    channel: &'r C,
}

impl<'r, C: AmqpChannel + ?Sized> RetryCoordinator<'r, C> {
    /// Creates a coordinator publishing on `channel`.
    ///
    /// # Parameters
    /// * `channel` - The channel used to declare the retry queue and republish
    pub fn new(channel: &'r C) -> RetryCoordinator<'r, C> {
        RetryCoordinator { channel }
    }

    /// Declares the retry queue for `def` and publishes `body` to it with
    /// `retry_nums` incremented.
    ///
    /// The message is addressed to the retry queue through the default exchange, so
    /// it never reaches the original queue before the TTL expires, whatever the
    /// kind of the original exchange.
    ///
    /// # Returns
    /// The new `retry_nums` on success or AmqpError on failure
    pub async fn retry(
        &self,
        ctx: &Context,
        def: &QueueExchange,
        body: &[u8],
        headers: &FieldTable,
    ) -> Result<i32, AmqpError> {
        let attempt = retry_nums(headers).saturating_add(1);
        let spec = RetryQueueSpec::derive(def);
        let retry_def = spec.descriptor(def);

        if def.binding().is_some() && !routes_by_key(def.exchange_kind()) {
            warn!(
                queue = def.queue_name(),
                exchange = def.exchange_name(),
                kind = %def.exchange_kind(),
                "exchange does not route by key, retry queue left unbound"
            );
        }

        AmqpTopology::new(self.channel, &retry_def)
            .queue_args(spec.queue_args())
            .install()
            .await?;

        warn!(
            queue = def.queue_name(),
            retry_queue = spec.queue_name.as_str(),
            attempt,
            delay_ms = spec.ttl_millis,
            "scheduling message retry"
        );

        self.channel
            .publish(
                "",
                &spec.queue_name,
                body,
                otel::inject(ctx, with_retry_nums(headers, attempt)),
            )
            .await?;

        Ok(attempt)
    }
}
