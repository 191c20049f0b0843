// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channel Operations
//!
//! The declarator, publisher and retry coordinator only need a handful of channel
//! operations. `AmqpChannel` names them, and is implemented for `lapin::Channel`.
//! Every exchange and queue is declared durable and never auto-deleted.
//! `Acknowledge` is the matching seam over a received delivery.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use tracing::error;
use uuid::Uuid;

/// Content type of every published body; the core never looks inside it.
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares a durable exchange.
    async fn exchange_declare(&self, name: &str, kind: &ExchangeKind) -> Result<(), AmqpError>;

    /// Declares a durable queue with the given arguments.
    async fn queue_declare(&self, name: &str, args: FieldTable) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange.
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Publishes an opaque body without waiting for a broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries on this channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Acknowledges the delivery so the broker drops it.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery, asking the broker to requeue it or drop it.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Maps a failed declaration to a conflict when the broker answered
/// `PRECONDITION_FAILED`, i.e. the resource exists with other parameters.
fn declare_error(err: &lapin::Error, name: &str, fallback: AmqpError) -> AmqpError {
    if let lapin::Error::ProtocolError(amqp_err) = err {
        if let AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) = amqp_err.kind() {
            return AmqpError::TopologyConflictError(name.to_owned());
        }
    }

    fallback
}

#[async_trait]
impl AmqpChannel for Channel {
    async fn exchange_declare(&self, name: &str, kind: &ExchangeKind) -> Result<(), AmqpError> {
        match Channel::exchange_declare(
            self,
            name,
            kind.into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(declare_error(
                    &err,
                    name,
                    AmqpError::DeclareExchangeError(name.to_owned()),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(&self, name: &str, args: FieldTable) -> Result<(), AmqpError> {
        match Channel::queue_declare(
            self,
            name,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            args,
        )
        .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the queue"
                );
                Err(declare_error(
                    &err,
                    name,
                    AmqpError::DeclareQueueError(name.to_owned()),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match Channel::queue_bind(
            self,
            queue,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue,
                    exchange = exchange,
                    routing_key = routing_key,
                    "error to bind queue to exchange"
                );
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(OCTET_STREAM_CONTENT_TYPE))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(headers),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = exchange,
                    routing_key = routing_key,
                    "error publishing message"
                );
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        match self
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), prefetch, "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Acknowledge for Delivery {
    async fn ack(&self) -> Result<(), AmqpError> {
        match self.acker.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match self
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}
