// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! `AmqpError` covers every transport and topology failure raised by the core.
//! `ProcessingFailure` is not a core error: it is the outcome a business callback
//! reports when it could not handle a message, and it drives the retry state machine.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating or closing a channel
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The broker refused a declaration because an existing exchange or queue
    /// carries different parameters. Never succeeds without manual intervention.
    #[error("topology conflict for `{0}`")]
    TopologyConflictError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a payload before publishing
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Failure reported by a business callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct ProcessingFailure {
    reason: String,
}

impl ProcessingFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        ProcessingFailure {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<String> for ProcessingFailure {
    fn from(reason: String) -> Self {
        ProcessingFailure::new(reason)
    }
}

impl From<&str> for ProcessingFailure {
    fn from(reason: &str) -> Self {
        ProcessingFailure::new(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_failure_displays_reason() {
        let failure = ProcessingFailure::from("db timeout");
        assert_eq!(failure.to_string(), "db timeout");
        assert_eq!(failure.reason(), "db timeout");
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("orders".into(), "q1".into());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `orders` to queue `q1`"
        );
    }
}
