// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Handles a single delivery: runs the business callback, then acknowledges on
//! success, schedules a delayed retry while `retry_nums` is below the ceiling, or
//! hands the message to the terminal-failure callback once retries are exhausted.
//! The original delivery is acknowledged in every case except a failed retry
//! republication, where it is requeued so it is not lost.

use crate::{
    broker::{Acknowledge, AmqpChannel},
    errors::{AmqpError, ProcessingFailure},
    otel,
    queue::QueueExchange,
    retry::{retry_nums, RetryCoordinator, MAX_RETRIES},
};
use futures_util::future::{BoxFuture, FutureExt};
use lapin::{message::Delivery, types::FieldTable};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, future::Future, sync::Arc};
use tracing::{debug, error, warn};

type ProcessFn = dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), ProcessingFailure>> + Send + Sync;
type ExhaustedFn = dyn Fn(ProcessingFailure, Vec<u8>) -> BoxFuture<'static, Result<(), ProcessingFailure>>
    + Send
    + Sync;

/// The two application callbacks driven by the consumer loop.
///
/// `process` handles a message body and should be idempotent: a worker crash can
/// redeliver a body without bumping its retry count. `on_exhausted` receives the
/// last failure and the body of a message that failed after all retries; its own
/// error is only logged.
#[derive(Clone)]
pub struct Handlers {
    process: Arc<ProcessFn>,
    on_exhausted: Arc<ExhaustedFn>,
}

impl Handlers {
    /// Boxes the two callbacks so they can be shared between workers.
    ///
    /// # Parameters
    /// * `process` - Handles a message body; an error schedules a retry
    /// * `on_exhausted` - Receives the last failure and the body once retries are
    ///   exhausted
    pub fn new<P, PF, E, EF>(process: P, on_exhausted: E) -> Handlers
    where
        P: Fn(Vec<u8>) -> PF + Send + Sync + 'static,
        PF: Future<Output = Result<(), ProcessingFailure>> + Send + 'static,
        E: Fn(ProcessingFailure, Vec<u8>) -> EF + Send + Sync + 'static,
        EF: Future<Output = Result<(), ProcessingFailure>> + Send + 'static,
    {
        Handlers {
            process: Arc::new(move |body: Vec<u8>| process(body).boxed()),
            on_exhausted: Arc::new(move |reason: ProcessingFailure, body: Vec<u8>| {
                on_exhausted(reason, body).boxed()
            }),
        }
    }
}

/// Body and headers of a received message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub headers: FieldTable,
}

impl Envelope {
    pub fn new(body: Vec<u8>, headers: FieldTable) -> Envelope {
        Envelope { body, headers }
    }

    pub fn retry_nums(&self) -> i32 {
        retry_nums(&self.headers)
    }
}

impl From<&Delivery> for Envelope {
    fn from(delivery: &Delivery) -> Self {
        Envelope {
            body: delivery.data.clone(),
            headers: delivery.properties.headers().clone().unwrap_or_default(),
        }
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed and acknowledged.
    Acked,
    /// Republished for a delayed retry with the given `retry_nums`, then acknowledged.
    Retried(i32),
    /// Handed to the terminal-failure callback, then acknowledged.
    Exhausted,
    /// The retry republication failed; the delivery was requeued.
    Requeued,
}

/// Processes one delivery and settles it on the broker.
pub(crate) async fn consume<C, A>(
    tracer: &BoxedTracer,
    channel: &C,
    def: &QueueExchange,
    handlers: &Handlers,
    envelope: Envelope,
    acker: &A,
) -> Result<Disposition, AmqpError>
where
    C: AmqpChannel + ?Sized,
    A: Acknowledge + ?Sized,
{
    let count = envelope.retry_nums();
    let (ctx, mut span) = otel::new_span(&envelope.headers, tracer, def.queue_name());

    debug!(queue = def.queue_name(), retry_nums = count, "received message");

    let failure = match (handlers.process)(envelope.body.clone()).await {
        Ok(()) => {
            debug!("message successfully processed");
            return match acker.ack().await {
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(Disposition::Acked)
                }
            };
        }
        Err(failure) => failure,
    };

    span.record_error(&failure);

    let disposition = if count < MAX_RETRIES {
        warn!(
            error = failure.reason(),
            queue = def.queue_name(),
            routing_key = def.routing_key(),
            retry_nums = count,
            "error whiling handling msg, requeuing for latter"
        );

        match RetryCoordinator::new(channel)
            .retry(&ctx, def, &envelope.body, &envelope.headers)
            .await
        {
            Ok(attempt) => Disposition::Retried(attempt),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = def.queue_name(),
                    routing_key = def.routing_key(),
                    "error whiling scheduling retry, returning msg to the queue"
                );
                span.set_status(Status::Error {
                    description: Cow::from("error to schedule retry"),
                });

                acker.nack(true).await?;
                return Ok(Disposition::Requeued);
            }
        }
    } else {
        error!(
            error = failure.reason(),
            queue = def.queue_name(),
            routing_key = def.routing_key(),
            retry_nums = count,
            "too many attempts, handing msg to the failure handler"
        );

        if let Err(err) = (handlers.on_exhausted)(failure, envelope.body).await {
            error!(
                error = err.reason(),
                queue = def.queue_name(),
                "failure handler error"
            );
        }

        Disposition::Exhausted
    };

    span.set_status(Status::Error {
        description: Cow::from("failure to process msg"),
    });

    match acker.ack().await {
        Err(err) => {
            span.record_error(&err);
            Err(err)
        }
        _ => Ok(disposition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{MockAcknowledge, MockAmqpChannel},
        retry::with_retry_nums,
    };
    use opentelemetry::global;
    use std::sync::Mutex;

    fn tracer() -> BoxedTracer {
        global::tracer("consumer tests")
    }

    fn envelope(count: Option<i32>) -> Envelope {
        let headers = match count {
            Some(count) => with_retry_nums(&FieldTable::default(), count),
            None => FieldTable::default(),
        };
        Envelope::new(b"job-1".to_vec(), headers)
    }

    fn failing_handlers(exhausted: Arc<Mutex<Vec<(String, Vec<u8>)>>>) -> Handlers {
        Handlers::new(
            |_| async { Err(ProcessingFailure::new("boom")) },
            move |reason: ProcessingFailure, body| {
                let exhausted = exhausted.clone();
                async move {
                    exhausted
                        .lock()
                        .unwrap()
                        .push((reason.reason().to_owned(), body));
                    Ok(())
                }
            },
        )
    }

    #[tokio::test]
    async fn success_is_acked() {
        let channel = MockAmqpChannel::new();
        let mut acker = MockAcknowledge::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        let handlers = Handlers::new(
            |body| async move {
                assert_eq!(body, b"job-1");
                Ok(())
            },
            |_, _| async { Ok(()) },
        );

        let disposition = consume(
            &tracer(),
            &channel,
            &QueueExchange::new("q1"),
            &handlers,
            envelope(None),
            &acker,
        )
        .await
        .unwrap();

        assert_eq!(disposition, Disposition::Acked);
    }

    #[tokio::test]
    async fn failure_below_ceiling_is_retried_then_acked() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_queue_declare().times(1).returning(|_, _| Ok(()));
        channel
            .expect_publish()
            .withf(|_, key, _, headers| key == "q1_retry_3" && retry_nums(headers) == 2)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut acker = MockAcknowledge::new();
        acker.expect_ack().times(1).returning(|| Ok(()));

        let exhausted = Arc::new(Mutex::new(Vec::new()));

        let disposition = consume(
            &tracer(),
            &channel,
            &QueueExchange::new("q1"),
            &failing_handlers(exhausted.clone()),
            envelope(Some(1)),
            &acker,
        )
        .await
        .unwrap();

        assert_eq!(disposition, Disposition::Retried(2));
        assert!(exhausted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_at_ceiling_is_handed_to_failure_handler() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_queue_declare().never();
        channel.expect_publish().never();
        let mut acker = MockAcknowledge::new();
        acker.expect_ack().times(1).returning(|| Ok(()));

        let exhausted = Arc::new(Mutex::new(Vec::new()));

        let disposition = consume(
            &tracer(),
            &channel,
            &QueueExchange::new("q1"),
            &failing_handlers(exhausted.clone()),
            envelope(Some(MAX_RETRIES)),
            &acker,
        )
        .await
        .unwrap();

        assert_eq!(disposition, Disposition::Exhausted);
        assert_eq!(
            *exhausted.lock().unwrap(),
            vec![("boom".to_owned(), b"job-1".to_vec())]
        );
    }

    #[tokio::test]
    async fn failure_handler_error_still_acks() {
        let channel = MockAmqpChannel::new();
        let mut acker = MockAcknowledge::new();
        acker.expect_ack().times(1).returning(|| Ok(()));

        let handlers = Handlers::new(
            |_| async { Err(ProcessingFailure::new("boom")) },
            |_, _| async { Err(ProcessingFailure::new("db down")) },
        );

        let disposition = consume(
            &tracer(),
            &channel,
            &QueueExchange::new("q1"),
            &handlers,
            envelope(Some(5)),
            &acker,
        )
        .await
        .unwrap();

        assert_eq!(disposition, Disposition::Exhausted);
    }

    #[tokio::test]
    async fn failed_retry_requeues_original() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_queue_declare()
            .returning(|name, _| Err(AmqpError::TopologyConflictError(name.to_owned())));
        channel.expect_publish().never();
        let mut acker = MockAcknowledge::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .withf(|requeue| *requeue)
            .times(1)
            .returning(|_| Ok(()));

        let disposition = consume(
            &tracer(),
            &channel,
            &QueueExchange::new("q1"),
            &failing_handlers(Arc::new(Mutex::new(Vec::new()))),
            envelope(None),
            &acker,
        )
        .await
        .unwrap();

        assert_eq!(disposition, Disposition::Requeued);
    }

    #[tokio::test]
    async fn ack_failure_is_returned() {
        let channel = MockAmqpChannel::new();
        let mut acker = MockAcknowledge::new();
        acker
            .expect_ack()
            .returning(|| Err(AmqpError::AckMessageError));

        let handlers = Handlers::new(|_| async { Ok(()) }, |_, _| async { Ok(()) });

        let err = consume(
            &tracer(),
            &channel,
            &QueueExchange::new("q1"),
            &handlers,
            envelope(None),
            &acker,
        )
        .await
        .unwrap_err();

        assert_eq!(err, AmqpError::AckMessageError);
    }
}
