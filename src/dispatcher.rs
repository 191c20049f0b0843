// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Pool
//!
//! `receive` runs a pool of workers against one queue. Every worker owns its own
//! channel on a shared connection, declares the topology, sets prefetch to 1 so the
//! broker hands out one unacknowledged delivery at a time, and processes deliveries
//! until its channel fails or the shutdown token is cancelled. Workers share no
//! mutable state; a failed worker is not restarted.

use crate::{
    broker::{Acknowledge, AmqpChannel},
    channel::{close_channel, ConnectionHandle},
    consumer::{consume, Envelope, Handlers},
    errors::AmqpError,
    queue::QueueExchange,
    topology::AmqpTopology,
};
use futures_util::{future::join_all, Stream, StreamExt};
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use opentelemetry::global::{self, BoxedTracer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Unacknowledged deliveries allowed per worker channel
pub const PREFETCH_COUNT: u16 = 1;

/// Runs `workers` consumer loops on `def` until every loop has exited.
///
/// Loops exit when `shutdown` is cancelled or when their channel fails. The first
/// worker error is returned once all workers are done.
pub async fn receive(
    def: &QueueExchange,
    handlers: Handlers,
    workers: usize,
    shutdown: CancellationToken,
) -> Result<(), AmqpError> {
    let conn = Arc::new(ConnectionHandle::connect(def.address(), def.connection_name()).await?);
    let def = Arc::new(def.clone());
    let workers = workers.max(1);

    info!(
        queue = def.queue_name(),
        exchange = def.exchange_name(),
        routing_key = def.routing_key(),
        workers,
        "starting consumers"
    );

    let spawns = (1..=workers)
        .map(|worker| {
            tokio::spawn(run_worker(
                conn.clone(),
                def.clone(),
                handlers.clone(),
                worker,
                shutdown.clone(),
            ))
        })
        .collect::<Vec<_>>();

    let mut outcome = Ok(());
    for spawned in join_all(spawns).await {
        let result = match spawned {
            Ok(result) => result,
            Err(err) => {
                error!(error = err.to_string(), "tokio process error");
                Err(AmqpError::InternalError)
            }
        };

        if let Err(err) = result {
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
    }

    match Arc::try_unwrap(conn) {
        Ok(conn) => {
            if let Err(err) = conn.close().await {
                warn!(error = err.to_string(), "failure to close consumer connection");
            }
        }
        Err(_) => warn!("consumer connection still in use, not closing it"),
    }

    outcome
}

async fn run_worker(
    conn: Arc<ConnectionHandle>,
    def: Arc<QueueExchange>,
    handlers: Handlers,
    worker: usize,
    shutdown: CancellationToken,
) -> Result<(), AmqpError> {
    let channel = conn.open_channel().await?;

    let result = consume_channel(&channel, &def, &handlers, worker, &shutdown).await;
    match &result {
        Ok(()) => info!(queue = def.queue_name(), worker, "consumer stopped"),
        Err(err) => error!(
            error = err.to_string(),
            queue = def.queue_name(),
            routing_key = def.routing_key(),
            worker,
            "consumer failed"
        ),
    }

    // a channel that just failed usually cannot be closed cleanly
    if let Err(err) = close_channel(channel).await {
        debug!(error = err.to_string(), worker, "channel already unusable");
    }

    result
}

async fn consume_channel(
    channel: &Channel,
    def: &QueueExchange,
    handlers: &Handlers,
    worker: usize,
    shutdown: &CancellationToken,
) -> Result<(), AmqpError> {
    prepare_channel(channel, def).await?;

    let tag = format!("{}-{}-{}", def.queue_name(), worker, Uuid::new_v4());
    let consumer = match channel
        .basic_consume(
            def.queue_name(),
            &tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to create the consumer");
            Err(AmqpError::BindingConsumerError(def.queue_name().to_owned()))
        }
        Ok(c) => Ok(c),
    }?;

    debug!(queue = def.queue_name(), consumer = tag.as_str(), "consuming");

    let deliveries = consumer.map(|result| match result {
        Ok(delivery) => Ok((Envelope::from(&delivery), delivery)),
        Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
    });

    drive(
        &global::tracer("amqp consumer"),
        channel,
        def,
        handlers,
        deliveries,
        shutdown,
    )
    .await
}

/// Declares the topology and limits the channel to one unacknowledged delivery.
pub(crate) async fn prepare_channel<C>(channel: &C, def: &QueueExchange) -> Result<(), AmqpError>
where
    C: AmqpChannel + ?Sized,
{
    AmqpTopology::new(channel, def).install().await?;
    channel.qos(PREFETCH_COUNT).await
}

/// Processes deliveries one at a time until the stream fails or `shutdown` fires.
pub(crate) async fn drive<C, S, A>(
    tracer: &BoxedTracer,
    channel: &C,
    def: &QueueExchange,
    handlers: &Handlers,
    deliveries: S,
    shutdown: &CancellationToken,
) -> Result<(), AmqpError>
where
    C: AmqpChannel + ?Sized,
    S: Stream<Item = Result<(Envelope, A), AmqpError>>,
    A: Acknowledge,
{
    tokio::pin!(deliveries);

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok((envelope, acker))) => {
                match consume(tracer, channel, def, handlers, envelope, &acker).await {
                    Ok(disposition) => debug!(?disposition, "message settled"),
                    Err(err) => error!(
                        error = err.to_string(),
                        queue = def.queue_name(),
                        "error consume msg"
                    ),
                }
            }
            Some(Err(err)) => {
                error!(error = err.to_string(), queue = def.queue_name(), "errors consume msg");
                return Err(err);
            }
            None => {
                return Err(AmqpError::ConsumerError(format!(
                    "consumer for `{}` was closed",
                    def.queue_name()
                )));
            }
        }
    }
}
