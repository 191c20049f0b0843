// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! At-least-once messaging over RabbitMQ with bounded, delayed retries.
//!
//! Producers publish with [`publisher::send`]. Consumers run a worker pool with
//! [`dispatcher::receive`]: a failed message is parked in a TTL retry queue and
//! dead-lettered back to its queue 20 seconds later, up to three times, after
//! which the terminal-failure callback receives it.

mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
