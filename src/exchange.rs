// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Kinds
//!
//! Exchanges are the routing mechanism in RabbitMQ that determine how messages are
//! distributed to queues. A topology descriptor names the kind of its exchange;
//! this module maps that kind onto lapin's representation.

use serde::Deserialize;
use std::fmt;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - Custom: Any plugin-provided kind, passed to the broker as is
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl From<&str> for ExchangeKind {
    /// An empty kind falls back to `direct`.
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "" | "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            _ => ExchangeKind::Custom(value.to_owned()),
        }
    }
}

impl From<String> for ExchangeKind {
    fn from(value: String) -> Self {
        ExchangeKind::from(value.as_str())
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Topic => f.write_str("topic"),
            ExchangeKind::Headers => f.write_str("headers"),
            ExchangeKind::Custom(kind) => f.write_str(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_kind_defaults_to_direct() {
        assert_eq!(ExchangeKind::from(""), ExchangeKind::Direct);
        assert_eq!(ExchangeKind::default(), ExchangeKind::Direct);
    }

    #[test]
    fn parses_known_and_custom_kinds() {
        assert_eq!(ExchangeKind::from("Topic"), ExchangeKind::Topic);
        assert_eq!(
            ExchangeKind::from("x-delayed-message"),
            ExchangeKind::Custom("x-delayed-message".to_owned())
        );
    }

    #[test]
    fn converts_to_lapin_kind() {
        let kind: lapin::ExchangeKind = (&ExchangeKind::Fanout).into();
        assert!(matches!(kind, lapin::ExchangeKind::Fanout));
    }
}
