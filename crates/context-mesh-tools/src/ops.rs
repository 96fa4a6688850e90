//! The closed set of mesh operations callers may invoke by name.

use std::{fmt, str::FromStr, time::Duration};

use context_mesh_core::{MeshError, PushOptions, Result, TopicName};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// One named mesh operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    GetContext,
    PushContext,
    ListContext,
    ListContextKeys,
    RemoveContext,
    SubscribeToTopics,
    UnsubscribeFromTopics,
    GetSubscriptions,
    DiscoverTopics,
    DeleteTopic,
}

impl Operation {
    /// Every operation, in dispatch-table order.
    pub const ALL: [Self; 10] = [
        Self::GetContext,
        Self::PushContext,
        Self::ListContext,
        Self::ListContextKeys,
        Self::RemoveContext,
        Self::SubscribeToTopics,
        Self::UnsubscribeFromTopics,
        Self::GetSubscriptions,
        Self::DiscoverTopics,
        Self::DeleteTopic,
    ];

    /// Wire name, e.g. `push_context`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetContext => "get_context",
            Self::PushContext => "push_context",
            Self::ListContext => "list_context",
            Self::ListContextKeys => "list_context_keys",
            Self::RemoveContext => "remove_context",
            Self::SubscribeToTopics => "subscribe_to_topics",
            Self::UnsubscribeFromTopics => "unsubscribe_from_topics",
            Self::GetSubscriptions => "get_subscriptions",
            Self::DiscoverTopics => "discover_topics",
            Self::DeleteTopic => "delete_topic",
        }
    }

    /// Look up an operation by wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Wire names of every operation.
    #[must_use]
    pub fn all_names() -> Vec<String> {
        names(Self::ALL)
    }

    /// One-line summary for tool listings.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::GetContext => "Read one context value visible to the calling agent",
            Self::PushContext => {
                "Store a context value, optionally addressed to agents or topics with a TTL"
            }
            Self::ListContext => "Read every context value visible to the calling agent",
            Self::ListContextKeys => "List visible context keys grouped by topic",
            Self::RemoveContext => "Delete a context value",
            Self::SubscribeToTopics => "Subscribe the calling agent to topics",
            Self::UnsubscribeFromTopics => "Unsubscribe the calling agent from topics",
            Self::GetSubscriptions => "List the calling agent's topic subscriptions",
            Self::DiscoverTopics => "List topics by subscriber count",
            Self::DeleteTopic => "Unsubscribe every agent from a topic (requires confirm)",
        }
    }

    /// Argument names the operation reads. The calling agent is implicit.
    #[must_use]
    pub const fn argument_names(self) -> &'static [&'static str] {
        match self {
            Self::GetContext | Self::RemoveContext => &["key"],
            Self::PushContext => &["key", "value", "agents", "topics", "ttl_seconds"],
            Self::ListContext | Self::ListContextKeys | Self::GetSubscriptions => &[],
            Self::SubscribeToTopics | Self::UnsubscribeFromTopics => &["topics"],
            Self::DiscoverTopics => &["include_subscribers"],
            Self::DeleteTopic => &["topic", "confirm"],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| MeshError::UnknownOperation {
            operation: s.to_string(),
            available: Self::all_names(),
        })
    }
}

/// Wire names for a set of operations.
pub fn names(ops: impl IntoIterator<Item = Operation>) -> Vec<String> {
    ops.into_iter().map(|op| op.name().to_string()).collect()
}

/// Decode call arguments; `null` counts as an empty object.
///
/// # Errors
/// Returns [`MeshError::Validation`] if the arguments do not fit the shape.
pub fn parse_args<T: DeserializeOwned>(op: Operation, arguments: Value) -> Result<T> {
    let arguments = if arguments.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|e| MeshError::Validation(format!("invalid arguments for {op}: {e}")))
}

/// Arguments naming one key.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyArgs {
    pub key: String,
}

/// Arguments of `push_context`.
#[derive(Debug, Clone, Deserialize)]
pub struct PushArgs {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub topics: Vec<TopicName>,
    pub ttl_seconds: Option<f64>,
}

impl PushArgs {
    /// Addressing and expiry for the push.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for a non-positive or non-finite TTL.
    pub fn options(&self) -> Result<PushOptions> {
        let mut options = PushOptions::new()
            .agents(self.agents.iter().cloned())
            .topics(self.topics.iter().cloned());
        if let Some(secs) = self.ttl_seconds {
            let ttl = Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|ttl| !ttl.is_zero())
                .ok_or_else(|| {
                    MeshError::Validation(format!("ttl_seconds must be positive, got {secs}"))
                })?;
            options = options.ttl(ttl);
        }
        Ok(options)
    }
}

/// Arguments naming a set of topics.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicsArgs {
    pub topics: Vec<TopicName>,
}

/// Arguments of `discover_topics`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoverArgs {
    #[serde(default)]
    pub include_subscribers: bool,
}

/// Arguments of `delete_topic`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteTopicArgs {
    pub topic: TopicName,
    #[serde(default)]
    pub confirm: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_names_roundtrip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_name(op.name()), Some(op));
            assert_eq!(serde_json::to_value(op).unwrap(), json!(op.name()));
        }
        assert!(Operation::from_name("drop_database").is_none());
    }

    #[test]
    fn test_from_str_unknown() {
        let err = "frobnicate".parse::<Operation>().unwrap_err();
        assert_eq!(err.kind(), "unknown_operation");
        assert_eq!(err.available_operations().map(<[String]>::len), Some(10));
    }

    #[test]
    fn test_push_args_ttl() {
        let args: PushArgs = parse_args(
            Operation::PushContext,
            json!({"key": "k", "value": [1], "topics": ["t"], "ttl_seconds": 2.5}),
        )
        .unwrap();
        let options = args.options().unwrap();
        assert_eq!(options.ttl, Some(Duration::from_millis(2500)));
        assert_eq!(options.topics, vec!["t".to_string()]);

        for bad in [0.0, -1.0, f64::NAN] {
            let args = PushArgs {
                ttl_seconds: Some(bad),
                ..args.clone()
            };
            assert!(matches!(args.options(), Err(MeshError::Validation(_))));
        }
    }

    #[test]
    fn test_missing_argument_is_validation_error() {
        let err = parse_args::<KeyArgs>(Operation::GetContext, json!({})).unwrap_err();
        assert!(matches!(err, MeshError::Validation(ref msg) if msg.contains("get_context")));
    }

    #[test]
    fn test_null_arguments_are_empty() {
        let args: DiscoverArgs = parse_args(Operation::DiscoverTopics, Value::Null).unwrap();
        assert!(!args.include_subscribers);
    }
}
