//! Context items and the visibility rules attached to them.

use std::{collections::BTreeSet, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeshError, Result};

/// Logical caller identity used for visibility and permission checks.
pub type AgentId = String;

/// Named channel agents can subscribe to.
pub type TopicName = String;

/// Who may read a context item.
///
/// An item is addressed to exactly one of these. Topic visibility is resolved
/// against the subscription table at read time, not at push time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "targets", rename_all = "snake_case")]
pub enum Visibility {
    /// Readable by every agent.
    Global,
    /// Readable by an explicit subscriber list.
    Agents(BTreeSet<AgentId>),
    /// Readable by agents subscribed to any of these topics.
    Topics(BTreeSet<TopicName>),
}

impl Visibility {
    /// Build a visibility from optional agent and topic lists.
    ///
    /// Empty lists are the same as omitted ones; with neither given the item
    /// is global.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] if both lists are non-empty or if
    /// any entry is blank.
    pub fn from_targets<A, T>(agents: A, topics: T) -> Result<Self>
    where
        A: IntoIterator,
        A::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let agents = collect_names("agent id", agents)?;
        let topics = collect_names("topic", topics)?;

        match (agents.is_empty(), topics.is_empty()) {
            (true, true) => Ok(Self::Global),
            (false, true) => Ok(Self::Agents(agents)),
            (true, false) => Ok(Self::Topics(topics)),
            (false, false) => Err(MeshError::Validation(
                "an item is addressed to either agents or topics, not both".to_string(),
            )),
        }
    }

    /// Whether the item is readable by everyone.
    #[must_use]
    pub const fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }

    /// The direct subscriber list, if agent-addressed.
    #[must_use]
    pub const fn agents(&self) -> Option<&BTreeSet<AgentId>> {
        match self {
            Self::Agents(agents) => Some(agents),
            _ => None,
        }
    }

    /// The topic set, if topic-addressed.
    #[must_use]
    pub const fn topics(&self) -> Option<&BTreeSet<TopicName>> {
        match self {
            Self::Topics(topics) => Some(topics),
            _ => None,
        }
    }

    /// Whether `agent`, holding `subscriptions`, may read an item with this visibility.
    #[must_use]
    pub fn admits(&self, agent: &str, subscriptions: Option<&BTreeSet<TopicName>>) -> bool {
        match self {
            Self::Global => true,
            Self::Agents(agents) => agents.contains(agent),
            Self::Topics(topics) => subscriptions.is_some_and(|subs| !topics.is_disjoint(subs)),
        }
    }
}

/// One stored value plus its visibility and expiry metadata.
///
/// Items are never mutated in place: a push with an existing key replaces
/// the whole item.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    value: Value,
    visibility: Visibility,
    created_at: DateTime<Utc>,
    ttl: Option<Duration>,
}

impl ContextItem {
    /// Create an item stamped with the current time.
    #[must_use]
    pub fn new(value: Value, visibility: Visibility, ttl: Option<Duration>) -> Self {
        Self::restore(value, visibility, Utc::now(), ttl)
    }

    /// Rebuild an item with a known creation time, e.g. when loading from a backend.
    #[must_use]
    pub const fn restore(
        value: Value,
        visibility: Visibility,
        created_at: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            value,
            visibility,
            created_at,
            ttl,
        }
    }

    /// The stored value.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Consume the item and return its value.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Visibility rule.
    #[must_use]
    pub const fn visibility(&self) -> &Visibility {
        &self.visibility
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time to live, if any.
    #[must_use]
    pub const fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Instant after which the item is gone. `None` means it never expires.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = TimeDelta::from_std(self.ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    /// Whether the item has outlived its TTL.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the item has outlived its TTL at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now > at)
    }
}

/// Addressing and expiry options for a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Direct subscribers.
    pub agents: Vec<AgentId>,
    /// Topics the item is published to.
    pub topics: Vec<TopicName>,
    /// Time to live.
    pub ttl: Option<Duration>,
}

impl PushOptions {
    /// Options for a global item without expiry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the item to these agents.
    #[must_use]
    pub fn agents<I>(mut self, agents: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.agents = agents.into_iter().map(Into::into).collect();
        self
    }

    /// Publish the item to these topics.
    #[must_use]
    pub fn topics<I>(mut self, topics: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Expire the item after `ttl`.
    #[must_use]
    pub const fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Resolve the addressing into a [`Visibility`].
    ///
    /// # Errors
    /// See [`Visibility::from_targets`].
    pub fn visibility(&self) -> Result<Visibility> {
        Visibility::from_targets(self.agents.iter().cloned(), self.topics.iter().cloned())
    }
}

/// Reject blank identifiers (keys, agent ids, topic names).
///
/// # Errors
/// Returns [`MeshError::Validation`] if `value` is empty after trimming.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MeshError::Validation(format!("{kind} cannot be empty")));
    }
    Ok(())
}

fn collect_names<I>(kind: &str, names: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    names
        .into_iter()
        .map(|name| {
            let name = name.into();
            validate_identifier(kind, &name)?;
            Ok(name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_visibility_defaults_to_global() {
        let vis = Visibility::from_targets(Vec::<String>::new(), Vec::<String>::new()).unwrap();
        assert!(vis.is_global());
    }

    #[test]
    fn test_visibility_rejects_agents_and_topics() {
        let err = Visibility::from_targets(["a"], ["t"]).unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));
    }

    #[test]
    fn test_visibility_rejects_blank_names() {
        let err = Visibility::from_targets(["  "], Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));
    }

    #[test]
    fn test_admits() {
        let subs: BTreeSet<String> = ["news".to_string()].into();

        assert!(Visibility::Global.admits("anyone", None));

        let agents = Visibility::from_targets(["alice"], Vec::<String>::new()).unwrap();
        assert!(agents.admits("alice", None));
        assert!(!agents.admits("bob", Some(&subs)));

        let topics = Visibility::from_targets(Vec::<String>::new(), ["news", "sports"]).unwrap();
        assert!(topics.admits("carol", Some(&subs)));
        assert!(!topics.admits("carol", None));
        assert!(!topics.admits("carol", Some(&BTreeSet::new())));
    }

    #[test]
    fn test_item_expiry() {
        let created = Utc::now();
        let item = ContextItem::restore(
            json!("v"),
            Visibility::Global,
            created,
            Some(Duration::from_secs(10)),
        );

        assert!(!item.is_expired_at(created + TimeDelta::seconds(10)));
        assert!(item.is_expired_at(created + TimeDelta::seconds(11)));
        assert_eq!(item.expires_at(), Some(created + TimeDelta::seconds(10)));
    }

    #[test]
    fn test_item_without_ttl_never_expires() {
        let item = ContextItem::new(json!({"a": 1}), Visibility::Global, None);
        assert!(item.expires_at().is_none());
        assert!(!item.is_expired_at(Utc::now() + TimeDelta::days(365)));
    }

    #[test]
    fn test_push_options_builder() {
        let opts = PushOptions::new()
            .topics(["plans"])
            .ttl(Duration::from_secs(5));
        assert_eq!(opts.topics, vec!["plans".to_string()]);
        assert_eq!(opts.ttl, Some(Duration::from_secs(5)));
        assert!(matches!(opts.visibility().unwrap(), Visibility::Topics(_)));
    }
}
