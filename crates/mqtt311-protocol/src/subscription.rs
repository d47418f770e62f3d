//! Bookkeeping for active subscriptions and routing of inbound topics.

use crate::error::{MqttError, Result};
use crate::topic::{is_valid_topic_filter, matches};
use crate::types::QoS;

/// One acknowledged subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub filter: String,
    pub requested_qos: QoS,
    pub granted_qos: QoS,
}

/// Insertion-ordered registry of acknowledged subscriptions.
///
/// Re-subscribing to a known filter updates the entry in place without
/// changing its position, so [`SubscriptionRegistry::entries`] is stable
/// for display purposes.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<SubscriptionEntry>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a granted subscription, updating in place when the filter
    /// is already present.
    pub fn add_or_update(&mut self, filter: &str, requested_qos: QoS, granted_qos: QoS) -> Result<()> {
        if !is_valid_topic_filter(filter) {
            return Err(MqttError::InvalidTopicFilter(filter.to_string()));
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.filter == filter) {
            entry.requested_qos = requested_qos;
            entry.granted_qos = granted_qos;
        } else {
            self.entries.push(SubscriptionEntry {
                filter: filter.to_string(),
                requested_qos,
                granted_qos,
            });
        }
        Ok(())
    }

    /// Remove a filter; returns whether it was present.
    pub fn remove(&mut self, filter: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.filter != filter);
        self.entries.len() < before
    }

    /// All entries whose filter matches `topic`, in registry order.
    #[must_use]
    pub fn matches(&self, topic: &str) -> Vec<&SubscriptionEntry> {
        self.entries
            .iter()
            .filter(|e| matches(topic, &e.filter))
            .collect()
    }

    /// Current entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[SubscriptionEntry] {
        &self.entries
    }

    #[must_use]
    pub fn contains(&self, filter: &str) -> bool {
        self.entries.iter().any(|e| e.filter == filter)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
