//! Topic filter registry and MQTT wildcard matching

use super::{QoS, SessionError};

/// Callback invoked with the topic and payload of a matching message
pub type Handler = Box<dyn FnMut(&str, &[u8]) + Send>;

struct Subscription {
    filter: String,
    qos: QoS,
    handler: Handler,
}

/// Ordered set of (filter, handler) pairs
///
/// Handlers for every matching filter run in registration order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: Handler,
    ) -> Result<(), SessionError> {
        validate_filter(filter)?;
        self.entries.push(Subscription {
            filter: filter.to_string(),
            qos,
            handler,
        });
        Ok(())
    }

    /// Distinct filters to subscribe, keeping the highest QoS requested for each
    pub fn filters(&self) -> Vec<(String, QoS)> {
        let mut filters: Vec<(String, QoS)> = Vec::new();
        for entry in &self.entries {
            match filters.iter_mut().find(|(f, _)| *f == entry.filter) {
                Some((_, qos)) => {
                    if u8::from(entry.qos) > u8::from(*qos) {
                        *qos = entry.qos;
                    }
                }
                None => filters.push((entry.filter.clone(), entry.qos)),
            }
        }
        filters
    }

    /// Run every handler whose filter matches `topic`; returns how many ran
    pub fn dispatch(&mut self, topic: &str, payload: &[u8]) -> usize {
        let mut matched = 0;
        for entry in self.entries.iter_mut() {
            if topic_matches(&entry.filter, topic) {
                (entry.handler)(topic, payload);
                matched += 1;
            }
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.filter, e.qos)))
            .finish()
    }
}

pub(crate) fn validate_filter(filter: &str) -> Result<(), SessionError> {
    if filter.is_empty() {
        return Err(SessionError::InvalidTopicFilter(
            "filter must not be empty".to_string(),
        ));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(SessionError::InvalidTopicFilter(format!(
                "'#' must be the whole last level in '{filter}'"
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(SessionError::InvalidTopicFilter(format!(
                "'+' must occupy a whole level in '{filter}'"
            )));
        }
    }
    Ok(())
}

/// MQTT topic filter matching with `+` and `#` wildcards
///
/// Topics starting with `$` are not matched by a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
