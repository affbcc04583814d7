use std::collections::hash_map::Entry as MapEntry;
use std::str::FromStr;

use crate::error::{CloudError, Result};
use crate::event::{same_listener, Listener};
use crate::topic::Topic;
use crate::trie::TopicTree;
use crate::types::SubscriptionFilter;

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Outcome of a registration, telling the caller which session call is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First listener on this filter; one `subscribe` is due.
    Created,
    /// Another listener joined an existing filter.
    Added,
    /// The listener was already registered on this filter.
    Duplicate,
    /// Existing filter re-registered at a different QoS; the stored QoS is replaced.
    QosChanged,
}

impl Registration {
    #[inline]
    pub fn needs_subscribe(&self) -> bool {
        matches!(self, Registration::Created | Registration::QosChanged)
    }
}

/// Listeners bound to one filter. Never empty while its entry exists.
#[derive(Default, Clone)]
pub struct ListenerSet(Vec<Listener>);

impl ListenerSet {
    #[inline]
    fn contains(&self, listener: &Listener) -> bool {
        self.0.iter().any(|l| same_listener(l, listener))
    }

    #[inline]
    fn insert(&mut self, listener: Listener) -> bool {
        if self.contains(&listener) {
            false
        } else {
            self.0.push(listener);
            true
        }
    }

    #[inline]
    fn remove(&mut self, listener: &Listener) -> bool {
        let len = self.0.len();
        self.0.retain(|l| !same_listener(l, listener));
        self.0.len() != len
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.0.iter()
    }
}

struct Entry {
    filter: SubscriptionFilter,
    topic: Topic,
    listeners: ListenerSet,
}

/// Desired subscriptions keyed by topic filter string.
///
/// The registry does not talk to the session; it reports through
/// [`Registration`] and the filters returned by
/// [`unregister_subscriber`](SubscriptionRegistry::unregister_subscriber)
/// which session calls the mutation requires.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Entry>,
    tree: TopicTree<String>,
}

impl SubscriptionRegistry {
    pub fn register_subscriber(&mut self, filter: SubscriptionFilter, listener: Listener) -> Result<Registration> {
        let topic = Topic::from_str(&filter.topic_filter)
            .map_err(|e| CloudError::invalid_argument(format!("topic filter {}, {}", filter.topic_filter, e)))?;

        match self.entries.entry(filter.topic_filter.clone()) {
            MapEntry::Vacant(v) => {
                self.tree.insert(&topic, filter.topic_filter.clone());
                let mut listeners = ListenerSet::default();
                listeners.insert(listener);
                v.insert(Entry { filter, topic, listeners });
                Ok(Registration::Created)
            }
            MapEntry::Occupied(mut o) => {
                let entry = o.get_mut();
                let added = entry.listeners.insert(listener);
                if entry.filter.qos != filter.qos {
                    log::debug!(
                        "topic filter {} qos changed from {} to {}",
                        filter.topic_filter,
                        entry.filter.qos,
                        filter.qos
                    );
                    entry.filter.qos = filter.qos;
                    Ok(Registration::QosChanged)
                } else if added {
                    Ok(Registration::Added)
                } else {
                    Ok(Registration::Duplicate)
                }
            }
        }
    }

    /// Removes the listener from every filter. Returns the filters left without
    /// listeners; they have been deleted and each needs one `unsubscribe`.
    pub fn unregister_subscriber(&mut self, listener: &Listener) -> Vec<SubscriptionFilter> {
        let mut emptied = Vec::new();
        self.entries.retain(|_, entry| {
            if entry.listeners.remove(listener) && entry.listeners.is_empty() {
                emptied.push((entry.topic.clone(), entry.filter.clone()));
                false
            } else {
                true
            }
        });

        emptied
            .into_iter()
            .map(|(topic, filter)| {
                self.tree.remove(&topic, &filter.topic_filter);
                filter
            })
            .collect()
    }

    /// Union of the listeners of every filter matching `topic`, each listener once.
    pub fn matching_listeners(&self, topic: &Topic) -> Vec<Listener> {
        let mut out: Vec<Listener> = Vec::new();
        for filters in self.tree.matches(topic).into_values() {
            for key in filters {
                if let Some(entry) = self.entries.get(&key) {
                    for l in entry.listeners.iter() {
                        if !out.iter().any(|o| same_listener(o, l)) {
                            out.push(l.clone());
                        }
                    }
                }
            }
        }
        out
    }

    /// Every desired filter.
    #[inline]
    pub fn filters(&self) -> Vec<SubscriptionFilter> {
        self.entries.values().map(|e| e.filter.clone()).collect()
    }

    #[inline]
    pub fn get(&self, topic_filter: &str) -> Option<(&SubscriptionFilter, &ListenerSet)> {
        self.entries.get(topic_filter).map(|e| (&e.filter, &e.listeners))
    }

    #[inline]
    pub fn contains(&self, topic_filter: &str) -> bool {
        self.entries.contains_key(topic_filter)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
