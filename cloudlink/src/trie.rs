use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;

use crate::topic::{Level, Topic};

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub type TopicTree<V> = Node<V>;

/// Level trie keyed by filter levels; values hang off the node that ends a filter.
pub struct Node<V> {
    values: HashSet<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { values: HashSet::default(), branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: Hash + Eq + Clone + Debug,
{
    #[inline]
    pub fn insert(&mut self, topic_filter: &Topic, value: V) -> bool {
        let mut path = topic_filter.levels().clone();
        path.reverse();
        self._insert(path, value)
    }

    #[inline]
    fn _insert(&mut self, mut path: Vec<Level>, value: V) -> bool {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, value)
        } else {
            self.values.insert(value)
        }
    }

    /// Removes `value` under `topic_filter`, pruning branches left empty.
    #[inline]
    pub fn remove(&mut self, topic_filter: &Topic, value: &V) -> bool {
        self._remove(topic_filter.levels().as_ref(), value)
    }

    #[inline]
    fn _remove(&mut self, path: &[Level], value: &V) -> bool {
        match path.split_first() {
            None => self.values.remove(value),
            Some((first, rest)) => {
                if let Some(x) = self.branches.get_mut(first) {
                    let res = x._remove(rest, value);
                    if x.values.is_empty() && x.branches.is_empty() {
                        self.branches.remove(first);
                    }
                    res
                } else {
                    false
                }
            }
        }
    }

    /// All values whose filter matches the topic name, grouped by filter.
    #[inline]
    pub fn matches(&self, topic: &Topic) -> HashMap<Topic, Vec<V>> {
        let mut out = HashMap::default();
        self._matches(topic.levels(), Vec::new(), &mut out);
        out
    }

    fn _matches(&self, path: &[Level], mut sub_path: Vec<Level>, out: &mut HashMap<Topic, Vec<V>>) {
        let mut add_to_out = |levels: Vec<Level>, v_set: &HashSet<V>| {
            if !v_set.is_empty() {
                out.entry(Topic::from(levels)).or_default().extend(v_set.iter().cloned());
            }
        };

        match path.split_first() {
            None => {
                //a/# also matches a
                if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                    if !n.values.is_empty() {
                        let mut sub_path = sub_path.clone();
                        sub_path.push(Level::MultiWildcard);
                        add_to_out(sub_path, &n.values);
                    }
                }
                add_to_out(sub_path, &self.values);
            }
            Some((first, rest)) => {
                //Topic names starting with $ are not matched by filters starting with a wildcard
                if !(sub_path.is_empty() && first.is_metadata()) {
                    if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                        if !n.values.is_empty() {
                            let mut sub_path = sub_path.clone();
                            sub_path.push(Level::MultiWildcard);
                            add_to_out(sub_path, &n.values);
                        }
                    }

                    if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                        let mut sub_path = sub_path.clone();
                        sub_path.push(Level::SingleWildcard);
                        n._matches(rest, sub_path, out);
                    }
                }

                if let Some(n) = self.branches.get(first) {
                    sub_path.push(first.clone());
                    n._matches(rest, sub_path, out);
                }
            }
        }
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.values.len() + len
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.branches.is_empty()
    }
}

impl<V> Debug for Node<V>
where
    V: Hash + Eq + Clone + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {{ nodes_size: {}, values_size: {} }}", self.nodes_size(), self.values_size())
    }
}
