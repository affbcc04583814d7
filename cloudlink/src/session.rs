//! The data-session layer beneath an endpoint.
//!
//! A [`Session`] owns the broker connection. It reports lifecycle changes and
//! traffic back through [`SessionListener`], which the endpoint implements,
//! calling it from its own I/O context.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::types::{MessageId, QoS};

#[async_trait::async_trait]
pub trait Session: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Disconnects after waiting at most `quiesce_timeout` for in-flight work.
    async fn disconnect(&self, quiesce_timeout: Duration) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Sends one message and returns the id the confirmation will carry.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool, priority: u8) -> Result<MessageId>;

    /// Must not wait on the context that delivers [`SessionListener`] callbacks;
    /// the endpoint calls it while serializing registry changes.
    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, topic_filter: &str) -> Result<()>;

    fn info(&self) -> BTreeMap<String, String> {
        BTreeMap::default()
    }
}

#[async_trait::async_trait]
pub trait SessionListener: Send + Sync {
    async fn on_connecting(&self) {}

    async fn on_connection_established(&self);

    async fn on_disconnecting(&self);

    async fn on_disconnected(&self);

    async fn on_connection_lost(&self, cause: String);

    async fn on_message_arrived(&self, topic: &str, payload: Bytes, qos: QoS, retained: bool);

    async fn on_message_published(&self, id: MessageId, topic: &str) {
        log::debug!("message {} published, topic: {}", id, topic);
    }

    async fn on_message_confirmed(&self, id: MessageId, topic: &str);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::CloudError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Connect,
        Disconnect(Duration),
        Publish { topic: String, payload: Bytes, qos: QoS, retain: bool, priority: u8 },
        Subscribe(String, QoS),
        Unsubscribe(String),
    }

    /// Records every call; can be told to fail some of them.
    #[derive(Default)]
    pub(crate) struct MockSession {
        calls: Mutex<Vec<Call>>,
        connected: AtomicBool,
        next_id: AtomicU32,
        pub(crate) fail_connect: AtomicBool,
        pub(crate) fail_publish: AtomicBool,
        fail_subscribe: Mutex<Vec<String>>,
        hold: Mutex<Option<(String, Arc<Notify>, Arc<Notify>)>>,
    }

    impl MockSession {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub(crate) fn clear(&self) {
            self.calls.lock().clear();
        }

        pub(crate) fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        pub(crate) fn fail_subscribe(&self, topic_filter: &str) {
            self.fail_subscribe.lock().push(topic_filter.to_owned());
        }

        /// Makes `subscribe(topic_filter)` signal the first returned handle and
        /// then wait until the second one is notified.
        pub(crate) fn hold_subscribe(&self, topic_filter: &str) -> (Arc<Notify>, Arc<Notify>) {
            let entered = Arc::new(Notify::new());
            let release = Arc::new(Notify::new());
            *self.hold.lock() = Some((topic_filter.to_owned(), entered.clone(), release.clone()));
            (entered, release)
        }

        pub(crate) fn subscribes(&self) -> Vec<(String, QoS)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Subscribe(f, q) => Some((f, q)),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn unsubscribes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Unsubscribe(f) => Some(f),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn publishes(&self) -> Vec<(String, Bytes, QoS)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Publish { topic, payload, qos, .. } => Some((topic, payload, qos)),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn last_id(&self) -> MessageId {
            self.next_id.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Session for MockSession {
        async fn connect(&self) -> Result<()> {
            self.calls.lock().push(Call::Connect);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(CloudError::Session(anyhow::anyhow!("broker unreachable")));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self, quiesce_timeout: Duration) -> Result<()> {
            self.calls.lock().push(Call::Disconnect(quiesce_timeout));
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn publish(
            &self,
            topic: &str,
            payload: Bytes,
            qos: QoS,
            retain: bool,
            priority: u8,
        ) -> Result<MessageId> {
            self.calls.lock().push(Call::Publish { topic: topic.to_owned(), payload, qos, retain, priority });
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(CloudError::Session(anyhow::anyhow!("publish rejected")));
            }
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<()> {
            self.calls.lock().push(Call::Subscribe(topic_filter.to_owned(), qos));
            let held = self
                .hold
                .lock()
                .as_ref()
                .filter(|(f, _, _)| f == topic_filter)
                .map(|(_, entered, release)| (entered.clone(), release.clone()));
            if let Some((entered, release)) = held {
                entered.notify_one();
                release.notified().await;
            }
            if self.fail_subscribe.lock().iter().any(|f| f == topic_filter) {
                return Err(CloudError::Session(anyhow::anyhow!("subscribe rejected")));
            }
            Ok(())
        }

        async fn unsubscribe(&self, topic_filter: &str) -> Result<()> {
            self.calls.lock().push(Call::Unsubscribe(topic_filter.to_owned()));
            Ok(())
        }

        fn info(&self) -> BTreeMap<String, String> {
            let mut info = BTreeMap::new();
            info.insert("broker".into(), "mock://localhost".into());
            info
        }
    }
}
