use std::future::Future;

use tokio::sync::Mutex;

use cloudlink_utils::timestamp_millis;

use crate::error::Result;
use crate::event::{CloudEvent, Listener, Observers};
use crate::types::{CorrelationId, MessageId, QoS, TimestampMillis};

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// A QoS>0 publish waiting for its broker confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub broker_message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub topic: String,
    pub created: TimestampMillis,
}

/// Correlates broker message ids with the ids handed to publishers.
///
/// Entries live until their first confirmation. There is no timeout; an
/// unconfirmed entry stays for the lifetime of the tracker.
#[derive(Default)]
pub struct DeliveryTracker {
    pending: Mutex<HashMap<MessageId, PendingDelivery>>,
    listeners: Observers,
}

impl DeliveryTracker {
    /// Runs `publish` with the pending table locked and records its result.
    ///
    /// A confirmation for the new id cannot be processed before the entry
    /// exists, so it is never mistaken for an unknown id.
    pub async fn track<F>(&self, qos: QoS, topic: &str, publish: F) -> Result<Option<CorrelationId>>
    where
        F: Future<Output = Result<MessageId>>,
    {
        let mut pending = self.pending.lock().await;
        let id = publish.await?;
        Ok(Self::insert(&mut pending, qos, topic, id))
    }

    /// Records a publish that already completed.
    pub async fn record_pending(&self, qos: QoS, topic: &str, id: MessageId) -> Option<CorrelationId> {
        let mut pending = self.pending.lock().await;
        Self::insert(&mut pending, qos, topic, id)
    }

    fn insert(
        pending: &mut HashMap<MessageId, PendingDelivery>,
        qos: QoS,
        topic: &str,
        id: MessageId,
    ) -> Option<CorrelationId> {
        if !qos.is_confirmed() {
            return None;
        }
        let correlation_id = id.to_string();
        let delivery = PendingDelivery {
            broker_message_id: id,
            correlation_id: correlation_id.clone(),
            topic: topic.to_owned(),
            created: timestamp_millis(),
        };
        if let Some(old) = pending.insert(id, delivery) {
            log::warn!("message id {} reused before confirmation, topic: {}", id, old.topic);
        }
        Some(correlation_id)
    }

    /// Consumes the entry for `id` and notifies every delivery listener once.
    /// Unknown ids are dropped.
    pub async fn confirm(&self, id: MessageId, topic: &str) -> Option<PendingDelivery> {
        let delivery = self.pending.lock().await.remove(&id);
        match delivery {
            Some(delivery) => {
                log::debug!("message {} confirmed, topic: {}", id, topic);
                let event = CloudEvent::MessageConfirmed {
                    correlation_id: delivery.correlation_id.clone(),
                    topic: delivery.topic.clone(),
                };
                self.listeners.dispatch(&event).await;
                Some(delivery)
            }
            None => {
                log::debug!("confirmation for unknown message id {} dropped, topic: {}", id, topic);
                None
            }
        }
    }

    #[inline]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    #[inline]
    pub fn register_listener(&self, listener: Listener) -> bool {
        self.listeners.add(listener)
    }

    #[inline]
    pub fn unregister_listener(&self, listener: &Listener) -> bool {
        self.listeners.remove(listener)
    }
}
