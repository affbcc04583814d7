use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;

use crate::message::ArrivedMessage;
use crate::types::CorrelationId;

/// Everything the endpoint reports to application code.
#[derive(Debug, Clone)]
pub enum CloudEvent {
    ConnectionEstablished,
    /// The session dropped without a graceful disconnect.
    ConnectionLost {
        cause: String,
    },
    /// A graceful disconnect completed.
    Disconnected,
    MessageArrived(ArrivedMessage),
    MessageConfirmed {
        correlation_id: CorrelationId,
        topic: String,
    },
}

impl CloudEvent {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            CloudEvent::ConnectionEstablished => "connection_established",
            CloudEvent::ConnectionLost { .. } => "connection_lost",
            CloudEvent::Disconnected => "disconnected",
            CloudEvent::MessageArrived(_) => "message_arrived",
            CloudEvent::MessageConfirmed { .. } => "message_confirmed",
        }
    }
}

#[async_trait::async_trait]
pub trait CloudListener: Send + Sync {
    async fn on_event(&self, event: &CloudEvent) -> anyhow::Result<()>;
}

pub type Listener = Arc<dyn CloudListener>;

/// Identity of a listener handle; two clones of the same `Arc` are the same listener.
#[inline]
pub fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub struct FnListener<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> CloudListener for FnListener<F>
where
    F: Fn(CloudEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_event(&self, event: &CloudEvent) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Wraps an async closure into a listener handle.
#[inline]
pub fn listener_fn<F, Fut>(f: F) -> Listener
where
    F: Fn(CloudEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnListener { f })
}

/// A set of listeners keyed by handle identity.
#[derive(Default)]
pub struct Observers {
    listeners: RwLock<Vec<Listener>>,
}

impl Observers {
    /// Returns false if the listener was already present.
    pub fn add(&self, listener: Listener) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            false
        } else {
            listeners.push(listener);
            true
        }
    }

    pub fn remove(&self, listener: &Listener) -> bool {
        let mut listeners = self.listeners.write();
        let len = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != len
    }

    #[inline]
    pub fn snapshot(&self) -> Vec<Listener> {
        self.listeners.read().clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    #[inline]
    pub async fn dispatch(&self, event: &CloudEvent) -> usize {
        let listeners = self.snapshot();
        dispatch(&listeners, event).await
    }
}

fn panic_message(e: &(dyn Any + Send)) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

/// Calls each listener in turn. A listener that fails or panics is logged and
/// skipped; the rest still receive the event. Returns the number of listeners
/// that handled the event successfully.
pub async fn dispatch(listeners: &[Listener], event: &CloudEvent) -> usize {
    let mut delivered = 0;
    for listener in listeners {
        match AssertUnwindSafe(listener.on_event(event)).catch_unwind().await {
            Ok(Ok(())) => delivered += 1,
            Ok(Err(e)) => {
                log::warn!("listener failed on {} event, {:?}", event.name(), e);
            }
            Err(e) => {
                log::error!("listener panicked on {} event, {}", event.name(), panic_message(e.as_ref()));
            }
        }
    }
    delivered
}
