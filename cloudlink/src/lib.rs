#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cloudlink::{listener_fn, CloudEndpoint, CloudEvent, CloudMessage, QoS, Session, SubscriptionFilter};
//! use cloudlink::cloudlink_conf::{Options, Settings};
//!
//! async fn run(session: Arc<dyn Session>) -> cloudlink::Result<()> {
//!     let settings = Settings::init(Options::default())?;
//!     cloudlink::logger::logger_init(&settings.log)?;
//!
//!     let endpoint = Arc::new(CloudEndpoint::new(settings.endpoint.clone(), session)?);
//!     endpoint
//!         .register_subscriber(
//!             SubscriptionFilter::new("#account-name/#client-id/cmd/#", QoS::AtLeastOnce),
//!             listener_fn(|event| async move {
//!                 if let CloudEvent::MessageArrived(msg) = event {
//!                     log::info!("command on {}", msg.topic);
//!                 }
//!                 Ok(())
//!             }),
//!         )
//!         .await?;
//!
//!     endpoint.connect().await?;
//!     let correlation = endpoint
//!         .publish(CloudMessage::new("#account-name/#client-id/telemetry", "21.5").qos(QoS::AtLeastOnce))
//!         .await?;
//!     log::info!("published, correlation id: {:?}", correlation);
//!     Ok(())
//! }
//! ```

/// Subscriptions and delivery
pub mod delivery; // Delivery confirmation tracking
pub mod endpoint; // Connection state and orchestration
pub mod event; // Listener events and dispatch
pub mod registry; // Topic filter to listener bookkeeping
pub mod session; // Session layer seam

/// Topics and messages
pub mod lifecycle;
pub mod message;
pub mod topic;
pub mod trie;

/// Stack assembly
pub mod stack;
pub mod store;

pub mod error;
pub mod logger;
pub mod types;

pub use cloudlink_conf;
pub use cloudlink_utils;

pub use crate::delivery::{DeliveryTracker, PendingDelivery};
pub use crate::endpoint::CloudEndpoint;
pub use crate::error::{CloudError, Result};
pub use crate::event::{listener_fn, CloudEvent, CloudListener, Listener};
pub use crate::message::{ArrivedMessage, CloudMessage, CloudPayload, PayloadCodec, TopicTemplate};
pub use crate::registry::{Registration, SubscriptionRegistry};
pub use crate::session::{Session, SessionListener};
pub use crate::stack::{CloudConnectionFactory, StackAssembler, StackIdentifier, StackNaming};
pub use crate::store::{ConfigurationStore, MemoryStore, Properties, ServiceDirectory, ServiceInstance};
pub use crate::types::{ConnectionState, MessageId, QoS, SubscriptionFilter};
