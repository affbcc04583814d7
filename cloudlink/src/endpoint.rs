use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use cloudlink_conf::EndpointOptions;
use cloudlink_utils::{format_timestamp_millis, timestamp_millis};

use crate::delivery::DeliveryTracker;
use crate::error::{CloudError, Result};
use crate::event::{dispatch, CloudEvent, Listener, Observers};
use crate::lifecycle::Certificate;
use crate::message::{ArrivedMessage, CloudMessage, CloudPayload, PayloadCodec, TopicTemplate};
use crate::registry::{Registration, SubscriptionRegistry};
use crate::session::{Session, SessionListener};
use crate::topic::Topic;
use crate::types::{ConnectionState, CorrelationId, MessageId, QoS, SubscriptionFilter, TimestampMillis};

struct Inner {
    state: ConnectionState,
    registry: SubscriptionRegistry,
    connected_since: Option<TimestampMillis>,
}

/// Options together with what is derived from them. Replaced as a whole on update.
struct Profile {
    opts: EndpointOptions,
    template: TopicTemplate,
    codec: PayloadCodec,
}

impl Profile {
    fn new(opts: EndpointOptions) -> Result<Self> {
        opts.validate().map_err(|e| CloudError::invalid_argument(e.to_string()))?;
        Ok(Self { template: TopicTemplate::from_options(&opts), codec: PayloadCodec::from_options(&opts), opts })
    }

    /// `<prefix>/<account>/<client id>/#`, once the identity is configured.
    #[inline]
    fn device_filter(&self) -> Option<String> {
        self.template.control_topic("#").ok()
    }
}

/// Owns the subscriptions and delivery tracking of one cloud connection.
///
/// Application code publishes and registers listeners; the session drives the
/// connection state through [`SessionListener`]. Registry changes, the
/// resubscription after a reconnect and state transitions are serialized by
/// one mutex. Listeners are always called with that mutex released, so they
/// may call back into the endpoint.
pub struct CloudEndpoint {
    pid: String,
    profile: RwLock<Arc<Profile>>,
    session: Arc<dyn Session>,
    inner: Mutex<Inner>,
    tracker: DeliveryTracker,
    connection_listeners: Observers,
    birth_published: AtomicBool,
}

impl CloudEndpoint {
    pub fn new(opts: EndpointOptions, session: Arc<dyn Session>) -> Result<Self> {
        let profile = Profile::new(opts)?;
        Ok(Self {
            pid: profile.opts.pid.clone(),
            profile: RwLock::new(Arc::new(profile)),
            session,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                registry: SubscriptionRegistry::default(),
                connected_since: None,
            }),
            tracker: DeliveryTracker::default(),
            connection_listeners: Observers::default(),
            birth_published: AtomicBool::new(false),
        })
    }

    #[inline]
    fn profile(&self) -> Arc<Profile> {
        self.profile.read().clone()
    }

    #[inline]
    pub fn pid(&self) -> &str {
        &self.pid
    }

    #[inline]
    pub fn options(&self) -> EndpointOptions {
        self.profile().opts.clone()
    }

    #[inline]
    pub fn template(&self) -> TopicTemplate {
        self.profile().template.clone()
    }

    /// Replaces the options. The pid cannot change. When connected, the birth
    /// certificate is published again with the new options.
    ///
    /// Filters already registered keep the topics they were expanded to.
    pub async fn update(&self, opts: EndpointOptions) -> Result<()> {
        if opts.pid != self.pid {
            return Err(CloudError::invalid_argument(format!("pid {} can not change to {}", self.pid, opts.pid)));
        }
        let profile = Profile::new(opts)?;
        *self.profile.write() = Arc::new(profile);
        log::info!("{} options updated", self.pid());

        if self.is_connected().await && self.publish_certificate(Certificate::Birth).await {
            self.birth_published.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    #[inline]
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    #[inline]
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Asks the session to connect. The state follows once the session reports back.
    pub async fn connect(&self) -> Result<()> {
        log::info!("{} connecting", self.pid());
        self.session.connect().await.map_err(|e| CloudError::ConnectFailure(anyhow::Error::new(e)))
    }

    pub async fn disconnect(&self) -> Result<()> {
        let quiesce_timeout = self.profile().opts.disconnect_quiesce_timeout;
        log::info!("{} disconnecting, quiesce timeout: {:?}", self.pid(), quiesce_timeout);
        self.session
            .disconnect(quiesce_timeout)
            .await
            .map_err(|e| CloudError::DisconnectFailure(anyhow::Error::new(e)))
    }

    /// Publishes one message. Returns the correlation id for QoS 1 and 2,
    /// `None` for QoS 0.
    pub async fn publish(&self, msg: CloudMessage) -> Result<Option<CorrelationId>> {
        if msg.topic.is_empty() {
            return Err(CloudError::invalid_argument("topic is required"));
        }
        if msg.payload.is_empty() {
            return Err(CloudError::invalid_argument("payload is required"));
        }

        let topic = self.profile().template.resolve(&msg.topic);
        match Topic::from_str(&topic) {
            Ok(t) if t.is_name() => {}
            Ok(_) => return Err(CloudError::invalid_argument(format!("topic {} contains wildcards", topic))),
            Err(e) => return Err(CloudError::invalid_argument(format!("topic {}, {}", topic, e))),
        }

        if self.state().await.is_down() {
            return Err(CloudError::NotConnected);
        }

        log::debug!("{} publish to {}, qos: {}, retain: {}", self.pid(), topic, msg.qos, msg.retain);
        self.tracker
            .track(msg.qos, &topic, self.session.publish(&topic, msg.payload, msg.qos, msg.retain, msg.priority))
            .await
    }

    /// Encodes `payload` the way this endpoint puts payloads on the wire.
    #[inline]
    pub fn encode_payload(&self, payload: &CloudPayload) -> Result<Bytes> {
        self.profile().codec.encode(payload)
    }

    fn expand(&self, mut filter: SubscriptionFilter) -> Result<SubscriptionFilter> {
        let profile = self.profile();
        filter.topic_filter = if filter.is_control {
            profile.template.control_topic(&filter.topic_filter)?
        } else {
            profile.template.resolve(&filter.topic_filter)
        };
        Ok(filter)
    }

    /// Adds `listener` to `filter`. The session subscription is issued when the
    /// filter is new, or its QoS changed, and the connection is up; otherwise
    /// it is made on the next established connection.
    ///
    /// Filters starting with a wildcard, `#` included, do not match topics
    /// under the `$`-prefixed control prefix. Control traffic is received
    /// through [`SubscriptionFilter::control`] filters.
    pub async fn register_subscriber(&self, filter: SubscriptionFilter, listener: Listener) -> Result<Registration> {
        let filter = self.expand(filter)?;
        let mut inner = self.inner.lock().await;
        let reg = inner.registry.register_subscriber(filter.clone(), listener)?;
        log::debug!("{} register subscriber on {}, {:?}", self.pid(), filter, reg);
        if reg.needs_subscribe() && inner.state == ConnectionState::Connected {
            if let Err(e) = self.session.subscribe(&filter.topic_filter, filter.qos).await {
                log::warn!("{} subscribe to {} failed, {}", self.pid(), filter.topic_filter, e);
            }
        }
        Ok(reg)
    }

    /// Removes `listener` from every filter. Each filter left without listeners
    /// is unsubscribed once, whatever the connection state, and returned.
    pub async fn unregister_subscriber(&self, listener: &Listener) -> Vec<SubscriptionFilter> {
        let device_filter = self.profile().device_filter();
        let mut inner = self.inner.lock().await;
        let emptied = inner.registry.unregister_subscriber(listener);
        for filter in emptied.iter() {
            if device_filter.as_deref() == Some(filter.topic_filter.as_str()) {
                log::debug!("{} keeps the device subscription {}", self.pid(), filter.topic_filter);
                continue;
            }
            if let Err(e) = self.session.unsubscribe(&filter.topic_filter).await {
                log::warn!(
                    "{} unsubscribe from {} failed, state: {}, {}",
                    self.pid(),
                    filter.topic_filter,
                    inner.state,
                    e
                );
            }
        }
        emptied
    }

    #[inline]
    pub async fn subscriptions(&self) -> Vec<SubscriptionFilter> {
        self.inner.lock().await.registry.filters()
    }

    #[inline]
    pub fn register_connection_listener(&self, listener: Listener) -> bool {
        self.connection_listeners.add(listener)
    }

    #[inline]
    pub fn unregister_connection_listener(&self, listener: &Listener) -> bool {
        self.connection_listeners.remove(listener)
    }

    #[inline]
    pub fn register_delivery_listener(&self, listener: Listener) -> bool {
        self.tracker.register_listener(listener)
    }

    #[inline]
    pub fn unregister_delivery_listener(&self, listener: &Listener) -> bool {
        self.tracker.unregister_listener(listener)
    }

    #[inline]
    pub async fn pending_deliveries(&self) -> usize {
        self.tracker.pending_count().await
    }

    pub async fn info(&self) -> BTreeMap<String, String> {
        let mut info = self.session.info();
        let inner = self.inner.lock().await;
        info.insert("pid".into(), self.pid.clone());
        info.insert("state".into(), inner.state.to_string());
        if let Some(t) = inner.connected_since {
            info.insert("connected_since".into(), format_timestamp_millis(t));
        }
        info.insert("subscriptions".into(), inner.registry.len().to_string());
        drop(inner);
        info.insert("pending_deliveries".into(), self.pending_deliveries().await.to_string());
        info
    }

    async fn set_state(&self, state: ConnectionState) -> ConnectionState {
        let mut inner = self.inner.lock().await;
        let prev = inner.state;
        inner.state = state;
        if state != ConnectionState::Connected {
            inner.connected_since = None;
        }
        prev
    }

    /// Certificates go straight to the session. Their confirmations are
    /// not tracked and never reach delivery listeners.
    async fn publish_certificate(&self, cert: Certificate) -> bool {
        let profile = self.profile();
        if profile.opts.lifecycle_certs_disabled {
            return false;
        }
        let msg = match cert.message(&profile.template, &profile.opts) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("{} {} certificate not published, {}", self.pid(), cert.name(), e);
                return false;
            }
        };
        match self.session.publish(&msg.topic, msg.payload, msg.qos, msg.retain, msg.priority).await {
            Ok(id) => {
                log::info!(
                    "{} {} certificate published to {}, message id: {}",
                    self.pid(),
                    cert.name(),
                    msg.topic,
                    id
                );
                true
            }
            Err(e) => {
                log::error!("{} publish {} certificate failed, {}", self.pid(), cert.name(), e);
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl SessionListener for CloudEndpoint {
    async fn on_connecting(&self) {
        let prev = self.set_state(ConnectionState::Connecting).await;
        log::info!("{} {} -> connecting", self.pid(), prev);
    }

    async fn on_connection_established(&self) {
        let device_filter = self.profile().device_filter();
        {
            let mut inner = self.inner.lock().await;
            log::info!("{} {} -> connected", self.pid(), inner.state);
            inner.state = ConnectionState::Connected;
            inner.connected_since = Some(timestamp_millis());
            for filter in inner.registry.filters() {
                if let Err(e) = self.session.subscribe(&filter.topic_filter, filter.qos).await {
                    log::warn!("{} resubscribe to {} failed, {}", self.pid(), filter.topic_filter, e);
                }
            }
            match device_filter {
                Some(filter) if !inner.registry.contains(&filter) => {
                    if let Err(e) = self.session.subscribe(&filter, QoS::AtLeastOnce).await {
                        log::warn!("{} device subscription to {} failed, {}", self.pid(), filter, e);
                    }
                }
                Some(_) => {}
                None => log::debug!("{} no device subscription, identity not configured", self.pid()),
            }
        }

        if !self.birth_published.load(Ordering::SeqCst) || self.profile().opts.republish_birth_on_reconnect {
            let published = self.publish_certificate(Certificate::Birth).await;
            self.birth_published.fetch_or(published, Ordering::SeqCst);
        }

        self.connection_listeners.dispatch(&CloudEvent::ConnectionEstablished).await;
    }

    async fn on_disconnecting(&self) {
        let prev = self.set_state(ConnectionState::Disconnecting).await;
        log::info!("{} {} -> disconnecting", self.pid(), prev);
        self.publish_certificate(Certificate::Disconnect).await;
        self.birth_published.store(false, Ordering::SeqCst);
    }

    async fn on_disconnected(&self) {
        let prev = self.set_state(ConnectionState::Disconnected).await;
        log::info!("{} {} -> disconnected", self.pid(), prev);
        self.connection_listeners.dispatch(&CloudEvent::Disconnected).await;
    }

    async fn on_connection_lost(&self, cause: String) {
        let prev = self.set_state(ConnectionState::Disconnected).await;
        log::warn!("{} {} -> disconnected, connection lost, {}", self.pid(), prev, cause);
        self.connection_listeners.dispatch(&CloudEvent::ConnectionLost { cause }).await;
    }

    async fn on_message_arrived(&self, topic: &str, payload: Bytes, qos: QoS, retained: bool) {
        let t = match Topic::from_str(topic) {
            Ok(t) if t.is_name() => t,
            Ok(_) => {
                log::warn!("{} dropped message with wildcard topic {}", self.pid(), topic);
                return;
            }
            Err(e) => {
                log::warn!("{} dropped message with invalid topic {}, {}", self.pid(), topic, e);
                return;
            }
        };

        let listeners = self.inner.lock().await.registry.matching_listeners(&t);
        if listeners.is_empty() {
            log::debug!("{} no subscriber for {}", self.pid(), topic);
            return;
        }

        let profile = self.profile();
        let msg = ArrivedMessage {
            topic: topic.to_owned(),
            payload: profile.codec.decode(payload),
            qos,
            retained,
            control: profile.template.is_control(topic),
        };
        log::debug!("{} message arrived on {}, {} listener(s)", self.pid(), topic, listeners.len());
        dispatch(&listeners, &CloudEvent::MessageArrived(msg)).await;
    }

    async fn on_message_confirmed(&self, id: MessageId, topic: &str) {
        self.tracker.confirm(id, topic).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::time::Duration;

    use cloudlink_conf::PayloadEncoding;

    use super::*;
    use crate::event::tests::{Failing, Panicking, Recorder};
    use crate::event::CloudListener;
    use crate::session::mock::MockSession;

    fn endpoint_with(opts: EndpointOptions) -> (Arc<MockSession>, CloudEndpoint) {
        let session = Arc::new(MockSession::default());
        let endpoint = CloudEndpoint::new(opts, session.clone()).unwrap();
        (session, endpoint)
    }

    fn setup() -> (Arc<MockSession>, CloudEndpoint) {
        endpoint_with(EndpointOptions { lifecycle_certs_disabled: true, ..Default::default() })
    }

    fn identified() -> EndpointOptions {
        EndpointOptions { account_name: "acme".into(), client_id: "gw-01".into(), ..Default::default() }
    }

    async fn connected() -> (Arc<MockSession>, CloudEndpoint) {
        let (session, endpoint) = setup();
        session.set_connected(true);
        endpoint.on_connection_established().await;
        session.clear();
        (session, endpoint)
    }

    #[tokio::test]
    async fn test_publish_arguments() {
        let (session, endpoint) = setup();
        let err = endpoint.publish(CloudMessage::new("a/b", Bytes::new())).await.unwrap_err();
        assert!(err.is_invalid_argument());
        let err = endpoint.publish(CloudMessage::new("", "x")).await.unwrap_err();
        assert!(err.is_invalid_argument());
        let err = endpoint.publish(CloudMessage::new("a/+", "x")).await.unwrap_err();
        assert!(err.is_invalid_argument());

        let err = endpoint.publish(CloudMessage::new("a/b", "x")).await.unwrap_err();
        assert!(err.is_not_connected());
        assert!(session.calls().is_empty());
        assert_eq!(endpoint.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_not_connected_while_disconnecting() {
        let (_session, endpoint) = connected().await;
        endpoint.on_disconnecting().await;
        let err = endpoint.publish(CloudMessage::new("a/b", "x")).await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_qos0_has_no_correlation() {
        let (session, endpoint) = connected().await;
        let c = endpoint.publish(CloudMessage::new("a/b", "x")).await.unwrap();
        assert_eq!(c, None);
        assert_eq!(endpoint.pending_deliveries().await, 0);
        assert_eq!(session.publishes().len(), 1);
    }

    #[tokio::test]
    async fn test_qos_correlation_round_trip() {
        let (session, endpoint) = connected().await;
        let d1 = Recorder::new();
        let d2 = Recorder::new();
        endpoint.register_delivery_listener(d1.clone());
        endpoint.register_delivery_listener(d2.clone());

        let c = endpoint.publish(CloudMessage::new("a/b", "x").qos(QoS::AtLeastOnce)).await.unwrap();
        let id = session.last_id();
        assert_eq!(c, Some(id.to_string()));
        assert_eq!(endpoint.pending_deliveries().await, 1);

        endpoint.on_message_confirmed(id, "a/b").await;
        assert_eq!(d1.count(), 1);
        assert_eq!(d2.count(), 1);
        match &d1.events()[0] {
            CloudEvent::MessageConfirmed { correlation_id, .. } => assert_eq!(Some(correlation_id.clone()), c),
            e => panic!("unexpected event {:?}", e),
        }

        endpoint.on_message_confirmed(id, "a/b").await;
        assert_eq!(d1.count(), 1);
        assert_eq!(d2.count(), 1);
        assert_eq!(endpoint.pending_deliveries().await, 0);
    }

    #[tokio::test]
    async fn test_publish_session_failure() {
        let (session, endpoint) = connected().await;
        session.fail_publish.store(true, Ordering::SeqCst);
        assert!(endpoint.publish(CloudMessage::new("a/b", "x").qos(QoS::AtLeastOnce)).await.is_err());
        assert_eq!(endpoint.pending_deliveries().await, 0);
    }

    #[tokio::test]
    async fn test_reconnect_resubscription() {
        let (session, endpoint) = setup();
        let l1: Listener = Recorder::new();
        endpoint.register_subscriber(SubscriptionFilter::new("F1", QoS::AtMostOnce), l1.clone()).await.unwrap();
        endpoint.register_subscriber(SubscriptionFilter::new("F2/#", QoS::AtLeastOnce), l1.clone()).await.unwrap();
        //deferred while disconnected
        assert!(session.subscribes().is_empty());

        endpoint.on_connection_established().await;
        let mut subs = session.subscribes();
        subs.sort();
        assert_eq!(subs, vec![("F1".to_string(), QoS::AtMostOnce), ("F2/#".to_string(), QoS::AtLeastOnce)]);
        assert!(session.unsubscribes().is_empty());

        //lost and back again
        session.clear();
        endpoint.on_connection_lost("keepalive timeout".into()).await;
        assert_eq!(endpoint.subscriptions().await.len(), 2);
        endpoint.on_connection_established().await;
        assert_eq!(session.subscribes().len(), 2);
        assert!(session.unsubscribes().is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_failure_continues() {
        let (session, endpoint) = setup();
        let l1: Listener = Recorder::new();
        for f in ["A", "B", "C"] {
            endpoint.register_subscriber(SubscriptionFilter::new(f, QoS::AtMostOnce), l1.clone()).await.unwrap();
        }
        session.fail_subscribe("B");
        let c = Recorder::new();
        endpoint.register_connection_listener(c.clone());

        endpoint.on_connection_established().await;
        assert_eq!(session.subscribes().len(), 3);
        assert_eq!(endpoint.state().await, ConnectionState::Connected);
        assert_eq!(c.count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_while_connected() {
        let (session, endpoint) = connected().await;
        let l1: Listener = Recorder::new();
        let l2: Listener = Recorder::new();
        let f = SubscriptionFilter::new("F", QoS::AtMostOnce);

        assert_eq!(endpoint.register_subscriber(f.clone(), l1.clone()).await.unwrap(), Registration::Created);
        assert_eq!(endpoint.register_subscriber(f.clone(), l2.clone()).await.unwrap(), Registration::Added);
        assert_eq!(session.subscribes().len(), 1);

        //qos change re-subscribes once at the new level
        let reg = endpoint.register_subscriber(SubscriptionFilter::new("F", QoS::ExactlyOnce), l2.clone()).await;
        assert_eq!(reg.unwrap(), Registration::QosChanged);
        assert_eq!(session.subscribes().last(), Some(&("F".to_string(), QoS::ExactlyOnce)));
        assert_eq!(session.subscribes().len(), 2);
    }

    #[tokio::test]
    async fn test_reference_counting() {
        let (session, endpoint) = connected().await;
        let l1: Listener = Recorder::new();
        let l2: Listener = Recorder::new();
        let f = SubscriptionFilter::new("F", QoS::AtMostOnce);
        endpoint.register_subscriber(f.clone(), l1.clone()).await.unwrap();
        endpoint.register_subscriber(f.clone(), l2.clone()).await.unwrap();

        assert!(endpoint.unregister_subscriber(&l1).await.is_empty());
        assert!(session.unsubscribes().is_empty());

        assert_eq!(endpoint.unregister_subscriber(&l2).await, vec![f]);
        assert_eq!(session.unsubscribes(), vec!["F".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected() {
        let (session, endpoint) = connected().await;
        let l1: Listener = Recorder::new();
        let err =
            endpoint.register_subscriber(SubscriptionFilter::new("a/#/b", QoS::AtMostOnce), l1).await.unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(session.calls().is_empty());
        assert!(endpoint.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out() {
        let (_session, endpoint) = connected().await;
        let l1 = Recorder::new();
        let l2 = Recorder::new();
        let other = Recorder::new();
        let f = SubscriptionFilter::new("A/+/C", QoS::AtMostOnce);
        endpoint.register_subscriber(f.clone(), l1.clone()).await.unwrap();
        endpoint.register_subscriber(f.clone(), l2.clone()).await.unwrap();
        endpoint.register_subscriber(SubscriptionFilter::new("A/C", QoS::AtMostOnce), other.clone()).await.unwrap();

        endpoint.on_message_arrived("A/B/C", Bytes::from_static(b"hello"), QoS::AtMostOnce, false).await;
        assert_eq!(l1.count(), 1);
        assert_eq!(l2.count(), 1);
        assert_eq!(other.count(), 0);

        match &l1.events()[0] {
            CloudEvent::MessageArrived(m) => {
                assert_eq!(m.topic, "A/B/C");
                assert_eq!(m.payload.body, Some(Bytes::from_static(b"hello")));
                assert!(!m.control);
            }
            e => panic!("unexpected event {:?}", e),
        }

        //a wildcard topic is never delivered
        endpoint.on_message_arrived("A/+/C", Bytes::from_static(b"x"), QoS::AtMostOnce, false).await;
        assert_eq!(l1.count(), 1);
    }

    #[tokio::test]
    async fn test_listener_isolation() {
        let (_session, endpoint) = connected().await;
        let good = Recorder::new();
        let f = SubscriptionFilter::new("A/#", QoS::AtMostOnce);
        endpoint.register_subscriber(f.clone(), Arc::new(Failing)).await.unwrap();
        endpoint.register_subscriber(f.clone(), Arc::new(Panicking)).await.unwrap();
        endpoint.register_subscriber(SubscriptionFilter::new("A/B", QoS::AtMostOnce), good.clone()).await.unwrap();

        endpoint.on_message_arrived("A/B", Bytes::from_static(b"x"), QoS::AtMostOnce, false).await;
        assert_eq!(good.count(), 1);

        let c = Recorder::new();
        endpoint.register_connection_listener(Arc::new(Panicking));
        endpoint.register_connection_listener(c.clone());
        endpoint.on_connection_lost("reset".into()).await;
        assert_eq!(c.count(), 1);
    }

    struct SelfRemoving {
        endpoint: Weak<CloudEndpoint>,
        me: Weak<SelfRemoving>,
        hits: Recorder,
    }

    #[async_trait::async_trait]
    impl CloudListener for SelfRemoving {
        async fn on_event(&self, event: &CloudEvent) -> anyhow::Result<()> {
            self.hits.on_event(event).await?;
            let endpoint = self.endpoint.upgrade().ok_or_else(|| anyhow::anyhow!("endpoint gone"))?;
            let me: Listener = self.me.upgrade().ok_or_else(|| anyhow::anyhow!("listener gone"))?;
            endpoint.unregister_subscriber(&me).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reentrant_unregister() {
        let (session, endpoint) = connected().await;
        let endpoint = Arc::new(endpoint);
        let listener = Arc::new_cyclic(|me| SelfRemoving {
            endpoint: Arc::downgrade(&endpoint),
            me: me.clone(),
            hits: Recorder::default(),
        });
        endpoint.register_subscriber(SubscriptionFilter::new("A/B", QoS::AtMostOnce), listener.clone()).await.unwrap();

        endpoint.on_message_arrived("A/B", Bytes::from_static(b"x"), QoS::AtMostOnce, false).await;
        assert_eq!(listener.hits.count(), 1);
        assert_eq!(session.unsubscribes(), vec!["A/B".to_string()]);

        endpoint.on_message_arrived("A/B", Bytes::from_static(b"x"), QoS::AtMostOnce, false).await;
        assert_eq!(listener.hits.count(), 1);
    }

    #[tokio::test]
    async fn test_state_machine_events() {
        let (session, endpoint) = setup();
        let c = Recorder::new();
        endpoint.register_connection_listener(c.clone());

        endpoint.connect().await.unwrap();
        //state only follows session callbacks
        assert_eq!(endpoint.state().await, ConnectionState::Disconnected);
        endpoint.on_connecting().await;
        assert_eq!(endpoint.state().await, ConnectionState::Connecting);
        endpoint.on_connection_established().await;
        assert!(endpoint.is_connected().await);
        assert!(endpoint.info().await.contains_key("connected_since"));

        endpoint.on_connection_lost("broker reset".into()).await;
        assert_eq!(endpoint.state().await, ConnectionState::Disconnected);

        endpoint.on_connection_established().await;
        endpoint.disconnect().await.unwrap();
        endpoint.on_disconnecting().await;
        assert_eq!(endpoint.state().await, ConnectionState::Disconnecting);
        endpoint.on_disconnected().await;
        assert_eq!(endpoint.state().await, ConnectionState::Disconnected);

        let names: Vec<&str> = c.events().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["connection_established", "connection_lost", "connection_established", "disconnected"]
        );
        match &c.events()[1] {
            CloudEvent::ConnectionLost { cause } => assert_eq!(cause, "broker reset"),
            e => panic!("unexpected event {:?}", e),
        }
        assert!(session.calls().contains(&crate::session::mock::Call::Disconnect(
            endpoint.options().disconnect_quiesce_timeout
        )));

        let info = endpoint.info().await;
        assert_eq!(info.get("state").map(String::as_str), Some("disconnected"));
        assert_eq!(info.get("broker").map(String::as_str), Some("mock://localhost"));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let (session, endpoint) = setup();
        session.fail_connect.store(true, Ordering::SeqCst);
        assert!(matches!(endpoint.connect().await, Err(CloudError::ConnectFailure(_))));
        assert_eq!(endpoint.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_control_subscription() {
        let (session, endpoint) = endpoint_with(EndpointOptions { lifecycle_certs_disabled: true, ..identified() });
        let l = Recorder::new();
        endpoint.register_subscriber(SubscriptionFilter::control("cmd/#", QoS::AtLeastOnce), l.clone()).await.unwrap();
        endpoint.on_connection_established().await;
        assert_eq!(
            session.subscribes(),
            vec![
                ("$EDC/acme/gw-01/cmd/#".to_string(), QoS::AtLeastOnce),
                ("$EDC/acme/gw-01/#".to_string(), QoS::AtLeastOnce)
            ]
        );

        let reboot = Bytes::from_static(b"{}");
        endpoint.on_message_arrived("$EDC/acme/gw-01/cmd/reboot", reboot, QoS::AtLeastOnce, false).await;
        match &l.events()[0] {
            CloudEvent::MessageArrived(m) => assert!(m.control),
            e => panic!("unexpected event {:?}", e),
        }

        //a control filter needs the identity to be configured
        let (_session, anonymous) = setup();
        let err = anonymous
            .register_subscriber(SubscriptionFilter::control("cmd/#", QoS::AtLeastOnce), l.clone())
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn test_lifecycle_certificates() {
        let opts = EndpointOptions { republish_birth_on_reconnect: false, ..identified() };
        let (session, endpoint) = endpoint_with(opts);
        endpoint.on_connection_established().await;
        let births = session.publishes();
        assert_eq!(births.len(), 1);
        assert_eq!(births[0].0, "$EDC/acme/gw-01/MQTT/BIRTH");

        //not republished after a lost connection
        endpoint.on_connection_lost("reset".into()).await;
        endpoint.on_connection_established().await;
        assert_eq!(session.publishes().len(), 1);

        endpoint.on_disconnecting().await;
        let publishes = session.publishes();
        assert_eq!(publishes.len(), 2);
        assert_eq!(publishes[1].0, "$EDC/acme/gw-01/MQTT/DC");
        endpoint.on_disconnected().await;

        //a graceful disconnect resets the birth
        endpoint.on_connection_established().await;
        assert_eq!(session.publishes().len(), 3);
    }

    #[tokio::test]
    async fn test_raw_payload_encoding() {
        let (_session, endpoint) =
            endpoint_with(EndpointOptions { payload_encoding: PayloadEncoding::Raw, ..Default::default() });
        let l = Recorder::new();
        endpoint.register_subscriber(SubscriptionFilter::new("t", QoS::AtMostOnce), l.clone()).await.unwrap();
        let body = Bytes::from_static(br#"{"metrics":{"a":1}}"#);
        endpoint.on_message_arrived("t", body.clone(), QoS::AtMostOnce, true).await;
        match &l.events()[0] {
            CloudEvent::MessageArrived(m) => {
                assert_eq!(m.payload.body, Some(body));
                assert!(m.retained);
            }
            e => panic!("unexpected event {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_while_disconnected() {
        let (session, endpoint) = connected().await;
        let l: Listener = Recorder::new();
        endpoint.register_subscriber(SubscriptionFilter::new("F", QoS::AtLeastOnce), l.clone()).await.unwrap();
        endpoint.on_connection_lost("reset".into()).await;

        assert_eq!(endpoint.unregister_subscriber(&l).await.len(), 1);
        assert_eq!(session.unsubscribes(), vec!["F".to_string()]);

        //nothing left to restore
        session.clear();
        endpoint.on_connection_established().await;
        assert!(session.subscribes().is_empty());
        assert!(session.unsubscribes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_during_resubscribe() {
        let (session, endpoint) = setup();
        let endpoint = Arc::new(endpoint);
        let l: Listener = Recorder::new();
        endpoint.register_subscriber(SubscriptionFilter::new("A", QoS::AtMostOnce), l.clone()).await.unwrap();
        let (entered, release) = session.hold_subscribe("A");

        let reconnect = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.on_connection_established().await }
        });
        entered.notified().await;

        let register = tokio::spawn({
            let endpoint = endpoint.clone();
            let l = l.clone();
            async move { endpoint.register_subscriber(SubscriptionFilter::new("B", QoS::AtLeastOnce), l).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        //waits for the resubscribe loop
        assert!(!register.is_finished());

        release.notify_one();
        reconnect.await.unwrap();
        assert_eq!(register.await.unwrap().unwrap(), Registration::Created);

        let subs = session.subscribes();
        assert_eq!(subs.iter().filter(|(f, _)| f == "A").count(), 1);
        assert_eq!(subs.iter().filter(|(f, _)| f == "B").count(), 1);
        assert_eq!(endpoint.subscriptions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_certificates_are_not_tracked() {
        let (session, endpoint) = endpoint_with(EndpointOptions { lifecycle_qos: 1, ..identified() });
        let d = Recorder::new();
        endpoint.register_delivery_listener(d.clone());

        endpoint.on_connection_established().await;
        assert_eq!(session.publishes()[0].2, QoS::AtLeastOnce);
        assert_eq!(endpoint.pending_deliveries().await, 0);
        endpoint.on_message_confirmed(session.last_id(), "$EDC/acme/gw-01/MQTT/BIRTH").await;
        assert_eq!(d.count(), 0);

        let c = endpoint.publish(CloudMessage::new("a/b", "x").qos(QoS::AtLeastOnce)).await.unwrap();
        endpoint.on_message_confirmed(session.last_id(), "a/b").await;
        assert_eq!(d.count(), 1);
        match &d.events()[0] {
            CloudEvent::MessageConfirmed { correlation_id, topic } => {
                assert_eq!(Some(correlation_id.clone()), c);
                assert_eq!(topic, "a/b");
            }
            e => panic!("unexpected event {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_device_subscription() {
        let (session, endpoint) = endpoint_with(EndpointOptions { lifecycle_certs_disabled: true, ..identified() });
        endpoint.on_connection_established().await;
        assert_eq!(session.subscribes(), vec![("$EDC/acme/gw-01/#".to_string(), QoS::AtLeastOnce)]);

        //made on every connection
        endpoint.on_connection_lost("reset".into()).await;
        endpoint.on_connection_established().await;
        assert_eq!(session.subscribes().len(), 2);

        //outlives the last listener registered on the same filter
        let l: Listener = Recorder::new();
        endpoint.register_subscriber(SubscriptionFilter::control("#", QoS::AtLeastOnce), l.clone()).await.unwrap();
        assert_eq!(endpoint.unregister_subscriber(&l).await.len(), 1);
        assert!(session.unsubscribes().is_empty());

        let (session, anonymous) = setup();
        anonymous.on_connection_established().await;
        assert!(session.subscribes().is_empty());
    }

    #[tokio::test]
    async fn test_update_republishes_birth() {
        let (session, endpoint) = endpoint_with(identified());
        endpoint.update(EndpointOptions { client_id: "gw-02".into(), ..identified() }).await.unwrap();
        assert!(session.publishes().is_empty());

        endpoint.on_connection_established().await;
        assert_eq!(session.publishes()[0].0, "$EDC/acme/gw-02/MQTT/BIRTH");

        endpoint.update(identified()).await.unwrap();
        let publishes = session.publishes();
        assert_eq!(publishes.len(), 2);
        assert_eq!(publishes[1].0, "$EDC/acme/gw-01/MQTT/BIRTH");
        assert_eq!(endpoint.template().control_topic("x").unwrap(), "$EDC/acme/gw-01/x");

        let err = endpoint.update(EndpointOptions { pid: "other".into(), ..identified() }).await.unwrap_err();
        assert!(err.is_invalid_argument());
        let err = endpoint.update(EndpointOptions { topic_separator: ".".into(), ..identified() }).await.unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(session.publishes().len(), 2);
        assert_eq!(endpoint.options().client_id, "gw-01");
    }

    #[tokio::test]
    async fn test_invalid_options() {
        let session: Arc<dyn Session> = Arc::new(MockSession::default());
        let opts = EndpointOptions { topic_separator: ".".into(), ..Default::default() };
        let res = CloudEndpoint::new(opts, session.clone());
        assert!(matches!(res, Err(e) if e.is_invalid_argument()));
        let res = CloudEndpoint::new(EndpointOptions { lifecycle_qos: 3, ..Default::default() }, session);
        assert!(matches!(res, Err(e) if e.is_invalid_argument()));
    }

    #[tokio::test]
    async fn test_gzip_payloads() {
        let (session, endpoint) = endpoint_with(EndpointOptions { encode_gzip: true, ..identified() });
        endpoint.on_connection_established().await;
        assert!(crate::message::is_gzip(&session.publishes()[0].1));

        let l = Recorder::new();
        endpoint.register_subscriber(SubscriptionFilter::new("t", QoS::AtMostOnce), l.clone()).await.unwrap();
        let payload = CloudPayload::with_body("hello").metric("temperature", 21.5);
        let wire = endpoint.encode_payload(&payload).unwrap();
        assert!(crate::message::is_gzip(&wire));

        endpoint.on_message_arrived("t", wire, QoS::AtMostOnce, false).await;
        match &l.events()[0] {
            CloudEvent::MessageArrived(m) => assert_eq!(m.payload, payload),
            e => panic!("unexpected event {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_hash_skips_control_topics() {
        let (_session, endpoint) = endpoint_with(EndpointOptions { lifecycle_certs_disabled: true, ..identified() });
        let all = Recorder::new();
        let control = Recorder::new();
        endpoint.register_subscriber(SubscriptionFilter::new("#", QoS::AtMostOnce), all.clone()).await.unwrap();
        endpoint.register_subscriber(SubscriptionFilter::control("#", QoS::AtLeastOnce), control.clone()).await.unwrap();

        endpoint.on_message_arrived("$EDC/acme/gw-01/cmd", Bytes::from_static(b"x"), QoS::AtLeastOnce, false).await;
        assert_eq!(all.count(), 0);
        assert_eq!(control.count(), 1);

        endpoint.on_message_arrived("acme/telemetry", Bytes::from_static(b"x"), QoS::AtMostOnce, false).await;
        assert_eq!(all.count(), 1);
        assert_eq!(control.count(), 1);
    }
}
