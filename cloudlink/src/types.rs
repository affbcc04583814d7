use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CloudError;

pub use cloudlink_utils::{Timestamp, TimestampMillis};

/// Identifier the session assigns to an outgoing message.
pub type MessageId = u32;

/// Opaque token handed to the publisher and echoed back on confirmation.
pub type CorrelationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Messages at this level are confirmed by the broker.
    #[inline]
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, QoS::AtMostOnce)
    }
}

impl TryFrom<u8> for QoS {
    type Error = CloudError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(CloudError::invalid_argument(format!("invalid qos {}", v))),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Publishing is refused in these states.
    #[inline]
    pub fn is_down(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Disconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// A registered subscription as the session sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionFilter {
    pub topic_filter: String,
    pub qos: QoS,
    /// The filter lives under the control prefix.
    pub is_control: bool,
}

impl SubscriptionFilter {
    #[inline]
    pub fn new<T: Into<String>>(topic_filter: T, qos: QoS) -> Self {
        Self { topic_filter: topic_filter.into(), qos, is_control: false }
    }

    #[inline]
    pub fn control<T: Into<String>>(topic_filter: T, qos: QoS) -> Self {
        Self { topic_filter: topic_filter.into(), qos, is_control: true }
    }
}

impl fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(qos:{}, control:{})", self.topic_filter, self.qos, self.is_control)
    }
}
