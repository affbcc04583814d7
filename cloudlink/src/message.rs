use std::collections::BTreeMap;
use std::io::{Read, Write};

use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cloudlink_conf::{EndpointOptions, PayloadEncoding};

use crate::error::{CloudError, Result};
use crate::store::Properties;
use crate::types::{QoS, TimestampMillis};

pub const PROP_TOPIC: &str = "topic";
pub const PROP_QOS: &str = "qos";
pub const PROP_RETAIN: &str = "retain";
pub const PROP_PRIORITY: &str = "priority";

/// An outgoing application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub priority: u8,
}

impl CloudMessage {
    #[inline]
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self { topic: topic.into(), payload: payload.into(), qos: QoS::AtMostOnce, retain: false, priority: 0 }
    }

    #[inline]
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Builds a message from publish properties. `topic` is required; `qos`,
    /// `retain` and `priority` default to 0, false and 0.
    pub fn from_properties(props: &Properties, payload: Bytes) -> Result<Self> {
        let topic = props
            .get(PROP_TOPIC)
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CloudError::invalid_argument("topic property is required"))?;

        let qos = match props.get(PROP_QOS) {
            None => QoS::AtMostOnce,
            Some(v) => v
                .as_u64()
                .and_then(|q| u8::try_from(q).ok())
                .ok_or_else(|| CloudError::invalid_argument(format!("invalid qos property {}", v)))
                .and_then(QoS::try_from)?,
        };

        let retain = match props.get(PROP_RETAIN) {
            None => false,
            Some(v) => {
                v.as_bool().ok_or_else(|| CloudError::invalid_argument(format!("invalid retain property {}", v)))?
            }
        };

        let priority = match props.get(PROP_PRIORITY) {
            None => 0,
            Some(v) => v
                .as_u64()
                .and_then(|p| u8::try_from(p).ok())
                .ok_or_else(|| CloudError::invalid_argument(format!("invalid priority property {}", v)))?,
        };

        Ok(Self { topic: topic.to_owned(), payload, qos, retain, priority })
    }
}

mod body_base64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Bytes>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match body {
            Some(b) => s.serialize_some(&BASE64_STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Bytes>, D::Error> {
        let body: Option<String> = Option::deserialize(d)?;
        body.map(|b| BASE64_STANDARD.decode(b).map(Bytes::from).map_err(serde::de::Error::custom)).transpose()
    }
}

/// Structured payload: a timestamp, named metrics and an opaque body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TimestampMillis>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "body_base64")]
    pub body: Option<Bytes>,
}

impl CloudPayload {
    #[inline]
    pub fn with_body<B: Into<Bytes>>(body: B) -> Self {
        Self { body: Some(body.into()), ..Default::default() }
    }

    #[inline]
    pub fn metric<K: Into<String>, V: Into<Value>>(mut self, name: K, value: V) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    #[inline]
    pub fn timestamp(mut self, t: TimestampMillis) -> Self {
        self.timestamp = Some(t);
        self
    }

    pub fn encode(&self, encoding: PayloadEncoding) -> Result<Bytes> {
        match encoding {
            PayloadEncoding::SimpleJson => Ok(Bytes::from(serde_json::to_vec(self)?)),
            PayloadEncoding::Raw => Ok(self.body.clone().unwrap_or_default()),
        }
    }

    /// Decodes a structured payload; anything else becomes the body as is.
    pub fn decode(payload: &Bytes) -> Self {
        match serde_json::from_slice::<CloudPayload>(payload) {
            Ok(p) => p,
            Err(e) => {
                log::trace!("payload is not structured, {}", e);
                Self::with_body(payload.clone())
            }
        }
    }
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Wire form of [`CloudPayload`]: the configured encoding, optionally gzipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadCodec {
    pub encoding: PayloadEncoding,
    pub gzip: bool,
}

impl PayloadCodec {
    #[inline]
    pub fn from_options(opts: &EndpointOptions) -> Self {
        Self { encoding: opts.payload_encoding, gzip: opts.encode_gzip }
    }

    pub fn encode(&self, payload: &CloudPayload) -> Result<Bytes> {
        let data = payload.encode(self.encoding)?;
        if self.gzip {
            gzip(&data)
        } else {
            Ok(data)
        }
    }

    /// Compressed input is gunzipped first when the codec gzips or decodes
    /// structured payloads. Raw payloads are otherwise left untouched.
    pub fn decode(&self, payload: Bytes) -> CloudPayload {
        let payload = if (self.gzip || self.encoding == PayloadEncoding::SimpleJson) && is_gzip(&payload) {
            match gunzip(&payload) {
                Ok(data) => data,
                Err(e) => {
                    log::debug!("gzip payload can not be decompressed, {}", e);
                    payload
                }
            }
        } else {
            payload
        };

        match self.encoding {
            PayloadEncoding::SimpleJson => CloudPayload::decode(&payload),
            PayloadEncoding::Raw => CloudPayload::with_body(payload),
        }
    }
}

#[inline]
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

fn gzip(data: &[u8]) -> Result<Bytes> {
    use flate2::write::GzEncoder;
    let mut e = GzEncoder::new(Vec::new(), flate2::Compression::default());
    e.write_all(data).map_err(anyhow::Error::new)?;
    Ok(Bytes::from(e.finish().map_err(anyhow::Error::new)?))
}

fn gunzip(data: &[u8]) -> std::io::Result<Bytes> {
    use flate2::bufread::GzDecoder;
    let mut d = GzDecoder::new(data);
    let mut buf = Vec::new();
    d.read_to_end(&mut buf)?;
    Ok(Bytes::from(buf))
}

/// A message delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivedMessage {
    pub topic: String,
    pub payload: CloudPayload,
    pub qos: QoS,
    pub retained: bool,
    /// Arrived under the control prefix.
    pub control: bool,
}

/// Expands account and client-id tokens and builds control topics.
#[derive(Debug, Clone)]
pub struct TopicTemplate {
    separator: String,
    account_token: String,
    client_id_token: String,
    control_prefix: String,
    account_name: String,
    client_id: String,
}

impl TopicTemplate {
    pub fn from_options(opts: &EndpointOptions) -> Self {
        Self {
            separator: opts.topic_separator.clone(),
            account_token: opts.topic_account_token.clone(),
            client_id_token: opts.topic_client_id_token.clone(),
            control_prefix: opts.topic_control_prefix.clone(),
            account_name: opts.account_name.clone(),
            client_id: opts.client_id.clone(),
        }
    }

    /// Substitutes the tokens whose value is configured.
    pub fn resolve(&self, topic: &str) -> String {
        let mut topic = topic.to_owned();
        if !self.account_name.is_empty() {
            topic = topic.replace(&self.account_token, &self.account_name);
        }
        if !self.client_id.is_empty() {
            topic = topic.replace(&self.client_id_token, &self.client_id);
        }
        topic
    }

    /// `<prefix>/<account>/<client id>/<app_topic>`.
    pub fn control_topic(&self, app_topic: &str) -> Result<String> {
        if self.account_name.is_empty() || self.client_id.is_empty() {
            return Err(CloudError::invalid_argument(
                "control topics need both account name and client id configured",
            ));
        }
        let sep = &self.separator;
        Ok(format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.control_prefix,
            self.account_name,
            self.client_id,
            self.resolve(app_topic)
        ))
    }

    #[inline]
    pub fn is_control(&self, topic: &str) -> bool {
        topic
            .strip_prefix(self.control_prefix.as_str())
            .map(|rest| rest.is_empty() || rest.starts_with(self.separator.as_str()))
            .unwrap_or(false)
    }
}
