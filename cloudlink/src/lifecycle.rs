use cloudlink_conf::{EndpointOptions, PayloadEncoding};
use cloudlink_utils::timestamp_millis;

use crate::error::Result;
use crate::message::{CloudMessage, CloudPayload, PayloadCodec, TopicTemplate};
use crate::types::QoS;

/// Certificates announcing that an endpoint came up or is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Certificate {
    Birth,
    Disconnect,
}

impl Certificate {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Certificate::Birth => "birth",
            Certificate::Disconnect => "disconnect",
        }
    }

    pub fn topic(&self, template: &TopicTemplate, opts: &EndpointOptions) -> Result<String> {
        match self {
            Certificate::Birth => template.control_topic(&opts.topic_birth_suffix),
            Certificate::Disconnect => template.control_topic(&opts.topic_disconnect_suffix),
        }
    }

    pub fn payload(&self, opts: &EndpointOptions) -> CloudPayload {
        CloudPayload::default()
            .timestamp(timestamp_millis())
            .metric("endpoint_pid", opts.pid.as_str())
            .metric("account_name", opts.account_name.as_str())
            .metric("client_id", opts.client_id.as_str())
            .metric("event", self.name())
    }

    /// Certificates are always JSON, whatever the application payload encoding.
    /// They are gzipped like application payloads.
    pub fn message(&self, template: &TopicTemplate, opts: &EndpointOptions) -> Result<CloudMessage> {
        let codec = PayloadCodec { encoding: PayloadEncoding::SimpleJson, gzip: opts.encode_gzip };
        let payload = codec.encode(&self.payload(opts))?;
        Ok(CloudMessage::new(self.topic(template, opts)?, payload)
            .qos(QoS::try_from(opts.lifecycle_qos)?)
            .retain(opts.lifecycle_retain)
            .priority(opts.lifecycle_priority))
    }
}
