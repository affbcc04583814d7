use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

use cloudlink_utils::deserialize_duration;

/// How application payloads are put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Timestamp, metrics and body as a JSON document.
    SimpleJson,
    /// Body bytes only.
    Raw,
}

/// Options of one cloud endpoint instance.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointOptions {
    #[serde(default = "EndpointOptions::pid_default")]
    pub pid: String,

    #[serde(default = "EndpointOptions::topic_separator_default")]
    pub topic_separator: String,
    #[serde(default = "EndpointOptions::topic_account_token_default")]
    pub topic_account_token: String,
    #[serde(default = "EndpointOptions::topic_client_id_token_default")]
    pub topic_client_id_token: String,
    #[serde(default = "EndpointOptions::topic_control_prefix_default")]
    pub topic_control_prefix: String,
    //Value substituted for `topic_account_token`
    #[serde(default)]
    pub account_name: String,
    //Value substituted for `topic_client_id_token`
    #[serde(default)]
    pub client_id: String,

    #[serde(default = "EndpointOptions::birth_suffix_default")]
    pub topic_birth_suffix: String,
    #[serde(default = "EndpointOptions::disconnect_suffix_default")]
    pub topic_disconnect_suffix: String,
    #[serde(default)]
    pub lifecycle_certs_disabled: bool,
    #[serde(default = "EndpointOptions::republish_birth_on_reconnect_default")]
    pub republish_birth_on_reconnect: bool,
    #[serde(default)]
    pub lifecycle_qos: u8,
    #[serde(default)]
    pub lifecycle_retain: bool,
    #[serde(default)]
    pub lifecycle_priority: u8,

    #[serde(default = "EndpointOptions::payload_encoding_default")]
    pub payload_encoding: PayloadEncoding,
    //Gzip encoded payloads; arriving payloads are gunzipped whenever they are compressed
    #[serde(default)]
    pub encode_gzip: bool,

    #[serde(default = "EndpointOptions::disconnect_quiesce_default", deserialize_with = "deserialize_duration")]
    pub disconnect_quiesce_timeout: Duration,
}

impl Default for EndpointOptions {
    #[inline]
    fn default() -> Self {
        Self {
            pid: Self::pid_default(),
            topic_separator: Self::topic_separator_default(),
            topic_account_token: Self::topic_account_token_default(),
            topic_client_id_token: Self::topic_client_id_token_default(),
            topic_control_prefix: Self::topic_control_prefix_default(),
            account_name: String::new(),
            client_id: String::new(),
            topic_birth_suffix: Self::birth_suffix_default(),
            topic_disconnect_suffix: Self::disconnect_suffix_default(),
            lifecycle_certs_disabled: false,
            republish_birth_on_reconnect: Self::republish_birth_on_reconnect_default(),
            lifecycle_qos: 0,
            lifecycle_retain: false,
            lifecycle_priority: 0,
            payload_encoding: Self::payload_encoding_default(),
            encode_gzip: false,
            disconnect_quiesce_timeout: Self::disconnect_quiesce_default(),
        }
    }
}

impl EndpointOptions {
    /// Topics are split on `/` when matched, so no other separator is accepted.
    pub fn validate(&self) -> Result<()> {
        if self.topic_separator != "/" {
            bail!("unsupported topic separator {:?}, only \"/\" is supported", self.topic_separator);
        }
        if self.lifecycle_qos > 2 {
            bail!("invalid lifecycle qos {}", self.lifecycle_qos);
        }
        if self.topic_control_prefix.is_empty() || self.topic_control_prefix.contains(['/', '+', '#']) {
            bail!("invalid control prefix {:?}", self.topic_control_prefix);
        }
        Ok(())
    }

    fn pid_default() -> String {
        "cloudlink.CloudEndpoint".into()
    }
    fn topic_separator_default() -> String {
        "/".into()
    }
    fn topic_account_token_default() -> String {
        "#account-name".into()
    }
    fn topic_client_id_token_default() -> String {
        "#client-id".into()
    }
    fn topic_control_prefix_default() -> String {
        "$EDC".into()
    }
    fn birth_suffix_default() -> String {
        "MQTT/BIRTH".into()
    }
    fn disconnect_suffix_default() -> String {
        "MQTT/DC".into()
    }
    fn republish_birth_on_reconnect_default() -> bool {
        true
    }
    fn payload_encoding_default() -> PayloadEncoding {
        PayloadEncoding::SimpleJson
    }
    fn disconnect_quiesce_default() -> Duration {
        Duration::from_secs(10)
    }
}
