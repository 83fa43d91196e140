//! Protocol message types

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Main tunnel protocol message enum
///
/// Every message is a JSON object tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    // Relay -> client
    Connected {
        tunnel: TunnelInfo,
    },
    LocalAddressAck {
        address: String,
    },
    HeartbeatAck,
    Request {
        id: RequestId,
        method: String,
        url: String,
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(
            rename = "bodyEncoding",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        body_encoding: Option<BodyEncoding>,
    },
    /// Relay gave up on a request (timeout or caller went away)
    Cancel {
        id: RequestId,
    },

    // Client -> relay
    SetLocalAddress {
        address: String,
    },
    Heartbeat,
    Response {
        #[serde(alias = "requestId")]
        id: RequestId,
        #[serde(rename = "statusCode")]
        status_code: u16,
        #[serde(default)]
        headers: Headers,
        /// Older clients forward already-parsed JSON bodies, so any JSON value is accepted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        #[serde(
            rename = "bodyEncoding",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        body_encoding: Option<BodyEncoding>,
    },
    Error {
        #[serde(alias = "requestId")]
        id: RequestId,
        message: String,
    },
}

impl TunnelMessage {
    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::Connected { .. } => "connected",
            TunnelMessage::LocalAddressAck { .. } => "local_address_ack",
            TunnelMessage::HeartbeatAck => "heartbeat_ack",
            TunnelMessage::Request { .. } => "request",
            TunnelMessage::Cancel { .. } => "cancel",
            TunnelMessage::SetLocalAddress { .. } => "set_local_address",
            TunnelMessage::Heartbeat => "heartbeat",
            TunnelMessage::Response { .. } => "response",
            TunnelMessage::Error { .. } => "error",
        }
    }
}

/// All message tags understood by this protocol version
pub const MESSAGE_KINDS: &[&str] = &[
    "connected",
    "local_address_ack",
    "heartbeat_ack",
    "request",
    "cancel",
    "set_local_address",
    "heartbeat",
    "response",
    "error",
];

/// Public identity of a tunnel, sent to the client once its session is bound
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelInfo {
    pub id: String,
    pub subdomain: String,
    #[serde(alias = "location")]
    pub region: String,
    pub url: String,
}

/// Correlation id tying a forwarded request to its reply
///
/// Scoped to one session. Sent as a decimal string; numeric ids are accepted
/// on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(RequestId(n)),
            Raw::Text(s) => s
                .trim()
                .parse::<u64>()
                .map(RequestId)
                .map_err(|_| serde::de::Error::custom(format!("invalid request id: {s:?}"))),
        }
    }
}

/// Header map as carried on the wire (`{"name": "value"}`; repeated headers as arrays)
pub type Headers = BTreeMap<String, HeaderValues>;

/// One or more values for a single header name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            HeaderValues::One(value) => std::slice::from_ref(value),
            HeaderValues::Many(values) => values,
        };
        values.iter().map(String::as_str)
    }

    /// Append a value, promoting to a list when the header repeats
    pub fn push(&mut self, value: String) {
        match self {
            HeaderValues::One(existing) => {
                let first = std::mem::take(existing);
                *self = HeaderValues::Many(vec![first, value]);
            }
            HeaderValues::Many(values) => values.push(value),
        }
    }
}

impl From<&str> for HeaderValues {
    fn from(value: &str) -> Self {
        HeaderValues::One(value.to_string())
    }
}

/// How a body string is encoded on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    /// Plain UTF-8 text (the default when the marker is absent)
    Text,
    /// Standard base64, used for bodies that are not valid UTF-8
    Base64,
}
