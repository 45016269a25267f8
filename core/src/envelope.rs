use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Result, RpcError};

/// Body carried by provisioning handshakes.
///
/// A handshake is an envelope with this body, an empty correlation id and no
/// reply topic. Dispatchers drop it before any handler sees it.
pub const OPEN_MARKER: &[u8] = b"__open__";

/// Message type tag stamped on handshake envelopes.
pub const HANDSHAKE_MSG_TYPE: &str = "courier.handshake";

/// Wire-level record exchanged over broker topics.
///
/// An `Envelope` is built by the caller (request) or by the dispatcher (reply),
/// serialized once with [`encode`] and never mutated after publish.
///
/// # Fields
///
/// * `correlation_id` - Links a reply to the call that triggered it; empty for one-way messages
/// * `send_to` - Destination topic
/// * `reply_to` - Topic the responder publishes its answer to (`None` = no reply expected)
/// * `body` - Application payload
/// * `is_reply` - Marks an answer sharing the correlation id of its request
///
/// The remaining fields (`key`, `group_id`, `content_type`, `content_encoding`,
/// `message_id`, `msg_type`, `user_id`, `app_id`, `headers`) are opaque metadata,
/// copied onto replies unchanged.
///
/// # Examples
///
/// ```
/// use courier_core::Envelope;
///
/// let req = Envelope::request("jobs.run", b"{}".to_vec())
///     .with_correlation_id("c-1")
///     .with_reply_to("jobs.reply");
///
/// let reply = req.reply(b"ok".to_vec()).unwrap();
/// assert!(reply.is_reply);
/// assert_eq!(reply.correlation_id, "c-1");
/// assert_eq!(reply.send_to, "jobs.reply");
/// assert_eq!(reply.body.as_deref(), Some(&b"ok"[..]));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(default)]
    pub correlation_id: String,
    pub send_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Creation timestamp in milliseconds since epoch
    #[serde(default)]
    pub timestamp_ms: i64,
}

impl Envelope {
    /// Creates a one-way request envelope addressed to `send_to`.
    ///
    /// The correlation id stays empty until the facade registers a waiter.
    pub fn request(send_to: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            send_to: send_to.into(),
            body: Some(body),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Creates a provisioning handshake for `topic`.
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_core::Envelope;
    ///
    /// let hs = Envelope::handshake("jobs.run");
    /// assert!(hs.is_handshake());
    /// assert!(hs.reply_to.is_none());
    /// assert!(hs.correlation_id.is_empty());
    /// ```
    pub fn handshake(topic: impl Into<String>) -> Self {
        Self {
            send_to: topic.into(),
            body: Some(OPEN_MARKER.to_vec()),
            msg_type: Some(HANDSHAKE_MSG_TYPE.to_string()),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    /// Returns true for provisioning traffic that carries no application data.
    pub fn is_handshake(&self) -> bool {
        !self.is_reply
            && self.correlation_id.is_empty()
            && self.reply_to.is_none()
            && self.body.as_deref() == Some(OPEN_MARKER)
    }

    /// Returns true if the sender expects an answer.
    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some() && !self.is_reply
    }

    /// Builds the answer to this request.
    ///
    /// Returns `None` when the request carries no `reply_to`. The reply keeps
    /// the correlation id and metadata, targets `reply_to`, and sets `is_reply`.
    pub fn reply(&self, body: Vec<u8>) -> Option<Envelope> {
        let reply_to = self.reply_to.clone()?;
        Some(Envelope {
            correlation_id: self.correlation_id.clone(),
            send_to: reply_to,
            reply_to: None,
            body: Some(body),
            is_reply: true,
            key: self.key.clone(),
            group_id: self.group_id.clone(),
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            message_id: self.message_id.clone(),
            msg_type: self.msg_type.clone(),
            user_id: self.user_id.clone(),
            app_id: self.app_id.clone(),
            headers: self.headers.clone(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Payload bytes, empty if the envelope has no body.
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(content_encoding.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_msg_type(mut self, msg_type: impl Into<String>) -> Self {
        self.msg_type = Some(msg_type.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Serializes an envelope into the broker payload format (JSON).
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parses a broker payload into an envelope.
///
/// Fails with [`RpcError::MalformedEnvelope`] when the bytes are not an
/// envelope, when `send_to` is empty, or when a reply lacks a correlation id.
///
/// # Examples
///
/// ```
/// use courier_core::envelope::{decode, encode};
/// use courier_core::{Envelope, RpcError};
///
/// let env = Envelope::request("jobs.run", b"x".to_vec());
/// let bytes = encode(&env).unwrap();
/// assert_eq!(decode(&bytes).unwrap(), env);
///
/// assert!(matches!(decode(b"not json"), Err(RpcError::MalformedEnvelope(_))));
/// ```
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| RpcError::MalformedEnvelope(e.to_string()))?;
    if envelope.send_to.is_empty() {
        return Err(RpcError::MalformedEnvelope("empty send_to".into()));
    }
    if envelope.is_reply && envelope.correlation_id.is_empty() {
        return Err(RpcError::MalformedEnvelope(
            "reply without correlation_id".into(),
        ));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_copies_metadata() {
        let req = Envelope::request("svc.a", b"in".to_vec())
            .with_correlation_id("c-9")
            .with_reply_to("svc.a.reply")
            .with_key("k")
            .with_content_type("application/json")
            .with_header("trace", "t-1");

        let reply = req.reply(b"out".to_vec()).unwrap();
        assert_eq!(reply.key.as_deref(), Some("k"));
        assert_eq!(reply.content_type.as_deref(), Some("application/json"));
        assert_eq!(reply.headers.get("trace").map(String::as_str), Some("t-1"));
        assert!(reply.reply_to.is_none());
        assert!(!reply.expects_reply());
    }

    #[test]
    fn no_reply_without_reply_to() {
        let req = Envelope::request("svc.a", b"in".to_vec()).with_correlation_id("c-1");
        assert!(req.reply(b"out".to_vec()).is_none());
        assert!(!req.expects_reply());
    }

    #[test]
    fn marker_body_with_correlation_is_not_handshake() {
        let mut env = Envelope::handshake("t");
        env.correlation_id = "c-1".into();
        assert!(!env.is_handshake());
    }

    #[test]
    fn decode_rejects_empty_topic() {
        let bytes = br#"{"correlation_id":"c","send_to":""}"#;
        assert!(matches!(decode(bytes), Err(RpcError::MalformedEnvelope(_))));
    }

    #[test]
    fn decode_rejects_uncorrelated_reply() {
        let bytes = br#"{"send_to":"t","is_reply":true}"#;
        assert!(matches!(decode(bytes), Err(RpcError::MalformedEnvelope(_))));
    }

    #[test]
    fn decode_fills_missing_optional_fields() {
        let env = decode(br#"{"send_to":"t"}"#).unwrap();
        assert_eq!(env.send_to, "t");
        assert!(env.body.is_none());
        assert!(env.headers.is_empty());
        assert!(!env.is_reply);
    }
}
