// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Message types flowing in and out of the connector.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{ack::AckHandle, error::AmqpResult};

/// A header or argument value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// An ordered table of named field values, used for headers and declaration arguments.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// The basic properties carried alongside a message body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: FieldTable,
    /// 1 for transient, 2 for persistent.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub app_id: Option<String>,
}

impl MessageProperties {
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub const fn with_persistent(mut self, persistent: bool) -> Self {
        self.delivery_mode = Some(if persistent { 2 } else { 1 });
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    #[must_use]
    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }
}

/// A message handed to a sink for publishing.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub body: Bytes,
    /// Overrides the sink's default routing key when set.
    pub routing_key: Option<String>,
    pub properties: MessageProperties,
    /// Asks the broker to return the message if it cannot be routed to any queue.
    pub mandatory: bool,
    /// Do not hold the stream waiting for this message's publisher confirm.
    pub immediate: bool,
}

impl OutgoingMessage {
    /// Creates a new [`OutgoingMessage`] with default properties.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            routing_key: None,
            properties: MessageProperties::default(),
            mandatory: false,
            immediate: false,
        }
    }

    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub const fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    #[must_use]
    pub const fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }
}

/// Broker delivery metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Channel-scoped identifier used to acknowledge the delivery.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A message delivered by the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingMessage {
    pub body: Bytes,
    pub envelope: Envelope,
    pub properties: MessageProperties,
}

impl IncomingMessage {
    /// Returns the body as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn body_utf8(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Builds a reply publishing `body` to this message's reply-to queue with the same
    /// correlation id.
    pub fn reply(&self, body: impl Into<Bytes>) -> OutgoingMessage {
        let mut properties = MessageProperties::default();
        properties.reply_to.clone_from(&self.properties.reply_to);
        properties
            .correlation_id
            .clone_from(&self.properties.correlation_id);
        OutgoingMessage::new(body).with_properties(properties)
    }
}

/// A delivered message that must be explicitly acknowledged.
///
/// `ack` and `nack` may be called at most once between them. Later calls fail with
/// [`AmqpError::DoubleAcknowledgment`](crate::error::AmqpError::DoubleAcknowledgment).
#[derive(Debug)]
pub struct CommittableMessage {
    pub message: IncomingMessage,
    handle: AckHandle,
}

impl CommittableMessage {
    /// Creates a new [`CommittableMessage`] instance.
    #[must_use]
    pub const fn new(message: IncomingMessage, handle: AckHandle) -> Self {
        Self { message, handle }
    }

    #[must_use]
    pub const fn delivery_tag(&self) -> u64 {
        self.message.envelope.delivery_tag
    }

    /// Acknowledges the delivery, completing once the broker has processed it.
    ///
    /// # Errors
    ///
    /// Returns an error if the message was already settled or the channel closed first.
    pub async fn ack(&self) -> AmqpResult<()> {
        self.handle.ack().await
    }

    /// Negatively acknowledges the delivery, optionally asking the broker to requeue it.
    ///
    /// # Errors
    ///
    /// Returns an error if the message was already settled or the channel closed first.
    pub async fn nack(&self, requeue: bool) -> AmqpResult<()> {
        self.handle.nack(requeue).await
    }

    /// Returns the acknowledgment handle.
    #[must_use]
    pub const fn handle(&self) -> &AckHandle {
        &self.handle
    }

    /// Splits into the message and its acknowledgment handle.
    #[must_use]
    pub fn into_parts(self) -> (IncomingMessage, AckHandle) {
        (self.message, self.handle)
    }
}
