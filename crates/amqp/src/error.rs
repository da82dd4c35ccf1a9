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

//! Error types produced by the AMQP connector.

use thiserror::Error;

use crate::state::ConnectionState;

/// A convenience alias for results produced by the connector.
pub type AmqpResult<T> = Result<T, AmqpError>;

/// Failures establishing or keeping a broker connection.
///
/// These are fatal to every engine sharing the connection and are never retried by the
/// connector itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The broker could not be reached at the given endpoint.
    #[error("Connection refused by {endpoint}: {reason}")]
    Refused { endpoint: String, reason: String },
    /// The broker rejected the supplied credentials or virtual host.
    #[error("Authentication failed for user '{username}': {reason}")]
    AuthenticationFailure { username: String, reason: String },
    /// An open connection was lost without being asked to close.
    #[error("Connection lost unexpectedly: {0}")]
    Disconnected(String),
}

/// A typed error enumeration for the AMQP connector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmqpError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// A queue, exchange or binding declaration failed while opening a connection.
    #[error("Declaration of {target} failed: {reason}")]
    Declaration { target: String, reason: String },
    /// A reply-to sink received a message without a reply-to property.
    #[error("Reply-to header was not set")]
    MissingReplyTo,
    /// `ack` or `nack` was invoked more than once for the same delivery.
    #[error("Delivery {delivery_tag} was already acknowledged")]
    DoubleAcknowledgment { delivery_tag: u64 },
    /// The owning channel closed before the operation was confirmed.
    #[error("Channel closed: {reason}")]
    ChannelClosed { reason: String },
    /// The broker negatively confirmed a published message.
    #[error("Publish {sequence} was rejected by the broker")]
    PublishRejected { sequence: u64 },
    /// No publisher confirm arrived within the configured timeout.
    #[error("Publish {sequence} was not confirmed within {timeout_ms}ms")]
    ConfirmTimeout { sequence: u64, timeout_ms: u64 },
    /// The broker pushed more deliveries than the source buffer can hold.
    #[error("Reached maximum buffer size of {capacity} deliveries")]
    BufferOverflow { capacity: usize },
    /// A channel or connection level error reported by the broker.
    #[error("Broker error {code}: {text}")]
    Broker { code: u16, text: String },
    /// The operation is not valid in the current connection state.
    #[error("Invalid connection state: expected {expected}, was {actual}")]
    InvalidState {
        expected: ConnectionState,
        actual: ConnectionState,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AmqpError {
    /// Creates a [`AmqpError::ChannelClosed`] from any displayable reason.
    pub fn channel_closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed {
            reason: reason.into(),
        }
    }

    /// Returns true if this error means the underlying connection is gone.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
