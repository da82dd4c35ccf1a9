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

//! The boundary between the connector and an AMQP client implementation.
//!
//! Engines only ever talk to a broker through these traits. Delivery and shutdown callbacks
//! run on the client's I/O task and must not block, so engines implement them as pushes
//! into channels or completions.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    config::{Credentials, Endpoint},
    declaration::{BindingDeclaration, ExchangeDeclaration, QueueDeclaration},
    error::{AmqpError, AmqpResult, ConnectionError},
    message::{IncomingMessage, MessageProperties},
};

#[cfg(feature = "lapin")]
pub mod lapin;
pub mod memory;

/// An event pushed to a consumer by the broker.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsumerEvent {
    Delivery(IncomingMessage),
    /// The broker cancelled the consumer, no further deliveries will arrive.
    Cancelled,
    /// The consumer's channel was closed by an exception, no further deliveries will arrive.
    Failed(AmqpError),
}

/// The broker's answer to a published message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Describes why a connection shut down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownSignal {
    /// True when the shutdown was caused by a local `close`.
    pub initiated_by_application: bool,
    pub reason: String,
}

/// Callback receiving consumer events.
pub type ConsumerHandler = Arc<dyn Fn(ConsumerEvent) + Send + Sync>;

/// Callback receiving the connection shutdown signal.
pub type ShutdownHandler = Arc<dyn Fn(ShutdownSignal) + Send + Sync>;

/// Resolves once the broker confirms a publish.
pub type ConfirmFuture = BoxFuture<'static, AmqpResult<Confirmation>>;

/// Establishes broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync + Debug {
    /// Connects to a single endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Refused`] if the endpoint is unreachable and
    /// [`ConnectionError::AuthenticationFailure`] if the credentials or virtual host are
    /// rejected.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        virtual_host: &str,
        connection_name: Option<&str>,
    ) -> Result<Arc<dyn BrokerConnection>, ConnectionError>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync + Debug {
    /// Opens a new channel on the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the broker refuses the channel.
    async fn create_channel(&self) -> AmqpResult<Arc<dyn BrokerChannel>>;

    /// Registers a handler invoked once when the connection shuts down for any reason.
    fn on_shutdown(&self, handler: ShutdownHandler);

    fn is_open(&self) -> bool;

    /// Closes the connection and every channel on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails.
    async fn close(&self) -> AmqpResult<()>;
}

/// A channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync + Debug {
    /// Declares a queue, returning its name (generated by the broker when empty).
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the declaration.
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> AmqpResult<String>;

    /// # Errors
    ///
    /// Returns an error if the broker rejects the declaration.
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> AmqpResult<()>;

    /// # Errors
    ///
    /// Returns an error if the queue or exchange does not exist.
    async fn bind_queue(&self, declaration: &BindingDeclaration) -> AmqpResult<()>;

    /// Limits the number of unacknowledged deliveries pushed to consumers on this channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is closed.
    async fn basic_qos(&self, prefetch_count: u16) -> AmqpResult<()>;

    /// Puts the channel in publisher confirm mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is closed.
    async fn confirm_select(&self) -> AmqpResult<()>;

    /// Publishes a message, returning a future for the broker's confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be handed to the broker.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: Bytes,
    ) -> AmqpResult<ConfirmFuture>;

    /// Starts a consumer on `queue`, returning its consumer tag.
    ///
    /// An empty `consumer_tag` lets the broker generate one.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue does not exist or is exclusively consumed.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        exclusive: bool,
        handler: ConsumerHandler,
    ) -> AmqpResult<String>;

    /// # Errors
    ///
    /// Returns an error if the channel is closed.
    async fn basic_cancel(&self, consumer_tag: &str) -> AmqpResult<()>;

    /// # Errors
    ///
    /// Returns an error if the delivery tag is unknown or the channel is closed.
    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> AmqpResult<()>;

    /// # Errors
    ///
    /// Returns an error if the delivery tag is unknown or the channel is closed.
    async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
    -> AmqpResult<()>;

    fn is_open(&self) -> bool;

    /// Closes the channel, requeueing its unacknowledged deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails.
    async fn close(&self) -> AmqpResult<()>;
}
