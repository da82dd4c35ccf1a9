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

//! An in-process AMQP broker implementing the broker boundary.
//!
//! The broker keeps real queue, exchange, QoS and acknowledgment semantics so the engines can
//! be exercised end-to-end without a network. Each connection owns a dispatcher task which
//! invokes consumer and shutdown callbacks in the order the broker produced them, never while
//! the broker lock is held.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConfirmFuture, Confirmation, ConsumerEvent,
    ConsumerHandler, ShutdownHandler, ShutdownSignal,
};
use crate::{
    MUTEX_POISONED,
    config::{Credentials, DEFAULT_VIRTUAL_HOST, Endpoint},
    declaration::{BindingDeclaration, ExchangeDeclaration, ExchangeKind, QueueDeclaration},
    error::{AmqpError, AmqpResult, ConnectionError},
    message::{Envelope, FieldTable, FieldValue, IncomingMessage, MessageProperties},
};

const REPLY_NOT_FOUND: u16 = 404;
const REPLY_ACCESS_REFUSED: u16 = 403;
const REPLY_RESOURCE_LOCKED: u16 = 405;
const REPLY_PRECONDITION_FAILED: u16 = 406;
const REPLY_NOT_ALLOWED: u16 = 530;

const CONNECTION_REFUSED: &str = "Connection refused (os error 111)";
const LOGIN_REFUSED: &str = "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN. For details see the broker logfile.";
const CLOSED_BY_APPLICATION: &str = "Connection closed by application";

/// How the broker answers publishes on channels in confirm mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConfirmBehavior {
    #[default]
    Ack,
    Nack,
    /// Never confirm, leaving publishers waiting.
    Withhold,
}

#[derive(Clone, Debug)]
struct StoredMessage {
    body: Bytes,
    properties: MessageProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

impl StoredMessage {
    fn to_incoming(&self, delivery_tag: u64) -> IncomingMessage {
        IncomingMessage {
            body: self.body.clone(),
            envelope: Envelope {
                delivery_tag,
                redelivered: self.redelivered,
                exchange: self.exchange.clone(),
                routing_key: self.routing_key.clone(),
            },
            properties: self.properties.clone(),
        }
    }
}

struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    auto_ack: bool,
    exclusive: bool,
    handler: ConsumerHandler,
}

struct Queue {
    durable: bool,
    auto_delete: bool,
    exclusive_owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

impl Queue {
    const fn exclusive(&self) -> bool {
        self.exclusive_owner.is_some()
    }
}

struct Binding {
    queue: String,
    routing_key: String,
    arguments: FieldTable,
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
    bindings: Vec<Binding>,
}

impl Exchange {
    const fn new(kind: ExchangeKind) -> Self {
        Self {
            kind,
            durable: true,
            auto_delete: false,
            bindings: Vec::new(),
        }
    }

    fn route(&self, routing_key: &str, headers: &FieldTable) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matched = match self.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Headers => headers_match(&binding.arguments, headers),
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        queues
    }
}

struct VirtualHost {
    exchanges: AHashMap<String, Exchange>,
    queues: AHashMap<String, Queue>,
}

impl VirtualHost {
    fn new() -> Self {
        let exchanges = [
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.topic", ExchangeKind::Topic),
            ("amq.headers", ExchangeKind::Headers),
            ("amq.match", ExchangeKind::Headers),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_string(), Exchange::new(kind)))
        .collect();

        Self {
            exchanges,
            queues: AHashMap::new(),
        }
    }
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelEntry {
    connection_id: u64,
    vhost: String,
    prefetch: u16,
    confirm_mode: bool,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<(String, String)>,
}

impl ChannelEntry {
    fn has_credit(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

enum Dispatch {
    Consumer(ConsumerHandler, ConsumerEvent),
    Shutdown(Vec<ShutdownHandler>, ShutdownSignal),
}

struct ConnectionEntry {
    vhost: String,
    channels: Vec<u64>,
    shutdown_handlers: Vec<ShutdownHandler>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
}

struct BrokerState {
    listeners: AHashSet<Endpoint>,
    users: AHashMap<String, String>,
    vhosts: AHashMap<String, VirtualHost>,
    connections: AHashMap<u64, ConnectionEntry>,
    channels: AHashMap<u64, ChannelEntry>,
    confirm_behavior: ConfirmBehavior,
    next_id: u64,
}

/// A shared in-memory broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct(stringify!(InMemoryBroker))
            .field("listeners", &state.listeners)
            .field("connections", &state.connections.len())
            .field("channels", &state.channels.len())
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker listening on `localhost:5672` with the `guest` user and the root
    /// virtual host.
    #[must_use]
    pub fn new() -> Self {
        let mut vhosts = AHashMap::new();
        vhosts.insert(DEFAULT_VIRTUAL_HOST.to_string(), VirtualHost::new());
        let default_credentials = Credentials::default();

        let state = BrokerState {
            listeners: AHashSet::from_iter([Endpoint::default()]),
            users: AHashMap::from_iter([(
                default_credentials.username,
                default_credentials.password,
            )]),
            vhosts,
            connections: AHashMap::new(),
            channels: AHashMap::new(),
            confirm_behavior: ConfirmBehavior::default(),
            next_id: 0,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().expect(MUTEX_POISONED)
    }

    /// Makes the broker accept connections on `endpoint` as well.
    #[must_use]
    pub fn with_listener(self, endpoint: Endpoint) -> Self {
        self.lock().listeners.insert(endpoint);
        self
    }

    #[must_use]
    pub fn with_user(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.lock().users.insert(username.into(), password.into());
        self
    }

    #[must_use]
    pub fn with_virtual_host(self, name: impl Into<String>) -> Self {
        self.lock()
            .vhosts
            .entry(name.into())
            .or_insert_with(VirtualHost::new);
        self
    }

    /// Returns a connector dialing this broker.
    #[must_use]
    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(InMemoryConnector {
            broker: self.clone(),
        })
    }

    /// Sets how publishes on confirm-mode channels are answered from now on.
    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        self.lock().confirm_behavior = behavior;
    }

    /// Severs every open connection as an unexpected failure with `reason`.
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(
                id,
                ShutdownSignal {
                    initiated_by_application: false,
                    reason: reason.to_string(),
                },
            );
        }
    }

    /// Closes every channel consuming `queue` in the root virtual host with a channel-level
    /// exception, leaving their connections open.
    ///
    /// Returns the number of channels closed.
    pub fn fail_consumers(&self, queue: &str, code: u16, text: &str) -> usize {
        let mut state = self.lock();
        let mut channel_ids: Vec<u64> = state
            .vhosts
            .get(DEFAULT_VIRTUAL_HOST)
            .and_then(|vhost| vhost.queues.get(queue))
            .map(|queue| queue.consumers.iter().map(|consumer| consumer.channel_id).collect())
            .unwrap_or_default();
        channel_ids.sort_unstable();
        channel_ids.dedup();

        for channel_id in &channel_ids {
            state.close_channel_with_exception(*channel_id, &broker_error(code, text.to_string()));
        }
        channel_ids.len()
    }

    /// Deletes a queue in the root virtual host, cancelling its consumers.
    pub fn delete_queue(&self, name: &str) -> bool {
        self.lock().delete_queue(DEFAULT_VIRTUAL_HOST, name, true)
    }

    /// Returns the number of ready messages in a queue of the root virtual host.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.lock()
            .vhosts
            .get(DEFAULT_VIRTUAL_HOST)
            .and_then(|vhost| vhost.queues.get(name))
            .map(|queue| queue.messages.len())
    }

    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.queue_depth(name).is_some()
    }

    /// Returns the number of delivered but unacknowledged messages taken from `queue`.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|unacked| unacked.queue == queue)
            .count()
    }

    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .vhosts
            .get(DEFAULT_VIRTUAL_HOST)
            .and_then(|vhost| vhost.queues.get(queue))
            .map_or(0, |queue| queue.consumers.len())
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Returns the names of all queues in the root virtual host.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .vhosts
            .get(DEFAULT_VIRTUAL_HOST)
            .map(|vhost| vhost.queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn broker_error(code: u16, text: String) -> AmqpError {
    AmqpError::Broker { code, text }
}

fn channel_gone(channel_id: u64) -> AmqpError {
    AmqpError::channel_closed(format!("channel {channel_id} is not open"))
}

impl BrokerState {
    const fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_vhost(&self, channel_id: u64) -> AmqpResult<String> {
        self.channels
            .get(&channel_id)
            .map(|channel| channel.vhost.clone())
            .ok_or_else(|| channel_gone(channel_id))
    }

    fn vhost_mut(&mut self, name: &str) -> AmqpResult<&mut VirtualHost> {
        self.vhosts
            .get_mut(name)
            .ok_or_else(|| broker_error(REPLY_NOT_FOUND, format!("NOT_FOUND - vhost '{name}'")))
    }

    fn send(&self, channel_id: u64, dispatch: Dispatch) {
        let connection = self
            .channels
            .get(&channel_id)
            .and_then(|channel| self.connections.get(&channel.connection_id));
        if let Some(connection) = connection
            && connection.dispatch_tx.send(dispatch).is_err()
        {
            tracing::trace!("Dispatcher for channel {channel_id} has stopped");
        }
    }

    /// Pushes ready messages of one queue to consumers with available credit.
    fn dispatch(&mut self, vhost: &str, queue_name: &str) {
        let mut outgoing = Vec::new();
        {
            let Some(queue) = self
                .vhosts
                .get_mut(vhost)
                .and_then(|vhost| vhost.queues.get_mut(queue_name))
            else {
                return;
            };

            while !queue.messages.is_empty() {
                let count = queue.consumers.len();
                let cursor = queue.cursor;
                let chosen = (0..count)
                    .map(|offset| (cursor + offset) % count)
                    .find(|&index| {
                        let consumer = &queue.consumers[index];
                        self.channels
                            .get(&consumer.channel_id)
                            .is_some_and(|channel| consumer.auto_ack || channel.has_credit())
                    });
                let Some(index) = chosen else {
                    break;
                };
                let Some(stored) = queue.messages.pop_front() else {
                    break;
                };
                queue.cursor = index + 1;

                let consumer = &queue.consumers[index];
                let Some(channel) = self.channels.get_mut(&consumer.channel_id) else {
                    break;
                };
                channel.next_delivery_tag += 1;
                let delivery_tag = channel.next_delivery_tag;
                let message = stored.to_incoming(delivery_tag);
                if !consumer.auto_ack {
                    channel.unacked.insert(
                        delivery_tag,
                        Unacked {
                            queue: queue_name.to_string(),
                            message: stored,
                        },
                    );
                }
                outgoing.push((
                    consumer.channel_id,
                    Dispatch::Consumer(consumer.handler.clone(), ConsumerEvent::Delivery(message)),
                ));
            }
        }

        for (channel_id, dispatch) in outgoing {
            self.send(channel_id, dispatch);
        }
    }

    fn dispatch_vhost(&mut self, vhost: &str) {
        let mut names: Vec<String> = self
            .vhosts
            .get(vhost)
            .map(|vhost| vhost.queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        for name in names {
            self.dispatch(vhost, &name);
        }
    }

    fn delete_queue(&mut self, vhost_name: &str, queue_name: &str, notify: bool) -> bool {
        let Some(vhost) = self.vhosts.get_mut(vhost_name) else {
            return false;
        };
        let Some(queue) = vhost.queues.remove(queue_name) else {
            return false;
        };
        for exchange in vhost.exchanges.values_mut() {
            exchange.bindings.retain(|binding| binding.queue != queue_name);
        }
        vhost
            .exchanges
            .retain(|_, exchange| !exchange.auto_delete || !exchange.bindings.is_empty());

        for consumer in queue.consumers {
            if let Some(channel) = self.channels.get_mut(&consumer.channel_id) {
                channel
                    .consumers
                    .retain(|(queue, tag)| queue != queue_name || *tag != consumer.tag);
            }
            if notify {
                self.send(
                    consumer.channel_id,
                    Dispatch::Consumer(consumer.handler, ConsumerEvent::Cancelled),
                );
            }
        }
        tracing::trace!("Deleted queue '{queue_name}'");
        true
    }

    fn remove_consumer(&mut self, vhost_name: &str, queue_name: &str, tag: &str) {
        let Some(queue) = self
            .vhosts
            .get_mut(vhost_name)
            .and_then(|vhost| vhost.queues.get_mut(queue_name))
        else {
            return;
        };
        queue.consumers.retain(|consumer| consumer.tag != tag);
        if queue.auto_delete && queue.consumers.is_empty() {
            self.delete_queue(vhost_name, queue_name, false);
        }
    }

    fn requeue(&mut self, vhost_name: &str, unacked: Vec<Unacked>) {
        let Some(vhost) = self.vhosts.get_mut(vhost_name) else {
            return;
        };
        // Reverse so the oldest delivery ends up back at the head
        for entry in unacked.into_iter().rev() {
            if let Some(queue) = vhost.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };
        if let Some(connection) = self.connections.get_mut(&channel.connection_id) {
            connection.channels.retain(|id| *id != channel_id);
        }
        for (queue, tag) in &channel.consumers {
            self.remove_consumer(&channel.vhost, queue, tag);
        }
        self.requeue(&channel.vhost, channel.unacked.into_values().collect());
        self.dispatch_vhost(&channel.vhost);
    }

    fn close_channel_with_exception(&mut self, channel_id: u64, error: &AmqpError) {
        let Some(channel) = self.channels.get(&channel_id) else {
            return;
        };
        let handlers: Vec<ConsumerHandler> = channel
            .consumers
            .iter()
            .filter_map(|(queue, tag)| {
                self.vhosts
                    .get(&channel.vhost)
                    .and_then(|vhost| vhost.queues.get(queue))
                    .and_then(|queue| queue.consumers.iter().find(|consumer| consumer.tag == *tag))
                    .map(|consumer| consumer.handler.clone())
            })
            .collect();

        tracing::debug!("Channel {channel_id} closed: {error}");
        // Queued ahead of the handlers being dropped with the channel
        for handler in handlers {
            self.send(channel_id, Dispatch::Consumer(handler, ConsumerEvent::Failed(error.clone())));
        }
        self.close_channel(channel_id);
    }

    fn close_connection(&mut self, connection_id: u64, signal: ShutdownSignal) {
        let Some(channels) = self
            .connections
            .get(&connection_id)
            .map(|connection| connection.channels.clone())
        else {
            return;
        };
        for channel_id in channels {
            self.close_channel(channel_id);
        }

        let Some(connection) = self.connections.remove(&connection_id) else {
            return;
        };
        let owned: Vec<String> = self
            .vhosts
            .get(&connection.vhost)
            .map(|vhost| {
                vhost
                    .queues
                    .iter()
                    .filter(|(_, queue)| queue.exclusive_owner == Some(connection_id))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        for name in owned {
            self.delete_queue(&connection.vhost, &name, false);
        }

        tracing::debug!("Connection {connection_id} closed: {}", signal.reason);
        if connection
            .dispatch_tx
            .send(Dispatch::Shutdown(connection.shutdown_handlers, signal))
            .is_err()
        {
            tracing::trace!("Dispatcher for connection {connection_id} has stopped");
        }
    }

    fn declare_queue(
        &mut self,
        channel_id: u64,
        declaration: &QueueDeclaration,
    ) -> AmqpResult<String> {
        let vhost_name = self.channel_vhost(channel_id)?;
        let connection_id = self
            .channels
            .get(&channel_id)
            .map_or(0, |channel| channel.connection_id);
        let vhost = self.vhost_mut(&vhost_name)?;

        let name = if declaration.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            declaration.name.clone()
        };

        if let Some(queue) = vhost.queues.get(&name) {
            if queue
                .exclusive_owner
                .is_some_and(|owner| owner != connection_id)
            {
                return Err(broker_error(
                    REPLY_RESOURCE_LOCKED,
                    format!(
                        "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}' in vhost '{vhost_name}'"
                    ),
                ));
            }
            if declaration.passive {
                return Ok(name);
            }
            for (argument, received, current) in [
                ("durable", declaration.durable, queue.durable),
                ("exclusive", declaration.exclusive, queue.exclusive()),
                ("auto_delete", declaration.auto_delete, queue.auto_delete),
            ] {
                if received != current {
                    return Err(broker_error(
                        REPLY_PRECONDITION_FAILED,
                        format!(
                            "PRECONDITION_FAILED - inequivalent arg '{argument}' for queue '{name}' in vhost '{vhost_name}': received '{received}' but current is '{current}'"
                        ),
                    ));
                }
            }
            return Ok(name);
        }

        if declaration.passive {
            return Err(broker_error(
                REPLY_NOT_FOUND,
                format!("NOT_FOUND - no queue '{name}' in vhost '{vhost_name}'"),
            ));
        }

        vhost.queues.insert(
            name.clone(),
            Queue {
                durable: declaration.durable,
                auto_delete: declaration.auto_delete,
                exclusive_owner: declaration.exclusive.then_some(connection_id),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            },
        );
        tracing::trace!("Declared queue '{name}'");
        Ok(name)
    }

    fn declare_exchange(
        &mut self,
        channel_id: u64,
        declaration: &ExchangeDeclaration,
    ) -> AmqpResult<()> {
        let vhost_name = self.channel_vhost(channel_id)?;
        let vhost = self.vhost_mut(&vhost_name)?;
        let name = &declaration.name;

        if let Some(exchange) = vhost.exchanges.get(name) {
            if exchange.kind != declaration.kind {
                return Err(broker_error(
                    REPLY_PRECONDITION_FAILED,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}' in vhost '{vhost_name}': received '{}' but current is '{}'",
                        declaration.kind, exchange.kind
                    ),
                ));
            }
            if exchange.durable != declaration.durable {
                return Err(broker_error(
                    REPLY_PRECONDITION_FAILED,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{name}' in vhost '{vhost_name}': received '{}' but current is '{}'",
                        declaration.durable, exchange.durable
                    ),
                ));
            }
            return Ok(());
        }

        if name.is_empty() || name.starts_with("amq.") {
            return Err(broker_error(
                REPLY_ACCESS_REFUSED,
                format!(
                    "ACCESS_REFUSED - exchange name '{name}' contains reserved prefix 'amq.*'"
                ),
            ));
        }

        vhost.exchanges.insert(
            name.clone(),
            Exchange {
                kind: declaration.kind,
                durable: declaration.durable,
                auto_delete: declaration.auto_delete,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    fn bind_queue(&mut self, channel_id: u64, declaration: &BindingDeclaration) -> AmqpResult<()> {
        let vhost_name = self.channel_vhost(channel_id)?;
        let vhost = self.vhost_mut(&vhost_name)?;

        if !vhost.queues.contains_key(&declaration.queue) {
            return Err(broker_error(
                REPLY_NOT_FOUND,
                format!(
                    "NOT_FOUND - no queue '{}' in vhost '{vhost_name}'",
                    declaration.queue
                ),
            ));
        }
        if declaration.exchange.is_empty() {
            return Err(broker_error(
                REPLY_ACCESS_REFUSED,
                "ACCESS_REFUSED - operation not permitted on the default exchange".to_string(),
            ));
        }
        let Some(exchange) = vhost.exchanges.get_mut(&declaration.exchange) else {
            return Err(broker_error(
                REPLY_NOT_FOUND,
                format!(
                    "NOT_FOUND - no exchange '{}' in vhost '{vhost_name}'",
                    declaration.exchange
                ),
            ));
        };

        let exists = exchange.bindings.iter().any(|binding| {
            binding.queue == declaration.queue
                && binding.routing_key == declaration.routing_key
                && binding.arguments == declaration.arguments
        });
        if !exists {
            exchange.bindings.push(Binding {
                queue: declaration.queue.clone(),
                routing_key: declaration.routing_key.clone(),
                arguments: declaration.arguments.clone(),
            });
        }
        Ok(())
    }

    fn publish(
        &mut self,
        channel_id: u64,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: Bytes,
    ) -> AmqpResult<Confirmation> {
        let vhost_name = self.channel_vhost(channel_id)?;
        let confirm_mode = self
            .channels
            .get(&channel_id)
            .is_some_and(|channel| channel.confirm_mode);
        let vhost = self.vhost_mut(&vhost_name)?;

        let targets = if exchange.is_empty() {
            if vhost.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let Some(target) = vhost.exchanges.get(exchange) else {
                return Err(broker_error(
                    REPLY_NOT_FOUND,
                    format!("NOT_FOUND - no exchange '{exchange}' in vhost '{vhost_name}'"),
                ));
            };
            target.route(routing_key, &properties.headers)
        };

        if targets.is_empty() && mandatory {
            tracing::trace!("Returned unroutable message: exchange='{exchange}', routing_key='{routing_key}'");
        }

        for name in &targets {
            if let Some(queue) = vhost.queues.get_mut(name) {
                queue.messages.push_back(StoredMessage {
                    body: body.clone(),
                    properties: properties.clone(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
            }
        }
        for name in &targets {
            self.dispatch(&vhost_name, name);
        }

        Ok(match (confirm_mode, self.confirm_behavior) {
            (false, _) => Confirmation::NotRequested,
            (true, ConfirmBehavior::Ack) => Confirmation::Ack,
            (true, ConfirmBehavior::Nack | ConfirmBehavior::Withhold) => Confirmation::Nack,
        })
    }

    fn consume(
        &mut self,
        channel_id: u64,
        queue_name: &str,
        consumer_tag: &str,
        auto_ack: bool,
        exclusive: bool,
        handler: ConsumerHandler,
    ) -> AmqpResult<String> {
        let vhost_name = self.channel_vhost(channel_id)?;
        let connection_id = self
            .channels
            .get(&channel_id)
            .map_or(0, |channel| channel.connection_id);
        let vhost = self.vhost_mut(&vhost_name)?;

        let Some(queue) = vhost.queues.get_mut(queue_name) else {
            return Err(broker_error(
                REPLY_NOT_FOUND,
                format!("NOT_FOUND - no queue '{queue_name}' in vhost '{vhost_name}'"),
            ));
        };
        if queue
            .exclusive_owner
            .is_some_and(|owner| owner != connection_id)
        {
            return Err(broker_error(
                REPLY_RESOURCE_LOCKED,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{queue_name}' in vhost '{vhost_name}'"
                ),
            ));
        }
        if queue.consumers.iter().any(|consumer| consumer.exclusive)
            || (exclusive && !queue.consumers.is_empty())
        {
            return Err(broker_error(
                REPLY_ACCESS_REFUSED,
                format!(
                    "ACCESS_REFUSED - queue '{queue_name}' in vhost '{vhost_name}' in exclusive use"
                ),
            ));
        }

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            consumer_tag.to_string()
        };
        if queue.consumers.iter().any(|consumer| consumer.tag == tag) {
            return Err(broker_error(
                REPLY_NOT_ALLOWED,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"),
            ));
        }

        queue.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            channel_id,
            auto_ack,
            exclusive,
            handler,
        });
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.consumers.push((queue_name.to_string(), tag.clone()));
        }

        self.dispatch(&vhost_name, queue_name);
        Ok(tag)
    }

    fn cancel(&mut self, channel_id: u64, consumer_tag: &str) -> AmqpResult<()> {
        let vhost_name = self.channel_vhost(channel_id)?;
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Err(channel_gone(channel_id));
        };
        let queues: Vec<String> = channel
            .consumers
            .iter()
            .filter(|(_, tag)| tag == consumer_tag)
            .map(|(queue, _)| queue.clone())
            .collect();
        channel.consumers.retain(|(_, tag)| tag != consumer_tag);

        for queue in queues {
            self.remove_consumer(&vhost_name, &queue, consumer_tag);
        }
        Ok(())
    }

    fn settle(
        &mut self,
        channel_id: u64,
        delivery_tag: u64,
        multiple: bool,
        requeue: Option<bool>,
    ) -> AmqpResult<()> {
        let vhost_name = self.channel_vhost(channel_id)?;
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Err(channel_gone(channel_id));
        };

        let tags: Vec<u64> = if multiple {
            channel.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
        } else if channel.unacked.contains_key(&delivery_tag) {
            vec![delivery_tag]
        } else {
            Vec::new()
        };
        if tags.is_empty() {
            return Err(broker_error(
                REPLY_PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
            ));
        }

        let settled: Vec<Unacked> = tags
            .iter()
            .filter_map(|tag| channel.unacked.remove(tag))
            .collect();
        if requeue == Some(true) {
            self.requeue(&vhost_name, settled);
        }

        self.dispatch_vhost(&vhost_name);
        Ok(())
    }
}

/// Connects to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        virtual_host: &str,
        connection_name: Option<&str>,
    ) -> Result<Arc<dyn BrokerConnection>, ConnectionError> {
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();

        let id = {
            let mut state = self.broker.lock();
            if !state.listeners.contains(endpoint) {
                return Err(ConnectionError::Refused {
                    endpoint: endpoint.to_string(),
                    reason: CONNECTION_REFUSED.to_string(),
                });
            }
            if state.users.get(&credentials.username) != Some(&credentials.password) {
                return Err(ConnectionError::AuthenticationFailure {
                    username: credentials.username.clone(),
                    reason: LOGIN_REFUSED.to_string(),
                });
            }
            if !state.vhosts.contains_key(virtual_host) {
                return Err(ConnectionError::AuthenticationFailure {
                    username: credentials.username.clone(),
                    reason: format!("NOT_ALLOWED - vhost {virtual_host} not found"),
                });
            }

            let id = state.next_id();
            state.connections.insert(
                id,
                ConnectionEntry {
                    vhost: virtual_host.to_string(),
                    channels: Vec::new(),
                    shutdown_handlers: Vec::new(),
                    dispatch_tx,
                },
            );
            id
        };

        tokio::spawn(async move {
            while let Some(dispatch) = dispatch_rx.recv().await {
                match dispatch {
                    Dispatch::Consumer(handler, event) => handler(event),
                    Dispatch::Shutdown(handlers, signal) => {
                        for handler in handlers {
                            handler(signal.clone());
                        }
                    }
                }
            }
        });

        tracing::debug!(
            "Accepted connection {id} on {endpoint} (name={})",
            connection_name.unwrap_or("-")
        );
        Ok(Arc::new(InMemoryConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

/// A connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> AmqpResult<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        let Some(vhost) = state
            .connections
            .get(&self.id)
            .map(|connection| connection.vhost.clone())
        else {
            return Err(AmqpError::channel_closed(format!(
                "connection {} is not open",
                self.id
            )));
        };

        let channel_id = state.next_id();
        state.channels.insert(
            channel_id,
            ChannelEntry {
                connection_id: self.id,
                vhost,
                prefetch: 0,
                confirm_mode: false,
                next_delivery_tag: 0,
                unacked: BTreeMap::new(),
                consumers: Vec::new(),
            },
        );
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.channels.push(channel_id);
        }

        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id: channel_id,
        }))
    }

    fn on_shutdown(&self, handler: ShutdownHandler) {
        {
            let mut state = self.broker.lock();
            if let Some(connection) = state.connections.get_mut(&self.id) {
                connection.shutdown_handlers.push(handler);
                return;
            }
        }
        handler(ShutdownSignal {
            initiated_by_application: false,
            reason: format!("connection {} was already closed", self.id),
        });
    }

    fn is_open(&self) -> bool {
        self.broker.lock().connections.contains_key(&self.id)
    }

    async fn close(&self) -> AmqpResult<()> {
        self.broker.lock().close_connection(
            self.id,
            ShutdownSignal {
                initiated_by_application: true,
                reason: CLOSED_BY_APPLICATION.to_string(),
            },
        );
        Ok(())
    }
}

/// A channel on an [`InMemoryConnection`].
#[derive(Debug)]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> AmqpResult<String> {
        self.broker.lock().declare_queue(self.id, declaration)
    }

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> AmqpResult<()> {
        self.broker.lock().declare_exchange(self.id, declaration)
    }

    async fn bind_queue(&self, declaration: &BindingDeclaration) -> AmqpResult<()> {
        self.broker.lock().bind_queue(self.id, declaration)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> AmqpResult<()> {
        let mut state = self.broker.lock();
        let vhost = state.channel_vhost(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        state.dispatch_vhost(&vhost);
        Ok(())
    }

    async fn confirm_select(&self) -> AmqpResult<()> {
        let mut state = self.broker.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| channel_gone(self.id))?;
        channel.confirm_mode = true;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: Bytes,
    ) -> AmqpResult<ConfirmFuture> {
        let (confirmation, withhold) = {
            let mut state = self.broker.lock();
            let confirmation =
                state.publish(self.id, exchange, routing_key, mandatory, properties, body)?;
            let withhold = state.channels.get(&self.id).is_some_and(|channel| channel.confirm_mode)
                && state.confirm_behavior == ConfirmBehavior::Withhold;
            (confirmation, withhold)
        };

        if withhold {
            return Ok(futures::future::pending().boxed());
        }
        Ok(futures::future::ready(Ok(confirmation)).boxed())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        exclusive: bool,
        handler: ConsumerHandler,
    ) -> AmqpResult<String> {
        self.broker
            .lock()
            .consume(self.id, queue, consumer_tag, auto_ack, exclusive, handler)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> AmqpResult<()> {
        self.broker.lock().cancel(self.id, consumer_tag)
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> AmqpResult<()> {
        self.broker
            .lock()
            .settle(self.id, delivery_tag, multiple, None)
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> AmqpResult<()> {
        self.broker
            .lock()
            .settle(self.id, delivery_tag, multiple, Some(requeue))
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }

    async fn close(&self) -> AmqpResult<()> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

/// Returns true if a topic binding `pattern` matches `routing_key`.
///
/// `*` matches exactly one word and `#` matches zero or more words.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], words: &[&str]) -> bool {
        match pattern.split_first() {
            None => words.is_empty(),
            Some((&"#", rest)) => (0..=words.len()).any(|skip| matches(rest, &words[skip..])),
            Some((&"*", rest)) => !words.is_empty() && matches(rest, &words[1..]),
            Some((word, rest)) => {
                words.first().is_some_and(|first| first == word) && matches(rest, &words[1..])
            }
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &words)
}

fn headers_match(arguments: &FieldTable, headers: &FieldTable) -> bool {
    let match_any = matches!(
        arguments.get("x-match"),
        Some(FieldValue::Str(mode)) if mode == "any"
    );
    let mut required = arguments
        .iter()
        .filter(|(key, _)| !key.starts_with("x-"))
        .peekable();
    if required.peek().is_none() {
        return true;
    }

    if match_any {
        required.any(|(key, value)| headers.get(key) == Some(value))
    } else {
        required.all(|(key, value)| headers.get(key) == Some(value))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::testing::{recording_handler, wait_until_async};

    #[fixture]
    fn broker() -> InMemoryBroker {
        InMemoryBroker::new()
    }

    async fn open_channel(broker: &InMemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let connection = broker
            .connector()
            .connect(&Endpoint::default(), &Credentials::default(), "/", None)
            .await
            .unwrap();
        let channel = connection.create_channel().await.unwrap();
        (connection, channel)
    }

    async fn publish(channel: &Arc<dyn BrokerChannel>, exchange: &str, routing_key: &str, body: &'static str) {
        channel
            .basic_publish(
                exchange,
                routing_key,
                false,
                &MessageProperties::default(),
                Bytes::from_static(body.as_bytes()),
            )
            .await
            .unwrap()
            .await
            .unwrap();
    }

    fn bodies(events: &Mutex<Vec<ConsumerEvent>>) -> Vec<String> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ConsumerEvent::Delivery(message) => Some(message.body_utf8()),
                ConsumerEvent::Cancelled | ConsumerEvent::Failed(_) => None,
            })
            .collect()
    }

    #[rstest]
    #[case("a.b.c", "a.b.c", true)]
    #[case("a.*.c", "a.b.c", true)]
    #[case("a.*", "a.b.c", false)]
    #[case("a.#", "a.b.c", true)]
    #[case("a.#", "a", true)]
    #[case("#", "", true)]
    #[case("#.c", "a.b.c", true)]
    #[case("*.b.#", "x.b", true)]
    #[case("*", "", false)]
    fn test_topic_matches(#[case] pattern: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(topic_matches(pattern, key), expected);
    }

    #[rstest]
    fn test_headers_match_all_and_any() {
        let headers = FieldTable::from_iter([
            ("format".to_string(), FieldValue::from("pdf")),
            ("type".to_string(), FieldValue::from("report")),
        ]);
        let all = FieldTable::from_iter([
            ("format".to_string(), FieldValue::from("pdf")),
            ("type".to_string(), FieldValue::from("log")),
        ]);
        let mut any = all.clone();
        any.insert("x-match".to_string(), FieldValue::from("any"));

        assert!(!headers_match(&all, &headers));
        assert!(headers_match(&any, &headers));
    }

    #[rstest]
    #[tokio::test]
    async fn test_refuses_unknown_endpoint(broker: InMemoryBroker) {
        let result = broker
            .connector()
            .connect(&Endpoint::new("localhost", 5673), &Credentials::default(), "/", None)
            .await;

        assert!(matches!(result, Err(ConnectionError::Refused { .. })));
    }

    #[rstest]
    #[tokio::test]
    async fn test_rejects_wrong_password(broker: InMemoryBroker) {
        let result = broker
            .connector()
            .connect(&Endpoint::default(), &Credentials::new("guest", "nope"), "/", None)
            .await;

        assert!(matches!(
            result,
            Err(ConnectionError::AuthenticationFailure { .. })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries(broker: InMemoryBroker) {
        let (_connection, channel) = open_channel(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        for body in ["1", "2", "3"] {
            publish(&channel, "", "q", body).await;
        }

        channel.basic_qos(2).await.unwrap();
        let (handler, events) = recording_handler();
        channel.basic_consume("q", "", false, false, handler).await.unwrap();

        wait_until_async(|| async { bodies(&events).len() == 2 }, Duration::from_secs(2)).await;
        assert_eq!(broker.queue_depth("q"), Some(1));
        assert_eq!(broker.unacked_count("q"), 2);

        channel.basic_ack(1, false).await.unwrap();
        wait_until_async(|| async { bodies(&events).len() == 3 }, Duration::from_secs(2)).await;
        assert_eq!(bodies(&events), vec!["1", "2", "3"]);
    }

    #[rstest]
    #[tokio::test]
    async fn test_nack_requeue_redelivers_at_head(broker: InMemoryBroker) {
        let (_connection, channel) = open_channel(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        publish(&channel, "", "q", "first").await;
        publish(&channel, "", "q", "second").await;

        channel.basic_qos(1).await.unwrap();
        let (handler, events) = recording_handler();
        channel.basic_consume("q", "", false, false, handler).await.unwrap();
        wait_until_async(|| async { bodies(&events).len() == 1 }, Duration::from_secs(2)).await;

        channel.basic_nack(1, false, true).await.unwrap();
        wait_until_async(|| async { bodies(&events).len() == 2 }, Duration::from_secs(2)).await;

        let events = events.lock().unwrap();
        let ConsumerEvent::Delivery(redelivery) = &events[1] else {
            panic!("expected a delivery");
        };
        assert_eq!(redelivery.body_utf8(), "first");
        assert!(redelivery.envelope.redelivered);
        assert_eq!(redelivery.envelope.delivery_tag, 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_unknown_delivery_tag_is_rejected(broker: InMemoryBroker) {
        let (_connection, channel) = open_channel(&broker).await;
        let result = channel.basic_ack(99, false).await;
        assert!(matches!(result, Err(AmqpError::Broker { code: 406, .. })));
    }

    #[rstest]
    #[tokio::test]
    async fn test_topic_exchange_routing(broker: InMemoryBroker) {
        let (_connection, channel) = open_channel(&broker).await;
        channel
            .declare_exchange(&ExchangeDeclaration::new("events", ExchangeKind::Topic))
            .await
            .unwrap();
        for queue in ["orders", "all"] {
            channel.declare_queue(&QueueDeclaration::new(queue)).await.unwrap();
        }
        channel
            .bind_queue(&BindingDeclaration::new("orders", "events").with_routing_key("order.*"))
            .await
            .unwrap();
        channel
            .bind_queue(&BindingDeclaration::new("all", "events").with_routing_key("#"))
            .await
            .unwrap();

        publish(&channel, "events", "order.created", "a").await;
        publish(&channel, "events", "user.created", "b").await;

        assert_eq!(broker.queue_depth("orders"), Some(1));
        assert_eq!(broker.queue_depth("all"), Some(2));
    }

    #[rstest]
    #[tokio::test]
    async fn test_inequivalent_queue_declaration(broker: InMemoryBroker) {
        let (_connection, channel) = open_channel(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();

        let result = channel
            .declare_queue(&QueueDeclaration::new("q").durable(true))
            .await;

        assert!(matches!(result, Err(AmqpError::Broker { code: 406, .. })));
    }

    #[rstest]
    #[tokio::test]
    async fn test_passive_declaration_of_missing_queue(broker: InMemoryBroker) {
        let (_connection, channel) = open_channel(&broker).await;
        let result = channel
            .declare_queue(&QueueDeclaration::new("missing").passive(true))
            .await;
        assert!(matches!(result, Err(AmqpError::Broker { code: 404, .. })));
    }

    #[rstest]
    #[tokio::test]
    async fn test_exclusive_queue_deleted_with_connection(broker: InMemoryBroker) {
        let (connection, channel) = open_channel(&broker).await;
        let name = channel
            .declare_queue(&QueueDeclaration::server_named())
            .await
            .unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.queue_exists(&name));

        connection.close().await.unwrap();

        assert!(!broker.queue_exists(&name));
        assert_eq!(broker.connection_count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_channel_close_requeues_unacked(broker: InMemoryBroker) {
        let (_connection, channel) = open_channel(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        publish(&channel, "", "q", "pending").await;

        let (handler, events) = recording_handler();
        channel.basic_consume("q", "", false, false, handler).await.unwrap();
        wait_until_async(|| async { bodies(&events).len() == 1 }, Duration::from_secs(2)).await;
        assert_eq!(broker.queue_depth("q"), Some(0));

        channel.close().await.unwrap();

        assert_eq!(broker.queue_depth("q"), Some(1));
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_disconnect_all_notifies_shutdown_handlers(broker: InMemoryBroker) {
        let (connection, _channel) = open_channel(&broker).await;
        let signals = Arc::new(Mutex::new(Vec::new()));
        let recorded = signals.clone();
        connection.on_shutdown(Arc::new(move |signal| {
            recorded.lock().unwrap().push(signal);
        }));

        broker.disconnect_all("heartbeat timeout");

        wait_until_async(
            || async { !signals.lock().unwrap().is_empty() },
            Duration::from_secs(2),
        )
        .await;
        let signals = signals.lock().unwrap();
        assert_eq!(signals.len(), 1);
        assert!(!signals[0].initiated_by_application);
        assert_eq!(signals[0].reason, "heartbeat timeout");
        assert!(!connection.is_open());
    }

    #[rstest]
    #[tokio::test]
    async fn test_delete_queue_cancels_consumers(broker: InMemoryBroker) {
        let (_connection, channel) = open_channel(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        let (handler, events) = recording_handler();
        channel.basic_consume("q", "", false, false, handler).await.unwrap();

        assert!(broker.delete_queue("q"));

        wait_until_async(
            || async { events.lock().unwrap().contains(&ConsumerEvent::Cancelled) },
            Duration::from_secs(2),
        )
        .await;
    }

    #[rstest]
    #[tokio::test]
    async fn test_channel_exception_fails_consumers_and_requeues(broker: InMemoryBroker) {
        let (connection, channel) = open_channel(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        publish(&channel, "", "q", "a").await;
        let (handler, events) = recording_handler();
        channel.basic_consume("q", "", false, false, handler).await.unwrap();
        wait_until_async(
            || async { broker.unacked_count("q") == 1 },
            Duration::from_secs(2),
        )
        .await;

        assert_eq!(broker.fail_consumers("q", 406, "PRECONDITION_FAILED - test"), 1);

        wait_until_async(
            || async { events.lock().unwrap().len() == 2 },
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(
            events.lock().unwrap()[1],
            ConsumerEvent::Failed(AmqpError::Broker {
                code: 406,
                text: "PRECONDITION_FAILED - test".to_string(),
            })
        );
        assert!(!channel.is_open());
        assert!(connection.is_open());
        assert_eq!(broker.consumer_count("q"), 0);
        assert_eq!(broker.queue_depth("q"), Some(1));
    }

    #[rstest]
    #[tokio::test]
    async fn test_withheld_confirms_never_resolve(broker: InMemoryBroker) {
        let (_connection, channel) = open_channel(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        channel.confirm_select().await.unwrap();
        broker.set_confirm_behavior(ConfirmBehavior::Withhold);

        let confirm = channel
            .basic_publish("", "q", false, &MessageProperties::default(), Bytes::new())
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_millis(50), confirm).await;
        assert!(result.is_err());
        assert_eq!(broker.queue_depth("q"), Some(1));
    }
}
