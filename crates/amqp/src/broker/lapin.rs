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

//! Broker traits implemented over the [`lapin`] AMQP 0-9-1 client.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    message::DeliveryResult,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm,
    types::{AMQPValue, ByteArray, LongString, ShortString},
};

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConfirmFuture, Confirmation, ConsumerEvent,
    ConsumerHandler, ShutdownHandler, ShutdownSignal,
};
use crate::{
    MUTEX_POISONED,
    config::{Credentials, Endpoint},
    declaration::{BindingDeclaration, ExchangeDeclaration, ExchangeKind, QueueDeclaration},
    error::{AmqpError, AmqpResult, ConnectionError},
    message::{Envelope, FieldTable, FieldValue, IncomingMessage, MessageProperties},
};

const REPLY_SUCCESS: u16 = 200;
const INTERNAL_ERROR: u16 = 541;

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker) with `lapin`.
#[derive(Clone, Debug, Default)]
pub struct LapinConnector {
    tls: bool,
}

impl LapinConnector {
    /// Creates a new [`LapinConnector`] instance.
    #[must_use]
    pub const fn new() -> Self {
        Self { tls: false }
    }

    /// Connects with `amqps` instead of `amqp`.
    #[must_use]
    pub const fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Builds the AMQP URI for an endpoint, percent-encoding the user info and virtual host.
    #[must_use]
    pub fn uri(&self, endpoint: &Endpoint, credentials: &Credentials, virtual_host: &str) -> String {
        format!(
            "{}://{}:{}@{}:{}/{}",
            if self.tls { "amqps" } else { "amqp" },
            urlencoding::encode(&credentials.username),
            urlencoding::encode(&credentials.password),
            endpoint.host,
            endpoint.port,
            urlencoding::encode(virtual_host),
        )
    }
}

fn classify_connect_error(
    error: &lapin::Error,
    endpoint: &Endpoint,
    credentials: &Credentials,
) -> ConnectionError {
    let reason = error.to_string();
    if reason.contains("ACCESS_REFUSED") || reason.contains("NOT_ALLOWED") {
        ConnectionError::AuthenticationFailure {
            username: credentials.username.clone(),
            reason,
        }
    } else {
        ConnectionError::Refused {
            endpoint: endpoint.to_string(),
            reason,
        }
    }
}

fn to_amqp_error(error: lapin::Error) -> AmqpError {
    match error {
        lapin::Error::ProtocolError(e) => AmqpError::Broker {
            code: e.get_id(),
            text: e.get_message().as_str().to_string(),
        },
        lapin::Error::IOError(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_) => AmqpError::channel_closed(error.to_string()),
        other => AmqpError::Broker {
            code: INTERNAL_ERROR,
            text: other.to_string(),
        },
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        virtual_host: &str,
        connection_name: Option<&str>,
    ) -> Result<Arc<dyn BrokerConnection>, ConnectionError> {
        let uri = self.uri(endpoint, credentials, virtual_host);
        let mut properties = ConnectionProperties::default();
        if let Some(name) = connection_name {
            properties = properties.with_connection_name(LongString::from(name.to_string()));
        }

        let connection = Connection::connect(&uri, properties)
            .await
            .map_err(|e| classify_connect_error(&e, endpoint, credentials))?;
        tracing::debug!("Connected to {endpoint}");

        let notifier = Arc::new(ShutdownNotifier::default());
        connection.on_error({
            let notifier = notifier.clone();
            move |e| {
                notifier.fire(&ShutdownSignal {
                    initiated_by_application: false,
                    reason: e.to_string(),
                });
            }
        });

        Ok(Arc::new(LapinConnection {
            connection,
            notifier,
        }))
    }
}

#[derive(Default)]
struct ShutdownNotifier {
    handlers: Mutex<Vec<ShutdownHandler>>,
    signal: Mutex<Option<ShutdownSignal>>,
}

impl ShutdownNotifier {
    fn register(&self, handler: ShutdownHandler) {
        let fired = self.signal.lock().expect(MUTEX_POISONED).clone();
        match fired {
            Some(signal) => handler(signal),
            None => self.handlers.lock().expect(MUTEX_POISONED).push(handler),
        }
    }

    fn fire(&self, signal: &ShutdownSignal) {
        {
            let mut fired = self.signal.lock().expect(MUTEX_POISONED);
            if fired.is_some() {
                return;
            }
            *fired = Some(signal.clone());
        }

        let handlers = std::mem::take(&mut *self.handlers.lock().expect(MUTEX_POISONED));
        for handler in handlers {
            handler(signal.clone());
        }
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    connection: Connection,
    notifier: Arc<ShutdownNotifier>,
}

impl Debug for LapinConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(LapinConnection))
            .field("connected", &self.connection.status().connected())
            .finish()
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> AmqpResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(to_amqp_error)?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn on_shutdown(&self, handler: ShutdownHandler) {
        self.notifier.register(handler);
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> AmqpResult<()> {
        let result = if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(to_amqp_error)
        } else {
            Ok(())
        };

        self.notifier.fire(&ShutdownSignal {
            initiated_by_application: true,
            reason: "Connection closed by application".to_string(),
        });
        result
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
}

impl Debug for LapinChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(LapinChannel))
            .field("id", &self.channel.id())
            .finish()
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> AmqpResult<String> {
        let queue = self
            .channel
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    passive: declaration.passive,
                    durable: declaration.durable,
                    exclusive: declaration.exclusive,
                    auto_delete: declaration.auto_delete,
                    nowait: false,
                },
                to_lapin_table(&declaration.arguments),
            )
            .await
            .map_err(to_amqp_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> AmqpResult<()> {
        self.channel
            .exchange_declare(
                &declaration.name,
                to_lapin_kind(declaration.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    auto_delete: declaration.auto_delete,
                    internal: declaration.internal,
                    nowait: false,
                },
                to_lapin_table(&declaration.arguments),
            )
            .await
            .map_err(to_amqp_error)
    }

    async fn bind_queue(&self, declaration: &BindingDeclaration) -> AmqpResult<()> {
        self.channel
            .queue_bind(
                &declaration.queue,
                &declaration.exchange,
                &declaration.routing_key,
                QueueBindOptions::default(),
                to_lapin_table(&declaration.arguments),
            )
            .await
            .map_err(to_amqp_error)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> AmqpResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(to_amqp_error)
    }

    async fn confirm_select(&self) -> AmqpResult<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(to_amqp_error)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: Bytes,
    ) -> AmqpResult<ConfirmFuture> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                &body,
                to_lapin_properties(properties),
            )
            .await
            .map_err(to_amqp_error)?;

        Ok(async move {
            match confirm.await.map_err(to_amqp_error)? {
                publisher_confirm::Confirmation::Ack(_) => Ok(Confirmation::Ack),
                publisher_confirm::Confirmation::Nack(_) => Ok(Confirmation::Nack),
                publisher_confirm::Confirmation::NotRequested => Ok(Confirmation::NotRequested),
            }
        }
        .boxed())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        exclusive: bool,
        handler: ConsumerHandler,
    ) -> AmqpResult<String> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive,
                    nowait: false,
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(to_amqp_error)?;
        let tag = consumer.tag().as_str().to_string();

        consumer.set_delegate(move |delivery: DeliveryResult| {
            let handler = handler.clone();
            async move {
                match delivery {
                    Ok(Some(delivery)) => {
                        handler(ConsumerEvent::Delivery(IncomingMessage {
                            body: Bytes::from(delivery.data),
                            envelope: Envelope {
                                delivery_tag: delivery.delivery_tag,
                                redelivered: delivery.redelivered,
                                exchange: delivery.exchange.as_str().to_string(),
                                routing_key: delivery.routing_key.as_str().to_string(),
                            },
                            properties: from_lapin_properties(&delivery.properties),
                        }));
                    }
                    Ok(None) => handler(ConsumerEvent::Cancelled),
                    // Channel exceptions close only the channel, no shutdown signal follows
                    Err(e) => handler(ConsumerEvent::Failed(to_amqp_error(e))),
                }
            }
        });

        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> AmqpResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(to_amqp_error)
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> AmqpResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(to_amqp_error)
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> AmqpResult<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(to_amqp_error)
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> AmqpResult<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(to_amqp_error)
    }
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn to_lapin_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Bool(value) => AMQPValue::Boolean(*value),
        FieldValue::Int(value) => AMQPValue::LongLongInt(*value),
        FieldValue::Float(value) => AMQPValue::Double(*value),
        FieldValue::Str(value) => AMQPValue::LongString(LongString::from(value.clone())),
        FieldValue::Bytes(value) => AMQPValue::ByteArray(ByteArray::from(value.to_vec())),
    }
}

fn from_lapin_value(value: &AMQPValue) -> Option<FieldValue> {
    let value = match value {
        AMQPValue::Boolean(value) => FieldValue::Bool(*value),
        AMQPValue::ShortShortInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::ShortShortUInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::ShortInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::ShortUInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::LongInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::LongUInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::LongLongInt(value) => FieldValue::Int(*value),
        AMQPValue::Float(value) => FieldValue::Float(f64::from(*value)),
        AMQPValue::Double(value) => FieldValue::Float(*value),
        AMQPValue::ShortString(value) => FieldValue::Str(value.as_str().to_string()),
        AMQPValue::LongString(value) => {
            FieldValue::Str(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        AMQPValue::ByteArray(value) => FieldValue::Bytes(Bytes::copy_from_slice(value.as_slice())),
        _ => return None,
    };
    Some(value)
}

fn to_lapin_table(table: &FieldTable) -> lapin::types::FieldTable {
    let mut converted = lapin::types::FieldTable::default();
    for (key, value) in table {
        converted.insert(ShortString::from(key.clone()), to_lapin_value(value));
    }
    converted
}

fn from_lapin_table(table: &lapin::types::FieldTable) -> FieldTable {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match from_lapin_value(value) {
            Some(value) => Some((key.as_str().to_string(), value)),
            None => {
                tracing::debug!("Skipping unsupported header '{}'", key.as_str());
                None
            }
        })
        .collect()
}

fn short(value: &str) -> ShortString {
    ShortString::from(value.to_string())
}

fn to_lapin_properties(properties: &MessageProperties) -> BasicProperties {
    let mut converted = BasicProperties::default();
    if let Some(value) = &properties.content_type {
        converted = converted.with_content_type(short(value));
    }
    if let Some(value) = &properties.content_encoding {
        converted = converted.with_content_encoding(short(value));
    }
    if !properties.headers.is_empty() {
        converted = converted.with_headers(to_lapin_table(&properties.headers));
    }
    if let Some(value) = properties.delivery_mode {
        converted = converted.with_delivery_mode(value);
    }
    if let Some(value) = properties.priority {
        converted = converted.with_priority(value);
    }
    if let Some(value) = &properties.correlation_id {
        converted = converted.with_correlation_id(short(value));
    }
    if let Some(value) = &properties.reply_to {
        converted = converted.with_reply_to(short(value));
    }
    if let Some(value) = &properties.expiration {
        converted = converted.with_expiration(short(value));
    }
    if let Some(value) = &properties.message_id {
        converted = converted.with_message_id(short(value));
    }
    if let Some(value) = properties.timestamp {
        converted = converted.with_timestamp(value);
    }
    if let Some(value) = &properties.app_id {
        converted = converted.with_app_id(short(value));
    }
    converted
}

fn from_lapin_properties(properties: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.as_str().to_string());
    MessageProperties {
        content_type: text(properties.content_type()),
        content_encoding: text(properties.content_encoding()),
        headers: properties
            .headers()
            .as_ref()
            .map(from_lapin_table)
            .unwrap_or_default(),
        delivery_mode: *properties.delivery_mode(),
        priority: *properties.priority(),
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
        expiration: text(properties.expiration()),
        message_id: text(properties.message_id()),
        timestamp: *properties.timestamp(),
        app_id: text(properties.app_id()),
    }
}
