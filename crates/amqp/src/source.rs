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

//! Consuming a queue as a demand-driven stream.
//!
//! Broker deliveries arrive on the client's I/O task and are only pushed into an unbounded
//! channel there. How many deliveries can be in flight is bounded by the prefetch credit
//! granted to the broker (`buffer_size`): the broker only sends more once earlier deliveries
//! are acknowledged, which ties broker delivery to downstream demand.

use std::{
    fmt::Debug,
    pin::Pin,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use async_stream::try_stream;
use futures::{Stream, TryStreamExt};
use tokio::sync::mpsc;

use crate::{
    ack::AckTracker,
    broker::{BrokerChannel, BrokerConnector, ConsumerEvent, ConsumerHandler},
    config::{ConnectionConfig, QueueSource, SourceConfig},
    declaration::{BindingDeclaration, QueueDeclaration},
    error::{AmqpError, AmqpResult},
    message::{CommittableMessage, IncomingMessage},
    state::ConnectionState,
    supervisor::{ConnectionSupervisor, ShutdownEvent, ShutdownReceiver, wait_for_shutdown},
};

/// Consumer settings shared by sources and RPC reply consumers.
#[derive(Clone, Debug)]
pub(crate) struct ConsumerOptions {
    pub buffer_size: usize,
    pub prefetch_count: u16,
    pub ack_required: bool,
    pub consumer_tag: Option<String>,
    pub exclusive: bool,
}

impl From<&SourceConfig> for ConsumerOptions {
    fn from(config: &SourceConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            prefetch_count: config.prefetch_count(),
            ack_required: config.ack_required,
            consumer_tag: config.consumer_tag.clone(),
            exclusive: config.exclusive,
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Delivery(IncomingMessage),
    Cancelled,
    Failed(AmqpError),
    Overflow,
}

/// How long a consumer whose channel went away waits for the connection to report why.
const CHANNEL_CLOSE_GRACE: Duration = Duration::from_secs(1);

enum Next {
    Shutdown(ShutdownEvent),
    Inbound(Option<Inbound>),
}

/// A running broker consumer feeding committable messages.
#[derive(Debug)]
pub(crate) struct DeliveryConsumer {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    consumer_tag: String,
    tracker: Arc<AckTracker>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    buffered: Arc<AtomicUsize>,
    capacity: usize,
}

fn delivery_handler(
    tx: mpsc::UnboundedSender<Inbound>,
    buffered: Arc<AtomicUsize>,
    capacity: usize,
    ack_required: bool,
) -> ConsumerHandler {
    Arc::new(move |event| {
        let inbound = match event {
            ConsumerEvent::Delivery(message) => {
                let depth = buffered.fetch_add(1, Ordering::SeqCst) + 1;
                // Prefetch credit bounds the depth unless the broker auto-acks
                if !ack_required && depth > capacity {
                    buffered.fetch_sub(1, Ordering::SeqCst);
                    Inbound::Overflow
                } else {
                    Inbound::Delivery(message)
                }
            }
            ConsumerEvent::Cancelled => Inbound::Cancelled,
            ConsumerEvent::Failed(e) => Inbound::Failed(e),
        };

        if let Err(e) = tx.send(inbound) {
            tracing::trace!("Consumer stopped, dropping {:?}", e.0);
        }
    })
}

/// Resolves the queue to consume, declaring and binding a temporary queue when asked to.
async fn resolve_queue(channel: &dyn BrokerChannel, queue: &QueueSource) -> AmqpResult<String> {
    match queue {
        QueueSource::Named { queue } => Ok(queue.clone()),
        QueueSource::Temporary {
            exchange,
            routing_key,
        } => {
            let name = channel
                .declare_queue(&QueueDeclaration::server_named())
                .await?;
            channel
                .bind_queue(
                    &BindingDeclaration::new(name.as_str(), exchange.as_str())
                        .with_routing_key(routing_key.as_str()),
                )
                .await?;
            tracing::debug!("Bound temporary queue '{name}' to '{exchange}' ({routing_key})");
            Ok(name)
        }
    }
}

impl DeliveryConsumer {
    /// Starts consuming `queue` on `channel`.
    pub(crate) async fn start(
        channel: Arc<dyn BrokerChannel>,
        queue: &QueueSource,
        options: &ConsumerOptions,
    ) -> AmqpResult<Self> {
        let queue = resolve_queue(channel.as_ref(), queue).await?;

        if options.ack_required {
            channel.basic_qos(options.prefetch_count).await?;
        }

        let tracker = Arc::new(AckTracker::new(channel.clone(), options.ack_required));
        let (tx, inbound) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let handler = delivery_handler(
            tx,
            buffered.clone(),
            options.buffer_size,
            options.ack_required,
        );

        let consumer_tag = channel
            .basic_consume(
                &queue,
                options.consumer_tag.as_deref().unwrap_or_default(),
                !options.ack_required,
                options.exclusive,
                handler,
            )
            .await?;
        tracing::debug!("Consuming '{queue}' as '{consumer_tag}'");

        Ok(Self {
            channel,
            queue,
            consumer_tag,
            tracker,
            inbound,
            buffered,
            capacity: options.buffer_size,
        })
    }

    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn tracker(&self) -> Arc<AckTracker> {
        self.tracker.clone()
    }

    /// Waits for the next delivery.
    ///
    /// Returns `None` once the consumer ends gracefully: the connection was closed on
    /// request, or the broker cancelled the consumer. Losing the channel or the connection
    /// fails pending acknowledgments and yields the error once.
    pub(crate) async fn next(
        &mut self,
        shutdown: &mut ShutdownReceiver,
    ) -> Option<AmqpResult<CommittableMessage>> {
        let next = tokio::select! {
            biased;
            event = wait_for_shutdown(shutdown) => Next::Shutdown(event),
            inbound = self.inbound.recv() => Next::Inbound(inbound),
        };

        match next {
            Next::Shutdown(event) => event.into_error().map(|e| self.fail(e)),
            Next::Inbound(Some(Inbound::Delivery(message))) => {
                self.buffered.fetch_sub(1, Ordering::SeqCst);
                let handle = self.tracker.register(message.envelope.delivery_tag);
                tracing::trace!(
                    "Delivery {} from '{}'",
                    message.envelope.delivery_tag,
                    self.queue
                );
                Some(Ok(CommittableMessage::new(message, handle)))
            }
            Next::Inbound(Some(Inbound::Cancelled)) => {
                tracing::debug!("Consumer '{}' cancelled by broker", self.consumer_tag);
                None
            }
            Next::Inbound(Some(Inbound::Failed(e))) => {
                tracing::warn!("Consumer '{}' failed: {e}", self.consumer_tag);
                // A connection loss surfaces on the consumer too, prefer its cause
                let e = shutdown
                    .borrow()
                    .clone()
                    .and_then(ShutdownEvent::into_error)
                    .unwrap_or(e);
                Some(self.fail(e))
            }
            Next::Inbound(Some(Inbound::Overflow)) => Some(Err(AmqpError::BufferOverflow {
                capacity: self.capacity,
            })),
            Next::Inbound(None) => {
                // The channel closed under the consumer, the shutdown signal may still be
                // in flight
                match tokio::time::timeout(CHANNEL_CLOSE_GRACE, wait_for_shutdown(shutdown)).await
                {
                    Ok(event) => event.into_error().map(|e| self.fail(e)),
                    Err(_) => Some(self.fail(AmqpError::channel_closed(format!(
                        "channel of consumer '{}' closed",
                        self.consumer_tag
                    )))),
                }
            }
        }
    }

    fn fail(&self, e: AmqpError) -> AmqpResult<CommittableMessage> {
        self.tracker.teardown(&e.to_string());
        Err(e)
    }

    /// Stops broker deliveries and fails acknowledgments still pending.
    pub(crate) async fn stop(&self, reason: &str) {
        if self.channel.is_open()
            && let Err(e) = self.channel.basic_cancel(&self.consumer_tag).await
        {
            tracing::debug!("Error cancelling consumer '{}': {e}", self.consumer_tag);
        }
        self.tracker.teardown(reason);
    }
}

#[derive(Debug, Default)]
struct RunHandles {
    tracker: OnceLock<Arc<AckTracker>>,
    queue: OnceLock<String>,
}

/// Consumes a queue as a stream, one connection per run.
#[derive(Clone, Debug)]
pub struct AmqpSource {
    connector: Arc<dyn BrokerConnector>,
    connection: ConnectionConfig,
    config: SourceConfig,
}

impl AmqpSource {
    /// Creates a new [`AmqpSource`] instance.
    #[must_use]
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        connection: ConnectionConfig,
        config: SourceConfig,
    ) -> Self {
        Self {
            connector,
            connection,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Returns a stream of messages acknowledged before they are emitted.
    ///
    /// A message lost downstream after emission is never redelivered. Nothing connects until
    /// the stream is first polled.
    #[must_use]
    pub fn at_most_once(&self) -> SourceStream<IncomingMessage> {
        self.run(|mut deliveries| {
            Box::pin(try_stream! {
                while let Some(committable) = deliveries.try_next().await? {
                    let (message, handle) = committable.into_parts();
                    handle.ack().await?;
                    yield message;
                }
            })
        })
    }

    /// Returns a stream of messages that must each be settled with `ack` or `nack`.
    ///
    /// Nothing connects until the stream is first polled.
    #[must_use]
    pub fn committable(&self) -> SourceStream<CommittableMessage> {
        self.run(|deliveries| Box::pin(deliveries))
    }

    fn run<T, F>(&self, map: F) -> SourceStream<T>
    where
        F: FnOnce(
            Pin<Box<dyn Stream<Item = AmqpResult<CommittableMessage>> + Send>>,
        ) -> Pin<Box<dyn Stream<Item = AmqpResult<T>> + Send>>,
    {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            self.connector.clone(),
            self.connection.clone(),
        ));
        let handles = Arc::new(RunHandles::default());
        let deliveries = deliveries(supervisor.clone(), self.config.clone(), handles.clone());

        SourceStream {
            inner: map(Box::pin(deliveries)),
            supervisor,
            handles,
        }
    }
}

fn deliveries(
    supervisor: Arc<ConnectionSupervisor>,
    config: SourceConfig,
    handles: Arc<RunHandles>,
) -> impl Stream<Item = AmqpResult<CommittableMessage>> + Send + 'static {
    try_stream! {
        config.validate()?;
        let mut shutdown = supervisor.subscribe();

        let started = match supervisor.open(&config.declarations).await {
            Ok(channel) => {
                DeliveryConsumer::start(channel, &config.queue, &ConsumerOptions::from(&config))
                    .await
            }
            Err(e) => Err(e),
        };
        if started.is_err() {
            supervisor.close().await;
        }
        let mut consumer = started?;
        let _ = handles.tracker.set(consumer.tracker());
        let _ = handles.queue.set(consumer.queue().to_string());

        let outcome = loop {
            match consumer.next(&mut shutdown).await {
                Some(Ok(message)) => {
                    yield message;
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };

        match &outcome {
            Ok(()) => consumer.stop("source completed").await,
            Err(e) => consumer.stop(&e.to_string()).await,
        }
        supervisor.close().await;
        outcome?;
    }
}

/// The stream produced by one run of an [`AmqpSource`].
///
/// Dropping the stream stops consumption, fails pending acknowledgments and closes the
/// connection.
pub struct SourceStream<T> {
    inner: Pin<Box<dyn Stream<Item = AmqpResult<T>> + Send>>,
    supervisor: Arc<ConnectionSupervisor>,
    handles: Arc<RunHandles>,
}

impl<T> Debug for SourceStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(SourceStream))
            .field("supervisor", &self.supervisor)
            .field("queue", &self.handles.queue.get())
            .finish()
    }
}

impl<T> SourceStream<T> {
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Returns the consumed queue name once consuming has started.
    #[must_use]
    pub fn queue_name(&self) -> Option<&str> {
        self.handles.queue.get().map(String::as_str)
    }

    /// Returns the number of emitted deliveries not yet settled.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.handles.tracker.get().map_or(0, |tracker| tracker.len())
    }

    /// Stops consuming and closes the connection.
    ///
    /// Unsettled deliveries are returned to the queue by the broker.
    pub async fn cancel(self) {
        let supervisor = self.supervisor.clone();
        drop(self);
        supervisor.close().await;
    }
}

impl<T> Stream for SourceStream<T> {
    type Item = AmqpResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> Drop for SourceStream<T> {
    fn drop(&mut self) {
        if let Some(tracker) = self.handles.tracker.get() {
            tracker.teardown("source stream dropped");
        }
    }
}
