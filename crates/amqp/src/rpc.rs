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

//! Request/reply exchanges correlating a fixed number of replies to each request.
//!
//! Requests are published with a fresh correlation id and the flow's server-named reply
//! queue as reply-to. A router task consumes the reply queue and forwards every reply whose
//! correlation id is pending to the reply stream. The flow completes once upstream ended,
//! every expected reply arrived and every forwarded reply was settled.

use std::{
    fmt::Debug,
    pin::Pin,
    sync::{Arc, OnceLock},
    time::Instant,
};

use async_stream::try_stream;
use dashmap::DashMap;
use futures::{Stream, StreamExt, future::BoxFuture};
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::{
    broker::BrokerConnector,
    completion::Completion,
    config::{ConnectionConfig, QueueSource, RpcConfig},
    declaration::QueueDeclaration,
    error::{AmqpError, AmqpResult},
    message::{CommittableMessage, IncomingMessage, OutgoingMessage},
    sink::{Done, Publisher, Routing},
    source::{ConsumerOptions, DeliveryConsumer},
    supervisor::{ConnectionSupervisor, ShutdownEvent, ShutdownReceiver, wait_for_shutdown},
};

/// Bookkeeping for one published request.
#[derive(Debug)]
pub struct CorrelationEntry {
    pub expected: usize,
    pub received: usize,
    pub created_at: Instant,
    /// Resolved once every expected reply arrived, or with the failure ending the flow.
    pub completion: Arc<Completion<AmqpResult<()>>>,
}

/// Whether a reply belonged to a pending request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyMatch {
    /// The reply was counted, `remaining` more are expected for its request.
    Matched { remaining: usize },
    Unknown,
}

/// Maps correlation ids to the replies still expected for them.
#[derive(Debug, Default)]
pub struct RpcCorrelator {
    entries: DashMap<String, CorrelationEntry>,
    idle: Notify,
}

impl RpcCorrelator {
    /// Creates a new empty [`RpcCorrelator`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request expecting `expected` replies.
    ///
    /// The returned completion resolves with `Ok` once the last reply is counted, or with the
    /// error given to [`Self::fail_all`]. Callers tracking requests in aggregate through
    /// [`Self::wait_idle`] may drop it.
    pub fn register(
        &self,
        correlation_id: impl Into<String>,
        expected: usize,
    ) -> Arc<Completion<AmqpResult<()>>> {
        let completion = Arc::new(Completion::new());
        self.entries.insert(
            correlation_id.into(),
            CorrelationEntry {
                expected,
                received: 0,
                created_at: Instant::now(),
                completion: completion.clone(),
            },
        );
        completion
    }

    #[must_use]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Counts a reply for `correlation_id`, removing the entry once complete.
    pub fn record_reply(&self, correlation_id: &str) -> ReplyMatch {
        let remaining = {
            let Some(mut entry) = self.entries.get_mut(correlation_id) else {
                return ReplyMatch::Unknown;
            };
            entry.received += 1;
            entry.expected.saturating_sub(entry.received)
        };

        if remaining == 0
            && let Some((_, entry)) = self.entries.remove(correlation_id)
        {
            entry.completion.complete(Ok(()));
            self.idle.notify_waiters();
        }
        ReplyMatch::Matched { remaining }
    }

    /// Completes every pending request with `error` and forgets them.
    pub fn fail_all(&self, error: &AmqpError) {
        self.entries.retain(|_, entry| {
            entry.completion.complete(Err(error.clone()));
            false
        });
        self.idle.notify_waiters();
    }

    /// Returns the number of requests still awaiting replies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of replies still expected across all requests.
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.expected.saturating_sub(entry.received))
            .sum()
    }

    /// Waits until no request awaits replies.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.entries.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// The replies of an RPC run.
pub type ReplyStream<T> = Pin<Box<dyn Stream<Item = AmqpResult<T>> + Send>>;

/// One running RPC exchange.
pub struct RpcRun<T> {
    /// Correlated replies, in arrival order. Ends after the flow completes.
    pub replies: ReplyStream<T>,
    /// Resolves once the flow has finished.
    pub completion: BoxFuture<'static, AmqpResult<Done>>,
    reply_queue: Arc<OnceLock<String>>,
    correlator: Arc<RpcCorrelator>,
}

impl<T> Debug for RpcRun<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(RpcRun))
            .field("reply_queue", &self.reply_queue.get())
            .field("correlator", &self.correlator)
            .finish()
    }
}

impl<T> RpcRun<T> {
    /// Returns the reply queue name once the flow has connected.
    #[must_use]
    pub fn reply_queue(&self) -> Option<&str> {
        self.reply_queue.get().map(String::as_str)
    }

    #[must_use]
    pub fn correlator(&self) -> &RpcCorrelator {
        &self.correlator
    }

    /// Splits the run into its reply stream and completion.
    #[must_use]
    pub fn into_parts(self) -> (ReplyStream<T>, BoxFuture<'static, AmqpResult<Done>>) {
        (self.replies, self.completion)
    }
}

/// Publishes requests and streams back their correlated replies.
#[derive(Clone, Debug)]
pub struct AmqpRpcFlow {
    connector: Arc<dyn BrokerConnector>,
    connection: ConnectionConfig,
    config: RpcConfig,
}

impl AmqpRpcFlow {
    /// Creates a new [`AmqpRpcFlow`] instance.
    #[must_use]
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        connection: ConnectionConfig,
        config: RpcConfig,
    ) -> Self {
        Self {
            connector,
            connection,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Runs the flow, acknowledging each reply as it is pulled from the reply stream.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn at_most_once<S>(&self, upstream: S) -> RpcRun<IncomingMessage>
    where
        S: Stream<Item = OutgoingMessage> + Send + 'static,
    {
        self.run(upstream, |mut replies| {
            Box::pin(try_stream! {
                while let Some(reply) = replies.next().await {
                    let (message, handle) = reply?.into_parts();
                    handle.ack().await?;
                    yield message;
                }
            })
        })
    }

    /// Runs the flow with replies that must each be settled.
    ///
    /// The flow only completes after every reply was acknowledged or rejected.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn committable<S>(&self, upstream: S) -> RpcRun<CommittableMessage>
    where
        S: Stream<Item = OutgoingMessage> + Send + 'static,
    {
        self.run(upstream, |replies| replies)
    }

    fn run<S, T, F>(&self, upstream: S, map: F) -> RpcRun<T>
    where
        S: Stream<Item = OutgoingMessage> + Send + 'static,
        F: FnOnce(ReplyStream<CommittableMessage>) -> ReplyStream<T>,
    {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            self.connector.clone(),
            self.connection.clone(),
        ));
        let correlator = Arc::new(RpcCorrelator::new());
        let reply_queue = Arc::new(OnceLock::new());
        let failure = Arc::new(Completion::new());
        let (replies_tx, replies_rx) = mpsc::channel(self.config.buffer_size.max(1));

        let driver = Driver {
            supervisor,
            config: self.config.clone(),
            correlator: correlator.clone(),
            reply_queue: reply_queue.clone(),
            failure: failure.clone(),
        };
        let task = tokio::spawn(driver.run(upstream, replies_tx));

        RpcRun {
            replies: map(Box::pin(reply_stream(replies_rx, failure))),
            completion: Box::pin(async move {
                task.await.unwrap_or_else(|e| {
                    Err(AmqpError::channel_closed(format!("RPC flow task failed: {e}")))
                })
            }),
            reply_queue,
            correlator,
        }
    }
}

fn reply_stream(
    mut replies_rx: mpsc::Receiver<CommittableMessage>,
    failure: Arc<Completion<AmqpError>>,
) -> impl Stream<Item = AmqpResult<CommittableMessage>> + Send + 'static {
    try_stream! {
        while let Some(reply) = replies_rx.recv().await {
            yield reply;
        }
        if let Some(e) = failure.peek() {
            Err::<(), _>(e)?;
        }
    }
}

fn shutdown_error(event: ShutdownEvent) -> AmqpError {
    event.into_error().unwrap_or_else(|| {
        AmqpError::channel_closed("connection closed before all replies arrived")
    })
}

struct Driver {
    supervisor: Arc<ConnectionSupervisor>,
    config: RpcConfig,
    correlator: Arc<RpcCorrelator>,
    reply_queue: Arc<OnceLock<String>>,
    failure: Arc<Completion<AmqpError>>,
}

impl Driver {
    async fn run<S>(
        self,
        upstream: S,
        replies_tx: mpsc::Sender<CommittableMessage>,
    ) -> AmqpResult<Done>
    where
        S: Stream<Item = OutgoingMessage> + Send + 'static,
    {
        let result = match self.config.validate() {
            Ok(()) => {
                let mut upstream = Box::pin(upstream);
                match upstream.next().await {
                    // Nothing to send, never connect
                    None => {
                        tracing::debug!("RPC flow completed without requests");
                        return Ok(Done);
                    }
                    Some(first) => self.exchange(first, upstream, &replies_tx).await,
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            tracing::error!("RPC flow failed: {e}");
            self.failure.complete(e.clone());
            self.correlator.fail_all(e);
        }
        self.supervisor.close().await;
        result
    }

    async fn exchange(
        &self,
        first: OutgoingMessage,
        mut upstream: Pin<Box<impl Stream<Item = OutgoingMessage> + Send>>,
        replies_tx: &mpsc::Sender<CommittableMessage>,
    ) -> AmqpResult<Done> {
        let config = &self.config;
        let mut shutdown = self.supervisor.subscribe();

        let channel = self.supervisor.open(&config.sink.declarations).await?;
        let reply_queue = channel
            .declare_queue(&QueueDeclaration::server_named())
            .await?;
        let consumer = DeliveryConsumer::start(
            channel.clone(),
            &QueueSource::Named {
                queue: reply_queue.clone(),
            },
            &ConsumerOptions {
                buffer_size: config.buffer_size,
                prefetch_count: config.prefetch_count(),
                ack_required: config.ack_required,
                consumer_tag: None,
                exclusive: true,
            },
        )
        .await?;
        let tracker = consumer.tracker();
        let _ = self.reply_queue.set(reply_queue.clone());
        tracing::debug!("RPC replies on '{reply_queue}'");

        tokio::spawn(route_replies(
            consumer,
            self.supervisor.subscribe(),
            self.correlator.clone(),
            replies_tx.clone(),
            self.failure.clone(),
        ));

        let routing = Routing::Static {
            exchange: config.sink.exchange.clone(),
            routing_key: config.sink.routing_key.clone(),
        };
        let mut publisher =
            Publisher::on_channel(channel, self.supervisor.subscribe(), &config.sink, routing)
                .await?;

        let mut next = Some(first);
        loop {
            let mut request = match next.take() {
                Some(request) => request,
                None => {
                    let step = tokio::select! {
                        biased;
                        event = wait_for_shutdown(&mut shutdown) => Err(event),
                        request = upstream.next() => Ok(request),
                    };
                    match step {
                        Err(event) => return Err(shutdown_error(event)),
                        Ok(None) => break,
                        Ok(Some(request)) => request,
                    }
                }
            };

            let correlation_id = Uuid::new_v4().to_string();
            request.properties.correlation_id = Some(correlation_id.clone());
            request.properties.reply_to = Some(reply_queue.clone());
            self.correlator
                .register(correlation_id.as_str(), config.replies_per_message);
            publisher.publish(request).await?;
            tracing::trace!("Sent request {correlation_id}");
        }
        publisher.drain().await?;

        let settled = async {
            self.correlator.wait_idle().await;
            tracker.wait_empty().await;
        };
        tokio::select! {
            biased;
            event = wait_for_shutdown(&mut shutdown) => Err(shutdown_error(event)),
            e = self.failure.wait() => Err(e),
            () = settled => Ok(Done),
        }
    }
}

async fn route_replies(
    mut consumer: DeliveryConsumer,
    mut shutdown: ShutdownReceiver,
    correlator: Arc<RpcCorrelator>,
    replies_tx: mpsc::Sender<CommittableMessage>,
    failure: Arc<Completion<AmqpError>>,
) {
    let reason = loop {
        match consumer.next(&mut shutdown).await {
            Some(Ok(reply)) => {
                let correlation_id = reply.message.properties.correlation_id.clone();
                let Some(correlation_id) =
                    correlation_id.filter(|id| correlator.contains(id.as_str()))
                else {
                    tracing::warn!(
                        "Dropping reply {} without a pending correlation id",
                        reply.delivery_tag()
                    );
                    if let Err(e) = reply.ack().await {
                        tracing::debug!("Error acknowledging dropped reply: {e}");
                    }
                    continue;
                };

                if replies_tx.send(reply).await.is_err() {
                    let error = AmqpError::channel_closed("reply stream dropped");
                    failure.complete(error.clone());
                    correlator.fail_all(&error);
                    break error.to_string();
                }
                correlator.record_reply(&correlation_id);
            }
            Some(Err(e)) => {
                failure.complete(e.clone());
                correlator.fail_all(&e);
                break e.to_string();
            }
            None => break "reply consumer completed".to_string(),
        }
    };

    consumer.stop(&reason).await;
}
