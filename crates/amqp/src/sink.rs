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

//! Publishing a stream of messages.

use std::{collections::VecDeque, fmt::Debug, pin::Pin, sync::Arc, time::Duration};

use async_stream::try_stream;
use futures::{Stream, StreamExt, TryStreamExt};

use crate::{
    broker::{BrokerChannel, BrokerConnector, ConfirmFuture, Confirmation},
    config::{ConnectionConfig, ReplyToSinkConfig, SinkConfig},
    error::{AmqpError, AmqpResult},
    message::OutgoingMessage,
    supervisor::{ConnectionSupervisor, ShutdownEvent, ShutdownReceiver, wait_for_shutdown},
};

/// Signals that a sink finished and every message it published was accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Done;

/// Whether the broker confirmed a publish before it was reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Confirmed,
    /// Fire-and-forget, or an `immediate` message whose confirm is checked before completion.
    Unconfirmed,
}

/// The result of publishing one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteResult {
    /// 1-based position of the message among those published by the run.
    pub sequence: u64,
    pub outcome: PublishOutcome,
}

/// The per-message results of a sink run.
pub type PublishFlow = Pin<Box<dyn Stream<Item = AmqpResult<WriteResult>> + Send>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Routing {
    Static {
        exchange: String,
        routing_key: Option<String>,
    },
    ReplyTo {
        fail_if_missing: bool,
    },
}

/// Publishes messages from a stream, one connection per run.
#[derive(Clone, Debug)]
pub struct AmqpSink {
    connector: Arc<dyn BrokerConnector>,
    connection: ConnectionConfig,
    config: SinkConfig,
    routing: Routing,
}

impl AmqpSink {
    /// Creates a sink publishing to the exchange named by `config`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        connection: ConnectionConfig,
        config: SinkConfig,
    ) -> Self {
        let routing = Routing::Static {
            exchange: config.exchange.clone(),
            routing_key: config.routing_key.clone(),
        };
        Self {
            connector,
            connection,
            config,
            routing,
        }
    }

    /// Creates a sink publishing each message to the queue named by its reply-to property,
    /// through the default exchange.
    #[must_use]
    pub fn reply_to(
        connector: Arc<dyn BrokerConnector>,
        connection: ConnectionConfig,
        config: ReplyToSinkConfig,
    ) -> Self {
        Self {
            connector,
            connection,
            config: config.to_sink_config(),
            routing: Routing::ReplyTo {
                fail_if_missing: config.fail_if_reply_to_missing,
            },
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Publishes every message of `upstream`, yielding one result per published message.
    ///
    /// The connection opens when the flow is first polled, before anything is pulled from
    /// upstream. With publisher confirms enabled the next message is only pulled once the
    /// previous one was confirmed, otherwise up to `buffer_size` ready messages are pulled
    /// at a time. Confirms of `immediate` messages are awaited later, at most `buffer_size`
    /// of them outstanding at once. The flow ends after every outstanding confirm has arrived.
    ///
    /// A failure is yielded as a final `Err` item.
    #[must_use]
    pub fn publish_flow<S>(&self, upstream: S) -> PublishFlow
    where
        S: Stream<Item = OutgoingMessage> + Send + 'static,
    {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            self.connector.clone(),
            self.connection.clone(),
        ));
        let config = self.config.clone();
        let routing = self.routing.clone();

        Box::pin(try_stream! {
            config.validate()?;
            let mut shutdown = supervisor.subscribe();

            let opened = Publisher::open(&supervisor, &config, routing).await;
            if opened.is_err() {
                supervisor.close().await;
            }
            let mut publisher = opened?;

            let chunk_size = if config.publish_confirm { 1 } else { config.buffer_size };
            let mut upstream = Box::pin(upstream.ready_chunks(chunk_size));

            let outcome = 'publish: loop {
                let step = tokio::select! {
                    biased;
                    event = wait_for_shutdown(&mut shutdown) => Step::Shutdown(event),
                    batch = upstream.next() => Step::Batch(batch),
                };

                match step {
                    Step::Shutdown(event) => break event.into_error().map_or(Ok(()), Err),
                    Step::Batch(None) => break publisher.drain().await,
                    Step::Batch(Some(messages)) => {
                        for message in messages {
                            match publisher.publish(message).await {
                                Ok(Some(result)) => {
                                    yield result;
                                }
                                Ok(None) => {}
                                Err(e) => break 'publish Err(e),
                            }
                        }
                    }
                }
            };

            match &outcome {
                Ok(()) => tracing::debug!("Sink completed after {} message(s)", publisher.sequence),
                Err(e) => tracing::error!("Sink failed: {e}"),
            }
            supervisor.close().await;
            outcome?;
        })
    }

    /// Publishes every message of `upstream` and completes once all were accepted.
    ///
    /// # Errors
    ///
    /// Returns the first connection, routing or confirmation failure.
    pub async fn run<S>(&self, upstream: S) -> AmqpResult<Done>
    where
        S: Stream<Item = OutgoingMessage> + Send + 'static,
    {
        let mut flow = self.publish_flow(upstream);
        while flow.try_next().await?.is_some() {}
        Ok(Done)
    }
}

enum Step {
    Shutdown(ShutdownEvent),
    Batch(Option<Vec<OutgoingMessage>>),
}

/// Publishes on an open channel, tracking confirms.
#[derive(Debug)]
pub(crate) struct Publisher {
    channel: Arc<dyn BrokerChannel>,
    routing: Routing,
    publish_confirm: bool,
    confirm_timeout_ms: u64,
    sequence: u64,
    deferred: VecDeque<(u64, DeferredConfirm)>,
    max_deferred: usize,
    shutdown: ShutdownReceiver,
}

struct DeferredConfirm(ConfirmFuture);

impl Debug for DeferredConfirm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(stringify!(DeferredConfirm))
    }
}

impl Publisher {
    /// Opens the supervisor with the sink declarations and enables confirms if configured.
    pub(crate) async fn open(
        supervisor: &ConnectionSupervisor,
        config: &SinkConfig,
        routing: Routing,
    ) -> AmqpResult<Self> {
        let channel = supervisor.open(&config.declarations).await?;
        Self::on_channel(channel, supervisor.subscribe(), config, routing).await
    }

    /// Creates a publisher sharing an already open channel.
    pub(crate) async fn on_channel(
        channel: Arc<dyn BrokerChannel>,
        shutdown: ShutdownReceiver,
        config: &SinkConfig,
        routing: Routing,
    ) -> AmqpResult<Self> {
        if config.publish_confirm {
            channel.confirm_select().await?;
        }
        Ok(Self {
            channel,
            routing,
            publish_confirm: config.publish_confirm,
            confirm_timeout_ms: config.confirm_timeout_ms,
            sequence: 0,
            deferred: VecDeque::new(),
            max_deferred: config.buffer_size.max(1),
            shutdown,
        })
    }

    /// Resolves where `message` goes, or `None` to drop it.
    fn route(&self, message: &OutgoingMessage) -> AmqpResult<Option<(String, String)>> {
        match &self.routing {
            Routing::Static {
                exchange,
                routing_key,
            } => {
                let routing_key = message
                    .routing_key
                    .as_ref()
                    .or(routing_key.as_ref())
                    .cloned()
                    .unwrap_or_default();
                Ok(Some((exchange.clone(), routing_key)))
            }
            Routing::ReplyTo { fail_if_missing } => match &message.properties.reply_to {
                Some(reply_to) => Ok(Some((String::new(), reply_to.clone()))),
                None if *fail_if_missing => Err(AmqpError::MissingReplyTo),
                None => {
                    tracing::warn!("Dropping message without reply-to");
                    Ok(None)
                }
            },
        }
    }

    /// Publishes one message, waiting for its confirm unless confirms are off or the message
    /// is `immediate`. An `immediate` message beyond the deferred limit waits for the oldest
    /// outstanding confirm instead. Returns `None` if the message was dropped.
    pub(crate) async fn publish(
        &mut self,
        message: OutgoingMessage,
    ) -> AmqpResult<Option<WriteResult>> {
        let Some((exchange, routing_key)) = self.route(&message)? else {
            return Ok(None);
        };

        self.sequence += 1;
        let sequence = self.sequence;
        let confirm = self
            .channel
            .basic_publish(
                &exchange,
                &routing_key,
                message.mandatory,
                &message.properties,
                message.body,
            )
            .await?;
        tracing::trace!("Published {sequence} to '{exchange}' ({routing_key})");

        let outcome = if !self.publish_confirm {
            PublishOutcome::Unconfirmed
        } else if message.immediate {
            self.deferred.push_back((sequence, DeferredConfirm(confirm)));
            while self.deferred.len() > self.max_deferred {
                self.await_oldest().await?;
            }
            PublishOutcome::Unconfirmed
        } else {
            self.await_confirm(sequence, confirm).await?;
            PublishOutcome::Confirmed
        };

        Ok(Some(WriteResult { sequence, outcome }))
    }

    async fn await_confirm(&mut self, sequence: u64, confirm: ConfirmFuture) -> AmqpResult<()> {
        let timeout = Duration::from_millis(self.confirm_timeout_ms);

        let confirmation = tokio::select! {
            biased;
            event = wait_for_shutdown(&mut self.shutdown) => {
                return Err(event.into_error().unwrap_or_else(|| {
                    AmqpError::channel_closed("connection closed while awaiting confirm")
                }));
            }
            result = tokio::time::timeout(timeout, confirm) => result,
        };

        match confirmation {
            Ok(Ok(Confirmation::Ack | Confirmation::NotRequested)) => Ok(()),
            Ok(Ok(Confirmation::Nack)) => Err(AmqpError::PublishRejected { sequence }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AmqpError::ConfirmTimeout {
                sequence,
                timeout_ms: self.confirm_timeout_ms,
            }),
        }
    }

    async fn await_oldest(&mut self) -> AmqpResult<()> {
        let Some((sequence, DeferredConfirm(confirm))) = self.deferred.pop_front() else {
            return Ok(());
        };
        self.await_confirm(sequence, confirm).await
    }

    /// Waits for every deferred confirm.
    pub(crate) async fn drain(&mut self) -> AmqpResult<()> {
        while !self.deferred.is_empty() {
            self.await_oldest().await?;
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;
    use rstest::{fixture, rstest};

    use super::*;
    use crate::{
        broker::memory::{ConfirmBehavior, InMemoryBroker},
        config::Endpoint,
        declaration::QueueDeclaration,
        error::ConnectionError,
        message::MessageProperties,
    };

    #[fixture]
    fn broker() -> InMemoryBroker {
        InMemoryBroker::new()
    }

    fn sink(broker: &InMemoryBroker, config: SinkConfig) -> AmqpSink {
        AmqpSink::new(broker.connector(), ConnectionConfig::local(), config)
    }

    fn messages(bodies: &[&'static str]) -> impl Stream<Item = OutgoingMessage> + Send + 'static {
        stream::iter(
            bodies
                .iter()
                .map(|body| OutgoingMessage::new(*body))
                .collect::<Vec<_>>(),
        )
    }

    fn queue_sink_config(queue: &str) -> SinkConfig {
        SinkConfig::for_queue(queue).with_declaration(QueueDeclaration::new(queue))
    }

    #[rstest]
    #[tokio::test]
    async fn test_run_publishes_all_messages(broker: InMemoryBroker) {
        let done = sink(&broker, queue_sink_config("q"))
            .run(messages(&["a", "b", "c"]))
            .await
            .unwrap();

        assert_eq!(done, Done);
        assert_eq!(broker.queue_depth("q"), Some(3));
        assert_eq!(broker.connection_count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_empty_upstream_completes(broker: InMemoryBroker) {
        let result = sink(&broker, queue_sink_config("q"))
            .run(stream::empty())
            .await;

        assert_eq!(result, Ok(Done));
        assert_eq!(broker.connection_count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_confirmed_results_in_sequence(broker: InMemoryBroker) {
        let config = queue_sink_config("q").with_publish_confirm(true);
        let results: Vec<WriteResult> = sink(&broker, config)
            .publish_flow(messages(&["a", "b"]))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(
            results,
            vec![
                WriteResult {
                    sequence: 1,
                    outcome: PublishOutcome::Confirmed
                },
                WriteResult {
                    sequence: 2,
                    outcome: PublishOutcome::Confirmed
                },
            ]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_broker_nack_fails_sink(broker: InMemoryBroker) {
        broker.set_confirm_behavior(ConfirmBehavior::Nack);
        let config = queue_sink_config("q").with_publish_confirm(true);

        let result = sink(&broker, config).run(messages(&["a", "b"])).await;

        assert_eq!(result, Err(AmqpError::PublishRejected { sequence: 1 }));
    }

    #[rstest]
    #[tokio::test]
    async fn test_missing_confirm_times_out(broker: InMemoryBroker) {
        broker.set_confirm_behavior(ConfirmBehavior::Withhold);
        let config = queue_sink_config("q")
            .with_publish_confirm(true)
            .with_confirm_timeout_ms(50);

        let result = sink(&broker, config).run(messages(&["a"])).await;

        assert_eq!(
            result,
            Err(AmqpError::ConfirmTimeout {
                sequence: 1,
                timeout_ms: 50
            })
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_immediate_messages_confirmed_before_completion(broker: InMemoryBroker) {
        broker.set_confirm_behavior(ConfirmBehavior::Nack);
        let config = queue_sink_config("q").with_publish_confirm(true);
        let upstream = stream::iter(vec![OutgoingMessage::new("a").with_immediate(true)]);

        let mut flow = sink(&broker, config).publish_flow(upstream);

        assert_eq!(
            flow.next().await,
            Some(Ok(WriteResult {
                sequence: 1,
                outcome: PublishOutcome::Unconfirmed
            }))
        );
        assert_eq!(
            flow.next().await,
            Some(Err(AmqpError::PublishRejected { sequence: 1 }))
        );
        assert_eq!(flow.next().await, None);
    }

    #[rstest]
    #[tokio::test]
    async fn test_outstanding_immediate_confirms_bound_upstream_pulls(broker: InMemoryBroker) {
        broker.set_confirm_behavior(ConfirmBehavior::Withhold);
        let config = queue_sink_config("q")
            .with_publish_confirm(true)
            .with_confirm_timeout_ms(50)
            .with_buffer_size(2);
        let pulled = Arc::new(AtomicUsize::new(0));
        let upstream = stream::iter(0..10_000)
            .map(|i| OutgoingMessage::new(format!("message-{i}")).with_immediate(true))
            .inspect({
                let pulled = pulled.clone();
                move |_| {
                    pulled.fetch_add(1, Ordering::SeqCst);
                }
            });

        let results: Vec<AmqpResult<WriteResult>> =
            sink(&broker, config).publish_flow(upstream).collect().await;

        assert_eq!(
            results,
            vec![
                Ok(WriteResult {
                    sequence: 1,
                    outcome: PublishOutcome::Unconfirmed
                }),
                Ok(WriteResult {
                    sequence: 2,
                    outcome: PublishOutcome::Unconfirmed
                }),
                Err(AmqpError::ConfirmTimeout {
                    sequence: 1,
                    timeout_ms: 50
                }),
            ]
        );
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        assert_eq!(broker.queue_depth("q"), Some(3));
    }

    #[rstest]
    #[tokio::test]
    async fn test_message_routing_key_overrides_default(broker: InMemoryBroker) {
        let config = queue_sink_config("default")
            .with_declaration(QueueDeclaration::new("override"));
        let upstream = stream::iter(vec![
            OutgoingMessage::new("a"),
            OutgoingMessage::new("b").with_routing_key("override"),
        ]);

        sink(&broker, config).run(upstream).await.unwrap();

        assert_eq!(broker.queue_depth("default"), Some(1));
        assert_eq!(broker.queue_depth("override"), Some(1));
    }

    #[rstest]
    #[case(false, Ok(Done))]
    #[case(true, Err(AmqpError::MissingReplyTo))]
    #[tokio::test]
    async fn test_reply_to_sink_missing_header(
        broker: InMemoryBroker,
        #[case] strict: bool,
        #[case] expected: AmqpResult<Done>,
    ) {
        let config = ReplyToSinkConfig::default().with_fail_if_reply_to_missing(strict);
        let sink = AmqpSink::reply_to(broker.connector(), ConnectionConfig::local(), config);

        let result = sink.run(messages(&["orphan"])).await;

        assert_eq!(result, expected);
    }

    #[rstest]
    #[tokio::test]
    async fn test_reply_to_sink_routes_by_property(broker: InMemoryBroker) {
        let config = ReplyToSinkConfig::default()
            .with_declarations(vec![QueueDeclaration::new("replies").into()]);
        let sink = AmqpSink::reply_to(broker.connector(), ConnectionConfig::local(), config);
        let reply = OutgoingMessage::new("pong").with_properties(
            MessageProperties::default()
                .with_reply_to("replies")
                .with_correlation_id("1"),
        );

        sink.run(stream::iter(vec![reply])).await.unwrap();

        assert_eq!(broker.queue_depth("replies"), Some(1));
    }

    #[rstest]
    #[tokio::test]
    async fn test_unreachable_host_fails_completion(broker: InMemoryBroker) {
        let connection = ConnectionConfig::local().with_endpoint(Endpoint::new("localhost", 5673));
        let sink = AmqpSink::new(broker.connector(), connection, queue_sink_config("q"));

        let result = sink.run(stream::empty()).await;

        assert!(matches!(
            result,
            Err(AmqpError::Connection(ConnectionError::Refused { .. }))
        ));
    }
}
