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

//! Ownership and lifecycle of a single broker connection and channel.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex, watch};

use crate::{
    broker::{BrokerChannel, BrokerConnection, BrokerConnector, ShutdownSignal},
    config::ConnectionConfig,
    declaration::Declaration,
    error::{AmqpError, AmqpResult, ConnectionError},
    state::ConnectionState,
};

/// How a supervised connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownEvent {
    /// The connection was closed on request.
    Requested,
    /// The connection was lost unexpectedly.
    Failed(ConnectionError),
}

impl ShutdownEvent {
    /// Returns the error dependent streams should fail with, if any.
    #[must_use]
    pub fn into_error(self) -> Option<AmqpError> {
        match self {
            Self::Requested => None,
            Self::Failed(e) => Some(AmqpError::Connection(e)),
        }
    }
}

/// Receives the shutdown event of a supervisor, `None` until it fires.
pub type ShutdownReceiver = watch::Receiver<Option<ShutdownEvent>>;

/// Waits until the supervisor behind `receiver` shuts down.
pub async fn wait_for_shutdown(receiver: &mut ShutdownReceiver) -> ShutdownEvent {
    match receiver.wait_for(Option::is_some).await {
        Ok(event) => event.clone().unwrap_or(ShutdownEvent::Requested),
        Err(_) => ShutdownEvent::Requested,
    }
}

#[derive(Debug)]
struct OpenConnection {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl OpenConnection {
    async fn close(self) {
        if let Err(e) = self.channel.close().await {
            tracing::warn!("Error closing channel: {e}");
        }
        if let Err(e) = self.connection.close().await {
            tracing::warn!("Error closing connection: {e}");
        }
    }
}

/// Owns one broker connection and its channel.
///
/// A supervisor opens at most once. Dependent engines observe [`ConnectionSupervisor::subscribe`]
/// to end their streams when the connection is closed or lost.
pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    config: ConnectionConfig,
    state: Arc<AtomicU8>,
    inner: Mutex<Option<OpenConnection>>,
    shutdown_tx: Arc<watch::Sender<Option<ShutdownEvent>>>,
}

impl Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(ConnectionSupervisor))
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionSupervisor {
    /// Creates a new disconnected [`ConnectionSupervisor`].
    #[must_use]
    pub fn new(connector: Arc<dyn BrokerConnector>, config: ConnectionConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(None);
        Self {
            connector,
            config,
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected.as_u8())),
            inner: Mutex::new(None),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_atomic(&self.state)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Subscribes to the shutdown event, which fires exactly once.
    #[must_use]
    pub fn subscribe(&self) -> ShutdownReceiver {
        self.shutdown_tx.subscribe()
    }

    /// Returns the open channel, if any.
    pub async fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|open| open.channel.clone())
    }

    /// Connects, opens a channel and runs `declarations` in order.
    ///
    /// Endpoints are dialed in configuration order. A refused or timed out endpoint moves on
    /// to the next one, an authentication failure stops immediately. If any declaration
    /// fails the connection is closed; declarations that already succeeded are not rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidState`] unless the supervisor is disconnected, the
    /// [`ConnectionError`] of the last endpoint tried, or [`AmqpError::Declaration`].
    pub async fn open(&self, declarations: &[Declaration]) -> AmqpResult<Arc<dyn BrokerChannel>> {
        let mut inner = self.inner.lock().await;

        if let Err(actual) = self.state.compare_exchange(
            ConnectionState::Disconnected.as_u8(),
            ConnectionState::Connecting.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(AmqpError::InvalidState {
                expected: ConnectionState::Disconnected,
                actual: ConnectionState::from_u8(actual),
            });
        }

        match self.establish(declarations).await {
            Ok(open) => {
                let channel = open.channel.clone();
                self.register_shutdown_handler(open.connection.as_ref());
                *inner = Some(open);

                if self
                    .state
                    .compare_exchange(
                        ConnectionState::Connecting.as_u8(),
                        ConnectionState::Open.as_u8(),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
                {
                    // Lost before the transition, the shutdown handler has the cause
                    let reason = match self.subscribe().borrow().clone() {
                        Some(ShutdownEvent::Failed(e)) => e,
                        _ => ConnectionError::Disconnected("connection lost while opening".into()),
                    };
                    return Err(AmqpError::Connection(reason));
                }

                tracing::debug!("Connection open");
                Ok(channel)
            }
            Err(e) => {
                self.state
                    .store(ConnectionState::Failed.as_u8(), Ordering::SeqCst);
                tracing::error!("Failed to open connection: {e}");
                Err(e)
            }
        }
    }

    async fn establish(&self, declarations: &[Declaration]) -> AmqpResult<OpenConnection> {
        let connection = self.connect().await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    tracing::warn!("Error closing connection: {close_err}");
                }
                return Err(e);
            }
        };
        let open = OpenConnection {
            connection,
            channel,
        };

        for declaration in declarations {
            tracing::debug!("Declaring {declaration}");
            if let Err(e) = declaration.apply(open.channel.as_ref()).await {
                open.close().await;
                return Err(e);
            }
        }

        Ok(open)
    }

    async fn connect(&self) -> AmqpResult<Arc<dyn BrokerConnection>> {
        let config = &self.config;
        let timeout = Duration::from_millis(config.connection_timeout_ms);
        let mut last_error = None;

        for endpoint in config.resolved_endpoints() {
            tracing::debug!("Connecting to {endpoint}");
            let attempt = self.connector.connect(
                &endpoint,
                &config.credentials,
                &config.virtual_host,
                config.connection_name.as_deref(),
            );

            match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(connection)) => {
                    tracing::debug!("Connected to {endpoint}");
                    return Ok(connection);
                }
                Ok(Err(e @ ConnectionError::AuthenticationFailure { .. })) => {
                    return Err(e.into());
                }
                Ok(Err(e)) => {
                    tracing::warn!("Connection to {endpoint} failed: {e}");
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!("Connection to {endpoint} timed out");
                    last_error = Some(ConnectionError::Refused {
                        endpoint: endpoint.to_string(),
                        reason: format!(
                            "Connection timed out after {}ms",
                            config.connection_timeout_ms
                        ),
                    });
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ConnectionError::Disconnected("no endpoints configured".into()))
            .into())
    }

    fn register_shutdown_handler(&self, connection: &dyn BrokerConnection) {
        let state = self.state.clone();
        let shutdown_tx = self.shutdown_tx.clone();

        connection.on_shutdown(Arc::new(move |signal: ShutdownSignal| {
            let current = ConnectionState::from_atomic(&state);
            let event = if signal.initiated_by_application || current.is_closing_or_closed() {
                ShutdownEvent::Requested
            } else {
                tracing::warn!("Connection lost: {}", signal.reason);
                state.store(ConnectionState::Failed.as_u8(), Ordering::SeqCst);
                ShutdownEvent::Failed(ConnectionError::Disconnected(signal.reason))
            };
            fire(&shutdown_tx, event);
        }));
    }

    /// Closes the channel and connection. Idempotent, and a no-op after a failure.
    ///
    /// A supervisor that never opened moves straight to closed and can no longer be opened.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;

        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => return,
            ConnectionState::Failed => {
                // Already reported through the shutdown event
                if let Some(open) = inner.take() {
                    open.close().await;
                }
                return;
            }
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Open => {}
        }

        tracing::debug!("Closing connection");
        self.state
            .store(ConnectionState::Closing.as_u8(), Ordering::SeqCst);
        if let Some(open) = inner.take() {
            open.close().await;
        }
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
        fire(&self.shutdown_tx, ShutdownEvent::Requested);
        tracing::debug!("Connection closed");
    }
}

fn fire(shutdown_tx: &watch::Sender<Option<ShutdownEvent>>, event: ShutdownEvent) {
    shutdown_tx.send_if_modified(|slot| {
        if slot.is_some() {
            return false;
        }
        *slot = Some(event);
        true
    });
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        let Some(open) = self.inner.get_mut().take() else {
            return;
        };
        if !self.state().is_open() {
            return;
        }

        self.state
            .store(ConnectionState::Closing.as_u8(), Ordering::SeqCst);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Supervisor dropped while open, closing connection");
                handle.spawn(open.close());
            }
            Err(_) => {
                tracing::warn!("Supervisor dropped outside a runtime, connection not closed");
            }
        }
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
        fire(&self.shutdown_tx, ShutdownEvent::Requested);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::{
        broker::memory::InMemoryBroker,
        config::{Credentials, Endpoint},
        declaration::{BindingDeclaration, ExchangeDeclaration, ExchangeKind, QueueDeclaration},
        testing::wait_until_async,
    };

    #[fixture]
    fn broker() -> InMemoryBroker {
        InMemoryBroker::new()
    }

    fn supervisor(broker: &InMemoryBroker, config: ConnectionConfig) -> ConnectionSupervisor {
        ConnectionSupervisor::new(broker.connector(), config)
    }

    #[rstest]
    #[tokio::test]
    async fn test_open_runs_declarations_in_order(broker: InMemoryBroker) {
        let supervisor = supervisor(&broker, ConnectionConfig::local());
        let declarations = vec![
            ExchangeDeclaration::new("events", ExchangeKind::Fanout).into(),
            QueueDeclaration::new("audit").into(),
            BindingDeclaration::new("audit", "events").into(),
        ];

        supervisor.open(&declarations).await.unwrap();

        assert_eq!(supervisor.state(), ConnectionState::Open);
        assert!(broker.queue_exists("audit"));
        assert!(supervisor.channel().await.is_some());
    }

    #[rstest]
    #[tokio::test]
    async fn test_failed_declaration_closes_connection(broker: InMemoryBroker) {
        let supervisor = supervisor(&broker, ConnectionConfig::local());
        let declarations = vec![
            QueueDeclaration::new("first").into(),
            BindingDeclaration::new("first", "missing").into(),
            QueueDeclaration::new("never").into(),
        ];

        let result = supervisor.open(&declarations).await;

        match result {
            Err(AmqpError::Declaration { target, reason }) => {
                assert_eq!(target, "binding 'missing' -> 'first' ()");
                assert!(reason.contains("NOT_FOUND"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(supervisor.state(), ConnectionState::Failed);
        assert_eq!(broker.connection_count(), 0);
        assert!(broker.queue_exists("first"));
        assert!(!broker.queue_exists("never"));
    }

    #[rstest]
    #[tokio::test]
    async fn test_falls_back_to_next_endpoint(broker: InMemoryBroker) {
        let config = ConnectionConfig::local()
            .with_endpoint(Endpoint::new("unreachable", 5672))
            .with_endpoint(Endpoint::default());
        let supervisor = supervisor(&broker, config);

        supervisor.open(&[]).await.unwrap();

        assert!(supervisor.is_open());
        assert_eq!(broker.connection_count(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_refused_when_all_endpoints_fail(broker: InMemoryBroker) {
        let config = ConnectionConfig::local()
            .with_endpoint(Endpoint::new("localhost", 5673))
            .with_endpoint(Endpoint::new("localhost", 5674));
        let supervisor = supervisor(&broker, config);

        let result = supervisor.open(&[]).await;

        match result {
            Err(AmqpError::Connection(ConnectionError::Refused { endpoint, .. })) => {
                assert_eq!(endpoint, "localhost:5674");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_authentication_failure_stops_fallback(broker: InMemoryBroker) {
        let broker = broker.with_listener(Endpoint::new("backup", 5672));
        let config = ConnectionConfig::local()
            .with_endpoint(Endpoint::default())
            .with_endpoint(Endpoint::new("backup", 5672))
            .with_credentials(Credentials::new("guest", "wrong"));
        let supervisor = supervisor(&broker, config);

        let result = supervisor.open(&[]).await;

        assert!(matches!(
            result,
            Err(AmqpError::Connection(ConnectionError::AuthenticationFailure { .. }))
        ));
        assert_eq!(supervisor.state(), ConnectionState::Failed);
    }

    #[rstest]
    #[tokio::test]
    async fn test_close_is_idempotent_and_fires_once(broker: InMemoryBroker) {
        let supervisor = supervisor(&broker, ConnectionConfig::local());
        let mut shutdown = supervisor.subscribe();
        supervisor.open(&[]).await.unwrap();

        supervisor.close().await;
        supervisor.close().await;

        assert_eq!(supervisor.state(), ConnectionState::Closed);
        assert_eq!(wait_for_shutdown(&mut shutdown).await, ShutdownEvent::Requested);
        assert_eq!(broker.connection_count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_cannot_reopen(broker: InMemoryBroker) {
        let supervisor = supervisor(&broker, ConnectionConfig::local());
        supervisor.open(&[]).await.unwrap();
        supervisor.close().await;

        let result = supervisor.open(&[]).await;

        assert_eq!(
            result.unwrap_err(),
            AmqpError::InvalidState {
                expected: ConnectionState::Disconnected,
                actual: ConnectionState::Closed,
            }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_unexpected_disconnect_fails(broker: InMemoryBroker) {
        let supervisor = supervisor(&broker, ConnectionConfig::local());
        let mut shutdown = supervisor.subscribe();
        supervisor.open(&[]).await.unwrap();

        broker.disconnect_all("broker restarted");

        assert_eq!(
            wait_for_shutdown(&mut shutdown).await,
            ShutdownEvent::Failed(ConnectionError::Disconnected("broker restarted".into()))
        );
        assert_eq!(supervisor.state(), ConnectionState::Failed);

        // Closing after a failure does not replace the failure
        supervisor.close().await;
        assert_eq!(supervisor.state(), ConnectionState::Failed);
    }

    #[rstest]
    #[tokio::test]
    async fn test_drop_closes_open_connection(broker: InMemoryBroker) {
        let supervisor = supervisor(&broker, ConnectionConfig::local());
        supervisor.open(&[]).await.unwrap();
        assert_eq!(broker.connection_count(), 1);

        drop(supervisor);

        wait_until_async(
            || async { broker.connection_count() == 0 },
            Duration::from_secs(2),
        )
        .await;
    }
}
