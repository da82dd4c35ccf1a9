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

//! Consumer-side acknowledgment bookkeeping.
//!
//! Every delivery handed downstream is registered under its delivery tag together with a
//! [`Completion`]. The entry is removed once the broker has processed the `ack`/`nack`, or
//! completed with [`AmqpError::ChannelClosed`] when the channel is torn down first, so no
//! acknowledgment ever waits on a channel that no longer exists.

use std::{
    fmt::Debug,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::{
    broker::BrokerChannel,
    completion::Completion,
    error::{AmqpError, AmqpResult},
};

type AckCompletion = Arc<Completion<AmqpResult<()>>>;

/// A delivery awaiting acknowledgment.
#[derive(Debug)]
pub struct PendingAck {
    pub completion: AckCompletion,
    pub created_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// Tracks outstanding acknowledgments for the deliveries of one channel.
#[derive(Debug)]
pub struct AckTracker {
    channel: Arc<dyn BrokerChannel>,
    ack_required: bool,
    pending: DashMap<u64, PendingAck>,
    closed: OnceLock<String>,
    settled: Notify,
}

impl AckTracker {
    /// Creates a new [`AckTracker`] for deliveries on `channel`.
    ///
    /// When `ack_required` is false the broker already considers deliveries settled, so
    /// `ack`/`nack` resolve locally without a broker round-trip.
    #[must_use]
    pub fn new(channel: Arc<dyn BrokerChannel>, ack_required: bool) -> Self {
        Self {
            channel,
            ack_required,
            pending: DashMap::new(),
            closed: OnceLock::new(),
            settled: Notify::new(),
        }
    }

    #[must_use]
    pub const fn ack_required(&self) -> bool {
        self.ack_required
    }

    /// Registers a delivery and returns the handle used to settle it.
    ///
    /// Registering on a torn down tracker returns a handle whose settlement fails with
    /// [`AmqpError::ChannelClosed`].
    #[must_use]
    pub fn register(self: &Arc<Self>, delivery_tag: u64) -> AckHandle {
        let completion: AckCompletion = Arc::new(Completion::new());

        match self.closed.get() {
            Some(reason) => {
                completion.complete(Err(AmqpError::channel_closed(reason.clone())));
            }
            None => {
                self.pending.insert(
                    delivery_tag,
                    PendingAck {
                        completion: completion.clone(),
                        created_at: Instant::now(),
                    },
                );
                // A concurrent teardown may have drained the map before the insert
                if let Some(reason) = self.closed.get() {
                    self.pending.remove(&delivery_tag);
                    completion.complete(Err(AmqpError::channel_closed(reason.clone())));
                }
            }
        }

        tracing::trace!("Registered delivery {delivery_tag}");
        AckHandle {
            delivery_tag,
            tracker: self.clone(),
            used: AtomicBool::new(false),
            completion,
        }
    }

    async fn settle(
        &self,
        delivery_tag: u64,
        completion: &AckCompletion,
        settlement: Settlement,
    ) -> AmqpResult<()> {
        if !self.ack_required {
            self.remove(delivery_tag);
            completion.complete(Ok(()));
            return completion.wait().await;
        }

        if let Some(result) = completion.peek() {
            return result;
        }

        let operation = async {
            match settlement {
                Settlement::Ack => self.channel.basic_ack(delivery_tag, false).await,
                Settlement::Nack { requeue } => {
                    self.channel
                        .basic_nack(delivery_tag, false, requeue)
                        .await
                }
            }
        };

        let outcome = tokio::select! {
            biased;
            torn_down = completion.wait() => torn_down,
            result = operation => result,
        };

        self.remove(delivery_tag);
        if completion.complete(outcome.clone()) {
            tracing::trace!("Settled delivery {delivery_tag} ({settlement:?}): {outcome:?}");
            outcome
        } else {
            completion.wait().await
        }
    }

    /// Fails every pending acknowledgment with [`AmqpError::ChannelClosed`] and rejects
    /// later registrations. Idempotent.
    pub fn teardown(&self, reason: &str) {
        if self.closed.set(reason.to_string()).is_err() {
            return;
        }

        let error = AmqpError::channel_closed(reason);
        let mut failed = 0_usize;
        self.pending.retain(|_, pending| {
            if pending.completion.complete(Err(error.clone())) {
                failed += 1;
            }
            false
        });

        self.settled.notify_waiters();

        if failed > 0 {
            tracing::debug!("Failed {failed} pending acknowledgment(s): {reason}");
        }
    }

    fn remove(&self, delivery_tag: u64) {
        if self.pending.remove(&delivery_tag).is_some() {
            self.settled.notify_waiters();
        }
    }

    /// Waits until no delivery awaits acknowledgment.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending.is_empty() {
                return;
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// Returns the number of deliveries awaiting acknowledgment.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn contains(&self, delivery_tag: u64) -> bool {
        self.pending.contains_key(&delivery_tag)
    }

    /// Returns how long the oldest pending delivery has been waiting.
    #[must_use]
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.pending
            .iter()
            .map(|entry| entry.value().created_at.elapsed())
            .max()
    }
}

/// Settles exactly one delivery.
pub struct AckHandle {
    delivery_tag: u64,
    tracker: Arc<AckTracker>,
    used: AtomicBool,
    completion: AckCompletion,
}

impl Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(AckHandle))
            .field("delivery_tag", &self.delivery_tag)
            .field("used", &self.used.load(Ordering::Relaxed))
            .field("completion", &self.completion)
            .finish()
    }
}

impl AckHandle {
    #[must_use]
    pub const fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Returns true once `ack` or `nack` has been invoked.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }

    /// Returns the settlement outcome if already known.
    #[must_use]
    pub fn outcome(&self) -> Option<AmqpResult<()>> {
        self.completion.peek()
    }

    /// Returns the completion resolved with the settlement outcome.
    ///
    /// Useful for blocking inspection with [`Completion::wait_timeout`].
    #[must_use]
    pub fn completion(&self) -> AckCompletion {
        self.completion.clone()
    }

    fn claim(&self) -> AmqpResult<()> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::DoubleAcknowledgment {
                delivery_tag: self.delivery_tag,
            });
        }
        Ok(())
    }

    /// Acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::DoubleAcknowledgment`] if the delivery was already settled through
    /// this handle, or [`AmqpError::ChannelClosed`] if the channel closed first.
    pub async fn ack(&self) -> AmqpResult<()> {
        self.claim()?;
        self.tracker
            .settle(self.delivery_tag, &self.completion, Settlement::Ack)
            .await
    }

    /// Rejects the delivery, requeueing it when `requeue` is true.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::DoubleAcknowledgment`] if the delivery was already settled through
    /// this handle, or [`AmqpError::ChannelClosed`] if the channel closed first.
    pub async fn nack(&self, requeue: bool) -> AmqpResult<()> {
        self.claim()?;
        self.tracker
            .settle(self.delivery_tag, &self.completion, Settlement::Nack { requeue })
            .await
    }
}
