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

//! Backpressured AMQP connectivity for [NautilusTrader](http://nautilustrader.io).
//!
//! The `nautilus-amqp` crate bridges pull-based async streams to a push-based AMQP broker
//! client. It provides:
//!
//! - **Sources**: consume a queue as a demand-driven [`futures::Stream`], either at-most-once
//!   (acknowledged before emission) or committable (explicit `ack`/`nack` per message).
//! - **Sinks**: publish a stream of [`message::OutgoingMessage`] to an exchange, optionally
//!   waiting on publisher confirms, or route replies to each message's reply-to queue.
//! - **RPC flows**: publish requests and correlate a fixed number of replies per request.
//!
//! The AMQP wire protocol itself lives behind the [`broker`] traits. An in-memory broker
//! ([`broker::memory::InMemoryBroker`]) implements them for tests, and a `lapin` backed
//! implementation is available with the `lapin` feature.
//!
//! # Feature flags
//!
//! - `lapin`: Enables the [lapin](https://docs.rs/lapin) broker client implementation.

#![warn(rustc::all)]
#![deny(unsafe_code)]
#![deny(nonstandard_style)]
#![deny(missing_debug_implementations)]
#![deny(clippy::missing_errors_doc)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod ack;
pub mod broker;
pub mod completion;
pub mod config;
pub mod declaration;
pub mod error;
pub mod message;
pub mod rpc;
pub mod sink;
pub mod source;
pub mod state;
pub mod supervisor;
pub mod testing;

// Re-exports
pub use crate::{
    error::{AmqpError, AmqpResult, ConnectionError},
    message::{CommittableMessage, IncomingMessage, OutgoingMessage},
    rpc::AmqpRpcFlow,
    sink::{AmqpSink, Done},
    source::AmqpSource,
    supervisor::ConnectionSupervisor,
};

/// Message for when a mutex guard cannot be acquired due to poisoning.
///
/// A poisoned mutex means a thread panicked while holding the lock, so the protected
/// state may be inconsistent and propagating the panic is the only safe option.
pub const MUTEX_POISONED: &str = "Mutex poisoned";
