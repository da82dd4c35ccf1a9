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

//! Declarative descriptions of the queues, exchanges and bindings a connection sets up
//! before it is considered open.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::{
    broker::BrokerChannel,
    error::{AmqpError, AmqpResult},
    message::FieldTable,
};

/// The routing algorithm of an exchange.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Hash,
    PartialEq,
    Eq,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// A queue to declare.
///
/// An empty `name` asks the broker to generate one, which is then returned from the
/// declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Only check that the queue exists, never create it.
    pub passive: bool,
    pub arguments: FieldTable,
}

impl Default for QueueDeclaration {
    fn default() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            passive: false,
            arguments: FieldTable::new(),
        }
    }
}

impl QueueDeclaration {
    /// Creates a new non-durable [`QueueDeclaration`] named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Creates an exclusive auto-delete declaration named by the broker.
    #[must_use]
    pub fn server_named() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub const fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    #[must_use]
    pub const fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    #[must_use]
    pub const fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }
}

/// An exchange to declare.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeDeclaration {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub arguments: FieldTable,
}

impl ExchangeDeclaration {
    /// Creates a new non-durable [`ExchangeDeclaration`].
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::new(),
        }
    }

    #[must_use]
    pub const fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub const fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }
}

/// A binding of a queue to an exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BindingDeclaration {
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    /// Binding arguments, matched against message headers by `headers` exchanges.
    #[serde(default)]
    pub arguments: FieldTable,
}

impl BindingDeclaration {
    /// Creates a new [`BindingDeclaration`] with no routing key.
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: String::new(),
            arguments: FieldTable::new(),
        }
    }

    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }
}

/// A single idempotent setup step run in order before a connection opens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Declaration {
    Queue(QueueDeclaration),
    Exchange(ExchangeDeclaration),
    Binding(BindingDeclaration),
}

impl Declaration {
    /// Applies the declaration on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::Declaration`] naming this declaration if the broker refuses it.
    pub async fn apply(&self, channel: &dyn BrokerChannel) -> AmqpResult<()> {
        let result = match self {
            Self::Queue(queue) => channel.declare_queue(queue).await.map(|_| ()),
            Self::Exchange(exchange) => channel.declare_exchange(exchange).await,
            Self::Binding(binding) => channel.bind_queue(binding).await,
        };

        result.map_err(|e| AmqpError::Declaration {
            target: self.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Display for Declaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue(queue) => write!(f, "queue '{}'", queue.name),
            Self::Exchange(exchange) => {
                write!(f, "{} exchange '{}'", exchange.kind, exchange.name)
            }
            Self::Binding(binding) => write!(
                f,
                "binding '{}' -> '{}' ({})",
                binding.exchange, binding.queue, binding.routing_key
            ),
        }
    }
}

impl From<QueueDeclaration> for Declaration {
    fn from(value: QueueDeclaration) -> Self {
        Self::Queue(value)
    }
}

impl From<ExchangeDeclaration> for Declaration {
    fn from(value: ExchangeDeclaration) -> Self {
        Self::Exchange(value)
    }
}

impl From<BindingDeclaration> for Declaration {
    fn from(value: BindingDeclaration) -> Self {
        Self::Binding(value)
    }
}
