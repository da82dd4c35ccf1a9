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

//! A result slot resolved exactly once and observable from async and blocking code.

use std::{
    fmt::Debug,
    sync::{Condvar, Mutex},
    time::Duration,
};

use tokio::sync::Notify;

use crate::MUTEX_POISONED;

/// A write-once result slot with any number of waiters.
///
/// Async waiters are woken through a [`Notify`], blocking waiters through a [`Condvar`], so
/// broker callbacks can resolve a completion without knowing who is waiting on it.
pub struct Completion<T> {
    slot: Mutex<Option<T>>,
    condvar: Condvar,
    notify: Notify,
}

impl<T> Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(Completion))
            .field("is_complete", &self.is_complete())
            .finish()
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    /// Creates a new unresolved [`Completion`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            condvar: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Resolves the completion with `value`.
    ///
    /// Returns false, dropping `value`, if the completion was already resolved.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.slot.lock().expect(MUTEX_POISONED);
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);

        self.condvar.notify_all();
        self.notify.notify_waiters();
        true
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slot.lock().expect(MUTEX_POISONED).is_some()
    }
}

impl<T: Clone> Completion<T> {
    /// Returns a copy of the value if resolved.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.slot.lock().expect(MUTEX_POISONED).clone()
    }

    /// Waits asynchronously for the value.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the slot so a concurrent `complete` is not missed
            notified.as_mut().enable();

            if let Some(value) = self.peek() {
                return value;
            }
            notified.await;
        }
    }

    /// Blocks the current thread until the value is available or `timeout` elapses.
    ///
    /// Must not be called from within an async task.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let slot = self.slot.lock().expect(MUTEX_POISONED);
        let (slot, _) = self
            .condvar
            .wait_timeout_while(slot, timeout, |value| value.is_none())
            .expect(MUTEX_POISONED);
        slot.clone()
    }
}
