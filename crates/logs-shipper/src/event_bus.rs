// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle notifications between the queue and its consumers.
//!
//! ```text
//!   LogQueue::create/destroy ──publish──> LifecycleBus ──try_send──> subscriber rx
//! ```
//!
//! Publishing never waits: a subscriber whose channel is full misses the
//! event, and a subscriber whose receiver was dropped is pruned. The queue's
//! destroy path must not stall on an absent or slow listener.

use std::sync::Mutex;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::constants::MAX_LIFECYCLE_EVENTS;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A queue became live and can be drained.
    QueueActivated,
    /// The queue was destroyed; consumers must stop draining it.
    QueueDeactivated,
    /// The live queue was reconfigured with a different destination.
    DestinationChanged,
}

#[derive(Debug, Default)]
pub struct LifecycleBus {
    subscribers: Mutex<Vec<mpsc::Sender<LifecycleEvent>>>,
}

impl LifecycleBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener.
    pub fn subscribe(&self) -> mpsc::Receiver<LifecycleEvent> {
        let (tx, rx) = mpsc::channel(MAX_LIFECYCLE_EVENTS);
        match self.subscribers.lock() {
            Ok(mut guard) => guard.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    /// Best-effort delivery to every listener. Returns the number of
    /// listeners that received the event.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let mut guard = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut delivered = 0;
        guard.retain(|tx| match tx.try_send(event) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("QUEUE | Lifecycle listener is busy, dropping {event:?}");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
