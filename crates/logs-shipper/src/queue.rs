// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, thread-safe log event queue.
//!
//! Many producers enqueue concurrently; one consumer (the publisher) drains
//! batches. The queue has an explicit lifecycle:
//!
//! ```text
//!            create()                 destroy()
//!  Inactive ─────────> Active ──────────────────> Inactive
//!                       │  ^
//!                       └──┘ create() with a new destination
//!                            (DestinationChanged, buffer kept)
//! ```
//!
//! # Locking
//!
//! A single `RwLock` guards the lifecycle. Enqueue and dequeue take it
//! shared, so they never serialize against each other beyond the short
//! critical section on the buffer itself. Create and destroy take it
//! exclusively, which makes destroy wait for in-flight operations.
//!
//! # Capacity
//!
//! Enqueue fails fast with [`QueueError::QueueOverflow`] once `capacity`
//! events are buffered; it never waits for space and never evicts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::constants::{MAX_BATCH_SIZE_BYTES, MAX_EVENTS_PER_BATCH, MAX_EVENT_SIZE_BYTES};
use crate::event::LogEvent;
use crate::event_bus::{LifecycleBus, LifecycleEvent};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full ({capacity} events)")]
    QueueOverflow { capacity: usize },
    #[error("queue is not active")]
    QueueNotActive,
}

/// Where the events of the live queue go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueDestination {
    pub log_group: String,
    pub sharing_enabled: bool,
    /// Encoded `key::secret::group::stream`, empty when not configured.
    pub sharing_destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub destination: QueueDestination,
}

/// Outcome of [`LogQueue::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    DestinationChanged,
    Unchanged,
}

#[derive(Debug)]
struct Buffer {
    items: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
    available: Notify,
    closed: AtomicBool,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(MAX_EVENTS_PER_BATCH))),
            capacity,
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<LogEvent>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, event: LogEvent) -> Result<(), QueueError> {
        {
            let mut items = self.items();
            if items.len() >= self.capacity {
                return Err(QueueError::QueueOverflow {
                    capacity: self.capacity,
                });
            }
            items.push_back(event);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pops events in FIFO order until either limit is hit. The first event
    /// is always taken so an oversized one cannot wedge the queue.
    fn drain_batch(&self, max_events: usize, max_bytes: usize) -> Vec<LogEvent> {
        let mut items = self.items();
        let mut batch = Vec::new();
        let mut bytes = 0;
        while batch.len() < max_events {
            let Some(next) = items.front() else { break };
            let size = next.serialized_size();
            if !batch.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            if let Some(event) = items.pop_front() {
                batch.push(event);
            }
        }
        batch
    }

    fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut items = self.items();
            let dropped = items.len();
            items.clear();
            items.shrink_to_fit();
            dropped
        };
        self.available.notify_waiters();
        dropped
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    buffer: Option<Arc<Buffer>>,
    destination: Option<QueueDestination>,
}

/// The log event queue. At most one buffer is live per `LogQueue`; share the
/// queue itself behind an `Arc` between producers and the publisher.
#[derive(Debug)]
pub struct LogQueue {
    state: RwLock<QueueState>,
    bus: Arc<LifecycleBus>,
    max_batch_events: usize,
    max_batch_bytes: usize,
}

impl LogQueue {
    #[must_use]
    pub fn new(bus: Arc<LifecycleBus>) -> Self {
        Self::with_batch_limits(bus, MAX_EVENTS_PER_BATCH, MAX_BATCH_SIZE_BYTES)
    }

    #[must_use]
    pub fn with_batch_limits(
        bus: Arc<LifecycleBus>,
        max_batch_events: usize,
        max_batch_bytes: usize,
    ) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            bus,
            max_batch_events,
            max_batch_bytes,
        }
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<LifecycleBus> {
        &self.bus
    }

    fn read_state(&self) -> RwLockReadGuard<'_, QueueState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, QueueState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Makes the queue live. A second call while live only updates the
    /// destination; the buffered events and the capacity are kept.
    pub fn create(&self, config: QueueConfig) -> CreateOutcome {
        let outcome = {
            let mut state = self.write_state();
            if state.buffer.is_none() {
                state.buffer = Some(Arc::new(Buffer::new(config.capacity)));
                state.destination = Some(config.destination);
                CreateOutcome::Created
            } else if state.destination.as_ref() != Some(&config.destination) {
                state.destination = Some(config.destination);
                CreateOutcome::DestinationChanged
            } else {
                CreateOutcome::Unchanged
            }
        };

        match outcome {
            CreateOutcome::Created => {
                debug!("QUEUE | Created with capacity {}", config.capacity);
                self.bus.publish(LifecycleEvent::QueueActivated);
            }
            CreateOutcome::DestinationChanged => {
                debug!("QUEUE | Destination changed");
                self.bus.publish(LifecycleEvent::DestinationChanged);
            }
            CreateOutcome::Unchanged => {}
        }
        outcome
    }

    /// Drops every buffered event and deactivates the queue. Waits for
    /// in-flight enqueue/dequeue calls. Returns the number of dropped events.
    pub fn destroy(&self) -> usize {
        let buffer = {
            let mut state = self.write_state();
            state.destination = None;
            state.buffer.take()
        };
        let Some(buffer) = buffer else {
            return 0;
        };
        let dropped = buffer.close();
        if dropped > 0 {
            warn!("QUEUE | Destroyed with {dropped} undelivered events");
        } else {
            debug!("QUEUE | Destroyed");
        }
        self.bus.publish(LifecycleEvent::QueueDeactivated);
        dropped
    }

    pub fn enqueue(&self, mut event: LogEvent) -> Result<(), QueueError> {
        event.truncate_message(MAX_EVENT_SIZE_BYTES);
        let state = self.read_state();
        let buffer = state.buffer.as_ref().ok_or(QueueError::QueueNotActive)?;
        buffer.push(event)
    }

    /// Waits up to `max_wait` for at least one event, then returns whatever
    /// is buffered within the batch limits. An empty batch means nothing
    /// arrived in time.
    pub async fn dequeue(&self, max_wait: Duration) -> Result<Vec<LogEvent>, QueueError> {
        let buffer = self
            .read_state()
            .buffer
            .clone()
            .ok_or(QueueError::QueueNotActive)?;
        let deadline = Instant::now() + max_wait;

        loop {
            // Register interest before draining so a push racing with the
            // drain still wakes us.
            let notified = buffer.available.notified();
            {
                let _state = self.read_state();
                if buffer.is_closed() {
                    return Err(QueueError::QueueNotActive);
                }
                let batch = buffer.drain_batch(self.max_batch_events, self.max_batch_bytes);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.read_state().buffer.is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read_state()
            .buffer
            .as_ref()
            .map_or(0, |buffer| buffer.items().len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn destination(&self) -> Option<QueueDestination> {
        self.read_state().destination.clone()
    }
}
