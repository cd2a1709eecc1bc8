// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drains the queue on a schedule and pushes batches to the remote service.
//!
//! # Architecture
//!
//! ```text
//!   LifecycleBus ──> listener task ──> start() / stop()
//!                                          │
//!                                          v
//!                                   ┌─────────────┐
//!            stop channel ────────> │  poll loop  │ owns Session
//!                                   └──────┬──────┘
//!                                          │ sleep(interval), dequeue(wait)
//!                                          v
//!                            ┌─────────────┴─────────────┐
//!                            v                           v
//!                    primary SinkClient         sharing SinkClient
//!                    (ambient credentials)      (own credentials)
//! ```
//!
//! # Pacing
//!
//! A failed primary push doubles the polling interval up to
//! `max_polling_interval`; the first tick without a failure puts it back to
//! the baseline. Batches that fail are dropped, never re-queued.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::constants::{
    DEFAULT_DEQUEUE_WAIT, DEFAULT_MAX_POLLING_INTERVAL, DEFAULT_POLLING_INTERVAL,
    DEFAULT_STOP_POLICY_THRESHOLD,
};
use crate::destination::Destination;
use crate::event::LogEvent;
use crate::event_bus::LifecycleEvent;
use crate::queue::{LogQueue, QueueDestination, QueueError};
use crate::sink::api::LogsApiFactory;
use crate::sink::{SinkClient, SinkError, TokenLookup};

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("queue is not active")]
    QueueNotActive,
    #[error("log group is not configured")]
    MissingLogGroup,
    #[error("instance id is not available")]
    MissingInstanceId,
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Name of the primary stream.
    pub instance_id: String,
    /// Zero means [`DEFAULT_POLLING_INTERVAL`].
    pub polling_interval: Duration,
    /// Zero means [`DEFAULT_DEQUEUE_WAIT`].
    pub dequeue_wait: Duration,
    pub max_polling_interval: Duration,
    pub stop_policy_threshold: usize,
}

impl PublisherConfig {
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            dequeue_wait: DEFAULT_DEQUEUE_WAIT,
            max_polling_interval: DEFAULT_MAX_POLLING_INTERVAL,
            stop_policy_threshold: DEFAULT_STOP_POLICY_THRESHOLD,
        }
    }

    fn with_defaults(mut self) -> Self {
        if self.polling_interval.is_zero() {
            self.polling_interval = DEFAULT_POLLING_INTERVAL;
        }
        if self.dequeue_wait.is_zero() {
            self.dequeue_wait = DEFAULT_DEQUEUE_WAIT;
        }
        if self.max_polling_interval < self.polling_interval {
            self.max_polling_interval = self.polling_interval;
        }
        self
    }
}

/// Interval of the tick following one that did (`backoff`) or did not fail.
#[must_use]
pub fn next_interval(
    current: Duration,
    baseline: Duration,
    max: Duration,
    backoff: bool,
) -> Duration {
    if backoff {
        current.saturating_mul(2).min(max)
    } else {
        baseline
    }
}

/// One destination with the token of its next write.
#[derive(Debug)]
struct Target {
    client: Arc<SinkClient>,
    destination: Destination,
    token: Option<String>,
}

impl Target {
    async fn push(&mut self, batch: &[LogEvent]) -> Result<(), SinkError> {
        let next = self
            .client
            .put_events(
                batch,
                &self.destination.log_group,
                &self.destination.log_stream,
                self.token.take(),
            )
            .await?;
        self.token = next;
        Ok(())
    }

    async fn refresh_token(&mut self) -> Result<TokenLookup, SinkError> {
        let lookup = self
            .client
            .get_sequence_token(&self.destination.log_group, &self.destination.log_stream)
            .await?;
        if let TokenLookup::Found(token) = &lookup {
            self.token.clone_from(token);
        }
        Ok(lookup)
    }
}

/// State of one run of the poll loop. Never shared.
#[derive(Debug)]
struct Session {
    queue: Arc<LogQueue>,
    primary: Target,
    sharing: Option<Target>,
    interval: Duration,
    baseline: Duration,
    max_interval: Duration,
    dequeue_wait: Duration,
}

impl Session {
    async fn tick(&mut self) {
        let batch = match self.queue.dequeue(self.dequeue_wait).await {
            Ok(batch) => batch,
            Err(QueueError::QueueNotActive) => {
                debug!("PUBLISHER | Queue is not active, skipping tick");
                return;
            }
            Err(e) => {
                warn!("PUBLISHER | Failed to dequeue: {e}");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }

        let mut backoff = false;
        if let Err(e) = self.primary.push(&batch).await {
            warn!(
                "PUBLISHER | Dropping {} events for {}: {e}",
                batch.len(),
                self.primary.destination
            );
            backoff = true;
            match self.primary.refresh_token().await {
                Ok(TokenLookup::Found(_)) => {}
                Ok(TokenLookup::StreamNotFound) => {
                    warn!("PUBLISHER | Stream {} is gone", self.primary.destination);
                }
                Err(e) => debug!("PUBLISHER | Failed to refresh sequence token: {e}"),
            }
        }

        if let Some(sharing) = self.sharing.as_mut() {
            if let Err(e) = sharing.push(&batch).await {
                warn!(
                    "PUBLISHER | Failed to share {} events with {}: {e}",
                    batch.len(),
                    sharing.destination
                );
                let reason = match sharing.refresh_token().await {
                    Ok(TokenLookup::Found(_)) => None,
                    Ok(TokenLookup::StreamNotFound) => Some("stream not found".to_string()),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(reason) = reason {
                    warn!("PUBLISHER | Disabling log sharing for this session: {reason}");
                    self.sharing = None;
                }
            }
        }

        let next = next_interval(self.interval, self.baseline, self.max_interval, backoff);
        if next != self.interval {
            debug!("PUBLISHER | Polling interval {:?} -> {next:?}", self.interval);
            self.interval = next;
        }
    }
}

async fn poll_loop(mut session: Session, mut stop_rx: mpsc::Receiver<oneshot::Sender<()>>) {
    loop {
        tokio::select! {
            biased;
            request = stop_rx.recv() => {
                if let Some(ack) = request {
                    let _ = ack.send(());
                }
                break;
            }
            () = tokio::time::sleep(session.interval) => {}
        }
        session.tick().await;
    }
    debug!("PUBLISHER | Poll loop stopped");
}

#[derive(Debug)]
struct RunningLoop {
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

pub struct Publisher {
    config: PublisherConfig,
    queue: Arc<LogQueue>,
    factory: Arc<dyn LogsApiFactory>,
    primary: Arc<SinkClient>,
    running: Mutex<Option<RunningLoop>>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("config", &self.config)
            .field("primary", &self.primary)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// The primary client is built from `factory` with ambient credentials;
    /// a sharing client is built per session with its own credentials.
    #[must_use]
    pub fn new(
        config: PublisherConfig,
        queue: Arc<LogQueue>,
        factory: Arc<dyn LogsApiFactory>,
    ) -> Self {
        let config = config.with_defaults();
        let primary = Arc::new(SinkClient::new(
            Arc::clone(&factory),
            None,
            config.stop_policy_threshold,
        ));
        Self {
            config,
            queue,
            factory,
            primary,
            running: Mutex::new(None),
        }
    }

    /// Starts publishing if the queue is already live, then follows the
    /// queue's lifecycle events until the bus goes away. Call once.
    pub async fn init(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.queue.bus().subscribe();
        if self.queue.is_active() {
            if let Err(e) = self.start().await {
                warn!("PUBLISHER | Failed to start: {e}");
            }
        }

        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let publisher = Arc::clone(&publisher);
                let handled =
                    tokio::spawn(async move { publisher.on_lifecycle_event(event).await }).await;
                if let Err(e) = handled {
                    error!("PUBLISHER | Lifecycle handler for {event:?} failed: {e}");
                }
            }
            debug!("PUBLISHER | Lifecycle listener stopped");
        })
    }

    async fn on_lifecycle_event(&self, event: LifecycleEvent) {
        debug!("PUBLISHER | Received {event:?}");
        match event {
            LifecycleEvent::QueueActivated => {
                if let Err(e) = self.start().await {
                    warn!("PUBLISHER | Failed to start: {e}");
                }
            }
            LifecycleEvent::QueueDeactivated => self.stop().await,
            LifecycleEvent::DestinationChanged => {
                self.stop().await;
                if let Err(e) = self.start().await {
                    warn!("PUBLISHER | Failed to restart with new destination: {e}");
                }
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Resolves both destinations and launches the poll loop. No-op while a
    /// loop is already running.
    pub async fn start(&self) -> Result<(), PublisherError> {
        let mut running = self.running.lock().await;
        if running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            debug!("PUBLISHER | Already running");
            return Ok(());
        }

        let queue_destination = self
            .queue
            .destination()
            .ok_or(PublisherError::QueueNotActive)?;
        let primary = self.resolve_primary(&queue_destination).await?;
        let sharing = self.resolve_sharing(&queue_destination).await;

        info!(
            "PUBLISHER | Publishing to {}{}",
            primary.destination,
            sharing
                .as_ref()
                .map(|s| format!(", sharing with {}", s.destination))
                .unwrap_or_default()
        );

        let session = Session {
            queue: Arc::clone(&self.queue),
            primary,
            sharing,
            interval: self.config.polling_interval,
            baseline: self.config.polling_interval,
            max_interval: self.config.max_polling_interval,
            dequeue_wait: self.config.dequeue_wait,
        };
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(poll_loop(session, stop_rx));
        *running = Some(RunningLoop { stop_tx, handle });
        Ok(())
    }

    /// Stops the poll loop and waits for it to exit. Safe to call when not
    /// running.
    pub async fn stop(&self) {
        let Some(RunningLoop { stop_tx, handle }) = self.running.lock().await.take() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = handle.await {
            error!("PUBLISHER | Poll loop ended abnormally: {e}");
        }
        debug!("PUBLISHER | Stopped");
    }

    async fn resolve_primary(
        &self,
        queue_destination: &QueueDestination,
    ) -> Result<Target, PublisherError> {
        if queue_destination.log_group.is_empty() {
            return Err(PublisherError::MissingLogGroup);
        }
        if self.config.instance_id.is_empty() {
            return Err(PublisherError::MissingInstanceId);
        }
        let destination = Destination::new(
            queue_destination.log_group.clone(),
            self.config.instance_id.clone(),
        );
        self.primary
            .ensure_group_and_stream(&destination.log_group, &destination.log_stream)
            .await?;
        let token = match self
            .primary
            .get_sequence_token(&destination.log_group, &destination.log_stream)
            .await?
        {
            TokenLookup::Found(token) => token,
            TokenLookup::StreamNotFound => {
                return Err(SinkError::StreamNotFound {
                    log_group: destination.log_group,
                    log_stream: destination.log_stream,
                }
                .into())
            }
        };
        Ok(Target {
            client: Arc::clone(&self.primary),
            destination,
            token,
        })
    }

    /// The sharing target, or `None` with the reason logged.
    async fn resolve_sharing(&self, queue_destination: &QueueDestination) -> Option<Target> {
        if !queue_destination.sharing_enabled {
            debug!("PUBLISHER | Log sharing is disabled");
            return None;
        }
        let Some(destination) = Destination::parse_sharing(&queue_destination.sharing_destination)
        else {
            warn!("PUBLISHER | Log sharing disabled: malformed sharing destination");
            return None;
        };
        if !destination.is_usable() {
            warn!("PUBLISHER | Log sharing disabled: incomplete sharing destination");
            return None;
        }

        let client = Arc::new(SinkClient::new(
            Arc::clone(&self.factory),
            destination.credentials.clone(),
            self.config.stop_policy_threshold,
        ));
        match client
            .get_sequence_token(&destination.log_group, &destination.log_stream)
            .await
        {
            Ok(TokenLookup::Found(token)) => Some(Target {
                client,
                destination,
                token,
            }),
            Ok(TokenLookup::StreamNotFound) => {
                warn!("PUBLISHER | Log sharing disabled: {destination} not found");
                None
            }
            Err(e) => {
                warn!("PUBLISHER | Log sharing disabled: {e}");
                None
            }
        }
    }
}
