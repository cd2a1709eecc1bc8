// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits of the remote log API and defaults of the shipping pipeline.

use std::time::Duration;

/// Default number of events the queue holds before rejecting enqueues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Maximum number of events accepted by a single put-events call.
pub const MAX_EVENTS_PER_BATCH: usize = 10_000;

/// Maximum serialized size of a single put-events call, in bytes.
pub const MAX_BATCH_SIZE_BYTES: usize = 1_048_576;

/// Bytes the remote API accounts for each event on top of its message.
pub const EVENT_OVERHEAD_BYTES: usize = 26;

/// Maximum size of one event message, in bytes.
pub const MAX_EVENT_SIZE_BYTES: usize = 262_144 - EVENT_OVERHEAD_BYTES;

/// Baseline interval between two publisher ticks.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(1_000);

/// How long a dequeue waits for the first event.
pub const DEFAULT_DEQUEUE_WAIT: Duration = Duration::from_millis(200);

/// Ceiling reached by the polling interval after repeated failures.
pub const DEFAULT_MAX_POLLING_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between two reads of a streamed file.
pub const DEFAULT_STREAMING_INTERVAL: Duration = Duration::from_millis(1_000);

/// Attempts the transport makes for throttled, 5xx and network failures.
pub const DEFAULT_MAX_TRANSPORT_RETRIES: u32 = 5;

/// Base delay of the transport's exponential retry backoff.
pub const TRANSPORT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Consecutive failure count after which the transport is rebuilt.
pub const DEFAULT_STOP_POLICY_THRESHOLD: usize = 10;

/// Per-request timeout of the HTTP transport.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Delimiter of the encoded sharing destination.
pub const SHARING_DESTINATION_DELIMITER: &str = "::";

/// Capacity of each lifecycle subscriber channel.
pub(crate) const MAX_LIFECYCLE_EVENTS: usize = 16;
