// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Logs Shipper
//!
//! Ships locally produced log lines to a remote log-aggregation service.
//!
//! ## Pipeline
//!
//! ```text
//!   tracing events ──> QueueLayer ──┐
//!                                   v
//!   producers ──────────────> LogQueue (bounded, FIFO)
//!                                   │ dequeue(wait)
//!                                   v
//!                              Publisher (poll loop, backoff)
//!                               │                │
//!                               v                v
//!                     SinkClient (self)   SinkClient (sharing)
//!                               │                │
//!                               v                v
//!                          remote log group / stream
//!
//!   file on disk ──> FileStreamBatcher ──> FileStreamer ──> SinkClient
//! ```
//!
//! - [`queue`]: capacity-limited queue with create/destroy lifecycle
//! - [`event_bus`]: non-blocking lifecycle notifications
//! - [`sink`]: remote API client with token recovery and reconnect policy
//! - [`publisher`]: polling loop with adaptive interval and dual destinations
//! - [`file_batcher`] / [`file_streamer`]: incremental file shipping
//! - [`logger`]: formatter and the receiver layer feeding the queue

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod destination;
pub mod event;
pub mod event_bus;
pub mod file_batcher;
pub mod file_streamer;
pub mod logger;
pub mod publisher;
pub mod queue;
pub mod sink;

#[cfg(test)]
mod test_support;
