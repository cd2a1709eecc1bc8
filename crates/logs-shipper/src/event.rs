// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::constants::EVENT_OVERHEAD_BYTES;

/// A single log line (or group of lines) ready to be shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub message: String,
    #[serde(rename = "timestamp")]
    pub timestamp_millis: i64,
}

impl LogEvent {
    #[must_use]
    pub fn new(message: impl Into<String>, timestamp_millis: i64) -> Self {
        Self {
            message: message.into(),
            timestamp_millis,
        }
    }

    /// Creates an event stamped with the current wall clock time.
    #[must_use]
    pub fn now(message: impl Into<String>) -> Self {
        Self::new(message, now_millis())
    }

    /// Cuts the message to at most `max_bytes`, on a char boundary.
    pub fn truncate_message(&mut self, max_bytes: usize) {
        if self.message.len() <= max_bytes {
            return;
        }
        let mut cut = max_bytes;
        while !self.message.is_char_boundary(cut) {
            cut -= 1;
        }
        self.message.truncate(cut);
    }

    /// Size the remote API accounts for this event.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.message.len() + EVENT_OVERHEAD_BYTES
    }
}

#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
