// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};

/// Consecutive-failure counter. Once `threshold` failures accumulate the
/// transport is considered unhealthy and gets rebuilt before the next call.
#[derive(Debug)]
pub struct StopPolicy {
    error_count: AtomicUsize,
    threshold: usize,
}

impl StopPolicy {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            error_count: AtomicUsize::new(0),
            threshold,
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.error_count.load(Ordering::SeqCst) < self.threshold
    }

    pub fn add_errors(&self, count: usize) {
        self.error_count.fetch_add(count, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.error_count.store(0, Ordering::SeqCst);
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::SeqCst)
    }
}
