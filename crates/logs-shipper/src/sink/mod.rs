// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for one remote log destination.
//!
//! Wraps a [`LogsApi`] transport with:
//! - idempotent creation of groups and streams,
//! - sequence-token lookup by paging through stream descriptions,
//! - a single token-refresh retry on `InvalidSequenceToken` /
//!   `DataAlreadyAccepted`,
//! - a [`StopPolicy`] that rebuilds the transport after repeated failures.
//!
//! ```text
//! put_events ──> Attempt ──ok──────────────────────────────> Success
//!                   │
//!                   ├─token mismatch──> lookup token ──> Attempt ──> Success | Fail
//!                   │
//!                   └─other error────────────────────────────> Fail
//! ```

pub mod api;
pub mod http;
pub mod stop_policy;

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::destination::Credentials;
use crate::event::LogEvent;
use api::{ApiError, ErrorCode, LogsApi, LogsApiFactory, PutLogEventsInput};
use stop_policy::StopPolicy;

/// Result of a sequence-token lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenLookup {
    /// The stream exists. `None` means it has never been written to and
    /// accepts its first batch without a token.
    Found(Option<String>),
    StreamNotFound,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("log stream {log_group}/{log_stream} not found")]
    StreamNotFound {
        log_group: String,
        log_stream: String,
    },
}

impl SinkError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Api(e) => e.code,
            Self::StreamNotFound { .. } => ErrorCode::ResourceNotFound,
        }
    }
}

pub struct SinkClient {
    factory: Arc<dyn LogsApiFactory>,
    credentials: Option<Credentials>,
    api: Mutex<Option<Arc<dyn LogsApi>>>,
    stop_policy: StopPolicy,
}

impl std::fmt::Debug for SinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkClient")
            .field("credentials", &self.credentials)
            .field("stop_policy", &self.stop_policy)
            .finish_non_exhaustive()
    }
}

impl SinkClient {
    #[must_use]
    pub fn new(
        factory: Arc<dyn LogsApiFactory>,
        credentials: Option<Credentials>,
        stop_policy_threshold: usize,
    ) -> Self {
        Self {
            factory,
            credentials,
            api: Mutex::new(None),
            stop_policy: StopPolicy::new(stop_policy_threshold),
        }
    }

    #[must_use]
    pub fn stop_policy(&self) -> &StopPolicy {
        &self.stop_policy
    }

    /// Current transport, rebuilt first when missing or unhealthy.
    fn api(&self) -> Result<Arc<dyn LogsApi>, SinkError> {
        let mut guard = match self.api.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let (Some(api), true) = (guard.as_ref(), self.stop_policy.is_healthy()) {
            return Ok(Arc::clone(api));
        }
        if guard.is_some() {
            warn!(
                "SINK | Transport unhealthy after {} errors, recreating it",
                self.stop_policy.error_count()
            );
        }
        self.stop_policy.reset();
        let api = self.factory.build(self.credentials.as_ref())?;
        *guard = Some(Arc::clone(&api));
        Ok(api)
    }

    fn record_failure(&self, error: &ApiError) {
        let count = match error.code {
            ErrorCode::ResourceAlreadyExists => 0,
            code if code.is_token_mismatch() => 1,
            _ => error.attempts.max(1) as usize,
        };
        self.stop_policy.add_errors(count);
    }

    fn track<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    /// Creates the group; an existing group is not an error.
    pub async fn create_log_group(&self, log_group: &str) -> Result<(), SinkError> {
        let api = self.api()?;
        match self.track(api.create_log_group(log_group).await) {
            Ok(()) => {
                debug!("SINK | Created log group {log_group}");
                Ok(())
            }
            Err(e) if e.code == ErrorCode::ResourceAlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the stream; an existing stream is not an error.
    pub async fn create_log_stream(&self, log_group: &str, log_stream: &str) -> Result<(), SinkError> {
        let api = self.api()?;
        match self.track(api.create_log_stream(log_group, log_stream).await) {
            Ok(()) => {
                debug!("SINK | Created log stream {log_group}/{log_stream}");
                Ok(())
            }
            Err(e) if e.code == ErrorCode::ResourceAlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Pages through groups named with `log_group` as prefix looking for an
    /// exact match.
    pub async fn is_log_group_present(&self, log_group: &str) -> Result<bool, SinkError> {
        let mut next_token = None;
        loop {
            let api = self.api()?;
            let page = self.track(api.describe_log_groups(log_group, next_token).await)?;
            if page.log_groups.iter().any(|g| g.log_group_name == log_group) {
                return Ok(true);
            }
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(false),
            }
        }
    }

    pub async fn ensure_group_and_stream(
        &self,
        log_group: &str,
        log_stream: &str,
    ) -> Result<(), SinkError> {
        if !self.is_log_group_present(log_group).await? {
            self.create_log_group(log_group).await?;
        }
        self.create_log_stream(log_group, log_stream).await
    }

    /// Pages through the group's streams until one is named exactly
    /// `log_stream`. A missing group is reported as a missing stream.
    pub async fn get_sequence_token(
        &self,
        log_group: &str,
        log_stream: &str,
    ) -> Result<TokenLookup, SinkError> {
        let mut next_token = None;
        loop {
            let api = self.api()?;
            let page = match api
                .describe_log_streams(log_group, log_stream, next_token)
                .await
            {
                Ok(page) => page,
                Err(e) if e.code == ErrorCode::ResourceNotFound => {
                    return Ok(TokenLookup::StreamNotFound)
                }
                Err(e) => {
                    self.record_failure(&e);
                    return Err(e.into());
                }
            };
            if let Some(stream) = page
                .log_streams
                .into_iter()
                .find(|s| s.log_stream_name == log_stream)
            {
                return Ok(TokenLookup::Found(stream.upload_sequence_token));
            }
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(TokenLookup::StreamNotFound),
            }
        }
    }

    async fn put_once(
        &self,
        events: &[LogEvent],
        log_group: &str,
        log_stream: &str,
        sequence_token: Option<String>,
    ) -> Result<Option<String>, ApiError> {
        let api = self.api().map_err(|e| match e {
            SinkError::Api(e) => e,
            other => ApiError::new(other.code(), other.to_string()),
        })?;
        let input = PutLogEventsInput {
            log_group_name: log_group.to_string(),
            log_stream_name: log_stream.to_string(),
            log_events: events.to_vec(),
            sequence_token,
        };
        self.track(api.put_log_events(input).await)
            .map(|output| output.next_sequence_token)
    }

    /// Pushes `events` in order and returns the token for the next push. A
    /// token mismatch triggers exactly one lookup and one retry.
    pub async fn put_events(
        &self,
        events: &[LogEvent],
        log_group: &str,
        log_stream: &str,
        sequence_token: Option<String>,
    ) -> Result<Option<String>, SinkError> {
        if events.is_empty() {
            return Ok(sequence_token);
        }
        match self
            .put_once(events, log_group, log_stream, sequence_token)
            .await
        {
            Ok(next) => Ok(next),
            Err(e) if e.code.is_token_mismatch() => {
                debug!("SINK | {e}, refreshing sequence token for {log_group}/{log_stream}");
                let token = match self.get_sequence_token(log_group, log_stream).await? {
                    TokenLookup::Found(token) => token,
                    TokenLookup::StreamNotFound => {
                        return Err(SinkError::StreamNotFound {
                            log_group: log_group.to_string(),
                            log_stream: log_stream.to_string(),
                        })
                    }
                };
                Ok(self.put_once(events, log_group, log_stream, token).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}
