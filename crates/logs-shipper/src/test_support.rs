// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory remote log service shared by unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::destination::Credentials;
use crate::sink::api::{
    ApiError, DescribeLogGroupsOutput, DescribeLogStreamsOutput, ErrorCode, LogGroup, LogStream,
    LogsApi, LogsApiFactory, PutLogEventsInput, PutLogEventsOutput,
};

#[derive(Debug, Default)]
struct State {
    groups: Vec<String>,
    /// (group, stream) -> current upload token
    streams: BTreeMap<(String, String), Option<String>>,
    puts: Vec<PutLogEventsInput>,
    put_attempts: usize,
    put_failures: VecDeque<ApiError>,
    create_failures: VecDeque<ApiError>,
    describe_failures: VecDeque<ApiError>,
    issued_tokens: usize,
}

/// Behaves like the remote service: validates sequence tokens, pages
/// descriptions and rejects writes to unknown streams. Failures can be
/// scripted per operation.
#[derive(Debug)]
pub(crate) struct FakeLogsApi {
    state: Mutex<State>,
    page_size: usize,
    put_delay: Duration,
    describe_stream_calls: AtomicUsize,
}

impl Default for FakeLogsApi {
    fn default() -> Self {
        Self::with_page_size(50)
    }
}

impl FakeLogsApi {
    pub(crate) fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size,
            put_delay: Duration::ZERO,
            describe_stream_calls: AtomicUsize::new(0),
        }
    }

    /// Every put takes `delay` before it is answered.
    pub(crate) fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn add_stream(&self, group: &str, stream: &str, token: Option<String>) {
        let mut state = self.state();
        if !state.groups.iter().any(|g| g == group) {
            state.groups.push(group.to_string());
        }
        state
            .streams
            .insert((group.to_string(), stream.to_string()), token);
    }

    pub(crate) fn fail_next_put(&self, error: ApiError) {
        self.state().put_failures.push_back(error);
    }

    pub(crate) fn fail_next_create(&self, error: ApiError) {
        self.state().create_failures.push_back(error);
    }

    pub(crate) fn fail_next_describe(&self, error: ApiError) {
        self.state().describe_failures.push_back(error);
    }

    pub(crate) fn group_names(&self) -> Vec<String> {
        self.state().groups.clone()
    }

    pub(crate) fn has_stream(&self, group: &str, stream: &str) -> bool {
        self.state()
            .streams
            .contains_key(&(group.to_string(), stream.to_string()))
    }

    pub(crate) fn stream_token(&self, group: &str, stream: &str) -> Option<String> {
        self.state()
            .streams
            .get(&(group.to_string(), stream.to_string()))
            .cloned()
            .flatten()
    }

    /// Put calls received, accepted or not.
    pub(crate) fn put_attempts(&self) -> usize {
        self.state().put_attempts
    }

    /// Messages accepted for `group`/`stream`, in order.
    pub(crate) fn delivered(&self, group: &str, stream: &str) -> Vec<String> {
        self.state()
            .puts
            .iter()
            .filter(|p| p.log_group_name == group && p.log_stream_name == stream)
            .flat_map(|p| p.log_events.iter().map(|e| e.message.clone()))
            .collect()
    }

    pub(crate) fn describe_stream_calls(&self) -> usize {
        self.describe_stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogsApi for FakeLogsApi {
    async fn create_log_group(&self, log_group: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        if let Some(e) = state.create_failures.pop_front() {
            return Err(e);
        }
        if state.groups.iter().any(|g| g == log_group) {
            return Err(ApiError::new(ErrorCode::ResourceAlreadyExists, "group exists"));
        }
        state.groups.push(log_group.to_string());
        Ok(())
    }

    async fn create_log_stream(&self, log_group: &str, log_stream: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        if let Some(e) = state.create_failures.pop_front() {
            return Err(e);
        }
        if !state.groups.iter().any(|g| g == log_group) {
            return Err(ApiError::new(ErrorCode::ResourceNotFound, "no such group"));
        }
        let key = (log_group.to_string(), log_stream.to_string());
        if state.streams.contains_key(&key) {
            return Err(ApiError::new(ErrorCode::ResourceAlreadyExists, "stream exists"));
        }
        state.streams.insert(key, None);
        Ok(())
    }

    async fn describe_log_groups(
        &self,
        prefix: &str,
        next_token: Option<String>,
    ) -> Result<DescribeLogGroupsOutput, ApiError> {
        let mut state = self.state();
        if let Some(e) = state.describe_failures.pop_front() {
            return Err(e);
        }
        let mut names: Vec<_> = state
            .groups
            .iter()
            .filter(|g| g.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        let start = next_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(names.len());
        Ok(DescribeLogGroupsOutput {
            log_groups: names[start..end]
                .iter()
                .map(|n| LogGroup {
                    log_group_name: n.clone(),
                })
                .collect(),
            next_token: (end < names.len()).then(|| end.to_string()),
        })
    }

    async fn describe_log_streams(
        &self,
        log_group: &str,
        prefix: &str,
        next_token: Option<String>,
    ) -> Result<DescribeLogStreamsOutput, ApiError> {
        self.describe_stream_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(e) = state.describe_failures.pop_front() {
            return Err(e);
        }
        if !state.groups.iter().any(|g| g == log_group) {
            return Err(ApiError::new(ErrorCode::ResourceNotFound, "no such group"));
        }
        let streams: Vec<_> = state
            .streams
            .iter()
            .filter(|((g, s), _)| g == log_group && s.starts_with(prefix))
            .map(|((_, s), token)| LogStream {
                log_stream_name: s.clone(),
                upload_sequence_token: token.clone(),
            })
            .collect();
        let start = next_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(streams.len());
        Ok(DescribeLogStreamsOutput {
            log_streams: streams[start..end].to_vec(),
            next_token: (end < streams.len()).then(|| end.to_string()),
        })
    }

    async fn put_log_events(
        &self,
        input: PutLogEventsInput,
    ) -> Result<PutLogEventsOutput, ApiError> {
        if !self.put_delay.is_zero() {
            tokio::time::sleep(self.put_delay).await;
        }
        let mut state = self.state();
        state.put_attempts += 1;
        if let Some(e) = state.put_failures.pop_front() {
            return Err(e);
        }
        let key = (input.log_group_name.clone(), input.log_stream_name.clone());
        let Some(expected) = state.streams.get(&key).cloned() else {
            return Err(ApiError::new(ErrorCode::ResourceNotFound, "no such stream"));
        };
        if expected.is_some() && expected != input.sequence_token {
            return Err(ApiError::new(
                ErrorCode::InvalidSequenceToken,
                "sequence token mismatch",
            ));
        }
        state.issued_tokens += 1;
        let next = format!("token-{}", state.issued_tokens);
        state.streams.insert(key, Some(next.clone()));
        state.puts.push(input);
        Ok(PutLogEventsOutput {
            next_sequence_token: Some(next),
        })
    }
}

/// Hands out the same fake and counts how often a transport was built.
#[derive(Debug)]
pub(crate) struct FakeFactory {
    api: Arc<FakeLogsApi>,
    builds: AtomicUsize,
    panic_on_build: AtomicBool,
    seen_credentials: Mutex<Vec<Option<Credentials>>>,
}

impl FakeFactory {
    pub(crate) fn new(api: Arc<FakeLogsApi>) -> Self {
        Self {
            api,
            builds: AtomicUsize::new(0),
            panic_on_build: AtomicBool::new(false),
            seen_credentials: Mutex::new(Vec::new()),
        }
    }

    /// The next `build` panics instead of returning a transport.
    pub(crate) fn panic_on_next_build(&self) {
        self.panic_on_build.store(true, Ordering::SeqCst);
    }

    pub(crate) fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub(crate) fn seen_credentials(&self) -> Vec<Option<Credentials>> {
        self.seen_credentials.lock().unwrap().clone()
    }
}

impl LogsApiFactory for FakeFactory {
    fn build(&self, credentials: Option<&Credentials>) -> Result<Arc<dyn LogsApi>, ApiError> {
        if self.panic_on_build.swap(false, Ordering::SeqCst) {
            panic!("transport construction failed");
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.seen_credentials
            .lock()
            .unwrap()
            .push(credentials.cloned());
        Ok(self.api.clone())
    }
}
