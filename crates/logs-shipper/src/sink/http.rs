// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON-over-HTTP transport for the remote log API.
//!
//! Each operation is a `POST` to the service endpoint, selected by the
//! `X-Amz-Target` header. Throttling, 5xx and network errors are retried
//! here with exponential backoff; every other error is returned as-is so the
//! sink client can apply its own recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::constants::TRANSPORT_RETRY_BASE_DELAY;
use crate::destination::Credentials;
use crate::sink::api::{
    ApiError, DescribeLogGroupsOutput, DescribeLogStreamsOutput, ErrorCode, LogsApi,
    LogsApiFactory, PutLogEventsInput, PutLogEventsOutput,
};

const TARGET_PREFIX: &str = "Logs_20140328";
const CONTENT_TYPE_JSON: &str = "application/x-amz-json-1.1";

#[derive(Debug, Default, Deserialize)]
struct EmptyOutput {}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type")]
    error_type: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpLogsApi {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<Credentials>,
    max_attempts: u32,
    retry_base_delay: Duration,
}

impl HttpLogsApi {
    pub fn new(
        endpoint: impl Into<String>,
        credentials: Option<Credentials>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::new(ErrorCode::Other, format!("failed to build client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            credentials,
            max_attempts: max_attempts.max(1),
            retry_base_delay: TRANSPORT_RETRY_BASE_DELAY,
        })
    }

    #[must_use]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    async fn call<I, O>(&self, operation: &str, input: &I) -> Result<O, ApiError>
    where
        I: Serialize + Sync,
        O: DeserializeOwned,
    {
        let payload = serde_json::to_vec(input).map_err(|e| {
            ApiError::new(ErrorCode::Other, format!("failed to encode {operation}: {e}"))
        })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let time = Instant::now();
            match self.send(operation, payload.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if e.code.is_transient() && attempts < self.max_attempts => {
                    let backoff = self
                        .retry_base_delay
                        .saturating_mul(2_u32.saturating_pow(attempts - 1));
                    debug!(
                        "SINK | {operation} attempt {attempts} failed after {} ms: {e}, retrying in {} ms",
                        time.elapsed().as_millis(),
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if e.code.is_transient() {
                        error!("SINK | {operation} failed after {attempts} attempts: {e}");
                    }
                    return Err(e.with_attempts(attempts));
                }
            }
        }
    }

    async fn send<O: DeserializeOwned>(
        &self,
        operation: &str,
        payload: Vec<u8>,
    ) -> Result<O, ApiError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{operation}"))
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(payload);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(
                &credentials.access_key_id,
                Some(&credentials.secret_access_key),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::new(ErrorCode::Network, e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::new(ErrorCode::Network, e.to_string()))?;

        if !status.is_success() {
            return Err(classify_error(status, &body));
        }
        let body: &[u8] = if body.is_empty() { b"{}" } else { &body };
        serde_json::from_slice(body).map_err(|e| {
            ApiError::new(
                ErrorCode::Other,
                format!("failed to decode {operation} response: {e}"),
            )
        })
    }
}

fn classify_error(status: StatusCode, body: &[u8]) -> ApiError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let mut code = parsed
        .error_type
        .as_deref()
        .map_or(ErrorCode::Other, ErrorCode::from_error_type);
    if code == ErrorCode::Other {
        if status == StatusCode::TOO_MANY_REQUESTS {
            code = ErrorCode::Throttling;
        } else if status.is_server_error() {
            code = ErrorCode::ServiceUnavailable;
        }
    }
    let message = parsed
        .message
        .unwrap_or_else(|| format!("request failed with status {status}"));
    ApiError::new(code, message)
}

fn with_next_token(mut body: Value, next_token: Option<String>) -> Value {
    if let (Some(token), Some(map)) = (next_token, body.as_object_mut()) {
        map.insert("nextToken".to_string(), Value::String(token));
    }
    body
}

#[async_trait::async_trait]
impl LogsApi for HttpLogsApi {
    async fn create_log_group(&self, log_group: &str) -> Result<(), ApiError> {
        let _: EmptyOutput = self
            .call("CreateLogGroup", &json!({ "logGroupName": log_group }))
            .await?;
        Ok(())
    }

    async fn create_log_stream(&self, log_group: &str, log_stream: &str) -> Result<(), ApiError> {
        let _: EmptyOutput = self
            .call(
                "CreateLogStream",
                &json!({ "logGroupName": log_group, "logStreamName": log_stream }),
            )
            .await?;
        Ok(())
    }

    async fn describe_log_groups(
        &self,
        prefix: &str,
        next_token: Option<String>,
    ) -> Result<DescribeLogGroupsOutput, ApiError> {
        let body = with_next_token(json!({ "logGroupNamePrefix": prefix }), next_token);
        self.call("DescribeLogGroups", &body).await
    }

    async fn describe_log_streams(
        &self,
        log_group: &str,
        prefix: &str,
        next_token: Option<String>,
    ) -> Result<DescribeLogStreamsOutput, ApiError> {
        let body = with_next_token(
            json!({ "logGroupName": log_group, "logStreamNamePrefix": prefix }),
            next_token,
        );
        self.call("DescribeLogStreams", &body).await
    }

    async fn put_log_events(
        &self,
        input: PutLogEventsInput,
    ) -> Result<PutLogEventsOutput, ApiError> {
        self.call("PutLogEvents", &input).await
    }
}

/// Production factory: a new `reqwest` client per build, so a rebuild also
/// drops pooled connections.
#[derive(Debug, Clone)]
pub struct HttpLogsApiFactory {
    endpoint: String,
    timeout: Duration,
    max_attempts: u32,
}

impl HttpLogsApiFactory {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            max_attempts,
        }
    }
}

impl LogsApiFactory for HttpLogsApiFactory {
    fn build(&self, credentials: Option<&Credentials>) -> Result<Arc<dyn LogsApi>, ApiError> {
        let api = HttpLogsApi::new(
            self.endpoint.clone(),
            credentials.cloned(),
            self.timeout,
            self.max_attempts,
        )?;
        Ok(Arc::new(api))
    }
}
