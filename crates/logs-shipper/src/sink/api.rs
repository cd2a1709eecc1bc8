// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract of the remote log API: five operations and a small fixed
//! vocabulary of error codes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::destination::Credentials;
use crate::event::LogEvent;

/// Error codes the shipping logic reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ResourceAlreadyExists,
    InvalidSequenceToken,
    DataAlreadyAccepted,
    ResourceNotFound,
    Throttling,
    ServiceUnavailable,
    Network,
    Other,
}

impl ErrorCode {
    /// Maps the remote `__type` value (`prefix#NameException`) to a code.
    #[must_use]
    pub fn from_error_type(error_type: &str) -> Self {
        let name = error_type.rsplit('#').next().unwrap_or(error_type);
        match name.trim_end_matches("Exception") {
            "ResourceAlreadyExists" => Self::ResourceAlreadyExists,
            "InvalidSequenceToken" => Self::InvalidSequenceToken,
            "DataAlreadyAccepted" => Self::DataAlreadyAccepted,
            "ResourceNotFound" => Self::ResourceNotFound,
            "Throttling" | "LimitExceeded" => Self::Throttling,
            "ServiceUnavailable" => Self::ServiceUnavailable,
            _ => Self::Other,
        }
    }

    /// Errors that are cured by fetching a fresh sequence token.
    #[must_use]
    pub fn is_token_mismatch(self) -> bool {
        matches!(self, Self::InvalidSequenceToken | Self::DataAlreadyAccepted)
    }

    /// Errors the transport retries on its own.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Throttling | Self::ServiceUnavailable | Self::Network
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Attempts the transport spent before giving up.
    pub attempts: u32,
}

impl ApiError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            attempts: 1,
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogGroup {
    pub log_group_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStream {
    pub log_stream_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_sequence_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeLogGroupsOutput {
    #[serde(default)]
    pub log_groups: Vec<LogGroup>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeLogStreamsOutput {
    #[serde(default)]
    pub log_streams: Vec<LogStream>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutLogEventsInput {
    pub log_group_name: String,
    pub log_stream_name: String,
    pub log_events: Vec<LogEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutLogEventsOutput {
    #[serde(default)]
    pub next_sequence_token: Option<String>,
}

/// Raw remote operations. Implementations perform their own bounded retries
/// for transient failures and report the attempts in [`ApiError::attempts`].
#[async_trait]
pub trait LogsApi: Send + Sync {
    async fn create_log_group(&self, log_group: &str) -> Result<(), ApiError>;

    async fn create_log_stream(&self, log_group: &str, log_stream: &str) -> Result<(), ApiError>;

    async fn describe_log_groups(
        &self,
        prefix: &str,
        next_token: Option<String>,
    ) -> Result<DescribeLogGroupsOutput, ApiError>;

    async fn describe_log_streams(
        &self,
        log_group: &str,
        prefix: &str,
        next_token: Option<String>,
    ) -> Result<DescribeLogStreamsOutput, ApiError>;

    async fn put_log_events(&self, input: PutLogEventsInput)
        -> Result<PutLogEventsOutput, ApiError>;
}

/// Builds fresh transports; called once at start and again whenever the
/// stop policy reports the current one unhealthy.
pub trait LogsApiFactory: Send + Sync {
    fn build(&self, credentials: Option<&Credentials>) -> Result<Arc<dyn LogsApi>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_from_type() {
        assert_eq!(
            ErrorCode::from_error_type("com.amazonaws.logs#InvalidSequenceTokenException"),
            ErrorCode::InvalidSequenceToken
        );
        assert_eq!(
            ErrorCode::from_error_type("ResourceAlreadyExistsException"),
            ErrorCode::ResourceAlreadyExists
        );
        assert_eq!(
            ErrorCode::from_error_type("x#DataAlreadyAcceptedException"),
            ErrorCode::DataAlreadyAccepted
        );
        assert_eq!(
            ErrorCode::from_error_type("x#ResourceNotFoundException"),
            ErrorCode::ResourceNotFound
        );
        assert_eq!(
            ErrorCode::from_error_type("x#ThrottlingException"),
            ErrorCode::Throttling
        );
        assert_eq!(
            ErrorCode::from_error_type("x#AccessDeniedException"),
            ErrorCode::Other
        );
    }

    #[test]
    fn error_code_classes() {
        assert!(ErrorCode::InvalidSequenceToken.is_token_mismatch());
        assert!(ErrorCode::DataAlreadyAccepted.is_token_mismatch());
        assert!(!ErrorCode::ResourceNotFound.is_token_mismatch());
        assert!(ErrorCode::Throttling.is_transient());
        assert!(ErrorCode::Network.is_transient());
        assert!(!ErrorCode::Other.is_transient());
    }

    #[test]
    fn put_input_uses_remote_field_names() {
        let input = PutLogEventsInput {
            log_group_name: "g".to_string(),
            log_stream_name: "s".to_string(),
            log_events: vec![LogEvent::new("m", 5)],
            sequence_token: None,
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["logGroupName"], "g");
        assert_eq!(json["logStreamName"], "s");
        assert_eq!(json["logEvents"][0]["message"], "m");
        assert!(json.get("sequenceToken").is_none());
    }

    #[test]
    fn describe_streams_output_parses() {
        let output: DescribeLogStreamsOutput = serde_json::from_str(
            r#"{"logStreams":[{"logStreamName":"a","uploadSequenceToken":"t1"},{"logStreamName":"b"}],"nextToken":"n"}"#,
        )
        .unwrap();
        assert_eq!(output.log_streams.len(), 2);
        assert_eq!(output.log_streams[0].upload_sequence_token.as_deref(), Some("t1"));
        assert_eq!(output.log_streams[1].upload_sequence_token, None);
        assert_eq!(output.next_token.as_deref(), Some("n"));
    }
}
