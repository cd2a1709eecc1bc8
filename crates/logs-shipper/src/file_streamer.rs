// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships a growing file to one log stream until the file is complete.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::constants::DEFAULT_STREAMING_INTERVAL;
use crate::file_batcher::{FileStreamBatcher, StreamCursor};
use crate::sink::api::ErrorCode;
use crate::sink::{SinkClient, SinkError, TokenLookup};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("log stream {log_group}/{log_stream} no longer exists")]
    StreamGone {
        log_group: String,
        log_stream: String,
    },
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("file reader task failed: {0}")]
    Reader(String),
}

#[derive(Debug)]
pub struct FileStreamer {
    client: Arc<SinkClient>,
    batcher: Arc<FileStreamBatcher>,
    interval: Duration,
}

impl FileStreamer {
    #[must_use]
    pub fn new(client: Arc<SinkClient>, batcher: FileStreamBatcher) -> Self {
        Self {
            client,
            batcher: Arc::new(batcher),
            interval: DEFAULT_STREAMING_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Streams `path` into `log_group`/`log_stream`, reading once per
    /// interval. Returns once `file_complete` is `true` and every line has
    /// been shipped. A batch that failed on throttling, the network or a
    /// stale token is re-read on the next tick; one the service rejects
    /// outright is dropped. A stream deleted remotely ends streaming with an
    /// error.
    pub async fn stream_file(
        &self,
        log_group: &str,
        log_stream: &str,
        path: PathBuf,
        file_complete: watch::Receiver<bool>,
    ) -> Result<(), StreamError> {
        let gone = || StreamError::StreamGone {
            log_group: log_group.to_string(),
            log_stream: log_stream.to_string(),
        };

        self.client
            .ensure_group_and_stream(log_group, log_stream)
            .await?;
        let mut token = match self.client.get_sequence_token(log_group, log_stream).await? {
            TokenLookup::Found(token) => token,
            TokenLookup::StreamNotFound => return Err(gone()),
        };
        info!(
            "STREAMER | Streaming {} to {log_group}/{log_stream}",
            path.display()
        );

        let mut cursor = StreamCursor::default();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let complete = *file_complete.borrow();
            let batch = {
                let batcher = Arc::clone(&self.batcher);
                let read_path = path.clone();
                let mut read_cursor = cursor;
                let read = tokio::task::spawn_blocking(move || {
                    batcher
                        .next_batch(&read_path, &mut read_cursor, complete)
                        .map(|batch| (batch, read_cursor))
                })
                .await
                .map_err(|e| StreamError::Reader(e.to_string()))?;
                let (batch, read_cursor) = read.map_err(|source| StreamError::Read {
                    path: path.clone(),
                    source,
                })?;
                cursor = read_cursor;
                batch
            };

            if batch.end_of_stream {
                info!(
                    "STREAMER | Finished {} after {} lines",
                    path.display(),
                    cursor.last_known_line
                );
                return Ok(());
            }
            if batch.events.is_empty() {
                continue;
            }

            match self
                .client
                .put_events(&batch.events, log_group, log_stream, token.take())
                .await
            {
                Ok(next) => {
                    debug!("STREAMER | Shipped {} events", batch.events.len());
                    token = next;
                    cursor.commit();
                }
                Err(e) if e.code() == ErrorCode::ResourceNotFound => return Err(gone()),
                Err(e) => {
                    let code = e.code();
                    if code.is_transient() || code.is_token_mismatch() {
                        warn!(
                            "STREAMER | Failed to ship {} events, retrying: {e}",
                            batch.events.len()
                        );
                    } else {
                        warn!(
                            "STREAMER | Dropping {} events rejected by the service: {e}",
                            batch.events.len()
                        );
                        cursor.commit();
                    }
                    token = match self.client.get_sequence_token(log_group, log_stream).await {
                        Ok(TokenLookup::Found(token)) => token,
                        Ok(TokenLookup::StreamNotFound) => return Err(gone()),
                        Err(e) => {
                            debug!("STREAMER | Failed to refresh sequence token: {e}");
                            None
                        }
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_EVENT_SIZE_BYTES;
    use crate::sink::api::ApiError;
    use crate::test_support::{FakeFactory, FakeLogsApi};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn streamer(api: &Arc<FakeLogsApi>) -> FileStreamer {
        let factory = Arc::new(FakeFactory::new(Arc::clone(api)));
        FileStreamer::new(
            Arc::new(SinkClient::new(factory, None, 10)),
            FileStreamBatcher::new(1, 100),
        )
        .with_interval(Duration::from_millis(10))
    }

    fn file_with(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn ships_complete_file_and_finishes() {
        let api = Arc::new(FakeLogsApi::default());
        let file = file_with("one\ntwo\nthree");
        let (_tx, rx) = watch::channel(true);

        streamer(&api)
            .stream_file("group", "i-1-file", file.path().to_path_buf(), rx)
            .await
            .unwrap();

        assert!(api.has_stream("group", "i-1-file"));
        assert_eq!(
            api.delivered("group", "i-1-file"),
            vec!["one".to_string(), "two".to_string(), "three".to_string()]
        );
    }

    #[tokio::test]
    async fn follows_file_until_marked_complete() {
        let api = Arc::new(FakeLogsApi::default());
        let mut file = file_with("first\n");
        let (tx, rx) = watch::channel(false);
        let path = file.path().to_path_buf();

        let task = {
            let streamer = streamer(&api);
            tokio::spawn(async move { streamer.stream_file("group", "s", path, rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        file.write_all(b"second\n").unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            api.delivered("group", "s"),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_push_is_read_again() {
        let api = Arc::new(FakeLogsApi::default());
        api.fail_next_put(ApiError::new(ErrorCode::ServiceUnavailable, "busy"));
        let file = file_with("only\n");
        let (_tx, rx) = watch::channel(true);

        streamer(&api)
            .stream_file("group", "s", file.path().to_path_buf(), rx)
            .await
            .unwrap();

        assert_eq!(api.delivered("group", "s"), vec!["only".to_string()]);
    }

    #[tokio::test]
    async fn rejected_batch_is_dropped_and_streaming_continues() {
        let api = Arc::new(FakeLogsApi::default());
        api.fail_next_put(ApiError::new(ErrorCode::Other, "event too large"));
        let file = file_with("rejected
");
        let (tx, rx) = watch::channel(false);
        let path = file.path().to_path_buf();

        let task = {
            let streamer = streamer(&api);
            tokio::spawn(async move { streamer.stream_file("group", "s", path, rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut file = file;
        file.write_all(b"accepted\n").unwrap();
        file.flush().unwrap();
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(api.delivered("group", "s"), vec!["accepted".to_string()]);
        assert_eq!(api.put_attempts(), 2);
    }

    #[tokio::test]
    async fn oversized_line_is_truncated_and_shipped() {
        let api = Arc::new(FakeLogsApi::default());
        let long = "x".repeat(MAX_EVENT_SIZE_BYTES + 1_000);
        let file = file_with(&format!("{long}\nafter\n"));
        let (_tx, rx) = watch::channel(true);

        FileStreamer::new(
            Arc::new(SinkClient::new(
                Arc::new(FakeFactory::new(Arc::clone(&api))),
                None,
                10,
            )),
            FileStreamBatcher::default(),
        )
        .with_interval(Duration::from_millis(10))
        .stream_file("group", "s", file.path().to_path_buf(), rx)
        .await
        .unwrap();

        let delivered = api.delivered("group", "s");
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].len(), MAX_EVENT_SIZE_BYTES);
        assert_eq!(delivered[1], "after");
    }

    #[tokio::test]
    async fn deleted_stream_stops_streaming() {
        let api = Arc::new(FakeLogsApi::default());
        api.fail_next_put(ApiError::new(ErrorCode::ResourceNotFound, "gone"));
        let file = file_with("line\n");
        let (_tx, rx) = watch::channel(false);

        let err = streamer(&api)
            .stream_file("group", "s", file.path().to_path_buf(), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::StreamGone { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let api = Arc::new(FakeLogsApi::default());
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);

        let err = streamer(&api)
            .stream_file("group", "s", dir.path().join("absent.log"), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Read { .. }));
    }
}
