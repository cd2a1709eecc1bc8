// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Incremental reader turning a growing text file into batches of events.
//!
//! The caller owns a [`StreamCursor`]; each call resumes after
//! `last_known_line` and reports in `current_line` how far the returned
//! events reach. Committing the cursor is the caller's job, so a batch that
//! failed to ship is simply read again.
//!
//! Lines accumulate into one event until the next line would push it past
//! `max_bytes_per_event` (newlines included). A single line larger than the
//! limit still becomes one event of its own, cut down to
//! [`MAX_EVENT_SIZE_BYTES`] so the service accepts it.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::constants::{MAX_BATCH_SIZE_BYTES, MAX_EVENTS_PER_BATCH, MAX_EVENT_SIZE_BYTES};
use crate::event::LogEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCursor {
    /// Lines already shipped.
    pub last_known_line: usize,
    /// Lines covered by the last batch read; becomes `last_known_line` once
    /// that batch is shipped.
    pub current_line: usize,
}

impl StreamCursor {
    pub fn commit(&mut self) {
        self.last_known_line = self.current_line;
    }
}

/// Identity of the session a file belongs to, used by the structured format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub region: String,
    pub target_id: String,
    pub user_arn: String,
    pub run_as_user: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventFormat {
    /// Lines joined with `\n`.
    #[default]
    Raw,
    /// Lines wrapped in a JSON document carrying the session metadata.
    Structured(SessionMetadata),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBatch {
    pub events: Vec<LogEvent>,
    /// The file is complete and everything in it has been returned.
    pub end_of_stream: bool,
}

#[derive(Debug, Clone)]
pub struct FileStreamBatcher {
    max_bytes_per_event: usize,
    max_events_per_batch: usize,
    max_batch_bytes: usize,
    format: EventFormat,
    strip_control_characters: bool,
}

impl Default for FileStreamBatcher {
    fn default() -> Self {
        Self::new(MAX_EVENT_SIZE_BYTES, MAX_EVENTS_PER_BATCH)
    }
}

#[derive(Debug, Default)]
struct Pending {
    lines: Vec<String>,
    bytes: usize,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn push(&mut self, raw: &[u8]) {
        self.bytes += raw.len();
        let text = String::from_utf8_lossy(raw);
        let text = text.strip_suffix('\n').unwrap_or(&text);
        let text = text.strip_suffix('\r').unwrap_or(text);
        self.lines.push(text.to_string());
    }
}

impl FileStreamBatcher {
    #[must_use]
    pub fn new(max_bytes_per_event: usize, max_events_per_batch: usize) -> Self {
        Self {
            max_bytes_per_event,
            max_events_per_batch: max_events_per_batch.max(1),
            max_batch_bytes: MAX_BATCH_SIZE_BYTES,
            format: EventFormat::Raw,
            strip_control_characters: false,
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: EventFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_control_character_stripping(mut self, enabled: bool) -> Self {
        self.strip_control_characters = enabled;
        self
    }

    #[must_use]
    pub fn with_max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.max_batch_bytes = max_batch_bytes;
        self
    }

    /// Reads the lines after `cursor.last_known_line` into events and sets
    /// `cursor.current_line` to the first line not covered by them.
    ///
    /// A trailing line without a newline is left for a later call unless
    /// `file_complete` is set.
    pub fn next_batch(
        &self,
        path: &Path,
        cursor: &mut StreamCursor,
        file_complete: bool,
    ) -> io::Result<FileBatch> {
        let mut reader = BufReader::new(File::open(path)?);
        cursor.current_line = cursor.last_known_line;
        let skipped = skip_lines(&mut reader, cursor.last_known_line)?;
        if skipped < cursor.last_known_line {
            debug!(
                "STREAMER | {} has {skipped} lines, fewer than the {} already shipped",
                path.display(),
                cursor.last_known_line
            );
            return Ok(FileBatch {
                events: Vec::new(),
                end_of_stream: file_complete,
            });
        }

        let now = Utc::now();
        let mut events = Vec::new();
        let mut batch_bytes = 0;
        let mut consumed = 0;
        let mut pending = Pending::default();
        let mut line = Vec::new();
        let mut full = false;

        loop {
            if events.len() >= self.max_events_per_batch {
                full = true;
                break;
            }
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            let partial = read > 0 && !line.ends_with(b"\n");
            if read == 0 || (partial && !file_complete) {
                break;
            }
            if !pending.is_empty() && pending.bytes + line.len() > self.max_bytes_per_event {
                if !self.seal(&mut pending, now, &mut events, &mut batch_bytes, &mut consumed) {
                    full = true;
                    break;
                }
                if events.len() >= self.max_events_per_batch {
                    full = true;
                    break;
                }
            }
            pending.push(&line);
        }

        let nothing_new = events.is_empty() && pending.is_empty();
        if !full && !pending.is_empty() {
            self.seal(&mut pending, now, &mut events, &mut batch_bytes, &mut consumed);
        }

        cursor.current_line = cursor.last_known_line + consumed;
        Ok(FileBatch {
            events,
            end_of_stream: !full && file_complete && nothing_new,
        })
    }

    /// Turns the pending lines into an event. Returns `false`, keeping the
    /// lines pending, when the event would overflow the batch.
    fn seal(
        &self,
        pending: &mut Pending,
        now: DateTime<Utc>,
        events: &mut Vec<LogEvent>,
        batch_bytes: &mut usize,
        consumed: &mut usize,
    ) -> bool {
        let message = self.render(&pending.lines, now);
        if !message.is_empty() {
            let mut event = LogEvent::new(message, now.timestamp_millis());
            event.truncate_message(MAX_EVENT_SIZE_BYTES);
            let size = event.serialized_size();
            if !events.is_empty() && *batch_bytes + size > self.max_batch_bytes {
                return false;
            }
            *batch_bytes += size;
            events.push(event);
        }
        *consumed += pending.lines.len();
        *pending = Pending::default();
        true
    }

    fn render(&self, lines: &[String], now: DateTime<Utc>) -> String {
        let lines: Vec<String> = if self.strip_control_characters {
            lines.iter().map(|l| strip_control_characters(l)).collect()
        } else {
            lines.to_vec()
        };
        match &self.format {
            EventFormat::Raw => lines.join("\n"),
            EventFormat::Structured(metadata) => structured_message(metadata, lines, now),
        }
    }
}

/// Skips `lines` lines without buffering them; a non-empty unterminated
/// tail counts as a line. Returns how many were skipped.
fn skip_lines<R: BufRead>(reader: &mut R, lines: usize) -> io::Result<usize> {
    let mut skipped = 0;
    let mut in_line = false;
    while skipped < lines {
        let (used, newline) = {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                if in_line {
                    skipped += 1;
                }
                break;
            }
            match buf.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (buf.len(), false),
            }
        };
        reader.consume(used);
        if newline {
            skipped += 1;
            in_line = false;
        } else {
            in_line = true;
        }
    }
    Ok(skipped)
}

#[allow(clippy::expect_used)]
fn escape_sequences() -> &'static Regex {
    static ESCAPES: OnceLock<Regex> = OnceLock::new();
    ESCAPES.get_or_init(|| {
        // OSC (terminated by BEL or ST), CSI, then two-byte escapes
        Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b\[[0-?]*[ -/]*[@-~]|\x1b[@-Z\\-_]")
            .expect("failed creating regex")
    })
}

#[allow(clippy::expect_used)]
fn control_characters() -> &'static Regex {
    static CONTROLS: OnceLock<Regex> = OnceLock::new();
    CONTROLS.get_or_init(|| {
        Regex::new(r"[\x00-\x08\x0b-\x1f\x7f]").expect("failed creating regex")
    })
}

/// Removes terminal escape sequences and C0 control characters other than
/// newline and tab.
#[must_use]
pub fn strip_control_characters(text: &str) -> String {
    let without_escapes = escape_sequences().replace_all(text, "");
    control_characters()
        .replace_all(&without_escapes, "")
        .into_owned()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StructuredEvent<'a> {
    event_version: &'static str,
    event_time: String,
    aws_region: &'a str,
    target: TargetRef<'a>,
    user_identity: UserIdentity<'a>,
    run_as_user: &'a str,
    session_id: &'a str,
    session_data: Vec<String>,
}

#[derive(Serialize)]
struct TargetRef<'a> {
    id: &'a str,
}

#[derive(Serialize)]
struct UserIdentity<'a> {
    arn: &'a str,
}

fn structured_message(metadata: &SessionMetadata, lines: Vec<String>, now: DateTime<Utc>) -> String {
    let event = StructuredEvent {
        event_version: "1.0",
        event_time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        aws_region: &metadata.region,
        target: TargetRef {
            id: &metadata.target_id,
        },
        user_identity: UserIdentity {
            arn: &metadata.user_arn,
        },
        run_as_user: &metadata.run_as_user,
        session_id: &metadata.session_id,
        session_data: lines,
    };
    match serde_json::to_string(&event) {
        Ok(json) => json,
        Err(e) => {
            debug!("STREAMER | Failed to serialize structured event: {e}");
            event.session_data.join("\n")
        }
    }
}
