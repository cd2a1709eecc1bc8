// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log output of the shipper itself.
//!
//! [`Formatter`] renders lines as
//! ```text
//! LOGS_SHIPPER | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! [`QueueLayer`] feeds every event of the process into the [`LogQueue`], so
//! the shipper's own diagnostics are shipped too. The layer never reports
//! its own failures, and an event emitted while it is enqueueing is dropped.

use std::cell::Cell;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing_core::field::{Field, Visit};
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::event::LogEvent;
use crate::queue::LogQueue;

const PREFIX: &str = "LOGS_SHIPPER";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

thread_local! {
    static ENQUEUEING: Cell<bool> = const { Cell::new(false) };
}

/// Collects the message and the fields of one event into a single line.
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

/// Tracing layer that enqueues each event as a [`LogEvent`].
#[derive(Debug, Clone)]
pub struct QueueLayer {
    queue: Arc<LogQueue>,
}

impl QueueLayer {
    #[must_use]
    pub fn new(queue: Arc<LogQueue>) -> Self {
        Self { queue }
    }
}

impl<S: Subscriber> Layer<S> for QueueLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if ENQUEUEING.with(|flag| flag.replace(true)) {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let line = format!(
            "{PREFIX} | {} | {}",
            event.metadata().level(),
            visitor.finish()
        );
        // Overflow and inactivity are dropped on purpose: reporting them
        // would come straight back here.
        let _ = self.queue.enqueue(LogEvent::now(line));

        ENQUEUEING.with(|flag| flag.set(false));
    }
}
