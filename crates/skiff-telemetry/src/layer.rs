//! `tracing` layer feeding events through the redacting formatter

use crate::formatter::{ExceptionInfo, Record, RedactingFormatter};
use std::error::Error as StdError;
use std::fmt::{self, Write as _};
use std::io::Write;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Writes every event as one redacted line to `W`
pub struct RedactingLayer<W> {
    formatter: RedactingFormatter,
    make_writer: W,
}

impl<W> RedactingLayer<W>
where
    W: for<'a> MakeWriter<'a> + 'static,
{
    pub fn new(formatter: RedactingFormatter, make_writer: W) -> Self {
        Self {
            formatter,
            make_writer,
        }
    }

    pub fn formatter(&self) -> &RedactingFormatter {
        &self.formatter
    }
}

impl<S, W> Layer<S> for RedactingLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'a> MakeWriter<'a> + 'static,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let component = metadata.module_path().unwrap_or_else(|| metadata.target());
        let function = visitor
            .function
            .take()
            .or_else(|| ctx.event_span(event).map(|span| span.name().to_string()))
            .unwrap_or_else(|| "-".to_string());

        let mut record = Record::new(metadata.level().to_string(), visitor.message())
            .with_session(self.formatter.app().session_id.clone());
        record.component = component.to_string();
        record.function = function;
        record.line = metadata.line();
        record.user_id = visitor.user_id.take();
        record.exception = visitor.exception.take();

        let mut line = self.formatter.format(&record);
        line.push('\n');

        let mut writer = self.make_writer.make_writer_for(metadata);
        let _ = writer.write_all(line.as_bytes());
    }
}

/// Collects the message, a few well-known fields and everything else as
/// trailing `key=value` pairs.
#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    function: Option<String>,
    user_id: Option<String>,
    exception: Option<ExceptionInfo>,
    extra: String,
}

impl RecordVisitor {
    fn message(&self) -> String {
        let mut message = self.message.clone().unwrap_or_default();
        if !self.extra.is_empty() {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&self.extra);
        }
        message
    }

    fn push_extra(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if !self.extra.is_empty() {
            self.extra.push(' ');
        }
        let _ = write!(self.extra, "{}={}", field.name(), value);
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "function" => self.function = Some(value.to_string()),
            "user_id" => self.user_id = Some(value.to_string()),
            "exception" => self.exception = Some(ExceptionInfo::new(value)),
            _ => self.push_extra(field, format_args!("{}", value)),
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn StdError + 'static)) {
        let info = ExceptionInfo::from_error(value);
        self.exception = Some(match field.name() {
            "error" | "exception" => info,
            other => info.with_kind(other),
        });
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{:?}", value)),
            "function" => self.function = Some(format!("{:?}", value)),
            "user_id" => self.user_id = Some(format!("{:?}", value)),
            _ => self.push_extra(field, format_args!("{:?}", value)),
        }
    }
}
