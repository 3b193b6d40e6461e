use std::fmt;
use std::io::IsTerminal;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::types::LogFormat;

/// Outcome tag prepended to session lifecycle events in pretty output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    fn classify(message: &str) -> Option<Self> {
        let msg = message.to_lowercase();
        if DENY_MARKERS.iter().any(|m| msg.contains(m)) {
            Some(Verdict::Deny)
        } else if ALLOW_MARKERS.iter().any(|m| msg.contains(m)) {
            Some(Verdict::Allow)
        } else {
            None
        }
    }

    fn tag(self, ansi: bool) -> &'static str {
        match (self, ansi) {
            (Verdict::Allow, true) => "\x1b[34m[ALLOW]\x1b[0m ",
            (Verdict::Allow, false) => "[ALLOW] ",
            (Verdict::Deny, true) => "\x1b[31m[DENY]\x1b[0m ",
            (Verdict::Deny, false) => "[DENY] ",
        }
    }
}

const DENY_MARKERS: &[&str] = &[
    "rejected",
    "denied",
    "auth failed",
    "timed out",
    "agent forwarding failed",
    "error opening channel",
];

const ALLOW_MARKERS: &[&str] = &["session started", "connection established", "auth success"];

/// Field name to ANSI color code. Longer names that share a prefix come first.
const FIELD_COLORS: &[(&str, &str)] = &[
    ("user", "36"),
    ("fingerprint", "36"),
    ("service", "33"),
    ("subsystem", "33"),
    ("session", "35"),
    ("peer", "35"),
    ("ip", "35"),
    ("conn_id", "2"),
    ("trace_id", "2"),
    ("error", "31"),
    ("reason", "31"),
];

/// Pretty formatter that tags accepted/rejected sessions and colorizes the
/// fields operators scan for.
pub struct PrefixedFormatter<E> {
    inner: E,
    ansi: bool,
}

impl<E> PrefixedFormatter<E> {
    pub fn new(inner: E, ansi: bool) -> Self {
        Self { inner, ansi }
    }
}

impl<S, N, E> FormatEvent<S, N> for PrefixedFormatter<E>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if let Some(verdict) = Verdict::classify(&visitor.message) {
            writer.write_str(verdict.tag(self.ansi))?;
        }

        if !self.ansi {
            return self.inner.format_event(ctx, writer, event);
        }
        let mut line = String::new();
        self.inner.format_event(ctx, Writer::new(&mut line), event)?;
        writer.write_str(&colorize_fields(&line))
    }
}

fn colorize_fields(line: &str) -> String {
    FIELD_COLORS
        .iter()
        .fold(line.to_string(), |acc, (field, color)| {
            let pattern = format!(" {}=", field);
            if acc.contains(&pattern) {
                acc.replace(&pattern, &format!(" \x1b[{}m{}=\x1b[0m", color, field))
            } else {
                acc
            }
        })
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

/// Install the global subscriber. An unparsable `level` falls back to `info`.
pub fn setup_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Pretty => {
            let ansi = std::io::stdout().is_terminal();
            tracing_subscriber::fmt()
                .event_format(PrefixedFormatter::new(
                    tracing_subscriber::fmt::format::Format::default(),
                    ansi,
                ))
                .with_env_filter(filter)
                .init();
        }
    }
}
