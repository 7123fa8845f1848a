//! # Logging Setup
//!
//! Two output streams for a fuzzing campaign: a colorized stdout line per
//! event for the operator, and a daily-rolling detail file (or stderr on
//! request) carrying the full structured record. Crash and hang verdicts
//! override the severity color on stdout, so findings stay visible inside
//! a long stream of INFO lines without raising their log level.

use colored::*;
use std::fmt;
use std::path::Path;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

/// Operator-facing formatter for the stdout stream.
///
/// The whole line is colored: by the event's `result`/`verdict` field when
/// one is present (crashes red, hangs and resource exhaustion yellow),
/// else by severity. No timestamps or level prefixes; the detail file
/// keeps those.
pub struct CampaignFormatter;

/// Extracts a test-case verdict from an event's fields, if it carries one.
#[derive(Default)]
struct VerdictVisitor {
    verdict: Option<String>,
}

impl Visit for VerdictVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if matches!(field.name(), "result" | "verdict") {
            self.verdict = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if matches!(field.name(), "result" | "verdict") {
            self.verdict = Some(format!("{value:?}"));
        }
    }
}

impl<S, N> FormatEvent<S, N> for CampaignFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let mut visitor = VerdictVisitor::default();
        event.record(&mut visitor);

        let line = match visitor.verdict.as_deref() {
            Some("crash") => buffer.red().bold(),
            Some("hang") | Some("resource_exhaustion") => buffer.yellow().bold(),
            Some("logical_failure") | Some("anomaly") => buffer.magenta(),
            _ => match *event.metadata().level() {
                Level::ERROR => buffer.red(),
                Level::WARN => buffer.yellow(),
                Level::INFO => buffer.normal(),
                Level::DEBUG => buffer.blue(),
                Level::TRACE => buffer.dimmed(),
            },
        };

        writeln!(writer, "{}", line)
    }
}

/// Map `-v` counts onto the detail stream's level.
fn detail_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the subscriber: a detail layer (rolling file under `log_dir`,
/// a caller-chosen path, or stderr) plus the colorized stdout layer.
///
/// Returns the non-blocking writer guard; it must live until the process
/// exits or buffered file output is lost.
pub fn init(verbosity: u8, log_file: Option<&str>, log_dir: &Path) -> Option<WorkerGuard> {
    let level = detail_level(verbosity);

    let guard;
    let detail_layer;
    if let Some("stderr") = log_file {
        detail_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(level)
            .boxed();
        guard = None;
    } else {
        let appender = match log_file {
            Some(path_str) => {
                let path = Path::new(path_str);
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let name = path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("protofuzz.log"));
                tracing_appender::rolling::daily(dir, name)
            }
            None => tracing_appender::rolling::daily(log_dir, "protofuzz.log"),
        };
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        detail_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(CampaignFormatter)
        .with_writer(std::io::stdout)
        .with_filter(LevelFilter::INFO)
        .boxed();

    tracing_subscriber::registry()
        .with(detail_layer)
        .with(stdout_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(detail_level(0), LevelFilter::INFO);
        assert_eq!(detail_level(1), LevelFilter::DEBUG);
        assert_eq!(detail_level(2), LevelFilter::TRACE);
        assert_eq!(detail_level(9), LevelFilter::TRACE);
    }
}
