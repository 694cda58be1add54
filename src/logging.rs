use colored::*;
use std::fmt;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
// Correct the import paths for tracing_subscriber items.
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{filter::EnvFilter, prelude::*, Layer};

/// Colorizes the whole log line by severity; no timestamp/level prefix.
///
/// Used for the stdout layer. The file layer uses the default uncolored
/// formatter so archived logs stay greppable.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
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
        // Buffer the formatted fields to apply color to the entire line.
        // This is necessary because the format_fields method writes directly.
        let mut buffer = String::new();
        let buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer, event)?;

        // Apply color based on the event's log level.
        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        // Write the colored line to the actual output.
        writeln!(writer, "{}", colored_output)
    }
}

/// Keeps the non-blocking file writer's background flush thread alive.
/// Dropping this stops file logging, so the caller must hold it for as
/// long as the node runs.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Registers the dual-layer subscriber: a plain, uncolored layer (rolling
/// daily log file if `log_dir` is given, otherwise stderr) for archived
/// logs, and a colorized stdout layer for interactive use. Both layers
/// share the same `RUST_LOG`-driven filter, defaulting to `info`.
///
/// Safe to call once per process; a second call is a no-op panic from
/// `tracing`'s global dispatcher, same as the teacher's `main.rs`.
pub fn init(log_dir: Option<&Path>) -> LoggingGuard {
    let make_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (detailed_layer, file_guard) = match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "siphon.log");
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(make_filter())
                .boxed();
            (layer, Some(guard))
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(make_filter())
                .boxed();
            (layer, None)
        }
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .event_format(ColorizedFormatter)
        .with_filter(make_filter());

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();

    LoggingGuard { _file_guard: file_guard }
}