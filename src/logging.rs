use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// A tracing event formatter for the user-facing stdout stream.
///
/// Lines carry no timestamps or targets; the message and its fields are
/// colored by severity, with warnings and errors prefixed so they stand
/// out even when colors are stripped.
pub struct DeploymentFormatter;

impl<S, N> FormatEvent<S, N> for DeploymentFormatter
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
        // Buffer the formatted fields so the whole line can be colored at
        // once.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let line = match *event.metadata().level() {
            Level::ERROR => format!("error: {buffer}").red().bold(),
            Level::WARN => format!("warning: {buffer}").yellow(),
            Level::INFO => buffer.normal(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.dimmed(),
        };
        writeln!(writer, "{line}")
    }
}
