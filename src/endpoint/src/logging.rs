use std::fmt;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Environment variable overriding the default filter directive.
pub const LOG_ENV: &str = "RDMA_ENDPOINT_LOG";

struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

impl<'a> FmtLevel<'a> {
    fn new(level: &'a Level, ansi: bool) -> Self {
        Self { level, ansi }
    }
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self.level {
            Level::TRACE => TRACE_STR,
            Level::DEBUG => DEBUG_STR,
            Level::INFO => INFO_STR,
            Level::WARN => WARN_STR,
            Level::ERROR => ERROR_STR,
        };
        if !self.ansi {
            return f.pad(s);
        }
        let colour = match *self.level {
            Level::TRACE => Colour::Purple,
            Level::DEBUG => Colour::Blue,
            Level::INFO => Colour::Green,
            Level::WARN => Colour::Yellow,
            Level::ERROR => Colour::Red,
        };
        write!(f, "{}", colour.paint(s))
    }
}

/// `[timestamp LEVEL thread file:line] fields`. Processor workers are named after their
/// channel or device, so the thread column tells event and completion paths apart.
struct EndpointFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for EndpointFormatter
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
        let meta = event.metadata();
        let level = FmtLevel::new(meta.level(), self.ansi && writer.has_ansi_escapes());
        let thread = std::thread::current();

        write!(
            writer,
            "[{} {} {} {}:{}] ",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            level,
            thread.name().unwrap_or("-"),
            meta.file().unwrap_or("<unnamed>"),
            meta.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. `default_level` is a filter directive such as `"info"` or
/// `"rdma_endpoint=debug"`, used when `RDMA_ENDPOINT_LOG` is unset.
///
/// Fails if the directive does not parse or a global subscriber is already set.
pub fn init_log(default_level: &str, ansi: bool) -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;

    let log_env_filter = EnvFilter::builder()
        .with_default_directive(default_level.parse()?)
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let log_fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .event_format(EndpointFormatter { ansi })
        .with_filter(log_env_filter);

    tracing_subscriber::registry().with(log_fmt_layer).try_init()?;
    tracing::debug!(env = LOG_ENV, "endpoint logging initialized");
    Ok(())
}
