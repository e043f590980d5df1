//! Per-tunnel log line format
//!
//! Every event is rendered as `[<timestamp>] [<tunnel>] <message>`, the plain
//! text format the registry tails for `logs`.

use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Timestamp layout used in tunnel log lines (local time, seconds precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Event formatter producing `[timestamp] [name] message` lines
#[derive(Debug, Clone)]
pub struct TunnelLogFormat {
    name: String,
}

impl TunnelLogFormat {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl<S, N> FormatEvent<S, N> for TunnelLogFormat
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
        write!(
            writer,
            "[{}] [{}] ",
            chrono::Local::now().format(TIMESTAMP_FORMAT),
            self.name
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Variable overriding the proxy's `info` level. `RUST_LOG` is not used
/// because the proxy inherits the environment of the CLI that spawned it.
pub const PROXY_LOG_ENV: &str = "HOOKTUNNEL_PROXY_LOG";

/// Build the subscriber used by a proxy process
pub fn tunnel_log_subscriber<W>(name: &str, make_writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_env(PROXY_LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .event_format(TunnelLogFormat::new(name))
        .finish()
}
