use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Commands written to a relay
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

/// Replies read from a relay
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::incoming!(level = TRACE, $($msg)*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Output format for log lines, selected with `LOG_FORMAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Compact,
    Json,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

fn level_from(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    value.map_or(default, |level| {
        LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

fn ours(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target().starts_with("courier")
}

/// Install the global subscriber.
///
/// `LOG_LEVEL` picks the verbosity (`TRACE` in debug builds, `INFO` otherwise) and
/// `LOG_FORMAT=json` switches to one JSON object per line. Only events emitted from
/// the courier crates are kept.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let level = level_from(std::env::var("LOG_LEVEL").ok().as_deref(), default);
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|f| {
            f.parse::<Format>()
                .inspect_err(|err| eprintln!("{err}, defaulting to compact"))
                .ok()
        })
        .unwrap_or_default();

    let timer = tracing_subscriber::fmt::time::ChronoUtc::rfc_3339();

    match format {
        Format::Compact => tracing_subscriber::Registry::default()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(false)
                    .with_line_number(false)
                    .compact()
                    .with_ansi(true)
                    .with_timer(timer)
                    .with_filter(level)
                    .with_filter(FilterFn::new(ours)),
            )
            .init(),
        Format::Json => tracing_subscriber::Registry::default()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(timer)
                    .with_filter(level)
                    .with_filter(FilterFn::new(ours)),
            )
            .init(),
    }
}
