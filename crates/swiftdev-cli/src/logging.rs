//! Logging initialization for the CLI.
//!
//! Logging is owned by the CLI crate; the core library only emits
//! `tracing` events.

use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber.
///
/// `verbosity`: 0 = INFO, 1 = DEBUG, 2+ = TRACE for swiftdev's own targets.
/// `RUST_LOG` still applies to everything else. With `json`, events are
/// written to stderr as JSON lines.
pub fn init(verbosity: u8, json: bool) {
    let level = level_for(verbosity);

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    for target in ["swiftdev_core", "swiftdev", "tower_http"] {
        if let Ok(directive) = format!("{target}={level}").parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
