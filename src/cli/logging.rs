//! Log setup for the daemon.
//!
//! Two output shapes, picked by where stderr points: a terminal gets
//! compact human-readable lines, anything else (a pod log collector, a
//! pipe) gets JSON through a non-blocking writer. The verbosity flags on
//! the CLI pick the base level; `RUST_LOG` directives compose on top for
//! per-target filtering.

use std::io::IsTerminal;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

use super::LogArgs;

//================================================================================================
// Macros
//================================================================================================

/// Records an error the daemon cannot recover from.
///
/// The `fatal` field lets log pipelines page on process-ending failures
/// without parsing message text.
#[macro_export]
macro_rules! fatal {
    ($error:expr) => {
        tracing::error!(fatal = true, error = %$error, "terminating")
    };
}

//================================================================================================
// Functions
//================================================================================================

/// Installs the process-wide subscriber and returns the guard that keeps
/// the non-blocking writer flushing.
///
/// Dropping the guard flushes buffered output, so the caller holds it for
/// the life of the process.
pub fn init_global_subscriber(args: LogArgs) -> WorkerGuard {
    let filter = EnvFilter::from_default_env().add_directive(base_level(args).into());
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let output = if std::io::stderr().is_terminal() {
        fmt::layer()
            .compact()
            .without_time()
            .with_target(false)
            .boxed()
    } else {
        fmt::layer().json().with_ansi(false).with_writer(writer).boxed()
    };

    tracing_subscriber::registry().with(filter).with(output).init();
    guard
}

/// The base level the verbosity flags select. Quieting wins over raising.
fn base_level(args: LogArgs) -> LevelFilter {
    match (args.quiet, args.verbosity) {
        (q, _) if q > 1 => LevelFilter::ERROR,
        (1, _) => LevelFilter::WARN,
        (_, 0) => LevelFilter::INFO,
        (_, 1) => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}
