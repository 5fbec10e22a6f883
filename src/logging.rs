//! Logging setup (§4.11): an `EnvFilter` plus a dual `fmt` layer writing to
//! stderr and a daily rolling file under the same cache directory
//! [`crate::session_store`] persists its session record in.

use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default `EnvFilter` directive when `RUST_LOG` isn't set.
pub const DEFAULT_FILTER: &str = "bandroom_session=info";

/// Cache directory logs are written under, mirroring `SessionStore`'s own
/// storage location so a bug report only needs one directory.
fn log_dir() -> PathBuf {
    let path = dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("bandroom-session");
    let _ = std::fs::create_dir_all(&path);
    path
}

/// Install the global `tracing` subscriber: an `EnvFilter` (default
/// [`DEFAULT_FILTER`]) plus a colored stderr layer and a non-colored daily
/// rolling file layer. Returns the file appender's guard; the caller must
/// keep it alive for the process lifetime or buffered log lines are lost.
pub fn init(disable_colors: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir(), "bandroom-session.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let disable_colors = disable_colors || std::env::var("NO_COLOR").map(|v| !v.is_empty()).unwrap_or(false);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(!disable_colors)
                .and_then(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer)),
        )
        .init();

    guard
}
