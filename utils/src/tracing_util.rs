//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::filter::LevelFilter;

/// Initialize tracing with the default configuration.
///
/// `RUST_LOG` wins when set; otherwise events at `default_level` and above
/// are emitted.
pub fn initialize_tracing(default_level: tracing::Level) {
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(default_level).into())
        .from_env_lossy();
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
