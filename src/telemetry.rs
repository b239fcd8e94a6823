use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber filtered at `log_level`.
///
/// Falls back to `info` for an unparsable level. Returns false when a subscriber was already set.
pub fn init(log_level: &str) -> bool {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}
