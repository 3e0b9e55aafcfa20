//! Tracing-subscriber initialization for the daemon binary.

use tracing_subscriber::EnvFilter;

/// Installs a global subscriber reading its filter from `RUST_LOG`
/// (defaulting to `info`), in either human-readable or JSON form.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
