use time::macros::format_description;
use tracing_subscriber::{fmt, fmt::time::UtcTime, EnvFilter};

/// Installs a stderr subscriber. `RUST_LOG` wins over `default_filter`.
/// Returns false when a global subscriber was already set.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let timer = UtcTime::new(format_description!(
        "[hour]:[minute]:[second].[subsecond digits:3]"
    ));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_timer(timer)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
