use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global subscriber. Later calls are no-ops.
///
/// The filter comes from `LOCALAI_LOG_LEVEL`, then `RUST_LOG`, then `info`.
/// `LOCALAI_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = std::env::var("LOCALAI_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".into());
        let json = std::env::var("LOCALAI_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_target(true)
            .with_level(true);

        let _ = if json {
            tracing::subscriber::set_global_default(builder.json().finish())
        } else {
            tracing::subscriber::set_global_default(builder.compact().finish())
        };
    });
}
