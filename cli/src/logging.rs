//! Tracing setup from `LUMINA_LOG_LEVEL` (default INFO) and
//! `LUMINA_LOG_FORMAT` (`text` | `json`).

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_env("LUMINA_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LUMINA_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
