//! Tracing setup with a runtime-reloadable level filter.
//!
//! A binary installs the subscriber once at startup. The effective level
//! then comes from three places in fixed priority: `RUST_LOG` when the
//! operator set it, the `log_level` option persisted in the router
//! directory, and "info" as the fallback. The persisted level is applied
//! through a reload handle so changing it does not need a restart.

use once_cell::sync::OnceCell;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

static RELOAD: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

/// Install the global subscriber with a reloadable filter. Safe to call
/// more than once; only the first installation wins.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (reload_layer, handle) = reload::Layer::new(env_filter);
    if tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer())
        .try_init()
        .is_ok()
    {
        let _ = RELOAD.set(handle);
    }
}

/// True when `RUST_LOG` pins the filter; a persisted level must not
/// override the operator then.
pub fn env_override_active() -> bool {
    matches!(std::env::var("RUST_LOG"), Ok(s) if !s.trim().is_empty())
}

/// Map a persisted `log_level` option onto a filter. Unknown values fall
/// back to "info" rather than failing startup.
pub fn level_from_option(value: &str) -> LevelFilter {
    match value.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

/// Swap the active filter. No-op until [`init`] has run.
pub fn apply_level(level: LevelFilter) {
    let Some(handle) = RELOAD.get() else { return };
    let directive = match level {
        LevelFilter::OFF => "off",
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::DEBUG => "debug",
        LevelFilter::TRACE => "trace",
        _ => "info",
    };
    let _ = handle.reload(EnvFilter::new(directive));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_levels_parse_with_info_fallback() {
        assert_eq!(level_from_option("warn"), LevelFilter::WARN);
        assert_eq!(level_from_option("TRACE"), LevelFilter::TRACE);
        assert_eq!(level_from_option("off"), LevelFilter::OFF);
        assert_eq!(level_from_option("chatty"), LevelFilter::INFO);
    }
}
