pub mod host_cli;
pub mod router_cli;

/// Install the tracing subscriber for a binary.
pub fn init_tracing() {
    peer_net::logging::init();
}

/// Apply the `log_level` option persisted in the router database, unless
/// `RUST_LOG` already pins the filter.
pub async fn apply_persisted_log_level(pool: &sqlx::SqlitePool) {
    if peer_net::logging::env_override_active() {
        return;
    }
    let Ok(Some(level)) = state_store::options::get_router_option(pool, "log_level").await else {
        return;
    };
    peer_net::logging::apply_level(peer_net::logging::level_from_option(&level));
}
