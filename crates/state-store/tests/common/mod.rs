//! Test utilities for state-store tests.

/// Point `FV_ROUTER_DB_URL` at a named in-memory SQLite database.
///
/// # Safety
/// Uses `std::env::set_var`, which is unsafe in multi-threaded contexts.
/// Tests calling this must be marked `#[serial]`.
pub fn set_test_db_env(test_name: &str) {
    unsafe {
        std::env::set_var(
            "FV_ROUTER_DB_URL",
            format!("sqlite:file:{}?mode=memory&cache=shared", test_name),
        );
    }
}
