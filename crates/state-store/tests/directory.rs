mod common;

use common::set_test_db_env;
use fv_types::user::{session_access, user_flags, User};
use serial_test::serial;
use state_store::{hosts, users, DbError};

fn sample_user(name: &str) -> User {
    User {
        entry_id: 0,
        username: name.to_string(),
        verifier: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdHNhbHQ$AAAAAAAAAAAAAAAAAAAAAA".to_string(),
        sessions: session_access::ADMIN | session_access::CLIENT,
        flags: user_flags::ENABLED,
    }
}

#[tokio::test]
#[serial]
async fn add_and_find_user_is_case_insensitive() {
    set_test_db_env("users_case");
    let handle = state_store::router_db().await.unwrap();
    state_store::migrate_router(&handle).await.unwrap();
    let pool = handle.into_pool();

    let id = users::add_user(&pool, &sample_user("Admin")).await.unwrap();
    assert!(id > 0);

    let found = users::find_user(&pool, "ADMIN").await.unwrap().unwrap();
    assert_eq!(found.entry_id, id);
    assert_eq!(found.username, "Admin");
}

#[tokio::test]
#[serial]
async fn duplicate_username_does_not_mutate() {
    set_test_db_env("users_dup");
    let handle = state_store::router_db().await.unwrap();
    state_store::migrate_router(&handle).await.unwrap();
    let pool = handle.into_pool();

    users::add_user(&pool, &sample_user("admin")).await.unwrap();
    let err = users::add_user(&pool, &sample_user("ADMIN")).await.unwrap_err();
    assert!(matches!(err, DbError::DuplicateUsername { .. }));
    assert_eq!(users::count_users(&pool).await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn modify_and_remove_report_missing_entries() {
    set_test_db_env("users_modify");
    let handle = state_store::router_db().await.unwrap();
    state_store::migrate_router(&handle).await.unwrap();
    let pool = handle.into_pool();

    let mut user = sample_user("operator");
    user.entry_id = users::add_user(&pool, &user).await.unwrap();

    user.flags = 0;
    users::modify_user(&pool, &user).await.unwrap();
    let reread = users::find_user(&pool, "operator").await.unwrap().unwrap();
    assert!(!reread.is_enabled());

    users::remove_user(&pool, user.entry_id).await.unwrap();
    assert!(matches!(
        users::remove_user(&pool, user.entry_id).await.unwrap_err(),
        DbError::UserNotFound { .. }
    ));
    assert!(matches!(
        users::modify_user(&pool, &user).await.unwrap_err(),
        DbError::UserNotFound { .. }
    ));
}

#[tokio::test]
#[serial]
async fn user_list_is_ordered_by_entry_id() {
    set_test_db_env("users_order");
    let handle = state_store::router_db().await.unwrap();
    state_store::migrate_router(&handle).await.unwrap();
    let pool = handle.into_pool();

    users::add_user(&pool, &sample_user("zeta")).await.unwrap();
    users::add_user(&pool, &sample_user("alpha")).await.unwrap();

    let list = users::user_list(&pool).await.unwrap();
    assert_eq!(list.len(), 2);
    assert!(list[0].entry_id < list[1].entry_id);
    assert_eq!(list[0].username, "zeta");
}

#[tokio::test]
#[serial]
async fn add_host_allocates_sequential_ids_and_is_idempotent() {
    set_test_db_env("hosts_idempotent");
    let handle = state_store::router_db().await.unwrap();
    state_store::migrate_router(&handle).await.unwrap();
    let pool = handle.into_pool();

    let key_a = [0xAAu8; 32];
    let key_b = [0xBBu8; 32];

    let id_a = hosts::add_host(&pool, &key_a).await.unwrap();
    let id_b = hosts::add_host(&pool, &key_b).await.unwrap();
    assert!(id_a.is_valid());
    assert_ne!(id_a, id_b);

    // Second registration of the same key returns the same id and adds no row.
    let id_a2 = hosts::add_host(&pool, &key_a).await.unwrap();
    assert_eq!(id_a, id_a2);
    assert_eq!(hosts::count_hosts(&pool).await.unwrap(), 2);

    assert_eq!(hosts::host_id(&pool, &key_a).await.unwrap(), Some(id_a));
    assert_eq!(hosts::host_id(&pool, &[0xCC; 32]).await.unwrap(), None);
}
