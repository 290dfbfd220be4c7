//! Version-1 schema DDL and database bootstrap.
//!
//! The table list below is deliberately portable: every primary key is an
//! explicit `INTEGER`/`BIGINT` column rather than an identity/serial column,
//! because the "max current id + 1" allocation scheme (used by every store
//! except `changes`) needs to read and write ids inside the same
//! transaction. The same statements run unmodified against both the sqlite
//! and postgres backends through `sqlx::Any`.

use sqlx::any::AnyKind;
use sqlx::{AnyPool, Executor};

use crate::error::{Error, NotReadyReason, Result};

/// The schema version this crate understands. There has only ever been one.
pub const SCHEMA_VERSION: i64 = 1;

/// All table-creation statements, in dependency order. `pk` is the primary
/// key column definition for tables using "max current id + 1" allocation;
/// it differs only in spelling (INTEGER vs BIGINT), never in the value
/// semantics, between backends.
fn table_ddl(pk: &str) -> Vec<String> {
    vec![
        "CREATE TABLE version (version INTEGER NOT NULL)".to_string(),
        "INSERT INTO version (version) VALUES (1)".to_string(),
        format!(
            "CREATE TABLE last_access (\
                who TEXT NOT NULL, \
                writing INTEGER NOT NULL, \
                last_access BIGINT NOT NULL)"
        ),
        "CREATE TABLE changes_nextid (next_changeid BIGINT NOT NULL)".to_string(),
        "INSERT INTO changes_nextid (next_changeid) VALUES (1)".to_string(),
        format!(
            "CREATE TABLE changes (\
                changeid {pk}, \
                author TEXT NOT NULL, \
                comments TEXT NOT NULL, \
                is_dir INTEGER NOT NULL, \
                branch TEXT, \
                revision TEXT, \
                revlink TEXT, \
                when_timestamp BIGINT NOT NULL, \
                category TEXT)"
        ),
        "CREATE TABLE change_links (changeid BIGINT NOT NULL, link TEXT NOT NULL)".to_string(),
        "CREATE TABLE change_files (changeid BIGINT NOT NULL, filename TEXT NOT NULL)"
            .to_string(),
        "CREATE TABLE change_properties (\
            changeid BIGINT NOT NULL, \
            property_name TEXT NOT NULL, \
            property_value TEXT NOT NULL)"
            .to_string(),
        format!(
            "CREATE TABLE schedulers (\
                schedulerid {pk}, \
                name TEXT UNIQUE NOT NULL, \
                state TEXT NOT NULL)"
        ),
        "CREATE TABLE scheduler_changes (\
            schedulerid BIGINT NOT NULL, \
            changeid BIGINT NOT NULL, \
            important INTEGER NOT NULL)"
            .to_string(),
        "CREATE TABLE scheduler_upstream_buildsets (\
            buildsetid BIGINT NOT NULL, \
            schedulerid BIGINT NOT NULL, \
            active INTEGER NOT NULL)"
            .to_string(),
        format!(
            "CREATE TABLE sourcestamps (\
                id {pk}, \
                branch TEXT, \
                revision TEXT, \
                patchid BIGINT)"
        ),
        format!(
            "CREATE TABLE patches (\
                id {pk}, \
                patchlevel INTEGER NOT NULL, \
                patch_base64 TEXT NOT NULL, \
                subdir TEXT)"
        ),
        "CREATE TABLE sourcestamp_changes (\
            sourcestampid BIGINT NOT NULL, \
            changeid BIGINT NOT NULL)"
            .to_string(),
        format!(
            "CREATE TABLE buildsets (\
                id {pk}, \
                external_idstring TEXT, \
                reason TEXT, \
                sourcestampid BIGINT NOT NULL, \
                submitted_at BIGINT NOT NULL, \
                complete INTEGER NOT NULL DEFAULT 0, \
                complete_at BIGINT, \
                results INTEGER)"
        ),
        "CREATE TABLE buildset_properties (\
            buildsetid BIGINT NOT NULL, \
            property_name TEXT NOT NULL, \
            property_value TEXT NOT NULL)"
            .to_string(),
        format!(
            "CREATE TABLE buildrequests (\
                id {pk}, \
                buildsetid BIGINT NOT NULL, \
                buildername TEXT NOT NULL, \
                priority INTEGER NOT NULL DEFAULT 0, \
                claimed_at BIGINT NOT NULL DEFAULT 0, \
                claimed_by_name TEXT, \
                claimed_by_incarnation TEXT, \
                complete INTEGER NOT NULL DEFAULT 0, \
                results INTEGER, \
                submitted_at BIGINT NOT NULL, \
                complete_at BIGINT)"
        ),
        format!(
            "CREATE TABLE builds (\
                id {pk}, \
                number INTEGER NOT NULL, \
                brid BIGINT NOT NULL, \
                start_time BIGINT NOT NULL, \
                finish_time BIGINT)"
        ),
    ]
}

/// Creates a fresh schema. Refuses to touch a database that already has a
/// `version` table, matching `create_db`'s original contract.
pub async fn create_db(pool: &AnyPool) -> Result<()> {
    let existing: std::result::Result<(i64,), sqlx::Error> =
        sqlx::query_as("SELECT version FROM version").fetch_one(pool).await;
    if existing.is_ok() {
        return Err(Error::AlreadyExists);
    }

    let pk = match pool.any_kind() {
        AnyKind::Postgres => "BIGINT PRIMARY KEY",
        _ => "INTEGER PRIMARY KEY",
    };

    let mut txn = pool.begin().await?;
    for stmt in table_ddl(pk) {
        txn.execute(stmt.as_str()).await?;
    }
    txn.commit().await?;
    Ok(())
}

/// Opens an existing database, verifying it carries a `version` row this
/// crate understands.
pub async fn open_db(pool: &AnyPool) -> Result<()> {
    let row: std::result::Result<(i64,), sqlx::Error> =
        sqlx::query_as("SELECT version FROM version").fetch_one(pool).await;
    let version = match row {
        Ok((v,)) => v,
        Err(sqlx::Error::RowNotFound) => return Err(Error::NotReady(NotReadyReason::Empty)),
        Err(e) => {
            // most drivers report a missing table as a generic database
            // error rather than RowNotFound; treat any failure here as "no
            // version table yet" since that's by far the common case.
            tracing::debug!(error = %e, "treating query failure as empty database");
            return Err(Error::NotReady(NotReadyReason::Empty));
        }
    };
    if version != SCHEMA_VERSION {
        return Err(Error::NotReady(NotReadyReason::UnsupportedVersion(version)));
    }
    Ok(())
}

/// Creates the database if it doesn't exist yet, otherwise just verifies it.
pub async fn create_or_open_db(pool: &AnyPool) -> Result<()> {
    match create_db(pool).await {
        Ok(()) => Ok(()),
        Err(Error::AlreadyExists) => open_db(pool).await,
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::any::install_default_drivers;

    async fn memory_pool() -> AnyPool {
        install_default_drivers();
        AnyPool::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_then_reject_duplicate() {
        let pool = memory_pool().await;
        create_db(&pool).await.unwrap();
        let err = create_db(&pool).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }

    #[tokio::test]
    async fn open_empty_is_not_ready() {
        let pool = memory_pool().await;
        let err = open_db(&pool).await.unwrap_err();
        assert!(matches!(err, Error::NotReady(NotReadyReason::Empty)));
    }

    #[tokio::test]
    async fn open_after_create_succeeds() {
        let pool = memory_pool().await;
        create_db(&pool).await.unwrap();
        open_db(&pool).await.unwrap();
    }
}
