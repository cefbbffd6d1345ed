use rusqlite::{params, Connection};
use tracing::info;

use super::TableNames;
use crate::error::{DatastoreError, Result};

struct Migration {
    version: u32,
    sql: String,
}

/// Table names are part of the DDL, so migrations are rendered per store.
fn migrations(tables: &TableNames) -> Vec<Migration> {
    let groups = quoted(&tables.groups);
    let subjects = quoted(&tables.subjects);
    let subjects_index = quoted(&format!("idx_{}_group_name", tables.subjects));

    vec![
        Migration {
            version: 1,
            sql: format!(
                "CREATE TABLE IF NOT EXISTS {groups} (
                    name TEXT NOT NULL PRIMARY KEY,
                    parents TEXT NOT NULL DEFAULT '',
                    default_group INTEGER NOT NULL DEFAULT 0,
                    display_name TEXT NOT NULL DEFAULT '',
                    prefix TEXT NOT NULL DEFAULT '',
                    suffix TEXT NOT NULL DEFAULT '',
                    color TEXT NOT NULL DEFAULT 'f',
                    show_tab INTEGER NOT NULL DEFAULT 1,
                    show_tag INTEGER NOT NULL DEFAULT 1,
                    show_chat INTEGER NOT NULL DEFAULT 1,
                    sort_order INTEGER NOT NULL UNIQUE,
                    permissions TEXT NOT NULL DEFAULT ''
                );
                CREATE TABLE IF NOT EXISTS {subjects} (
                    unique_id TEXT NOT NULL PRIMARY KEY,
                    group_name TEXT NOT NULL,
                    permissions TEXT NOT NULL DEFAULT ''
                );"
            ),
        },
        Migration {
            version: 2,
            sql: format!(
                "CREATE INDEX IF NOT EXISTS {subjects_index} ON {subjects} (group_name);"
            ),
        },
        Migration {
            version: 3,
            // last_seen holds unix milliseconds
            sql: format!(
                "ALTER TABLE {subjects} ADD COLUMN name TEXT;
                ALTER TABLE {subjects} ADD COLUMN last_seen INTEGER;"
            ),
        },
    ]
}

/// Quote a validated identifier; `groups` is a keyword in newer SQLite.
pub(super) fn quoted(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// Apply pending migrations. Each one runs in its own transaction and is
/// recorded per table set, so stores sharing a database file with different
/// table names don't shadow each other.
pub(super) fn run_migrations(connection: &Connection, tables: &TableNames) -> Result<()> {
    let scope = format!("{}/{}", tables.groups, tables.subjects);

    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                scope TEXT NOT NULL,
                version INTEGER NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (scope, version)
            );",
        )
        .map_err(|error| DatastoreError::SchemaFailed {
            version: 0,
            reason: format!("failed to create _migrations table: {error}"),
        })?;

    for migration in migrations(tables) {
        let is_applied: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE scope = ?1 AND version = ?2)",
                params![scope, migration.version],
                |row| row.get(0),
            )
            .map_err(|error| DatastoreError::SchemaFailed {
                version: migration.version,
                reason: format!("failed to query migration state: {error}"),
            })?;

        if is_applied != 0 {
            continue;
        }

        let tx = connection
            .unchecked_transaction()
            .map_err(|error| DatastoreError::SchemaFailed {
                version: migration.version,
                reason: format!("failed to begin transaction: {error}"),
            })?;

        tx.execute_batch(&migration.sql)
            .map_err(|error| DatastoreError::SchemaFailed {
                version: migration.version,
                reason: error.to_string(),
            })?;

        tx.execute(
            "INSERT INTO _migrations (scope, version) VALUES (?1, ?2)",
            params![scope, migration.version],
        )
        .map_err(|error| DatastoreError::SchemaFailed {
            version: migration.version,
            reason: format!("failed to record migration: {error}"),
        })?;

        tx.commit().map_err(|error| DatastoreError::SchemaFailed {
            version: migration.version,
            reason: format!("failed to commit migration: {error}"),
        })?;

        info!(version = migration.version, scope = %scope, "Applied schema migration");
    }

    Ok(())
}
