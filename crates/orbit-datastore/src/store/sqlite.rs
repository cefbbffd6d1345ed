use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::schema::{quoted, run_migrations};
use super::{EntityKind, PersistentStore, TableNames};
use crate::config::DatastoreConfig;
use crate::entity::{GroupDisplay, GroupRecord, SubjectRecord};
use crate::error::{DatastoreError, Result};
use crate::permissions::{decode_names, decode_nodes, encode_nodes};

const GROUP_COLUMNS: &str = "name, parents, default_group, display_name, prefix, suffix, \
                             color, show_tab, show_tag, show_chat, sort_order, permissions";

const SUBJECT_COLUMNS: &str = "unique_id, name, group_name, last_seen, permissions";

/// SQLite-backed store holding a single shared connection.
#[derive(Debug)]
pub struct SqliteStore {
    path: Option<PathBuf>,
    tables: TableNames,
    busy_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl SqliteStore {
    pub fn new(config: &DatastoreConfig) -> Self {
        Self {
            path: config.database.path.clone(),
            tables: config.tables.clone(),
            busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
            connection: Mutex::new(None),
        }
    }

    pub fn in_memory(tables: TableNames) -> Self {
        Self {
            path: None,
            tables,
            busy_timeout: Duration::from_secs(5),
            connection: Mutex::new(None),
        }
    }

    pub fn open(path: impl Into<PathBuf>, tables: TableNames) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory(tables)
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn table(&self, kind: EntityKind) -> String {
        quoted(self.tables.table(kind))
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(connection) => f(connection),
            None => Err(DatastoreError::NotConnected),
        }
    }
}

fn connection_error(path: &Path, error: impl ToString) -> DatastoreError {
    DatastoreError::ConnectionFailed {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

fn open_file_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| connection_error(path, error))?;
    }

    let connection = Connection::open(path).map_err(|error| connection_error(path, error))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|error| connection_error(path, error))?;
    connection
        .busy_timeout(busy_timeout)
        .map_err(|error| connection_error(path, error))?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .map_err(|error| connection_error(path, error))?;

    Ok(connection)
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<GroupRecord> {
    let parents: Option<String> = row.get(1)?;
    let permissions: Option<String> = row.get(11)?;

    Ok(GroupRecord {
        name: row.get(0)?,
        parents: decode_names(parents.as_deref()),
        default_group: row.get(2)?,
        display: GroupDisplay {
            display_name: row.get(3)?,
            prefix: row.get(4)?,
            suffix: row.get(5)?,
            color: row.get(6)?,
            show_tab: row.get(7)?,
            show_tag: row.get(8)?,
            show_chat: row.get(9)?,
        },
        sort_order: row.get(10)?,
        permissions: decode_nodes(permissions.as_deref()),
    })
}

fn subject_from_row(row: &Row<'_>) -> rusqlite::Result<SubjectRecord> {
    let unique_id: String = row.get(0)?;
    let id = Uuid::parse_str(&unique_id)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(error)))?;
    let last_seen: Option<i64> = row.get(3)?;
    let permissions: Option<String> = row.get(4)?;

    Ok(SubjectRecord {
        id,
        name: row.get(1)?,
        group_name: row.get(2)?,
        last_seen: last_seen.and_then(DateTime::<Utc>::from_timestamp_millis),
        permissions: decode_nodes(permissions.as_deref()),
    })
}

/// Rows that fail to decode are skipped; the error says which table held them.
fn invalid_row(table: &str, error: rusqlite::Error) -> DatastoreError {
    DatastoreError::InvalidRow {
        table: table.to_string(),
        reason: error.to_string(),
    }
}

impl PersistentStore for SqliteStore {
    #[instrument(skip(self), fields(path = ?self.path))]
    fn connect(&self) -> Result<()> {
        let mut slot = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let connection = match &self.path {
            Some(path) => open_file_connection(path, self.busy_timeout)?,
            None => Connection::open_in_memory()
                .map_err(|error| connection_error(Path::new(":memory:"), error))?,
        };
        run_migrations(&connection, &self.tables)?;
        *slot = Some(connection);

        info!("Connected to SQLite store");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(connection) = connection {
            connection
                .close()
                .map_err(|(_, error)| DatastoreError::QueryFailed(error.to_string()))?;
            debug!("Disconnected from SQLite store");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    #[instrument(skip(self))]
    fn load_all_groups(&self) -> Result<Vec<GroupRecord>> {
        let table = self.table(EntityKind::Group);
        self.with_connection(|connection| {
            let mut statement = connection.prepare(&format!(
                "SELECT {GROUP_COLUMNS} FROM {table} ORDER BY sort_order, name"
            ))?;
            let rows = statement.query_map([], group_from_row)?;

            let mut groups = Vec::new();
            for row in rows {
                match row {
                    Ok(group) if group.name.trim().is_empty() => {
                        warn!(table = %table, "Skipping group row without a name");
                    }
                    Ok(group) => groups.push(group),
                    Err(error) => {
                        let error = invalid_row(&table, error);
                        warn!(%error, "Skipping undecodable group row");
                    }
                }
            }
            Ok(groups)
        })
    }

    #[instrument(skip(self))]
    fn load_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        let table = self.table(EntityKind::Group);
        self.with_connection(|connection| {
            let group = connection
                .query_row(
                    &format!("SELECT {GROUP_COLUMNS} FROM {table} WHERE name = ?1"),
                    params![name],
                    group_from_row,
                )
                .optional()?;
            Ok(group)
        })
    }

    #[instrument(skip(self, group), fields(group = %group.name))]
    fn insert_group(&self, group: &GroupRecord) -> Result<bool> {
        let table = self.table(EntityKind::Group);
        self.with_connection(|connection| {
            let inserted = connection.execute(
                &format!(
                    "INSERT INTO {table} ({GROUP_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    group.name,
                    encode_nodes(&group.parents),
                    group.default_group,
                    group.display.display_name,
                    group.display.prefix,
                    group.display.suffix,
                    group.display.color,
                    group.display.show_tab,
                    group.display.show_tag,
                    group.display.show_chat,
                    group.sort_order,
                    encode_nodes(&group.permissions),
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    #[instrument(skip(self, group), fields(group = %group.name))]
    fn update_group(&self, group: &GroupRecord) -> Result<bool> {
        let table = self.table(EntityKind::Group);
        self.with_connection(|connection| {
            let updated = connection.execute(
                &format!(
                    "UPDATE {table} SET parents = ?2, default_group = ?3, display_name = ?4, \
                     prefix = ?5, suffix = ?6, color = ?7, show_tab = ?8, show_tag = ?9, \
                     show_chat = ?10, sort_order = ?11, permissions = ?12 WHERE name = ?1"
                ),
                params![
                    group.name,
                    encode_nodes(&group.parents),
                    group.default_group,
                    group.display.display_name,
                    group.display.prefix,
                    group.display.suffix,
                    group.display.color,
                    group.display.show_tab,
                    group.display.show_tag,
                    group.display.show_chat,
                    group.sort_order,
                    encode_nodes(&group.permissions),
                ],
            )?;
            Ok(updated > 0)
        })
    }

    #[instrument(skip(self))]
    fn delete_group(&self, name: &str) -> Result<bool> {
        let table = self.table(EntityKind::Group);
        self.with_connection(|connection| {
            let deleted =
                connection.execute(&format!("DELETE FROM {table} WHERE name = ?1"), params![name])?;
            Ok(deleted > 0)
        })
    }

    #[instrument(skip(self))]
    fn load_subject(&self, id: Uuid) -> Result<Option<SubjectRecord>> {
        let table = self.table(EntityKind::Subject);
        self.with_connection(|connection| {
            let subject = connection
                .query_row(
                    &format!("SELECT {SUBJECT_COLUMNS} FROM {table} WHERE unique_id = ?1"),
                    params![id.to_string()],
                    subject_from_row,
                )
                .optional()?;
            Ok(subject)
        })
    }

    #[instrument(skip(self))]
    fn load_subjects_by_group(&self, group_name: &str) -> Result<Vec<SubjectRecord>> {
        let table = self.table(EntityKind::Subject);
        self.with_connection(|connection| {
            let mut statement = connection.prepare(&format!(
                "SELECT {SUBJECT_COLUMNS} FROM {table} WHERE group_name = ?1 ORDER BY unique_id"
            ))?;
            let rows = statement.query_map(params![group_name], subject_from_row)?;

            let mut subjects = Vec::new();
            for row in rows {
                match row {
                    Ok(subject) => subjects.push(subject),
                    Err(error) => {
                        let error = invalid_row(&table, error);
                        warn!(%error, "Skipping undecodable subject row");
                    }
                }
            }
            Ok(subjects)
        })
    }

    #[instrument(skip(self, subject), fields(subject = %subject.id))]
    fn insert_subject(&self, subject: &SubjectRecord) -> Result<bool> {
        let table = self.table(EntityKind::Subject);
        self.with_connection(|connection| {
            let inserted = connection.execute(
                &format!("INSERT INTO {table} ({SUBJECT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    subject.id.to_string(),
                    subject.name,
                    subject.group_name,
                    subject.last_seen.map(|seen| seen.timestamp_millis()),
                    encode_nodes(&subject.permissions),
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    #[instrument(skip(self, subject), fields(subject = %subject.id))]
    fn update_subject(&self, subject: &SubjectRecord) -> Result<bool> {
        let table = self.table(EntityKind::Subject);
        self.with_connection(|connection| {
            let updated = connection.execute(
                &format!(
                    "UPDATE {table} SET name = ?2, group_name = ?3, last_seen = ?4, permissions = ?5 \
                     WHERE unique_id = ?1"
                ),
                params![
                    subject.id.to_string(),
                    subject.name,
                    subject.group_name,
                    subject.last_seen.map(|seen| seen.timestamp_millis()),
                    encode_nodes(&subject.permissions),
                ],
            )?;
            Ok(updated > 0)
        })
    }

    #[instrument(skip(self))]
    fn delete_subject(&self, id: Uuid) -> Result<bool> {
        let table = self.table(EntityKind::Subject);
        self.with_connection(|connection| {
            let deleted = connection.execute(
                &format!("DELETE FROM {table} WHERE unique_id = ?1"),
                params![id.to_string()],
            )?;
            Ok(deleted > 0)
        })
    }
}
