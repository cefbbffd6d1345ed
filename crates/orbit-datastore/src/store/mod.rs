//! Persistent storage for groups and subjects
//!
//! The datastore talks to storage through [`PersistentStore`]. Every call
//! blocks; callers run them on task-queue workers. Write methods report
//! whether a row was affected.

mod memory;
mod schema;
mod sqlite;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{GroupRecord, SubjectRecord};
use crate::error::{DatastoreError, Result};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub trait PersistentStore: Send + Sync {
    /// Open the backing connection and create missing tables. Idempotent.
    fn connect(&self) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    fn load_all_groups(&self) -> Result<Vec<GroupRecord>>;
    fn load_group(&self, name: &str) -> Result<Option<GroupRecord>>;
    fn insert_group(&self, group: &GroupRecord) -> Result<bool>;
    fn update_group(&self, group: &GroupRecord) -> Result<bool>;
    fn delete_group(&self, name: &str) -> Result<bool>;

    fn load_subject(&self, id: Uuid) -> Result<Option<SubjectRecord>>;
    fn load_subjects_by_group(&self, group_name: &str) -> Result<Vec<SubjectRecord>>;
    fn insert_subject(&self, subject: &SubjectRecord) -> Result<bool>;
    fn update_subject(&self, subject: &SubjectRecord) -> Result<bool>;
    fn delete_subject(&self, id: Uuid) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Group,
    Subject,
}

/// Storage name for each entity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub groups: String,
    pub subjects: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            groups: "groups".into(),
            subjects: "subjects".into(),
        }
    }
}

impl TableNames {
    pub fn table(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Group => &self.groups,
            EntityKind::Subject => &self.subjects,
        }
    }

    /// Names end up in SQL text, so only plain identifiers are accepted.
    pub fn validate(&self) -> Result<()> {
        for (key, name) in [("tables.groups", &self.groups), ("tables.subjects", &self.subjects)] {
            if !is_identifier(name) {
                return Err(DatastoreError::Config(format!(
                    "{key} must be a plain identifier, got {name:?}"
                )));
            }
        }

        if self.groups.eq_ignore_ascii_case(&self.subjects) {
            return Err(DatastoreError::Config(
                "tables.groups and tables.subjects must differ".to_string(),
            ));
        }

        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
