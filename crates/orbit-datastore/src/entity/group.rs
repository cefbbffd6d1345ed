use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::DefaultGroupConfig;
use crate::permissions::{Inherit, PermissionMatcher};

/// Group name assumed for subjects created before any default group exists
pub const DEFAULT_GROUP_NAME: &str = "default";

/// Presentation metadata carried for the host; never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupDisplay {
    pub display_name: String,
    pub prefix: String,
    pub suffix: String,
    pub color: String,
    pub show_tab: bool,
    pub show_tag: bool,
    pub show_chat: bool,
}

impl Default for GroupDisplay {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            prefix: String::new(),
            suffix: String::new(),
            color: "f".into(),
            show_tab: true,
            show_tag: true,
            show_chat: true,
        }
    }
}

/// Editable, persisted form of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub parents: BTreeSet<String>,
    pub default_group: bool,
    pub display: GroupDisplay,
    /// Unique across groups in the store
    pub sort_order: i32,
    /// Own nodes; inherited nodes are never stored
    pub permissions: BTreeSet<String>,
}

impl GroupRecord {
    /// # Panics
    ///
    /// If `name` is empty or blank.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.trim().is_empty(), "group name must not be empty");

        Self {
            display: GroupDisplay {
                display_name: name.clone(),
                ..GroupDisplay::default()
            },
            name,
            parents: BTreeSet::new(),
            default_group: false,
            sort_order: 0,
            permissions: BTreeSet::new(),
        }
    }

    /// The group inserted when a store has no default group yet
    pub fn bootstrap_default(config: &DefaultGroupConfig) -> Self {
        let mut record = Self::new(config.name.clone()).as_default();
        record.display.display_name = config.display_name.clone();
        record.display.prefix = config.prefix.clone();
        record.display.suffix = config.suffix.clone();
        record.sort_order = config.sort_order;
        record
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parents.insert(parent.into());
        self
    }

    pub fn with_permission(mut self, node: impl Into<String>) -> Self {
        self.permissions.insert(node.into());
        self
    }

    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default_group = true;
        self
    }
}

impl Inherit for GroupRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn parents(&self) -> &BTreeSet<String> {
        &self.parents
    }

    fn own_permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }
}

/// A cached group with its resolved effective permission set.
///
/// Stored fields are fixed for the life of the instance; only the effective
/// set changes, through [`update_permission_set`](Self::update_permission_set).
/// To edit a group, take a [`GroupRecord`] with [`to_record`](Self::to_record),
/// write it back through the datastore and refresh.
#[derive(Debug)]
pub struct Group {
    name: String,
    parents: BTreeSet<String>,
    default_group: bool,
    display: GroupDisplay,
    sort_order: i32,
    permissions: BTreeSet<String>,
    effective: PermissionMatcher,
}

impl Group {
    /// Build a group whose effective set starts out as its own nodes.
    pub fn from_record(record: GroupRecord) -> Self {
        let effective = PermissionMatcher::with_decision_cache(record.permissions.iter().cloned());

        Self {
            name: record.name,
            parents: record.parents,
            default_group: record.default_group,
            display: record.display,
            sort_order: record.sort_order,
            permissions: record.permissions,
            effective,
        }
    }

    pub fn to_record(&self) -> GroupRecord {
        GroupRecord {
            name: self.name.clone(),
            parents: self.parents.clone(),
            default_group: self.default_group,
            display: self.display.clone(),
            sort_order: self.sort_order,
            permissions: self.permissions.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parents(&self) -> &BTreeSet<String> {
        &self.parents
    }

    pub fn is_default(&self) -> bool {
        self.default_group
    }

    pub fn display(&self) -> &GroupDisplay {
        &self.display
    }

    pub fn sort_order(&self) -> i32 {
        self.sort_order
    }

    pub fn own_permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    pub fn effective_permissions(&self) -> Vec<String> {
        self.effective.permission_set()
    }

    pub fn has_permission(&self, query: &str) -> bool {
        self.effective.has_permission(query)
    }

    /// Whether `node` is literally part of the effective set
    pub fn is_permission_set(&self, node: &str) -> bool {
        self.effective.contains_node(node)
    }

    pub fn update_permission_set<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.effective.update_permission_set(nodes);
    }

    pub fn matcher(&self) -> &PermissionMatcher {
        &self.effective
    }
}

impl Inherit for Group {
    fn name(&self) -> &str {
        &self.name
    }

    fn parents(&self) -> &BTreeSet<String> {
        &self.parents
    }

    fn own_permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }
}
