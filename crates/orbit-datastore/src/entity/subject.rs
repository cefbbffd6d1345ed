use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Group, DEFAULT_GROUP_NAME};
use crate::permissions::PermissionMatcher;

/// Persisted form of a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub id: Uuid,
    /// Last known display name, if the host has reported one
    pub name: Option<String>,
    pub group_name: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub permissions: BTreeSet<String>,
}

impl SubjectRecord {
    pub fn new(id: Uuid, group_name: impl Into<String>) -> Self {
        Self {
            id,
            name: None,
            group_name: group_name.into(),
            last_seen: None,
            permissions: BTreeSet::new(),
        }
    }
}

/// An identity holding its own nodes and, when resolvable, its group.
///
/// Subjects are answered from two sources: their own nodes and their group's
/// effective set. Neither takes precedence; a query matching either grants.
#[derive(Debug)]
pub struct Subject {
    id: Uuid,
    name: Option<String>,
    group_name: String,
    last_seen: Option<DateTime<Utc>>,
    group: Option<Arc<Group>>,
    own: PermissionMatcher,
    persisted: bool,
}

impl Subject {
    pub fn from_record(record: SubjectRecord, group: Option<Arc<Group>>) -> Self {
        Self {
            id: record.id,
            name: record.name,
            group_name: record.group_name,
            last_seen: record.last_seen,
            group,
            own: PermissionMatcher::without_decision_cache(record.permissions),
            persisted: true,
        }
    }

    /// Transient subject for an identity the store has never seen, assigned
    /// to `default_group` when one exists.
    pub fn placeholder(id: Uuid, default_group: Option<Arc<Group>>) -> Self {
        let group_name = default_group
            .as_ref()
            .map(|group| group.name().to_string())
            .unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string());

        Self {
            id,
            name: None,
            group_name,
            last_seen: None,
            group: default_group,
            own: PermissionMatcher::without_decision_cache(Vec::<String>::new()),
            persisted: false,
        }
    }

    pub fn to_record(&self) -> SubjectRecord {
        SubjectRecord {
            id: self.id,
            name: self.name.clone(),
            group_name: self.group_name.clone(),
            last_seen: self.last_seen,
            permissions: self.own_permissions(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Stamp the subject as seen now
    pub fn mark_seen(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn group(&self) -> Option<&Arc<Group>> {
        self.group.as_ref()
    }

    pub fn set_group(&mut self, group: Arc<Group>) {
        self.group_name = group.name().to_string();
        self.group = Some(group);
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    pub fn own_permissions(&self) -> BTreeSet<String> {
        self.own.permission_set().into_iter().collect()
    }

    /// Own nodes plus the group's effective set
    pub fn combined_permissions(&self) -> BTreeSet<String> {
        let mut combined = self.own_permissions();
        if let Some(group) = &self.group {
            combined.extend(group.effective_permissions());
        }
        combined
    }

    pub fn has_permission(&self, query: &str) -> bool {
        self.own.has_permission(query)
            || self
                .group
                .as_ref()
                .is_some_and(|group| group.has_permission(query))
    }

    pub fn update_permission_set<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.own.update_permission_set(nodes);
    }

    pub fn grant(&self, node: impl Into<String>) {
        let mut nodes = self.own.permission_set();
        nodes.push(node.into());
        self.own.update_permission_set(nodes);
    }

    pub fn revoke(&self, node: &str) {
        let nodes: Vec<String> = self
            .own
            .permission_set()
            .into_iter()
            .filter(|candidate| candidate != node)
            .collect();
        self.own.update_permission_set(nodes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::GroupRecord;

    fn resolved_group(name: &str, effective: &[&str]) -> Arc<Group> {
        let group = Group::from_record(GroupRecord::new(name));
        group.update_permission_set(effective.iter().copied());
        Arc::new(group)
    }

    #[test]
    fn test_union_of_own_and_group_nodes() {
        let group = resolved_group("default", &["chat.*"]);
        let record = SubjectRecord {
            id: Uuid::new_v4(),
            name: None,
            group_name: "default".into(),
            last_seen: None,
            permissions: BTreeSet::from(["build.place".to_string()]),
        };
        let subject = Subject::from_record(record, Some(group));

        assert!(subject.has_permission("chat.send"));
        assert!(subject.has_permission("build.place"));
        assert!(!subject.has_permission("build.break"));
        assert_eq!(subject.combined_permissions().len(), 2);
    }

    #[test]
    fn test_own_negation_does_not_override_group_grant() {
        let group = resolved_group("default", &["chat.*"]);
        let record = SubjectRecord {
            id: Uuid::new_v4(),
            name: None,
            group_name: "default".into(),
            last_seen: None,
            permissions: BTreeSet::from(["-chat.spam".to_string()]),
        };
        let subject = Subject::from_record(record, Some(group));

        assert!(subject.has_permission("chat.spam"));
        assert!(subject.has_permission("-chat.spam"));
    }

    #[test]
    fn test_subject_without_group() {
        let record = SubjectRecord::new(Uuid::new_v4(), "missing");
        let subject = Subject::from_record(record, None);

        assert!(subject.group().is_none());
        assert!(!subject.has_permission("chat.send"));
        assert!(subject.is_persisted());
    }

    #[test]
    fn test_placeholder_uses_default_group() {
        let group = resolved_group("guest", &["spawn.visit"]);
        let subject = Subject::placeholder(Uuid::new_v4(), Some(group));

        assert_eq!(subject.group_name(), "guest");
        assert!(subject.has_permission("spawn.visit"));
        assert!(!subject.is_persisted());
        assert!(subject.own_permissions().is_empty());
    }

    #[test]
    fn test_placeholder_without_default_group() {
        let subject = Subject::placeholder(Uuid::new_v4(), None);
        assert_eq!(subject.group_name(), DEFAULT_GROUP_NAME);
        assert!(subject.group().is_none());
    }

    #[test]
    fn test_grant_revoke_and_reassign() {
        let mut subject = Subject::placeholder(Uuid::new_v4(), None);
        subject.grant("fly");
        assert!(subject.has_permission("fly"));

        subject.revoke("fly");
        assert!(!subject.has_permission("fly"));

        subject.set_group(resolved_group("vip", &["fly"]));
        assert_eq!(subject.group_name(), "vip");
        assert!(subject.has_permission("fly"));
        assert_eq!(subject.to_record().group_name, "vip");
    }

    #[test]
    fn test_name_and_last_seen_carry_into_record() {
        let mut subject = Subject::placeholder(Uuid::new_v4(), None);
        assert!(subject.name().is_none());
        assert!(subject.last_seen().is_none());

        let before = Utc::now();
        subject.set_name("Steve");
        subject.mark_seen();

        let record = subject.to_record();
        assert_eq!(record.name.as_deref(), Some("Steve"));
        assert!(record.last_seen.is_some_and(|seen| seen >= before));

        let reloaded = Subject::from_record(record, None);
        assert_eq!(reloaded.name(), Some("Steve"));
        assert_eq!(reloaded.last_seen(), subject.last_seen());
    }
}
