//! Host-facing capability checks
//!
//! Hosts ask "may this identity do X" through [`Permissible`] without knowing
//! about groups. Unlike the raw matcher, the answers here apply negation: a
//! query is refused when the combined set grants `-<query>`, whatever else
//! grants it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::Subject;
use crate::permissions::{is_negated, negation_of};

/// One node of an identity's combined set and whether it grants or revokes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionAttachment {
    pub permission: String,
    pub value: bool,
}

pub trait Permissible {
    fn has_permission(&self, permission: &str) -> bool;

    /// Whether `permission` appears literally in the combined set
    fn is_permission_set(&self, permission: &str) -> bool;

    fn effective_permissions(&self) -> Vec<PermissionAttachment>;
}

impl Permissible for Subject {
    fn has_permission(&self, permission: &str) -> bool {
        if is_negated(permission) {
            return Subject::has_permission(self, permission);
        }

        !Subject::has_permission(self, &negation_of(permission))
            && Subject::has_permission(self, permission)
    }

    fn is_permission_set(&self, permission: &str) -> bool {
        self.combined_permissions().contains(permission)
    }

    fn effective_permissions(&self) -> Vec<PermissionAttachment> {
        self.combined_permissions()
            .into_iter()
            .map(|node| PermissionAttachment {
                value: !is_negated(&node),
                permission: node,
            })
            .collect()
    }
}

impl<T: Permissible + ?Sized> Permissible for Arc<T> {
    fn has_permission(&self, permission: &str) -> bool {
        (**self).has_permission(permission)
    }

    fn is_permission_set(&self, permission: &str) -> bool {
        (**self).is_permission_set(permission)
    }

    fn effective_permissions(&self) -> Vec<PermissionAttachment> {
        (**self).effective_permissions()
    }
}

/// An identity that could not be resolved holds nothing.
impl<T: Permissible> Permissible for Option<T> {
    fn has_permission(&self, permission: &str) -> bool {
        self.as_ref()
            .is_some_and(|inner| inner.has_permission(permission))
    }

    fn is_permission_set(&self, permission: &str) -> bool {
        self.as_ref()
            .is_some_and(|inner| inner.is_permission_set(permission))
    }

    fn effective_permissions(&self) -> Vec<PermissionAttachment> {
        self.as_ref()
            .map(|inner| inner.effective_permissions())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use uuid::Uuid;

    use super::*;
    use crate::entity::{Group, GroupRecord, SubjectRecord};

    fn subject(own: &[&str], group: &[&str]) -> Subject {
        let resolved = Group::from_record(GroupRecord::new("default"));
        resolved.update_permission_set(group.iter().copied());

        let record = SubjectRecord {
            id: Uuid::new_v4(),
            name: None,
            group_name: "default".into(),
            last_seen: None,
            permissions: own.iter().map(|node| node.to_string()).collect::<BTreeSet<_>>(),
        };
        Subject::from_record(record, Some(Arc::new(resolved)))
    }

    #[test]
    fn test_negation_revokes_group_grant() {
        let subject = subject(&["-chat.spam"], &["chat.*"]);

        assert!(Permissible::has_permission(&subject, "chat.send"));
        assert!(!Permissible::has_permission(&subject, "chat.spam"));
        assert!(Permissible::has_permission(&subject, "-chat.spam"));
    }

    #[test]
    fn test_wildcard_negation() {
        let subject = subject(&["build.*"], &["-build.nether.*"]);

        assert!(Permissible::has_permission(&subject, "build.place"));
        assert!(!Permissible::has_permission(&subject, "build.nether.place"));
    }

    #[test]
    fn test_is_permission_set_is_literal() {
        let subject = subject(&["fly"], &["chat.*"]);

        assert!(subject.is_permission_set("fly"));
        assert!(subject.is_permission_set("chat.*"));
        assert!(!subject.is_permission_set("chat.send"));
    }

    #[test]
    fn test_effective_permissions_carry_values() {
        let subject = subject(&["-chat.spam"], &["chat.*"]);

        assert_eq!(
            subject.effective_permissions(),
            vec![
                PermissionAttachment {
                    permission: "-chat.spam".into(),
                    value: false,
                },
                PermissionAttachment {
                    permission: "chat.*".into(),
                    value: true,
                },
            ]
        );
    }

    #[test]
    fn test_missing_subject_holds_nothing() {
        let missing: Option<Subject> = None;
        assert!(!missing.has_permission("chat.send"));
        assert!(!missing.is_permission_set("chat.send"));
        assert!(missing.effective_permissions().is_empty());
    }
}
