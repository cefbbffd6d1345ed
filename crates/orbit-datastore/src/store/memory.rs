use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::PersistentStore;
use crate::entity::{GroupRecord, SubjectRecord};
use crate::error::{DatastoreError, Result};

/// In-process store for embedding and tests.
///
/// Besides holding records it can simulate an unreachable backend
/// ([`set_failing`](Self::set_failing)) and a slow one
/// ([`set_load_delay`](Self::set_load_delay)), and it counts group loads.
#[derive(Debug, Default)]
pub struct MemoryStore {
    connected: AtomicBool,
    failing: AtomicBool,
    load_delay_ms: AtomicU64,
    group_loads: AtomicUsize,
    groups: DashMap<String, GroupRecord>,
    subjects: DashMap<Uuid, SubjectRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: impl IntoIterator<Item = GroupRecord>) -> Self {
        let store = Self::new();
        for group in groups {
            store.groups.insert(group.name.clone(), group);
        }
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.load_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Single-group and bulk group loads served so far
    pub fn group_loads(&self) -> usize {
        self.group_loads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DatastoreError::QueryFailed(
                "simulated storage failure".to_string(),
            ));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DatastoreError::NotConnected);
        }
        Ok(())
    }

    /// Sort orders are unique across groups, like the SQLite column.
    fn check_sort_order(&self, group: &GroupRecord) -> Result<()> {
        let clash = self.groups.iter().any(|entry| {
            entry.value().sort_order == group.sort_order && entry.key() != &group.name
        });
        if clash {
            return Err(DatastoreError::QueryFailed(format!(
                "sort order {} is already taken",
                group.sort_order
            )));
        }
        Ok(())
    }

    fn record_group_load(&self) {
        self.group_loads.fetch_add(1, Ordering::SeqCst);
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
    }
}

impl PersistentStore for MemoryStore {
    fn connect(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DatastoreError::ConnectionFailed {
                path: ":memory:".into(),
                reason: "simulated storage failure".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn load_all_groups(&self) -> Result<Vec<GroupRecord>> {
        self.check()?;
        self.record_group_load();

        let mut groups: Vec<GroupRecord> = self
            .groups
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        groups.sort_by(|a, b| {
            a.sort_order
                .cmp(&b.sort_order)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(groups)
    }

    fn load_group(&self, name: &str) -> Result<Option<GroupRecord>> {
        self.check()?;
        self.record_group_load();
        Ok(self.groups.get(name).map(|entry| entry.value().clone()))
    }

    fn insert_group(&self, group: &GroupRecord) -> Result<bool> {
        self.check()?;
        self.check_sort_order(group)?;

        match self.groups.entry(group.name.clone()) {
            Entry::Occupied(_) => Err(DatastoreError::QueryFailed(format!(
                "group {} already exists",
                group.name
            ))),
            Entry::Vacant(slot) => {
                slot.insert(group.clone());
                Ok(true)
            }
        }
    }

    fn update_group(&self, group: &GroupRecord) -> Result<bool> {
        self.check()?;
        if !self.groups.contains_key(&group.name) {
            return Ok(false);
        }
        self.check_sort_order(group)?;

        match self.groups.get_mut(&group.name) {
            Some(mut entry) => {
                *entry = group.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_group(&self, name: &str) -> Result<bool> {
        self.check()?;
        Ok(self.groups.remove(name).is_some())
    }

    fn load_subject(&self, id: Uuid) -> Result<Option<SubjectRecord>> {
        self.check()?;
        Ok(self.subjects.get(&id).map(|entry| entry.value().clone()))
    }

    fn load_subjects_by_group(&self, group_name: &str) -> Result<Vec<SubjectRecord>> {
        self.check()?;
        let mut subjects: Vec<SubjectRecord> = self
            .subjects
            .iter()
            .filter(|entry| entry.value().group_name == group_name)
            .map(|entry| entry.value().clone())
            .collect();
        subjects.sort_by_key(|subject| subject.id);
        Ok(subjects)
    }

    fn insert_subject(&self, subject: &SubjectRecord) -> Result<bool> {
        self.check()?;
        match self.subjects.entry(subject.id) {
            Entry::Occupied(_) => Err(DatastoreError::QueryFailed(format!(
                "subject {} already exists",
                subject.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(subject.clone());
                Ok(true)
            }
        }
    }

    fn update_subject(&self, subject: &SubjectRecord) -> Result<bool> {
        self.check()?;
        match self.subjects.get_mut(&subject.id) {
            Some(mut entry) => {
                *entry = subject.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_subject(&self, id: Uuid) -> Result<bool> {
        self.check()?;
        Ok(self.subjects.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_connection() {
        let store = MemoryStore::new();
        assert!(matches!(store.load_all_groups(), Err(DatastoreError::NotConnected)));

        store.connect().unwrap();
        assert!(store.load_all_groups().unwrap().is_empty());
    }

    #[test]
    fn test_failure_injection() {
        let store = MemoryStore::with_groups([GroupRecord::new("default")]);
        store.connect().unwrap();
        store.set_failing(true);

        assert!(store.load_group("default").is_err());
        assert!(store.insert_group(&GroupRecord::new("x").with_sort_order(5)).is_err());

        store.set_failing(false);
        assert!(store.load_group("default").unwrap().is_some());
    }

    #[test]
    fn test_counts_group_loads() {
        let store = MemoryStore::with_groups([GroupRecord::new("default")]);
        store.connect().unwrap();

        store.load_group("default").unwrap();
        store.load_group("missing").unwrap();
        store.load_all_groups().unwrap();
        assert_eq!(store.group_loads(), 3);
    }

    #[test]
    fn test_duplicate_inserts_are_rejected() {
        let store = MemoryStore::new();
        store.connect().unwrap();

        store.insert_group(&GroupRecord::new("a").with_sort_order(1)).unwrap();
        assert!(store.insert_group(&GroupRecord::new("a").with_sort_order(2)).is_err());
        assert!(store.insert_group(&GroupRecord::new("b").with_sort_order(1)).is_err());

        let subject = SubjectRecord::new(Uuid::new_v4(), "a");
        assert!(store.insert_subject(&subject).unwrap());
        assert!(store.insert_subject(&subject).is_err());
    }

    #[test]
    fn test_update_keeps_sort_orders_unique() {
        let store = MemoryStore::with_groups([
            GroupRecord::new("a").with_sort_order(1),
            GroupRecord::new("b").with_sort_order(2),
        ]);
        store.connect().unwrap();

        let moved = GroupRecord::new("b").with_sort_order(1);
        assert!(store.update_group(&moved).is_err());
        assert_eq!(store.load_group("b").unwrap().unwrap().sort_order, 2);

        let same_slot = GroupRecord::new("b").with_sort_order(2).with_permission("x");
        assert!(store.update_group(&same_slot).unwrap());
        assert!(!store.update_group(&GroupRecord::new("c").with_sort_order(1)).unwrap());
    }
}
