//! Cache-aside access to groups and subjects
//!
//! [`Datastore`] keeps every group it has seen in a shared cache, resolved
//! against whatever else is cached at the time. Subjects are loaded on demand
//! and not cached.
//!
//! Each operation comes in two forms: a direct call that blocks and reports
//! failure as `false`/`None`/empty, and an `*_async` call that returns at once
//! and later hands a `Result` to a callback running on a task-queue worker.
//! Work that touches storage runs on the queue either way.

use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::DatastoreConfig;
use crate::entity::{Group, GroupRecord, Subject, SubjectRecord};
use crate::error::{DatastoreError, Result};
use crate::permissions::PermissionResolver;
use crate::queue::TaskQueue;
use crate::store::{PersistentStore, SqliteStore};

const QUEUE_NAME: &str = "orbit";

struct Shared {
    config: DatastoreConfig,
    store: Arc<dyn PersistentStore>,
    groups: DashMap<String, Arc<Group>>,
    default_group: RwLock<Option<Arc<Group>>>,
}

/// Handle to the group cache, the backing store and the task queue.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Datastore {
    shared: Arc<Shared>,
    queue: Arc<TaskQueue>,
}

impl Datastore {
    pub fn new(config: DatastoreConfig, store: Arc<dyn PersistentStore>) -> Result<Self> {
        config.validate()?;
        let queue = TaskQueue::new(QUEUE_NAME, config.worker_count())?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                groups: DashMap::new(),
                default_group: RwLock::new(None),
            }),
            queue: Arc::new(queue),
        })
    }

    /// Datastore over the SQLite database named in `config`.
    pub fn with_sqlite(config: DatastoreConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(&config));
        Self::new(config, store)
    }

    pub fn config(&self) -> &DatastoreConfig {
        &self.shared.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    fn run<T, F>(&self, operation: &'static str, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Shared) -> Result<T> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let result = self.queue.call(move || task(&shared));
        if let Err(error) = &result {
            warn!(operation, %error, "Datastore operation failed");
        }
        result
    }

    fn spawn<T, F, C>(&self, operation: &'static str, task: F, callback: C) -> Result<()>
    where
        T: Send + 'static,
        F: FnOnce(&Shared) -> Result<T> + Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.queue.submit(
            move || {
                let result = task(&shared);
                if let Err(error) = &result {
                    warn!(operation, %error, "Datastore operation failed");
                }
                result
            },
            callback,
        )
    }

    /// Open the store and create its schema.
    pub fn connect(&self) -> Result<()> {
        self.run("connect", |shared| shared.store.connect())
    }

    pub fn connect_async<C>(&self, callback: C) -> Result<()>
    where
        C: FnOnce(Result<()>) + Send + 'static,
    {
        self.spawn("connect", |shared| shared.store.connect(), callback)
    }

    /// Startup sequence: connect, load every group and make sure a default
    /// group exists, creating it from the configured template if needed.
    pub fn bootstrap(&self) -> Result<Arc<Group>> {
        self.run("bootstrap", |shared| {
            shared.store.connect()?;
            shared.fetch_and_cache_groups()?;
            shared.ensure_default_group()
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.store.is_connected()
    }

    /// Drain the queue, drop the cache and disconnect the store.
    pub fn close(&self) {
        self.queue.shutdown();
        self.clear_cache();

        if let Err(error) = self.shared.store.disconnect() {
            warn!(%error, "Failed to disconnect store");
        }
        info!("Datastore closed");
    }

    // --- groups ---------------------------------------------------------

    /// Reload the group cache from the store. Returns `false` if the store
    /// failed, in which case the cache is left empty.
    pub fn fetch_and_cache_groups(&self) -> bool {
        self.run("fetch_and_cache_groups", |shared| {
            shared.fetch_and_cache_groups()
        })
        .is_ok()
    }

    /// Like [`fetch_and_cache_groups`](Self::fetch_and_cache_groups); the
    /// callback receives the number of cached groups.
    pub fn fetch_and_cache_groups_async<C>(&self, callback: C) -> Result<()>
    where
        C: FnOnce(Result<usize>) + Send + 'static,
    {
        self.spawn(
            "fetch_and_cache_groups",
            |shared| shared.fetch_and_cache_groups(),
            callback,
        )
    }

    pub fn get_group(&self, name: &str) -> Option<Arc<Group>> {
        if let Some(group) = self.shared.cached(name) {
            return Some(group);
        }

        let name = name.to_string();
        self.run("get_group", move |shared| shared.load_group(&name))
            .ok()
            .flatten()
    }

    pub fn get_group_async<C>(&self, name: &str, callback: C) -> Result<()>
    where
        C: FnOnce(Result<Option<Arc<Group>>>) + Send + 'static,
    {
        let name = name.to_string();
        self.spawn("get_group", move |shared| shared.load_group(&name), callback)
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.get_group(name).is_some()
    }

    pub fn has_group_async<C>(&self, name: &str, callback: C) -> Result<()>
    where
        C: FnOnce(Result<bool>) + Send + 'static,
    {
        let name = name.to_string();
        self.spawn(
            "has_group",
            move |shared| Ok(shared.load_group(&name)?.is_some()),
            callback,
        )
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.shared.groups.contains_key(name)
    }

    /// Cached groups ordered by sort order, then name
    pub fn cached_groups(&self) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self
            .shared
            .groups
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        groups.sort_by(|a, b| {
            a.sort_order()
                .cmp(&b.sort_order())
                .then_with(|| a.name().cmp(b.name()))
        });
        groups
    }

    pub fn clear_cache(&self) {
        self.shared.groups.clear();
        *self.shared.default_slot_mut() = None;
        debug!("Group cache cleared");
    }

    pub fn default_group(&self) -> Option<Arc<Group>> {
        self.shared.default_group()
    }

    pub fn has_default_group(&self) -> bool {
        self.default_group().is_some()
    }

    /// Return the default group, creating and caching it first if the store
    /// has none.
    pub fn ensure_default_group(&self) -> Option<Arc<Group>> {
        self.run("ensure_default_group", |shared| {
            shared.ensure_default_group()
        })
        .ok()
    }

    pub fn ensure_default_group_async<C>(&self, callback: C) -> Result<()>
    where
        C: FnOnce(Result<Arc<Group>>) + Send + 'static,
    {
        self.spawn(
            "ensure_default_group",
            |shared| shared.ensure_default_group(),
            callback,
        )
    }

    /// Names of `name` and its reachable ancestors among cached groups
    pub fn ancestry(&self, name: &str) -> Vec<String> {
        self.get_group(name)
            .map(|group| self.resolver().ancestry(&group))
            .unwrap_or_default()
    }

    /// Parent names in the ancestry of `name` that no cached group answers to
    pub fn unresolved_parents(&self, name: &str) -> Vec<String> {
        self.get_group(name)
            .map(|group| self.resolver().unresolved_parents(&group))
            .unwrap_or_default()
    }

    /// Resolver over the current cache contents
    pub fn resolver(&self) -> PermissionResolver<impl Fn(&str) -> Option<Arc<Group>> + '_> {
        PermissionResolver::new(move |name: &str| self.shared.cached(name))
    }

    /// Write a new group. The cache is untouched; refresh to see it resolved
    /// into other groups.
    pub fn insert_group(&self, group: &GroupRecord) -> bool {
        let group = group.clone();
        self.run("insert_group", move |shared| shared.store.insert_group(&group))
            .unwrap_or(false)
    }

    pub fn insert_group_async<C>(&self, group: GroupRecord, callback: C) -> Result<()>
    where
        C: FnOnce(Result<bool>) + Send + 'static,
    {
        self.spawn(
            "insert_group",
            move |shared| shared.store.insert_group(&group),
            callback,
        )
    }

    /// Persist changes to an existing group. The cache is untouched.
    pub fn update_group(&self, group: &GroupRecord) -> bool {
        let group = group.clone();
        self.run("update_group", move |shared| shared.store.update_group(&group))
            .unwrap_or(false)
    }

    pub fn update_group_async<C>(&self, group: GroupRecord, callback: C) -> Result<()>
    where
        C: FnOnce(Result<bool>) + Send + 'static,
    {
        self.spawn(
            "update_group",
            move |shared| shared.store.update_group(&group),
            callback,
        )
    }

    /// Delete a group from the store and evict it from the cache.
    pub fn delete_group(&self, name: &str) -> bool {
        let name = name.to_string();
        self.run("delete_group", move |shared| shared.delete_group(&name))
            .unwrap_or(false)
    }

    pub fn delete_group_async<C>(&self, name: &str, callback: C) -> Result<()>
    where
        C: FnOnce(Result<bool>) + Send + 'static,
    {
        let name = name.to_string();
        self.spawn(
            "delete_group",
            move |shared| shared.delete_group(&name),
            callback,
        )
    }

    // --- subjects -------------------------------------------------------

    pub fn get_subject(&self, id: Uuid) -> Option<Subject> {
        self.run("get_subject", move |shared| shared.load_subject(id))
            .ok()
            .flatten()
    }

    pub fn get_subject_async<C>(&self, id: Uuid, callback: C) -> Result<()>
    where
        C: FnOnce(Result<Option<Subject>>) + Send + 'static,
    {
        self.spawn("get_subject", move |shared| shared.load_subject(id), callback)
    }

    pub fn has_subject(&self, id: Uuid) -> bool {
        self.run("has_subject", move |shared| {
            Ok(shared.store.load_subject(id)?.is_some())
        })
        .unwrap_or(false)
    }

    pub fn get_subjects_by_group(&self, group_name: &str) -> Vec<Subject> {
        let group_name = group_name.to_string();
        self.run("get_subjects_by_group", move |shared| {
            shared.load_subjects_by_group(&group_name)
        })
        .unwrap_or_default()
    }

    pub fn get_subjects_by_group_async<C>(&self, group_name: &str, callback: C) -> Result<()>
    where
        C: FnOnce(Result<Vec<Subject>>) + Send + 'static,
    {
        let group_name = group_name.to_string();
        self.spawn(
            "get_subjects_by_group",
            move |shared| shared.load_subjects_by_group(&group_name),
            callback,
        )
    }

    /// The stored subject, or a transient one on the default group for an
    /// identity seen for the first time.
    pub fn subject_or_placeholder(&self, id: Uuid) -> Subject {
        self.run("subject_or_placeholder", move |shared| {
            shared.subject_or_placeholder(id)
        })
        .unwrap_or_else(|_| Subject::placeholder(id, self.default_group()))
    }

    pub fn subject_or_placeholder_async<C>(&self, id: Uuid, callback: C) -> Result<()>
    where
        C: FnOnce(Result<Subject>) + Send + 'static,
    {
        self.spawn(
            "subject_or_placeholder",
            move |shared| shared.subject_or_placeholder(id),
            callback,
        )
    }

    pub fn insert_subject(&self, subject: &Subject) -> bool {
        let record = subject.to_record();
        self.run("insert_subject", move |shared| {
            shared.store.insert_subject(&record)
        })
        .unwrap_or(false)
    }

    pub fn insert_subject_async<C>(&self, subject: SubjectRecord, callback: C) -> Result<()>
    where
        C: FnOnce(Result<bool>) + Send + 'static,
    {
        self.spawn(
            "insert_subject",
            move |shared| shared.store.insert_subject(&subject),
            callback,
        )
    }

    pub fn update_subject(&self, subject: &Subject) -> bool {
        let record = subject.to_record();
        self.run("update_subject", move |shared| {
            shared.store.update_subject(&record)
        })
        .unwrap_or(false)
    }

    pub fn update_subject_async<C>(&self, subject: SubjectRecord, callback: C) -> Result<()>
    where
        C: FnOnce(Result<bool>) + Send + 'static,
    {
        self.spawn(
            "update_subject",
            move |shared| shared.store.update_subject(&subject),
            callback,
        )
    }

    pub fn delete_subject(&self, id: Uuid) -> bool {
        self.run("delete_subject", move |shared| shared.store.delete_subject(id))
            .unwrap_or(false)
    }

    pub fn delete_subject_async<C>(&self, id: Uuid, callback: C) -> Result<()>
    where
        C: FnOnce(Result<bool>) + Send + 'static,
    {
        self.spawn(
            "delete_subject",
            move |shared| shared.store.delete_subject(id),
            callback,
        )
    }

    /// Insert a transient subject or update a stored one.
    pub fn save_subject(&self, subject: &mut Subject) -> bool {
        let saved = if subject.is_persisted() {
            self.update_subject(subject)
        } else {
            self.insert_subject(subject)
        };

        if saved {
            subject.mark_persisted();
        }
        saved
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("cached_groups", &self.shared.groups.len())
            .field(
                "default_group",
                &self.default_group().map(|group| group.name().to_string()),
            )
            .field("queue", &self.queue)
            .finish()
    }
}

impl Shared {
    fn cached(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn default_group(&self) -> Option<Arc<Group>> {
        self.default_group
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn default_slot_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Group>>> {
        self.default_group
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace `group`'s effective set with one resolved against the cache.
    fn resolve(&self, group: &Group) {
        let effective =
            PermissionResolver::new(|name: &str| self.cached(name)).effective_permissions(group);
        group.update_permission_set(effective);
    }

    #[instrument(skip(self))]
    fn fetch_and_cache_groups(&self) -> Result<usize> {
        self.groups.clear();
        *self.default_slot_mut() = None;

        let records = self.store.load_all_groups()?;
        let mut default: Option<Arc<Group>> = None;

        // every group must be cached before any is resolved, so parents are
        // found regardless of load order
        for record in records {
            let name = record.name.clone();
            let retained = Arc::clone(
                self.groups
                    .entry(name)
                    .or_insert_with(|| Arc::new(Group::from_record(record)))
                    .value(),
            );

            if !retained.is_default() {
                continue;
            }
            if let Some(first) = default.as_ref() {
                warn!(
                    kept = first.name(),
                    ignored = retained.name(),
                    "More than one default group, keeping the first"
                );
                continue;
            }
            default = Some(retained);
        }

        let snapshot: Vec<Arc<Group>> = self
            .groups
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for group in &snapshot {
            self.resolve(group);
        }

        info!(
            groups = snapshot.len(),
            default = default.as_ref().map(|group| group.name()).unwrap_or("<none>"),
            "Fetched and cached groups"
        );
        *self.default_slot_mut() = default;

        Ok(snapshot.len())
    }

    #[instrument(skip(self))]
    fn load_group(&self, name: &str) -> Result<Option<Arc<Group>>> {
        if let Some(group) = self.cached(name) {
            return Ok(Some(group));
        }

        let Some(record) = self.store.load_group(name)? else {
            debug!(group = name, "Group not found in store");
            return Ok(None);
        };

        let group = Group::from_record(record);
        self.resolve(&group);

        // concurrent loads of the same name race here; the first insert wins
        // and every caller gets the retained instance
        let retained = Arc::clone(
            self.groups
                .entry(group.name().to_string())
                .or_insert_with(|| Arc::new(group))
                .value(),
        );

        if retained.is_default() {
            let mut slot = self.default_slot_mut();
            if slot.is_none() {
                *slot = Some(Arc::clone(&retained));
            }
        }

        debug!(group = retained.name(), "Cached group");
        Ok(Some(retained))
    }

    fn ensure_default_group(&self) -> Result<Arc<Group>> {
        if let Some(group) = self.default_group() {
            return Ok(group);
        }

        // the slot is only as fresh as the last fetch; ask the store first
        self.fetch_and_cache_groups()?;
        if let Some(group) = self.default_group() {
            return Ok(group);
        }

        let record = GroupRecord::bootstrap_default(&self.config.default_group);
        info!(group = %record.name, "No default group found, creating one");
        self.store.insert_group(&record)?;
        self.fetch_and_cache_groups()?;

        self.default_group().ok_or_else(|| {
            DatastoreError::QueryFailed(format!(
                "default group {} missing after creation",
                record.name
            ))
        })
    }

    fn delete_group(&self, name: &str) -> Result<bool> {
        let deleted = self.store.delete_group(name)?;

        self.groups.remove(name);
        let mut slot = self.default_slot_mut();
        if slot.as_ref().is_some_and(|group| group.name() == name) {
            *slot = None;
        }

        Ok(deleted)
    }

    fn load_subject(&self, id: Uuid) -> Result<Option<Subject>> {
        let Some(record) = self.store.load_subject(id)? else {
            return Ok(None);
        };

        let group = self.load_group(&record.group_name)?;
        if group.is_none() {
            debug!(subject = %id, group = %record.group_name, "Subject's group does not exist");
        }

        Ok(Some(Subject::from_record(record, group)))
    }

    fn load_subjects_by_group(&self, group_name: &str) -> Result<Vec<Subject>> {
        let records = self.store.load_subjects_by_group(group_name)?;
        let group = self.load_group(group_name)?;

        Ok(records
            .into_iter()
            .map(|record| Subject::from_record(record, group.clone()))
            .collect())
    }

    fn subject_or_placeholder(&self, id: Uuid) -> Result<Subject> {
        match self.load_subject(id)? {
            Some(subject) => Ok(subject),
            None => {
                debug!(subject = %id, "Unknown subject, using a placeholder");
                Ok(Subject::placeholder(id, self.default_group()))
            }
        }
    }
}
