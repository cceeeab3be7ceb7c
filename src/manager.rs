//! Bookkeeping for every collection known to a dump or restore pass.
//!
//! The manager lives in two phases. While **collecting**, intents are
//! inserted or merged by destination namespace and discovery order is
//! preserved; special collections (oplog, users, roles, auth version,
//! `system.indexes`) are routed into dedicated slots instead of the general
//! map. [`IntentManager::finalize`] is a one-way transition into the
//! **scheduling** phase: the chosen prioritizer takes ownership of every
//! remaining normal intent and the collecting structures are discarded, so
//! no further inserts are possible.
//!
//! Naming conflicts are collected, not raised mid-scan: the manager records
//! every source namespace mapped to each destination and reports all
//! offenders at once after scanning completes.

use crate::error::{DuffelError, Result};
use crate::intent::{split_namespace, Intent};
use crate::prioritizer::{
    IntentPrioritizer, LegacyPrioritizer, LongestTaskFirstPrioritizer,
    MultiDatabaseLtfPrioritizer, PriorityType,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Smart oplog pick ranks candidates: a top-level oplog (empty database)
/// beats a `local` database oplog, which beats anything else.
fn oplog_priority(intent: &Intent) -> u8 {
    if intent.db.is_empty() {
        0
    } else if intent.db == "local" {
        1
    } else {
        2
    }
}

enum Phase {
    Collecting {
        by_ns: HashMap<String, Intent>,
        order: Vec<String>,
    },
    Scheduling(Box<dyn IntentPrioritizer>),
}

struct Inner {
    phase: Phase,
    smart_pick_oplog: bool,
    oplog: Option<Intent>,
    oplog_priority: Option<u8>,
    oplog_conflict: bool,
    users: Option<Intent>,
    roles: Option<Intent>,
    auth_version: Option<Intent>,
    system_indexes: HashMap<String, Intent>,
    destinations: HashMap<String, Vec<String>>,
    destination_order: Vec<String>,
}

impl Inner {
    fn put_intent(&mut self, intent: Intent) -> Result<()> {
        if matches!(self.phase, Phase::Scheduling(_)) {
            return Err(DuffelError::ManagerFinalized);
        }
        if intent.is_oplog() {
            return self.put_oplog(intent);
        }
        if intent.is_users() {
            merge_slot(&mut self.users, intent);
            return Ok(());
        }
        if intent.is_roles() {
            merge_slot(&mut self.roles, intent);
            return Ok(());
        }
        if intent.is_auth_version() {
            merge_slot(&mut self.auth_version, intent);
            return Ok(());
        }
        let Phase::Collecting { by_ns, order } = &mut self.phase else {
            return Err(DuffelError::ManagerFinalized);
        };
        if intent.is_system_indexes() {
            match self.system_indexes.get_mut(&intent.db) {
                Some(existing) => existing.merge(intent),
                None => {
                    self.system_indexes.insert(intent.db.clone(), intent);
                }
            }
            return Ok(());
        }
        let ns = intent.namespace();
        match by_ns.get_mut(&ns) {
            Some(existing) => {
                tracing::debug!("merging intent for namespace {}", ns);
                existing.merge(intent);
            }
            None => {
                order.push(ns.clone());
                by_ns.insert(ns, intent);
            }
        }
        Ok(())
    }

    fn put_oplog(&mut self, intent: Intent) -> Result<()> {
        if matches!(self.phase, Phase::Scheduling(_)) {
            return Err(DuffelError::ManagerFinalized);
        }
        if !self.smart_pick_oplog {
            self.oplog = Some(intent);
            self.oplog_priority = None;
            return Ok(());
        }
        let priority = oplog_priority(&intent);
        match self.oplog_priority {
            None => {
                self.oplog = Some(intent);
                self.oplog_priority = Some(priority);
            }
            Some(current) if priority < current => {
                self.oplog = Some(intent);
                self.oplog_priority = Some(priority);
                self.oplog_conflict = false;
            }
            Some(current) if priority == current => {
                tracing::warn!(
                    "second oplog candidate {} at equal priority; flagging conflict",
                    intent.namespace()
                );
                self.oplog_conflict = true;
            }
            Some(_) => {}
        }
        Ok(())
    }
}

fn merge_slot(slot: &mut Option<Intent>, intent: Intent) {
    match slot {
        Some(existing) => existing.merge(intent),
        None => *slot = Some(intent),
    }
}

/// Owner of every [`Intent`] in one dump or restore invocation.
///
/// Internally synchronized: worker threads share it through an `Arc` and
/// call [`pop`](Self::pop)/[`finish`](Self::finish) concurrently.
pub struct IntentManager {
    inner: Mutex<Inner>,
}

impl IntentManager {
    pub fn new() -> Self {
        IntentManager {
            inner: Mutex::new(Inner {
                phase: Phase::Collecting {
                    by_ns: HashMap::new(),
                    order: Vec::new(),
                },
                smart_pick_oplog: false,
                oplog: None,
                oplog_priority: None,
                oplog_conflict: false,
                users: None,
                roles: None,
                auth_version: None,
                system_indexes: HashMap::new(),
                destinations: HashMap::new(),
                destination_order: Vec::new(),
            }),
        }
    }

    /// Enable smart oplog picking for dump sets that may contain more than
    /// one oplog-like source (e.g. per-shard oplogs).
    pub fn set_smart_pick_oplog(&self, smart: bool) {
        self.inner.lock().smart_pick_oplog = smart;
    }

    /// Insert-or-merge an intent under its own namespace.
    pub fn put(&self, intent: Intent) -> Result<()> {
        let ns = intent.namespace();
        self.put_with_namespace(&ns, intent)
    }

    /// Insert-or-merge an intent under an explicit destination namespace
    /// (rename on restore). The source→destination mapping is recorded for
    /// conflict reporting.
    pub fn put_with_namespace(&self, destination: &str, mut intent: Intent) -> Result<()> {
        let (db, coll) = split_namespace(destination)?;
        let source = intent.namespace();
        intent.db = db;
        intent.coll = coll;

        let mut inner = self.inner.lock();
        inner.put_intent(intent)?;
        if !inner.destinations.contains_key(destination) {
            inner.destination_order.push(destination.to_string());
        }
        let sources = inner
            .destinations
            .entry(destination.to_string())
            .or_default();
        if !sources.contains(&source) {
            sources.push(source);
        }
        Ok(())
    }

    /// Offer an oplog candidate directly, bypassing destination bookkeeping.
    pub fn put_oplog_intent(&self, intent: Intent) -> Result<()> {
        self.inner.lock().put_oplog(intent)
    }

    /// One-way transition from collecting to scheduling: constructs the
    /// chosen prioritizer over the discovery-order list and discards the
    /// collecting structures.
    pub fn finalize(&self, policy: PriorityType) -> Result<()> {
        let mut inner = self.inner.lock();
        let Phase::Collecting { by_ns, order } = &mut inner.phase else {
            return Err(DuffelError::ManagerFinalized);
        };
        let mut by_ns = std::mem::take(by_ns);
        let order = std::mem::take(order);
        let mut intents = Vec::with_capacity(order.len());
        for ns in order {
            if let Some(intent) = by_ns.remove(&ns) {
                intents.push(intent);
            }
        }
        tracing::info!(
            "finalizing intent manager: {} intents under {:?} scheduling",
            intents.len(),
            policy
        );
        let prioritizer: Box<dyn IntentPrioritizer> = match policy {
            PriorityType::Legacy => Box::new(LegacyPrioritizer::new(intents)),
            PriorityType::LongestTaskFirst => Box::new(LongestTaskFirstPrioritizer::new(intents)),
            PriorityType::MultiDatabaseLTF => Box::new(MultiDatabaseLtfPrioritizer::new(intents)),
        };
        inner.phase = Phase::Scheduling(prioritizer);
        Ok(())
    }

    /// Retrieve the next intent per the finalized policy; `None` when
    /// exhausted (or before `finalize`). Never blocks.
    pub fn pop(&self) -> Option<Intent> {
        match &mut self.inner.lock().phase {
            Phase::Scheduling(prioritizer) => prioritizer.get(),
            Phase::Collecting { .. } => None,
        }
    }

    /// Report a retrieved intent as done so the policy can rebalance.
    pub fn finish(&self, intent: &Intent) {
        if let Phase::Scheduling(prioritizer) = &mut self.inner.lock().phase {
            prioritizer.finish(intent);
        }
    }

    /// Non-destructive copy of the earliest-discovered intent, for
    /// validation passes that run before scheduling starts.
    pub fn peek(&self) -> Option<Intent> {
        match &self.inner.lock().phase {
            Phase::Collecting { by_ns, order } => {
                order.first().and_then(|ns| by_ns.get(ns)).cloned()
            }
            Phase::Scheduling(_) => None,
        }
    }

    pub fn oplog(&self) -> Option<Intent> {
        self.inner.lock().oplog.clone()
    }

    pub fn users(&self) -> Option<Intent> {
        self.inner.lock().users.clone()
    }

    pub fn roles(&self) -> Option<Intent> {
        self.inner.lock().roles.clone()
    }

    pub fn auth_version(&self) -> Option<Intent> {
        self.inner.lock().auth_version.clone()
    }

    pub fn system_indexes(&self, db: &str) -> Option<Intent> {
        self.inner.lock().system_indexes.get(db).cloned()
    }

    /// Whether any collected intent targets the `config` database (sharded
    /// cluster metadata needs special treatment).
    pub fn has_config_db_intent(&self) -> bool {
        match &self.inner.lock().phase {
            Phase::Collecting { by_ns, .. } => by_ns.values().any(|intent| intent.db == "config"),
            Phase::Scheduling(_) => false,
        }
    }

    /// True when a second equally ranked oplog candidate was seen under
    /// smart picking.
    pub fn oplog_conflict(&self) -> bool {
        self.inner.lock().oplog_conflict
    }

    /// All destination conflicts found while scanning: one error per
    /// surviving source of every destination with more than one distinct
    /// source, in discovery order.
    pub fn destination_conflicts(&self) -> Vec<DuffelError> {
        let inner = self.inner.lock();
        let mut conflicts = Vec::new();
        for destination in &inner.destination_order {
            if let Some(sources) = inner.destinations.get(destination) {
                if sources.len() > 1 {
                    for source in sources {
                        conflicts.push(DuffelError::DestinationConflict {
                            destination: destination.clone(),
                            source_namespace: source.clone(),
                        });
                    }
                }
            }
        }
        conflicts
    }

    /// Clones of everything currently known: normal intents in discovery
    /// order, then the special slots. Used to build an archive prelude
    /// before scheduling starts.
    pub fn intents(&self) -> Vec<Intent> {
        let inner = self.inner.lock();
        let mut all = Vec::new();
        if let Phase::Collecting { by_ns, order } = &inner.phase {
            for ns in order {
                if let Some(intent) = by_ns.get(ns) {
                    all.push(intent.clone());
                }
            }
        }
        all.extend(inner.oplog.clone());
        all.extend(inner.users.clone());
        all.extend(inner.roles.clone());
        all.extend(inner.auth_version.clone());
        let mut dbs: Vec<&String> = inner.system_indexes.keys().collect();
        dbs.sort();
        for db in dbs {
            if let Some(intent) = inner.system_indexes.get(db) {
                all.push(intent.clone());
            }
        }
        all
    }
}

impl Default for IntentManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::SourceHandle;
    use std::path::PathBuf;

    fn intent(db: &str, coll: &str, size: u64) -> Intent {
        let mut intent = Intent::new(db, coll);
        intent.size = size;
        intent
    }

    #[test]
    fn test_put_merges_by_namespace() {
        let manager = IntentManager::new();
        let mut data_half = intent("app", "orders", 64);
        data_half.data_source = Some(SourceHandle::File(PathBuf::from("orders.doc")));
        let mut meta_half = intent("app", "orders", 0);
        meta_half.metadata_source = Some(SourceHandle::File(PathBuf::from("orders.meta")));

        manager.put(data_half).unwrap();
        manager.put(meta_half).unwrap();

        let merged = manager.peek().unwrap();
        assert_eq!(merged.size, 64);
        assert!(merged.data_source.is_some());
        assert!(merged.metadata_source.is_some());
        // Still exactly one intent.
        manager.finalize(PriorityType::Legacy).unwrap();
        assert!(manager.pop().is_some());
        assert!(manager.pop().is_none());
    }

    #[test]
    fn test_finalize_is_one_way() {
        let manager = IntentManager::new();
        manager.put(intent("app", "orders", 1)).unwrap();
        manager.finalize(PriorityType::Legacy).unwrap();
        assert!(matches!(
            manager.put(intent("app", "more", 1)),
            Err(DuffelError::ManagerFinalized)
        ));
        assert!(matches!(
            manager.finalize(PriorityType::Legacy),
            Err(DuffelError::ManagerFinalized)
        ));
        assert!(manager.peek().is_none());
    }

    #[test]
    fn test_pop_before_finalize_is_none() {
        let manager = IntentManager::new();
        manager.put(intent("app", "orders", 1)).unwrap();
        assert!(manager.pop().is_none());
    }

    #[test]
    fn test_special_collections_routed_to_slots() {
        let manager = IntentManager::new();
        manager.put(intent("admin", "system.users", 1)).unwrap();
        manager.put(intent("admin", "system.roles", 2)).unwrap();
        manager.put(intent("admin", "system.version", 3)).unwrap();
        manager.put(intent("app", "system.indexes", 4)).unwrap();
        manager.put(intent("other", "system.indexes", 5)).unwrap();
        manager.put(intent("app", "orders", 6)).unwrap();

        assert_eq!(manager.users().unwrap().size, 1);
        assert_eq!(manager.roles().unwrap().size, 2);
        assert_eq!(manager.auth_version().unwrap().size, 3);
        assert_eq!(manager.system_indexes("app").unwrap().size, 4);
        assert_eq!(manager.system_indexes("other").unwrap().size, 5);
        assert!(manager.system_indexes("missing").is_none());

        // Only the normal intent reaches the prioritizer.
        manager.finalize(PriorityType::Legacy).unwrap();
        let only = manager.pop().unwrap();
        assert_eq!(only.namespace(), "app.orders");
        assert!(manager.pop().is_none());
    }

    #[test]
    fn test_smart_oplog_pick() {
        let manager = IntentManager::new();
        manager.set_smart_pick_oplog(true);

        // A local oplog first, then the top-level one replaces it.
        manager.put_oplog_intent(intent("local", "oplog.rs", 1)).unwrap();
        manager.put_oplog_intent(intent("", "oplog", 2)).unwrap();
        assert_eq!(manager.oplog().unwrap().size, 2);
        assert!(!manager.oplog_conflict());

        // A second top-priority candidate flags a conflict without
        // overwriting the winner.
        manager.put_oplog_intent(intent("", "oplog", 3)).unwrap();
        assert!(manager.oplog_conflict());
        assert_eq!(manager.oplog().unwrap().size, 2);

        // Lower-priority candidates are ignored outright.
        manager.put_oplog_intent(intent("local", "oplog.rs", 4)).unwrap();
        assert_eq!(manager.oplog().unwrap().size, 2);
    }

    #[test]
    fn test_oplog_without_smart_pick_overwrites() {
        let manager = IntentManager::new();
        manager.put_oplog_intent(intent("", "oplog", 1)).unwrap();
        manager.put_oplog_intent(intent("local", "oplog.rs", 2)).unwrap();
        assert_eq!(manager.oplog().unwrap().size, 2);
        assert!(!manager.oplog_conflict());
    }

    #[test]
    fn test_oplog_routed_via_put() {
        let manager = IntentManager::new();
        manager.put(intent("", "oplog", 7)).unwrap();
        assert_eq!(manager.oplog().unwrap().size, 7);
        assert!(manager.peek().is_none());
    }

    #[test]
    fn test_destination_conflicts() {
        let manager = IntentManager::new();
        manager
            .put_with_namespace("dbX.colY", intent("a", "one", 1))
            .unwrap();
        manager
            .put_with_namespace("dbX.colY", intent("b", "two", 2))
            .unwrap();
        manager.put(intent("clean", "coll", 3)).unwrap();

        let conflicts = manager.destination_conflicts();
        assert_eq!(conflicts.len(), 2);
        // The rendered message names the destination and the offending source.
        assert_eq!(
            conflicts[0].to_string(),
            "restore would overwrite dbX.colY from multiple sources (source a.one)"
        );
        for (conflict, expected_source) in conflicts.iter().zip(["a.one", "b.two"]) {
            match conflict {
                DuffelError::DestinationConflict {
                    destination,
                    source_namespace,
                } => {
                    assert_eq!(destination, "dbX.colY");
                    assert_eq!(source_namespace, expected_source);
                }
                other => panic!("unexpected error variant: {other:?}"),
            }
        }
    }

    #[test]
    fn test_merge_of_one_source_is_not_a_conflict() {
        let manager = IntentManager::new();
        // Data file and metadata file of the same source, both renamed.
        let mut data_half = intent("a", "one", 10);
        data_half.data_source = Some(SourceHandle::File(PathBuf::from("one.doc")));
        let mut meta_half = intent("a", "one", 0);
        meta_half.metadata_source = Some(SourceHandle::File(PathBuf::from("one.meta")));
        manager.put_with_namespace("dbX.colY", data_half).unwrap();
        manager.put_with_namespace("dbX.colY", meta_half).unwrap();
        assert!(manager.destination_conflicts().is_empty());
    }

    #[test]
    fn test_has_config_db_intent() {
        let manager = IntentManager::new();
        manager.put(intent("app", "orders", 1)).unwrap();
        assert!(!manager.has_config_db_intent());
        manager.put(intent("config", "chunks", 1)).unwrap();
        assert!(manager.has_config_db_intent());
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let manager = IntentManager::new();
        manager.put(intent("app", "first", 1)).unwrap();
        manager.put(intent("app", "second", 2)).unwrap();
        assert_eq!(manager.peek().unwrap().namespace(), "app.first");
        assert_eq!(manager.peek().unwrap().namespace(), "app.first");
        manager.finalize(PriorityType::Legacy).unwrap();
        assert_eq!(manager.pop().unwrap().namespace(), "app.first");
    }

    #[test]
    fn test_intents_lists_normals_then_specials() {
        let manager = IntentManager::new();
        manager.put(intent("app", "orders", 1)).unwrap();
        manager.put(intent("admin", "system.users", 2)).unwrap();
        manager.put(intent("", "oplog", 3)).unwrap();
        let all = manager.intents();
        let namespaces: Vec<String> = all.iter().map(|i| i.namespace()).collect();
        assert_eq!(
            namespaces,
            vec!["app.orders", ".oplog", "admin.system.users"]
        );
    }
}
