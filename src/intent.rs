//! The unit of work: one collection to be dumped or restored.

use crate::error::{DuffelError, Result};
use serde_json::Value;
use std::path::PathBuf;

/// Where a collection's bytes live.
///
/// Cheap, cloneable descriptor: the archive case is materialized into an
/// actual byte stream by the restore driver via
/// [`DemuxHandle::open_collection`](crate::demux::DemuxHandle::open_collection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceHandle {
    /// A plain file in a dump directory.
    File(PathBuf),
    /// A logical sub-stream inside an archive.
    Archive { namespace: String },
}

/// One collection to be moved, plus everything the scheduler needs to know
/// about it.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub db: String,
    pub coll: String,
    /// Literal collection options (capped, collation, viewOn, ...).
    pub options: Value,
    /// Byte size, used for scheduling. Zero until discovered.
    pub size: u64,
    pub data_source: Option<SourceHandle>,
    pub metadata_source: Option<SourceHandle>,
}

impl Intent {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Intent {
            db: db.into(),
            coll: coll.into(),
            options: Value::Null,
            size: 0,
            data_source: None,
            metadata_source: None,
        }
    }

    /// The `db.collection` pair identifying this collection.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }

    pub fn is_oplog(&self) -> bool {
        if self.db.is_empty() && self.coll == "oplog" {
            return true;
        }
        self.db == "local" && (self.coll == "oplog.rs" || self.coll == "oplog.$main")
    }

    pub fn is_users(&self) -> bool {
        (self.db == "admin" && self.coll == "system.users") || self.coll == "$admin.system.users"
    }

    pub fn is_roles(&self) -> bool {
        (self.db == "admin" && self.coll == "system.roles") || self.coll == "$admin.system.roles"
    }

    pub fn is_auth_version(&self) -> bool {
        (self.db == "admin" && self.coll == "system.version")
            || self.coll == "$admin.system.version"
    }

    pub fn is_system_indexes(&self) -> bool {
        self.coll == "system.indexes"
    }

    /// Views carry no physical data but must exist before anything that
    /// references them is restored.
    pub fn is_view(&self) -> bool {
        self.options.get("viewOn").is_some()
    }

    pub(crate) fn is_special(&self) -> bool {
        self.is_oplog()
            || self.is_users()
            || self.is_roles()
            || self.is_auth_version()
            || self.is_system_indexes()
    }

    /// Merge another discovery of the same destination namespace into this
    /// intent: first-known, non-empty field wins. The data file and the
    /// metadata file for one collection may be discovered in either order
    /// and still coalesce into one logical unit.
    pub fn merge(&mut self, other: Intent) {
        if self.data_source.is_none() {
            self.data_source = other.data_source;
        }
        if self.metadata_source.is_none() {
            self.metadata_source = other.metadata_source;
        }
        if self.size == 0 {
            self.size = other.size;
        }
        if self.options.is_null() {
            self.options = other.options;
        }
    }
}

/// Split a `db.collection` namespace at the first dot. The collection part
/// may itself contain dots (`system.indexes`); the database part may not.
pub fn split_namespace(ns: &str) -> Result<(String, String)> {
    match ns.split_once('.') {
        Some((db, coll)) if !coll.is_empty() => Ok((db.to_string(), coll.to_string())),
        _ => Err(DuffelError::InvalidNamespace(ns.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespace_and_split() {
        let intent = Intent::new("sales", "orders.archive");
        assert_eq!(intent.namespace(), "sales.orders.archive");
        let (db, coll) = split_namespace("sales.orders.archive").unwrap();
        assert_eq!(db, "sales");
        assert_eq!(coll, "orders.archive");
        // Empty database is legal (top-level oplog), empty collection is not.
        assert_eq!(
            split_namespace(".oplog").unwrap(),
            (String::new(), "oplog".to_string())
        );
        assert!(split_namespace("nodot").is_err());
        assert!(split_namespace("db.").is_err());
    }

    #[test]
    fn test_special_predicates() {
        assert!(Intent::new("", "oplog").is_oplog());
        assert!(Intent::new("local", "oplog.rs").is_oplog());
        assert!(Intent::new("local", "oplog.$main").is_oplog());
        assert!(!Intent::new("app", "oplog").is_oplog());

        assert!(Intent::new("admin", "system.users").is_users());
        assert!(Intent::new("admin", "system.roles").is_roles());
        assert!(Intent::new("admin", "system.version").is_auth_version());
        assert!(Intent::new("app", "system.indexes").is_system_indexes());
        assert!(!Intent::new("app", "users").is_users());
    }

    #[test]
    fn test_view_detection() {
        let mut intent = Intent::new("app", "totals");
        assert!(!intent.is_view());
        intent.options = json!({ "viewOn": "orders", "pipeline": [] });
        assert!(intent.is_view());
    }

    #[test]
    fn test_merge_first_known_wins() {
        let mut a = Intent::new("app", "orders");
        a.data_source = Some(SourceHandle::File(PathBuf::from("orders.doc")));
        a.size = 42;

        let mut b = Intent::new("app", "orders");
        b.metadata_source = Some(SourceHandle::File(PathBuf::from("orders.meta")));
        b.options = json!({ "capped": true });
        b.size = 99;

        let mut merged = a.clone();
        merged.merge(b.clone());
        assert_eq!(
            merged.data_source,
            Some(SourceHandle::File(PathBuf::from("orders.doc")))
        );
        assert_eq!(
            merged.metadata_source,
            Some(SourceHandle::File(PathBuf::from("orders.meta")))
        );
        // First-known size wins.
        assert_eq!(merged.size, 42);
        assert_eq!(merged.options, json!({ "capped": true }));
    }

    #[test]
    fn test_merge_commutative_over_discovery_order() {
        let mut data_half = Intent::new("app", "orders");
        data_half.data_source = Some(SourceHandle::Archive {
            namespace: "app.orders".to_string(),
        });
        data_half.size = 1024;

        let mut meta_half = Intent::new("app", "orders");
        meta_half.metadata_source = Some(SourceHandle::File(PathBuf::from("orders.meta")));
        meta_half.options = json!({ "collation": { "locale": "fr" } });

        let mut ab = data_half.clone();
        ab.merge(meta_half.clone());
        let mut ba = meta_half;
        ba.merge(data_half);
        assert_eq!(ab, ba);
    }

    proptest::proptest! {
        #[test]
        fn prop_merge_commutative_for_disjoint_halves(
            size_on_data in proptest::prelude::any::<bool>(),
            size in 1u64..1_000_000,
        ) {
            let mut data_half = Intent::new("db", "c");
            data_half.data_source = Some(SourceHandle::File(PathBuf::from("c.doc")));
            let mut meta_half = Intent::new("db", "c");
            meta_half.metadata_source = Some(SourceHandle::File(PathBuf::from("c.meta")));
            if size_on_data {
                data_half.size = size;
            } else {
                meta_half.size = size;
            }

            let mut ab = data_half.clone();
            ab.merge(meta_half.clone());
            let mut ba = meta_half;
            ba.merge(data_half);
            proptest::prop_assert_eq!(ab, ba);
        }
    }
}
