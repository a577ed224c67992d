//! Tamper-evident audit trail.
//!
//! Every entry hashes its own fields together with the previous entry's hash:
//! `entry_hash = sha256("ts|actor|action|details_json|prev_hash")`. The first
//! entry uses an empty previous hash. Rewriting or dropping any row breaks
//! every hash after it, which [`verify_chain`] detects offline.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::store::{AuditChainRow, StoreResult, VaultStore};

pub struct AuditLogger {
    store: Arc<dyn VaultStore>,
}

fn chain_hash(ts: &str, actor: &str, action: &str, details_json: &str, prev: &str) -> String {
    let raw = format!("{ts}|{actor}|{action}|{details_json}|{prev}");
    hex::encode(Sha256::digest(raw.as_bytes()))
}

impl AuditLogger {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self { store }
    }

    /// Append one entry, linking it to the current chain head.
    pub fn log(&self, actor: &str, action: &str, details: JsonValue) -> StoreResult<()> {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let prev = self.store.last_audit_hash()?;
        let details_json = details.to_string();
        let entry_hash = chain_hash(&ts, actor, action, &details_json, &prev);
        self.store
            .insert_audit(&ts, actor, action, &details_json, &prev, &entry_hash)
    }
}

/// Recompute the whole chain. Returns the index of the first broken row, or
/// `None` when every link verifies.
pub fn verify_chain(rows: &[AuditChainRow]) -> Option<usize> {
    let mut prev = String::new();
    for (i, row) in rows.iter().enumerate() {
        if row.prev_hash != prev {
            return Some(i);
        }
        let expected = chain_hash(&row.ts, &row.actor, &row.action, &row.details_json, &prev);
        if row.entry_hash != expected {
            return Some(i);
        }
        prev = row.entry_hash.clone();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteVaultStore;
    use serde_json::json;

    fn logger_and_store() -> (AuditLogger, Arc<SqliteVaultStore>) {
        let store = Arc::new(SqliteVaultStore::in_memory().unwrap());
        (AuditLogger::new(store.clone()), store)
    }

    #[test]
    fn chain_links_and_verifies() {
        let (logger, store) = logger_and_store();
        logger
            .log("system", "ingest_started", json!({"mount": "/media/usb0"}))
            .unwrap();
        logger
            .log("system", "file_ingested", json!({"crc32": "cbf43926"}))
            .unwrap();
        logger
            .log("system", "ingest_completed", json!({"copied": 1}))
            .unwrap();

        let rows = store.list_audit_chain().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].prev_hash, "");
        assert_eq!(rows[1].prev_hash, rows[0].entry_hash);
        assert_eq!(rows[2].prev_hash, rows[1].entry_hash);
        assert_eq!(verify_chain(&rows), None);
    }

    #[test]
    fn tampering_breaks_verification() {
        let (logger, store) = logger_and_store();
        logger.log("op", "login", json!({})).unwrap();
        logger.log("op", "storage_updated", json!({})).unwrap();

        let mut rows = store.list_audit_chain().unwrap();
        rows[0].action = "something_else".to_string();
        assert_eq!(verify_chain(&rows), Some(0));

        let mut rows = store.list_audit_chain().unwrap();
        rows[1].details_json = r#"{"forged":true}"#.to_string();
        assert_eq!(verify_chain(&rows), Some(1));

        // Dropping a middle row breaks the link after it.
        let mut rows = store.list_audit_chain().unwrap();
        logger.log("op", "logout", json!({})).unwrap();
        let full = store.list_audit_chain().unwrap();
        rows.push(full[2].clone());
        assert_eq!(verify_chain(&rows), None);
        rows.remove(1);
        assert_eq!(verify_chain(&rows), Some(1));
    }

    #[test]
    fn empty_chain_verifies() {
        assert_eq!(verify_chain(&[]), None);
    }
}
