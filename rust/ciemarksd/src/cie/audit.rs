//! Append-only journal of bundle transitions. Each entry's hash covers the
//! previous entry's hash, so editing or dropping a row breaks the chain.

use super::error::CieError;
use super::types::{AssessmentSlot, BundleKey};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub seq: i64,
    pub subject_id: String,
    pub slot: AssessmentSlot,
    pub action: String,
    pub actor_id: String,
    pub reason: Option<String>,
    pub record_count: i64,
    pub at: String,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub entries: usize,
    pub intact: bool,
    pub broken_at_seq: Option<i64>,
}

#[allow(clippy::too_many_arguments)]
fn entry_hash(
    prev_hash: &str,
    subject_id: &str,
    slot: AssessmentSlot,
    action: &str,
    actor_id: &str,
    reason: Option<&str>,
    record_count: i64,
    at: &str,
) -> String {
    let count = record_count.to_string();
    let mut hasher = Sha256::new();
    for part in [
        prev_hash,
        subject_id,
        slot.as_str(),
        action,
        actor_id,
        reason.unwrap_or(""),
        count.as_str(),
        at,
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        seq: row.get(0)?,
        subject_id: row.get(1)?,
        slot: row.get(2)?,
        action: row.get(3)?,
        actor_id: row.get(4)?,
        reason: row.get(5)?,
        record_count: row.get(6)?,
        at: row.get(7)?,
        prev_hash: row.get(8)?,
        hash: row.get(9)?,
    })
}

/// Must run inside the transition's write transaction.
pub fn append(
    conn: &Connection,
    key: &BundleKey,
    action: &str,
    actor_id: &str,
    reason: Option<&str>,
    record_count: usize,
    at: &str,
) -> Result<String, CieError> {
    let prev_hash: String = conn
        .query_row(
            "SELECT hash FROM cie_audit ORDER BY seq DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or_else(|| GENESIS_HASH.to_string());
    let record_count = record_count as i64;
    let hash = entry_hash(
        &prev_hash,
        &key.subject_id,
        key.slot,
        action,
        actor_id,
        reason,
        record_count,
        at,
    );
    conn.execute(
        "INSERT INTO cie_audit(subject_id, slot, action, actor_id, reason, record_count, at, prev_hash, hash)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &key.subject_id,
            key.slot,
            action,
            actor_id,
            reason,
            record_count,
            at,
            &prev_hash,
            &hash,
        ),
    )?;
    Ok(hash)
}

pub fn history(conn: &Connection, key: &BundleKey) -> Result<Vec<AuditEntry>, CieError> {
    let mut stmt = conn.prepare(
        "SELECT seq, subject_id, slot, action, actor_id, reason, record_count, at, prev_hash, hash
         FROM cie_audit
         WHERE subject_id = ? AND slot = ?
         ORDER BY seq",
    )?;
    let rows = stmt
        .query_map((&key.subject_id, key.slot), entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Most recent actor to perform `action` on the bundle.
pub fn last_actor(conn: &Connection, key: &BundleKey, action: &str) -> Result<Option<String>, CieError> {
    Ok(conn
        .query_row(
            "SELECT actor_id FROM cie_audit
             WHERE subject_id = ? AND slot = ? AND action = ?
             ORDER BY seq DESC LIMIT 1",
            (&key.subject_id, key.slot, action),
            |r| r.get(0),
        )
        .optional()?)
}

pub fn verify_chain(conn: &Connection) -> Result<ChainReport, CieError> {
    let mut stmt = conn.prepare(
        "SELECT seq, subject_id, slot, action, actor_id, reason, record_count, at, prev_hash, hash
         FROM cie_audit
         ORDER BY seq",
    )?;
    let entries = stmt
        .query_map([], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut expected_prev = GENESIS_HASH.to_string();
    for e in &entries {
        let recomputed = entry_hash(
            &e.prev_hash,
            &e.subject_id,
            e.slot,
            &e.action,
            &e.actor_id,
            e.reason.as_deref(),
            e.record_count,
            &e.at,
        );
        if e.prev_hash != expected_prev || e.hash != recomputed {
            return Ok(ChainReport {
                entries: entries.len(),
                intact: false,
                broken_at_seq: Some(e.seq),
            });
        }
        expected_prev = e.hash.clone();
    }
    Ok(ChainReport {
        entries: entries.len(),
        intact: true,
        broken_at_seq: None,
    })
}
