//! Write admission. Owns no state; asks the aggregator on every call.

use super::error::CieError;
use super::store;
use super::types::{AggregateStatus, BundleKey};
use rusqlite::Connection;

pub fn edit_allowed(conn: &Connection, key: &BundleKey) -> Result<bool, CieError> {
    Ok(store::bundle_status(conn, key)?.is_editable())
}

/// Like [`edit_allowed`], but a locked bundle comes back as
/// `BundleLocked` carrying the reason.
pub fn ensure_editable(conn: &Connection, key: &BundleKey) -> Result<(), CieError> {
    match store::bundle_status(conn, key)? {
        AggregateStatus::Editable => Ok(()),
        AggregateStatus::Locked(reason) => Err(CieError::locked(key, reason)),
    }
}
