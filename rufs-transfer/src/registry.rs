//! Process-wide `circle -> filename -> Transfer` map.
//!
//! Grounded on `transfer.go`'s `activeTransfers` package-level map plus its
//! `activeMtx` mutex and `getOrCreateActiveTransfer`/`GetActiveTransfer`/
//! `GetTransferForDownloadId` functions. `once_cell::sync::Lazy` stands in
//! for Go's package-level `var`, matching the teacher's use of `once_cell`
//! for process-wide lazily-initialized state (`item_id.rs`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::transfer::Transfer;

static ACTIVE_TRANSFERS: Lazy<Mutex<HashMap<String, HashMap<String, Arc<Transfer>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the existing `Transfer` for `(circle, filename)`, or runs
/// `create` to make one and registers it. Atomic: two concurrent calls for
/// the same key observe the same instance, and `create` runs at most once
/// (and only when no instance currently exists).
pub fn get_or_create<F, E>(circle: &str, filename: &str, create: F) -> Result<Arc<Transfer>, E>
where
    F: FnOnce() -> Result<Arc<Transfer>, E>,
{
    let mut registry = ACTIVE_TRANSFERS.lock().expect("registry lock poisoned");
    if let Some(existing) = registry.get(circle).and_then(|m| m.get(filename)) {
        return Ok(existing.clone());
    }
    let transfer = create()?;
    registry
        .entry(circle.to_string())
        .or_default()
        .insert(filename.to_string(), transfer.clone());
    Ok(transfer)
}

/// Returns the active transfer for `(circle, filename)` without creating
/// one.
pub fn get_active_transfer(circle: &str, filename: &str) -> Option<Arc<Transfer>> {
    let registry = ACTIVE_TRANSFERS.lock().expect("registry lock poisoned");
    registry.get(circle)?.get(filename).cloned()
}

/// Scans the registry linearly for the transfer whose orchestration
/// session has the given id.
pub fn get_transfer_for_download_id(circle: &str, download_id: i64) -> Option<Arc<Transfer>> {
    let registry = ACTIVE_TRANSFERS.lock().expect("registry lock poisoned");
    registry
        .get(circle)?
        .values()
        .find(|t| t.download_id() == download_id)
        .cloned()
}

/// The sole deleter: called from inside `Transfer::close`. After this
/// returns, a subsequent `get_or_create` for the same key may legally
/// invoke its factory again.
pub fn remove(circle: &str, filename: &str) {
    let mut registry = ACTIVE_TRANSFERS.lock().expect("registry lock poisoned");
    if let Some(by_filename) = registry.get_mut(circle) {
        by_filename.remove(filename);
        if by_filename.is_empty() {
            registry.remove(circle);
        }
    }
}

// Atomicity of `get_or_create` (factory runs at most once per key, two
// concurrent calls observe the same instance) is exercised in
// `transfer.rs`'s test module, which has access to `Transfer`'s private
// constructors needed to build a real instance without a network peer.
