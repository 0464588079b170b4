//! IdAllocator: free VM ids outside the protected ranges.
//!
//! Allocation scans upwards from a low watermark and returns the first
//! `count` ids that are neither protected, present on the hypervisor, nor
//! reserved by an allocation still in flight. The reservation lock is held
//! across the inventory refresh, so two concurrent batches never overlap.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use forge_core::{ProtectedRanges, VmId};

use crate::error::{InventoryError, InventoryResult};
use crate::inventory::Inventory;

/// Find `count` ascending ids starting at `start`.
///
/// The scan stops at the upper protected boundary, so it is always bounded.
pub fn find_free_ids(
    start: VmId,
    count: usize,
    protected: ProtectedRanges,
    in_use: impl Fn(VmId) -> bool,
) -> InventoryResult<Vec<VmId>> {
    let mut ids = Vec::with_capacity(count);
    let first = start.max(protected.below);
    for id in first..protected.from {
        if ids.len() == count {
            break;
        }
        if protected.is_protected(id) || in_use(id) {
            continue;
        }
        ids.push(id);
    }
    if ids.len() < count {
        return Err(InventoryError::CapacityExhausted {
            requested: count,
            available: ids.len(),
        });
    }
    Ok(ids)
}

pub struct IdAllocator {
    inventory: Arc<Inventory>,
    scan_start: VmId,
    reserved: Mutex<BTreeSet<VmId>>,
}

impl IdAllocator {
    pub fn new(inventory: Arc<Inventory>, scan_start: VmId) -> Self {
        Self {
            inventory,
            scan_start,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reserve `count` distinct free ids in ascending order.
    ///
    /// Ids stay reserved until [`release`](Self::release) is called, even
    /// after the VMs exist, so callers release once the batch is done.
    pub async fn allocate(&self, count: usize) -> InventoryResult<Vec<VmId>> {
        let mut reserved = self.reserved.lock().await;
        let snapshot = self.inventory.refresh().await?;
        let ids = find_free_ids(self.scan_start, count, self.inventory.protected(), |id| {
            snapshot.is_in_use(id) || reserved.contains(&id)
        })?;
        reserved.extend(ids.iter().copied());
        info!(?ids, "allocated VM ids");
        Ok(ids)
    }

    /// Reserve a caller-chosen id.
    pub async fn claim(&self, id: VmId) -> InventoryResult<VmId> {
        if self.inventory.protected().is_protected(id) {
            return Err(InventoryError::ProtectedId(id));
        }
        let mut reserved = self.reserved.lock().await;
        let snapshot = self.inventory.refresh().await?;
        if snapshot.is_in_use(id) || reserved.contains(&id) {
            return Err(InventoryError::IdInUse(id));
        }
        reserved.insert(id);
        debug!(vmid = id, "claimed explicit VM id");
        Ok(id)
    }

    pub async fn release(&self, ids: &[VmId]) {
        let mut reserved = self.reserved.lock().await;
        for id in ids {
            reserved.remove(id);
        }
        debug!(?ids, "released VM ids");
    }

    pub async fn reserved(&self) -> Vec<VmId> {
        self.reserved.lock().await.iter().copied().collect()
    }
}
