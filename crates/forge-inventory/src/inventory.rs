//! Inventory: epoch-guarded cache of hosts and VMs.
//!
//! A snapshot is built from one full pass over every online host. It is
//! never patched in place: mutations call [`Inventory::invalidate`] and the
//! next reader performs a fresh full query. A query that overlaps an
//! invalidation is discarded and repeated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use forge_core::{NodeStatus, ProtectedRanges, VmId, VmIdentity};
use forge_hypervisor::HypervisorGateway;

use crate::error::{InventoryError, InventoryResult};

/// A VM as seen by one inventory query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEntry {
    pub identity: VmIdentity,
    pub status: NodeStatus,
    pub cpus: u32,
}

/// One consistent listing of the cluster.
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    epoch: u64,
    /// Online hosts in discovery order.
    hosts: Vec<String>,
    /// Unprotected VMs by id.
    vms: BTreeMap<VmId, VmEntry>,
    by_name: HashMap<String, VmId>,
    /// Every id present on the hypervisor, protected ones included.
    ids_in_use: BTreeSet<VmId>,
}

impl InventorySnapshot {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Unprotected VMs in ascending id order.
    pub fn vms(&self) -> impl Iterator<Item = &VmEntry> {
        self.vms.values()
    }

    pub fn vm_by_id(&self, id: VmId) -> Option<&VmEntry> {
        self.vms.get(&id)
    }

    pub fn vm_by_name(&self, name: &str) -> Option<&VmEntry> {
        self.by_name.get(name).and_then(|id| self.vms.get(id))
    }

    /// VMs living on one host.
    pub fn vms_on<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a VmEntry> + 'a {
        self.vms.values().filter(move |vm| vm.identity.host == host)
    }

    pub fn is_in_use(&self, id: VmId) -> bool {
        self.ids_in_use.contains(&id)
    }

    pub fn ids_in_use(&self) -> &BTreeSet<VmId> {
        &self.ids_in_use
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }
}

/// Shared inventory service; hand out as `Arc<Inventory>`.
pub struct Inventory {
    gateway: Arc<dyn HypervisorGateway>,
    protected: ProtectedRanges,
    cache: RwLock<Option<Arc<InventorySnapshot>>>,
    epoch: AtomicU64,
}

impl Inventory {
    pub fn new(gateway: Arc<dyn HypervisorGateway>, protected: ProtectedRanges) -> Self {
        Self {
            gateway,
            protected,
            cache: RwLock::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn HypervisorGateway> {
        &self.gateway
    }

    pub fn protected(&self) -> ProtectedRanges {
        self.protected
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Current snapshot, querying the hypervisor if the cache is stale.
    pub async fn snapshot(&self) -> InventoryResult<Arc<InventorySnapshot>> {
        loop {
            let epoch = self.epoch();
            if let Some(cached) = self.cache.read().await.as_ref() {
                if cached.epoch == epoch {
                    return Ok(cached.clone());
                }
            }

            let fresh = Arc::new(self.query(epoch).await?);

            let mut cache = self.cache.write().await;
            if self.epoch() != epoch {
                debug!(epoch, "inventory invalidated during query, querying again");
                continue;
            }
            *cache = Some(fresh.clone());
            return Ok(fresh);
        }
    }

    /// Drop the cached listing; the next reader queries again.
    pub async fn invalidate(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        *self.cache.write().await = None;
        debug!(epoch, "inventory invalidated");
    }

    /// Invalidate and immediately re-query.
    pub async fn refresh(&self) -> InventoryResult<Arc<InventorySnapshot>> {
        self.invalidate().await;
        self.snapshot().await
    }

    pub async fn vm_by_name(&self, name: &str) -> InventoryResult<Option<VmEntry>> {
        Ok(self.snapshot().await?.vm_by_name(name).cloned())
    }

    pub async fn vm_by_id(&self, id: VmId) -> InventoryResult<Option<VmEntry>> {
        Ok(self.snapshot().await?.vm_by_id(id).cloned())
    }

    pub async fn vms(&self) -> InventoryResult<Vec<VmEntry>> {
        Ok(self.snapshot().await?.vms().cloned().collect())
    }

    async fn query(&self, epoch: u64) -> InventoryResult<InventorySnapshot> {
        let mut snapshot = InventorySnapshot {
            epoch,
            ..InventorySnapshot::default()
        };

        let mut offline = 0;
        for host in self.gateway.list_hosts().await? {
            if !host.online {
                warn!(host = %host.name, "skipping offline host");
                offline += 1;
                continue;
            }
            for vm in self.gateway.list_vms(&host.name).await? {
                snapshot.ids_in_use.insert(vm.id);
                if self.protected.is_protected(vm.id) {
                    continue;
                }
                if let Some(&first) = snapshot.by_name.get(&vm.name) {
                    return Err(InventoryError::DuplicateName {
                        name: vm.name,
                        first,
                        second: vm.id,
                    });
                }
                snapshot.by_name.insert(vm.name.clone(), vm.id);
                snapshot.vms.insert(
                    vm.id,
                    VmEntry {
                        identity: VmIdentity {
                            id: vm.id,
                            name: vm.name,
                            host: host.name.clone(),
                        },
                        status: NodeStatus::from_state(&vm.status),
                        cpus: vm.cpus,
                    },
                );
            }
            snapshot.hosts.push(host.name);
        }

        // Ids on offline hosts stay taken cluster-wide.
        if offline > 0 {
            snapshot.ids_in_use.extend(self.gateway.cluster_vm_ids().await?);
        }

        debug!(
            epoch,
            hosts = snapshot.hosts.len(),
            vms = snapshot.vms.len(),
            "inventory queried"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_hypervisor::testkit::InMemoryHypervisor;

    fn inventory(hv: &Arc<InMemoryHypervisor>) -> Inventory {
        Inventory::new(hv.clone(), ProtectedRanges::default())
    }

    #[tokio::test]
    async fn snapshot_is_cached_until_invalidated() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("tapir", 8));
        hv.add_vm("tapir", 501, "kb1", "running", 2);
        let inv = inventory(&hv);

        inv.snapshot().await.unwrap();
        inv.snapshot().await.unwrap();
        assert_eq!(hv.list_vm_calls(), 1);

        inv.invalidate().await;
        inv.snapshot().await.unwrap();
        assert_eq!(hv.list_vm_calls(), 2);
    }

    #[tokio::test]
    async fn invalidation_exposes_new_vms() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("tapir", 8));
        let inv = inventory(&hv);
        assert!(inv.vm_by_name("kb1").await.unwrap().is_none());

        hv.add_vm("tapir", 501, "kb1", "stopped", 2);
        assert!(inv.vm_by_name("kb1").await.unwrap().is_none());

        inv.invalidate().await;
        let vm = inv.vm_by_name("kb1").await.unwrap().unwrap();
        assert_eq!(vm.identity.id, 501);
        assert_eq!(vm.status, NodeStatus::Stopped);
    }

    #[tokio::test]
    async fn protected_vms_are_hidden_but_in_use() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("tapir", 8));
        hv.add_template("tapir", 9010);
        hv.add_vm("tapir", 100, "router", "running", 1);
        hv.add_vm("tapir", 502, "kb2", "running", 2);

        let snapshot = inventory(&hv).snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.vm_by_id(9010).is_none());
        assert!(snapshot.vm_by_name("router").is_none());
        assert!(snapshot.is_in_use(9010));
        assert!(snapshot.is_in_use(100));
        assert!(snapshot.is_in_use(502));
    }

    #[tokio::test]
    async fn offline_hosts_are_skipped() {
        let hv = Arc::new(
            InMemoryHypervisor::new()
                .with_host("tapir", 8)
                .with_offline_host("zebra"),
        );
        let snapshot = inventory(&hv).snapshot().await.unwrap();
        assert_eq!(snapshot.hosts(), ["tapir".to_string()]);
    }

    #[tokio::test]
    async fn offline_host_ids_stay_in_use() {
        let hv = Arc::new(
            InMemoryHypervisor::new()
                .with_host("tapir", 8)
                .with_offline_host("zebra"),
        );
        hv.add_vm("zebra", 500, "kb9", "running", 2);

        let snapshot = inventory(&hv).snapshot().await.unwrap();
        assert!(snapshot.vm_by_id(500).is_none());
        assert!(snapshot.is_in_use(500));
    }

    #[tokio::test]
    async fn duplicate_names_are_fatal() {
        let hv = Arc::new(
            InMemoryHypervisor::new()
                .with_host("tapir", 8)
                .with_host("zebra", 8),
        );
        hv.add_vm("tapir", 501, "kb1", "running", 2);
        hv.add_vm("zebra", 502, "kb1", "running", 2);

        let err = inventory(&hv).snapshot().await.unwrap_err();
        assert!(matches!(
            err,
            InventoryError::DuplicateName { ref name, first: 501, second: 502 } if name == "kb1"
        ));
    }

    #[tokio::test]
    async fn vms_record_their_host() {
        let hv = Arc::new(
            InMemoryHypervisor::new()
                .with_host("tapir", 8)
                .with_host("zebra", 8),
        );
        hv.add_vm("zebra", 510, "kb3", "running", 4);
        let snapshot = inventory(&hv).snapshot().await.unwrap();
        assert_eq!(snapshot.vms_on("zebra").count(), 1);
        assert_eq!(snapshot.vms_on("tapir").count(), 0);
        assert_eq!(snapshot.vm_by_id(510).unwrap().identity.host, "zebra");
    }

    #[tokio::test]
    async fn epoch_advances_on_invalidate() {
        let hv = Arc::new(InMemoryHypervisor::new().with_host("tapir", 8));
        let inv = inventory(&hv);
        let first = inv.snapshot().await.unwrap();
        let second = inv.refresh().await.unwrap();
        assert!(second.epoch() > first.epoch());
    }
}
