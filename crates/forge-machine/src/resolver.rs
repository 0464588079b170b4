//! Turning a user-supplied name into a [`Machine`].
//!
//! A name containing a dot (or an address literal) is tried as a network
//! host first; if it does not resolve, or the name has no dot, the VM of
//! that name is looked up in the inventory.

use std::sync::Arc;

use tracing::debug;

use forge_core::VmId;
use forge_inventory::Inventory;

use crate::error::{MachineError, MachineResult};
use crate::machine::{Machine, MachineContext};

pub struct MachineResolver {
    inventory: Arc<Inventory>,
    ctx: Arc<MachineContext>,
}

impl MachineResolver {
    pub fn new(inventory: Arc<Inventory>, ctx: Arc<MachineContext>) -> Self {
        Self { inventory, ctx }
    }

    pub fn context(&self) -> &Arc<MachineContext> {
        &self.ctx
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub async fn resolve(&self, name: &str) -> MachineResult<Machine> {
        if looks_like_host(name) {
            let resolved = tokio::net::lookup_host((name, 22))
                .await
                .is_ok_and(|mut addrs| addrs.next().is_some());
            if resolved {
                debug!(%name, "resolved as network host");
                return Ok(Machine::host(name, self.ctx.clone()));
            }
            debug!(%name, "no DNS record, falling back to VM lookup");
        }
        self.resolve_vm(name).await
    }

    /// Look a name up as a VM only.
    pub async fn resolve_vm(&self, name: &str) -> MachineResult<Machine> {
        let entry = self
            .inventory
            .vm_by_name(name)
            .await?
            .ok_or_else(|| MachineError::NotFound(name.to_string()))?;
        Ok(Machine::vm(entry.identity, self.ctx.clone()))
    }

    pub async fn resolve_id(&self, id: VmId) -> MachineResult<Machine> {
        let entry = self
            .inventory
            .vm_by_id(id)
            .await?
            .ok_or_else(|| MachineError::NotFound(id.to_string()))?;
        Ok(Machine::vm(entry.identity, self.ctx.clone()))
    }

    /// Every unprotected VM currently known.
    pub async fn all_vms(&self) -> MachineResult<Vec<Machine>> {
        Ok(self
            .inventory
            .vms()
            .await?
            .into_iter()
            .map(|entry| Machine::vm(entry.identity, self.ctx.clone()))
            .collect())
    }
}

fn looks_like_host(name: &str) -> bool {
    name.contains('.') || name.contains(':')
}
