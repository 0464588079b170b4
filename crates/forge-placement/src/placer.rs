//! Placement engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use forge_core::{NodeStatus, VmId};
use forge_hypervisor::HypervisorGateway;

use crate::error::{PlacementError, PlacementResult};
use crate::scorer::{HostLoad, least_utilized};

/// Where to clone a new VM from.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub host: String,
    pub template: VmId,
    pub utilization: f64,
}

pub struct Placer {
    gateway: Arc<dyn HypervisorGateway>,
    /// Template VM id per host name.
    templates: BTreeMap<String, VmId>,
}

impl Placer {
    pub fn new(gateway: Arc<dyn HypervisorGateway>, templates: BTreeMap<String, VmId>) -> Self {
        Self { gateway, templates }
    }

    /// Current load of every online host, in discovery order.
    pub async fn host_loads(&self) -> PlacementResult<Vec<HostLoad>> {
        let mut loads = Vec::new();
        for host in self.gateway.list_hosts().await? {
            if !host.online {
                continue;
            }
            let cpus = self.gateway.host_cpus(&host.name).await?;
            let running_vcpus = self
                .gateway
                .list_vms(&host.name)
                .await?
                .iter()
                .filter(|vm| NodeStatus::from_state(&vm.status) == NodeStatus::Running)
                .map(|vm| vm.cpus)
                .sum();
            loads.push(HostLoad {
                name: host.name,
                cpus,
                running_vcpus,
            });
        }
        Ok(loads)
    }

    /// Choose the least utilized host that has a template.
    pub async fn choose(&self) -> PlacementResult<Placement> {
        let candidates: Vec<_> = self
            .host_loads()
            .await?
            .into_iter()
            .filter(|load| {
                let known = self.templates.contains_key(&load.name);
                if !known {
                    warn!(host = %load.name, "no template configured for host, not placing there");
                }
                known
            })
            .map(|load| {
                debug!(host = %load.name, utilization = load.utilization(), "host load");
                load.descriptor()
            })
            .collect();

        let best = least_utilized(&candidates).ok_or(PlacementError::NoCandidateHost)?;
        let template = self.templates[&best.name];
        info!(host = %best.name, template, utilization = best.utilization, "placement chosen");
        Ok(Placement {
            host: best.name.clone(),
            template,
            utilization: best.utilization,
        })
    }
}
