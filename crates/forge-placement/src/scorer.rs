//! Host utilization scoring.

use forge_core::HostDescriptor;

/// CPU accounting for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLoad {
    pub name: String,
    /// Physical CPUs.
    pub cpus: u32,
    /// vCPUs allocated to running VMs.
    pub running_vcpus: u32,
}

impl HostLoad {
    /// Running vCPUs per physical CPU. A host reporting no CPUs is never
    /// preferred.
    pub fn utilization(&self) -> f64 {
        if self.cpus == 0 {
            return f64::INFINITY;
        }
        f64::from(self.running_vcpus) / f64::from(self.cpus)
    }

    pub fn descriptor(&self) -> HostDescriptor {
        HostDescriptor {
            name: self.name.clone(),
            utilization: self.utilization(),
        }
    }
}

/// The least utilized host; ties go to the earliest in the slice.
pub fn least_utilized(hosts: &[HostDescriptor]) -> Option<&HostDescriptor> {
    hosts.iter().fold(None, |best: Option<&HostDescriptor>, host| match best {
        Some(b) if b.utilization <= host.utilization => Some(b),
        _ => Some(host),
    })
}
