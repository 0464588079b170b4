//! Domain types shared by every nodeforge crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric VM identifier, unique across the whole hypervisor cluster.
pub type VmId = u32;

// ── Node status ───────────────────────────────────────────────────

/// Power state of a VM as reported by the hypervisor.
///
/// Never stored: always derived from the state string of a fresh query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Stopped,
    Unknown,
}

impl NodeStatus {
    /// Map a hypervisor VM state string; anything unrecognized is `Unknown`.
    pub fn from_state(state: &str) -> Self {
        match state {
            "running" => NodeStatus::Running,
            "stopped" => NodeStatus::Stopped,
            _ => NodeStatus::Unknown,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Running => "RUNNING",
            NodeStatus::Stopped => "STOPPED",
            NodeStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

// ── Hosts and VMs ─────────────────────────────────────────────────

/// A physical hypervisor host considered for placement.
///
/// Utilization is allocated vCPUs of running VMs divided by physical
/// CPUs. Recomputed for each placement decision.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDescriptor {
    pub name: String,
    pub utilization: f64,
}

/// Identity of a VM known to the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmIdentity {
    pub id: VmId,
    /// Display name, unique across the cluster.
    pub name: String,
    /// Name of the host the VM lives on.
    pub host: String,
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] on {}", self.name, self.id, self.host)
    }
}

/// Reserved id bands that must never be allocated, mutated or destroyed.
///
/// Ids below `below` and ids at or above `from` are protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedRanges {
    pub below: VmId,
    pub from: VmId,
}

impl ProtectedRanges {
    pub fn new(below: VmId, from: VmId) -> Self {
        Self { below, from }
    }

    pub fn is_protected(&self, id: VmId) -> bool {
        id < self.below || id >= self.from
    }
}

impl Default for ProtectedRanges {
    fn default() -> Self {
        Self {
            below: 500,
            from: 1000,
        }
    }
}

// ── Readiness ─────────────────────────────────────────────────────

/// Checkpoints a node passes through on its way to being usable.
///
/// Ordered: a later variant always implies every earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStage {
    Unreachable,
    AgentOnline,
    AddressAssigned,
    ShellReady,
    ServicesReady,
}

impl fmt::Display for ReadinessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadinessStage::Unreachable => "unreachable",
            ReadinessStage::AgentOnline => "agent-online",
            ReadinessStage::AddressAssigned => "address-assigned",
            ReadinessStage::ShellReady => "shell-ready",
            ReadinessStage::ServicesReady => "services-ready",
        };
        f.write_str(s)
    }
}
