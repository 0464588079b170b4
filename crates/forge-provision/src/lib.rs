//! forge-provision: taking nodes from nothing to a joined cluster.
//!
//! The [`Provisioner`] drives one node through clone, boot, readiness,
//! initialization and optional post-init steps, and fans that sequence
//! out across a node set. [`ClusterBootstrap`] then joins the workers to
//! the first node.
//!
//! # Architecture
//!
//! ```text
//! Provisioner
//!   ├── Placer          (least utilized host with a template)
//!   ├── IdAllocator     (one batch allocation per cluster)
//!   ├── per-host clone lock → clone → wait for host idle → invalidate Inventory
//!   ├── TaskWaiter      (start / stop / delete tasks)
//!   ├── MachineResolver → Machine::wait_until_ready()
//!   ├── init script → reboot grace → wait_until_ready()
//!   ├── payload, post-init script, interactive session (cancellable)
//!   └── teardown (always, when requested)
//!
//! provision_cluster(names)
//!   ├── allocate N ids
//!   ├── spawn one task per node, staggered
//!   ├── join all
//!   └── ClusterBootstrap: master mints join command → workers apply it
//! ```

pub mod bootstrap;
pub mod error;
pub mod provisioner;
pub mod settings;

pub use bootstrap::ClusterBootstrap;
pub use error::{ProvisionError, ProvisionResult};
pub use provisioner::{ClusterReport, DestroyOutcome, DestroyReport, NodeReport, NodeRequest, Provisioner};
pub use settings::ProvisionSettings;
