//! forge-hypervisor: the hypervisor side of node provisioning.
//!
//! Everything the orchestrator needs from the hypervisor goes through the
//! [`HypervisorGateway`] trait. The production implementation talks to the
//! Proxmox VE REST API; the in-memory implementation in [`testkit`] backs
//! the test suites of the higher crates.
//!
//! # Architecture
//!
//! ```text
//! HypervisorGateway (trait, Arc<dyn>)
//!   ├── ProxmoxClient    reqwest, ticket auth, /api2/json
//!   └── InMemoryHypervisor (testkit)
//!
//! TaskWaiter
//!   ├── TaskHandle::from_ref()   handle / completed / error payload
//!   ├── wait()                   poll task status until "stopped"
//!   └── wait_for_host_idle()     drain every active task on a host
//! ```

pub mod error;
pub mod gateway;
pub mod proxmox;
pub mod task;
pub mod waiter;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use error::{GatewayError, GatewayResult, TaskError, TaskResult};
pub use gateway::{
    AgentExecStatus, GuestInterface, HostRecord, HypervisorGateway, TaskRef, TaskStatus, VmRecord,
};
pub use proxmox::ProxmoxClient;
pub use task::TaskHandle;
pub use waiter::TaskWaiter;
