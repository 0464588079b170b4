//! forge-machine: one handle for every node the orchestrator drives.
//!
//! A [`Machine`] is either a hypervisor VM or a plain host reachable over
//! the network. Both expose the same capabilities (wait until ready,
//! upload, run a command, capture output, attach interactively); the
//! variant decides whether the guest agent or the network carries each
//! call.
//!
//! # Architecture
//!
//! ```text
//! MachineResolver
//!   ├── dotted name → DNS lookup → Machine::Host
//!   └── otherwise / DNS miss → Inventory → Machine::Vm
//!
//! Machine { kind: Vm(VmIdentity) | Host { name }, ctx: Arc<MachineContext> }
//!   └── wait_until_ready() → ReadinessProtocol
//!       ├── AgentOnline      (VM only: agent info)
//!       ├── AddressAssigned  (agent interfaces or DNS, home networks)
//!       ├── ShellReady       (`true` over RemoteExec)
//!       └── ServicesReady    (`systemctl is-system-running --wait`)
//! ```
//!
//! Every stage is a bounded poll loop that also stops on cancellation.

pub mod address;
pub mod error;
pub mod machine;
pub mod readiness;
pub mod resolver;

pub use address::{parse_addresses, select_home_address, sort_addresses};
pub use error::{MachineError, MachineResult, ReadinessError, ReadinessResult};
pub use machine::{Machine, MachineContext, MachineKind};
pub use readiness::{Pending, Probe, ReadinessProtocol, StageTracker};
pub use resolver::MachineResolver;
