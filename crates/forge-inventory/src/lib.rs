//! forge-inventory: what exists on the hypervisor right now.
//!
//! The [`Inventory`] caches one full listing of hosts and VMs. Any caller
//! that changes cluster membership (clone, delete) invalidates it, which
//! bumps an epoch counter; snapshots are tagged with the epoch they were
//! taken at and are never served once the epoch has moved on.
//!
//! # Architecture
//!
//! ```text
//! Inventory
//!   ├── HypervisorGateway (list hosts, list VMs per host)
//!   ├── RwLock<Option<Arc<InventorySnapshot>>>
//!   └── AtomicU64 epoch (bumped by invalidate())
//!
//! IdAllocator
//!   ├── Inventory (refreshed before every allocation)
//!   └── Mutex<BTreeSet<VmId>> reservations (batch allocation is atomic)
//! ```

pub mod allocator;
pub mod error;
pub mod inventory;

pub use allocator::{IdAllocator, find_free_ids};
pub use error::{InventoryError, InventoryResult};
pub use inventory::{Inventory, InventorySnapshot, VmEntry};
