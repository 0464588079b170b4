//! forge-placement: which host receives the next clone.
//!
//! Placement is deliberately simple: among online hosts that carry a
//! template, pick the one whose running VMs claim the smallest share of
//! its physical CPUs. Loads are queried fresh for every decision.
//!
//! # Components
//!
//! - **`scorer`**: utilization of one host, least-utilized selection
//! - **`placer`**: queries the hypervisor and produces a [`Placement`]

pub mod error;
pub mod placer;
pub mod scorer;

pub use error::{PlacementError, PlacementResult};
pub use placer::{Placement, Placer};
pub use scorer::{HostLoad, least_utilized};
