//! Error types for inventory queries and id allocation.

use thiserror::Error;

use forge_core::VmId;
use forge_hypervisor::GatewayError;

pub type InventoryResult<T> = Result<T, InventoryError>;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("duplicate VM name {name:?} (ids {first} and {second})")]
    DuplicateName {
        name: String,
        first: VmId,
        second: VmId,
    },

    #[error("cannot allocate {requested} ids: only {available} free")]
    CapacityExhausted { requested: usize, available: usize },

    #[error("VM id {0} is in a protected range")]
    ProtectedId(VmId),

    #[error("VM id {0} is already in use")]
    IdInUse(VmId),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
