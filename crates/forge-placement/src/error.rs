use thiserror::Error;

use forge_hypervisor::GatewayError;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no online host has a configured template")]
    NoCandidateHost,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
