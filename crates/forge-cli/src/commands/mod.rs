pub mod destroy;
pub mod nodes;
pub mod pod;
pub mod provision;
