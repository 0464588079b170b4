//! forge-remote: running commands on and moving files to reachable nodes.
//!
//! The orchestrator reaches a node over the network only through the
//! [`RemoteExec`] trait. [`SshExec`] shells out to the system `ssh` and
//! `rsync` binaries with host-key checking disabled, which suits
//! short-lived machines whose keys change on every clone.
//!
//! # Architecture
//!
//! ```text
//! RemoteExec (trait, Arc<dyn>)
//!   ├── run()          → exit code
//!   ├── run_capture()  → CommandOutput
//!   ├── interactive()  → exit code, inherits the terminal
//!   └── copy_to() / copy_from()  → recursive rsync
//!
//! SshExec       : tokio::process ssh / rsync
//! ScriptedExec  : testkit, scripted exit codes and output
//! ```

pub mod error;
pub mod exec;
pub mod ssh;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use error::{RemoteError, RemoteResult};
pub use exec::{CommandOutput, RemoteExec};
pub use ssh::SshExec;
