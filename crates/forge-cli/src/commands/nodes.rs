//! Inspecting and poking at individual nodes.

use std::path::Path;
use std::process::ExitCode;

use tracing::{error, info};

use crate::context::Context;

pub async fn list(ctx: &Context) -> anyhow::Result<ExitCode> {
    for entry in ctx.provisioner.list().await? {
        println!("{} [{}]: {}", entry.identity.name, entry.identity.id, entry.status);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn ssh(ctx: &Context, by_id: bool, name: &str) -> anyhow::Result<ExitCode> {
    let machine = ctx.resolve_by(by_id, name).await?;
    let code = machine.interactive(None).await?;
    Ok(exit_code(code))
}

pub async fn upload(ctx: &Context, name: &str, source: &Path, dest: &str) -> anyhow::Result<ExitCode> {
    let machine = ctx.resolve(name).await?;
    machine.upload(source, dest).await?;
    info!(node = %machine, source = %source.display(), %dest, "uploaded");
    Ok(ExitCode::SUCCESS)
}

pub async fn upload_everywhere(ctx: &Context, source: &Path, dest: &str) -> anyhow::Result<ExitCode> {
    let mut failed = false;
    for machine in ctx.provisioner.resolver().all_vms().await? {
        match machine.sync_to(source, dest, false).await {
            Ok(()) => info!(node = %machine, "synced"),
            Err(e) => {
                error!(node = %machine, error = %e, "sync failed");
                failed = true;
            }
        }
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

pub async fn start(ctx: &Context, name: &str) -> anyhow::Result<ExitCode> {
    let machine = ctx.resolve(name).await?;
    ctx.provisioner.start(&machine).await?;
    info!(node = %machine, "started");
    Ok(ExitCode::SUCCESS)
}

/// Map a remote exit code onto the process exit status.
pub fn exit_code(code: i32) -> ExitCode {
    match code {
        0 => ExitCode::SUCCESS,
        1..=255 => ExitCode::from(code as u8),
        _ => ExitCode::FAILURE,
    }
}
