use std::process::ExitCode;
use std::time::Duration;

use anyhow::bail;
use tracing::{error, info, warn};

use forge_provision::DestroyOutcome;

use crate::context::Context;

const COUNTDOWN_SECS: u64 = 3;

pub async fn destroy(ctx: &Context, by_id: bool, all: bool, names: &[String]) -> anyhow::Result<ExitCode> {
    let provisioner = &ctx.provisioner;

    if all {
        if !names.is_empty() {
            bail!("asking to destroy ALL VMs and naming some at the same time is not supported");
        }
        let count = provisioner.list().await?.len();
        if count == 0 {
            info!("nothing to destroy");
            return Ok(ExitCode::SUCCESS);
        }
        for remaining in (1..=COUNTDOWN_SECS).rev() {
            warn!("DESTROYING ALL {count} VMs in {remaining} seconds");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = ctx.cancel.cancelled() => {
                    info!("aborted, nothing was destroyed");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        warn!("DESTROYING ALL {count} VMs NOW");

        let report = provisioner.destroy_all().await?;
        info!(
            destroyed = report.destroyed.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            "destroy finished"
        );
        return Ok(if report.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }

    if names.is_empty() {
        bail!("name at least one VM, or pass --all");
    }

    let mut failed = false;
    for name in names {
        let result = if by_id {
            match name.parse() {
                Ok(id) => provisioner.destroy_by_id(id).await,
                Err(_) => {
                    error!(%name, "not a VM id");
                    failed = true;
                    continue;
                }
            }
        } else {
            provisioner.destroy_by_name(name).await
        };
        match result {
            Ok(DestroyOutcome::Destroyed) => info!(%name, "destroyed"),
            Ok(DestroyOutcome::Missing) => warn!(%name, "no such VM"),
            Err(e) => {
                error!(%name, error = %e, "destroy failed");
                failed = true;
            }
        }
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
