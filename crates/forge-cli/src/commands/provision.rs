//! Provisioning subcommands.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{info, warn};

use forge_provision::NodeRequest;

use crate::context::Context;

pub async fn provision_node(
    ctx: &Context,
    name: String,
    id: Option<u32>,
    post_init_script: Option<PathBuf>,
    interactive: bool,
    rm: bool,
) -> anyhow::Result<ExitCode> {
    let mut request = NodeRequest::new(name)
        .with_interactive(interactive)
        .with_teardown(rm);
    if let Some(id) = id {
        request = request.with_id(id);
    }
    if let Some(script) = post_init_script {
        request = request.with_post_init_script(script);
    }

    match ctx.provisioner.provision_node(request).await {
        Ok(report) => {
            info!(node = %report.machine, address = %report.address, "node ready");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_cancelled() => {
            warn!("provisioning aborted");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn install(
    ctx: &Context,
    name: &str,
    post_init_script: Option<PathBuf>,
    interactive: bool,
) -> anyhow::Result<ExitCode> {
    let machine = ctx.resolve(name).await?;
    let address = ctx
        .provisioner
        .install(&machine, post_init_script.as_deref(), interactive)
        .await?;
    info!(node = %machine, %address, "node installed");
    Ok(ExitCode::SUCCESS)
}

pub async fn provision(ctx: &Context, names: Vec<String>) -> anyhow::Result<ExitCode> {
    let requests = names.into_iter().map(NodeRequest::new).collect();
    let report = ctx.provisioner.provision_cluster(requests).await?;
    info!(nodes = report.nodes.len(), "cluster ready");
    Ok(ExitCode::SUCCESS)
}

pub async fn configure(ctx: &Context, names: &[String]) -> anyhow::Result<ExitCode> {
    let mut machines = Vec::with_capacity(names.len());
    for name in names {
        machines.push(ctx.resolve(name).await?);
    }
    ctx.provisioner.configure(&machines).await?;
    info!(nodes = machines.len(), "cluster configured");
    Ok(ExitCode::SUCCESS)
}
