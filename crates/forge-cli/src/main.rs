use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;
mod context;

#[derive(Parser)]
#[command(
    name = "forge",
    about = "nodeforge: provision hypervisor VMs and bootstrap them into a cluster",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Config file (default: $FORGE_CONFIG, then ./forge.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Destroy VMs by name, by id, or all of them
    Destroy {
        /// Treat arguments as VM ids
        #[arg(short = 'i', long = "vmid")]
        by_id: bool,
        /// Destroy every unprotected VM
        #[arg(long)]
        all: bool,
        names: Vec<String>,
    },
    /// List VMs with their status
    List,
    /// Open an interactive shell on a node
    Ssh {
        #[arg(short = 'i', long = "vmid")]
        by_id: bool,
        name: String,
    },
    /// Provision a single node
    ProvisionNode {
        /// Delete the VM when done
        #[arg(long)]
        rm: bool,
        /// Script to run after setup
        #[arg(long)]
        post_init_script: Option<PathBuf>,
        /// Open an interactive session after setup
        #[arg(short, long)]
        interactive: bool,
        /// Use this VM id instead of allocating one
        #[arg(long)]
        id: Option<u32>,
        name: String,
    },
    /// Initialize an existing node without cloning it
    Install {
        #[arg(long)]
        post_init_script: Option<PathBuf>,
        #[arg(short, long)]
        interactive: bool,
        name: String,
    },
    /// Provision a cluster; the first name is the master
    Provision {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Join already provisioned nodes; the first name is the master
    Configure {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Upload a file or directory to one node
    Upload {
        name: String,
        source: PathBuf,
        dest: String,
    },
    /// Sync a file or directory to every VM
    UploadEverywhere { source: PathBuf, dest: String },
    /// Power on a VM
    Start { name: String },
    /// Helpers for a single pod running on the cluster
    Pod {
        /// Master node running kubectl
        #[arg(long, default_value = "kb1")]
        master: String,
        /// Pod name
        #[arg(long, default_value = "arch")]
        pod: String,
        /// Pod manifest
        #[arg(long, default_value = "kube_configs/arch.yaml")]
        manifest: PathBuf,
        #[command(subcommand)]
        action: PodAction,
    },
}

#[derive(Subcommand)]
enum PodAction {
    /// Apply the manifest and wait until the pod is scheduled
    Deploy,
    /// Wait for and print the pod's node and address
    Ip,
    /// Delete the manifest's resources
    Delete,
    /// Open a shell inside the pod
    Shell,
    /// Copy a local path into the pod
    Upload { source: PathBuf, dest: String },
    /// Download result files from the pod
    Fetch { dest: PathBuf },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info,forge=debug" };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let ctx = context::Context::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Destroy { by_id, all, names } => {
            commands::destroy::destroy(&ctx, by_id, all, &names).await
        }
        Commands::List => commands::nodes::list(&ctx).await,
        Commands::Ssh { by_id, name } => commands::nodes::ssh(&ctx, by_id, &name).await,
        Commands::ProvisionNode {
            rm,
            post_init_script,
            interactive,
            id,
            name,
        } => {
            commands::provision::provision_node(&ctx, name, id, post_init_script, interactive, rm)
                .await
        }
        Commands::Install {
            post_init_script,
            interactive,
            name,
        } => commands::provision::install(&ctx, &name, post_init_script, interactive).await,
        Commands::Provision { names } => commands::provision::provision(&ctx, names).await,
        Commands::Configure { names } => commands::provision::configure(&ctx, &names).await,
        Commands::Upload { name, source, dest } => {
            commands::nodes::upload(&ctx, &name, &source, &dest).await
        }
        Commands::UploadEverywhere { source, dest } => {
            commands::nodes::upload_everywhere(&ctx, &source, &dest).await
        }
        Commands::Start { name } => commands::nodes::start(&ctx, &name).await,
        Commands::Pod {
            master,
            pod,
            manifest,
            action,
        } => {
            let target = commands::pod::PodTarget::new(pod, manifest);
            let master = ctx.resolve(&master).await?;
            match action {
                PodAction::Deploy => target.deploy(&master).await,
                PodAction::Ip => target.wait_scheduled(&master).await,
                PodAction::Delete => target.delete(&master).await,
                PodAction::Shell => target.shell(&master).await,
                PodAction::Upload { source, dest } => target.upload(&master, &source, &dest).await,
                PodAction::Fetch { dest } => target.fetch(&master, &dest).await,
            }
        }
    }
}
