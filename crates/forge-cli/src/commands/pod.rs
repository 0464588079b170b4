//! Helpers for one pod on the cluster, driven through kubectl on the master.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::bail;
use tracing::info;

use forge_machine::Machine;

use super::nodes::exit_code;

/// Remote staging directory for pod uploads.
const STAGING: &str = "/.upload";

pub struct PodTarget {
    pod: String,
    manifest: PathBuf,
}

impl PodTarget {
    pub fn new(pod: String, manifest: PathBuf) -> Self {
        Self { pod, manifest }
    }

    fn remote_manifest(&self) -> String {
        format!("/{}.yaml", self.pod)
    }

    fn wait_command(&self) -> String {
        format!(
            "while ! (kubectl describe pod {} | grep -E '^Node:|^IP:'); do sleep 1; done",
            self.pod
        )
    }

    fn copy_in_command(&self, dest: &str) -> String {
        format!("kubectl cp {STAGING} default/{}:{dest}; sudo rm -fr {STAGING}", self.pod)
    }

    fn chmod_command(&self, dest: &str) -> String {
        format!("kubectl exec {} -- chmod +x {dest}", self.pod)
    }

    fn shell_command(&self) -> String {
        format!("kubectl exec -ti {} -- bash", self.pod)
    }

    /// Copies result files out of the pod into `./fetch` on the master.
    fn collect_command(&self) -> String {
        let pod = &self.pod;
        format!(
            "rm -rf fetch; mkdir fetch; \
             for f in $(kubectl exec {pod} -- ls | grep -E '\\.(pcap|csv|jsonl)$'); do \
             echo $f; kubectl exec {pod} -- cp $f file; kubectl cp {pod}:file ./file; mv ./file fetch/$f; \
             done"
        )
    }

    pub async fn deploy(&self, master: &Machine) -> anyhow::Result<ExitCode> {
        master.upload(&self.manifest, &self.remote_manifest()).await?;
        run(master, &format!("kubectl apply -f {}", self.remote_manifest())).await?;
        self.wait_scheduled(master).await
    }

    pub async fn wait_scheduled(&self, master: &Machine) -> anyhow::Result<ExitCode> {
        run(master, &self.wait_command()).await?;
        Ok(ExitCode::SUCCESS)
    }

    pub async fn delete(&self, master: &Machine) -> anyhow::Result<ExitCode> {
        master.upload(&self.manifest, &self.remote_manifest()).await?;
        run(master, &format!("kubectl delete -f {}", self.remote_manifest())).await?;
        Ok(ExitCode::SUCCESS)
    }

    pub async fn shell(&self, master: &Machine) -> anyhow::Result<ExitCode> {
        let code = master.interactive(Some(&self.shell_command())).await?;
        Ok(exit_code(code))
    }

    pub async fn upload(&self, master: &Machine, source: &Path, dest: &str) -> anyhow::Result<ExitCode> {
        master.sync_to(source, STAGING, true).await?;
        run(master, &self.copy_in_command(dest)).await?;
        if is_executable(source) {
            run(master, &self.chmod_command(dest)).await?;
        }
        Ok(ExitCode::SUCCESS)
    }

    pub async fn fetch(&self, master: &Machine, dest: &Path) -> anyhow::Result<ExitCode> {
        run(master, &self.collect_command()).await?;
        master.sync_from("./fetch", dest, false).await?;
        info!(dest = %dest.display(), "files downloaded to the fetch directory");
        Ok(ExitCode::SUCCESS)
    }
}

async fn run(master: &Machine, command: &str) -> anyhow::Result<()> {
    let code = master.run_blocking(command).await?;
    if code != 0 {
        bail!("{command:?} on {master} exited with {code}");
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> PodTarget {
        PodTarget::new("arch".to_string(), PathBuf::from("kube_configs/arch.yaml"))
    }

    #[test]
    fn kubectl_commands() {
        let t = target();
        assert_eq!(t.remote_manifest(), "/arch.yaml");
        assert_eq!(
            t.copy_in_command("/root/tool"),
            "kubectl cp /.upload default/arch:/root/tool; sudo rm -fr /.upload"
        );
        assert_eq!(t.shell_command(), "kubectl exec -ti arch -- bash");
        assert!(t.wait_command().starts_with("while ! (kubectl describe pod arch"));
        assert!(t.collect_command().contains("kubectl cp arch:file ./file"));
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(!is_executable(file.path()));
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(file.path()));
    }
}
