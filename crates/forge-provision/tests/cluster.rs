//! End-to-end provisioning against the in-memory hypervisor and scripted
//! remote execution.

use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;

use forge_core::{CancelSignal, ForgeConfig, VmIdentity, cancel_pair};
use forge_hypervisor::testkit::{GatewayCall, InMemoryHypervisor};
use forge_provision::{DestroyOutcome, NodeRequest, ProvisionError, Provisioner};
use forge_remote::testkit::{RemoteCall, ScriptedExec};

const JOIN: &str = "kubeadm join 192.168.1.110:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00";

struct Harness {
    hv: Arc<InMemoryHypervisor>,
    remote: Arc<ScriptedExec>,
    provisioner: Arc<Provisioner>,
    _init: NamedTempFile,
    post_init: NamedTempFile,
}

fn script(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

fn harness(cancel: CancelSignal) -> Harness {
    let hv = Arc::new(
        InMemoryHypervisor::new()
            .with_host("tapir", 8)
            .with_host("zebra", 8)
            .with_offline_host("okapi"),
    );
    hv.add_template("tapir", 9010);
    hv.add_template("zebra", 9011);
    let remote = Arc::new(ScriptedExec::new());

    let init = script("#!/bin/bash\nhostnamectl set-hostname \"$1\"\nreboot\n");
    let post_init = script("#!/bin/sh\necho done\n");

    let mut config = ForgeConfig::default();
    config.hypervisor.templates = [("tapir".to_string(), 9010), ("zebra".to_string(), 9011)]
        .into_iter()
        .collect();
    config.hypervisor.task_poll_interval = "10ms".to_string();
    config.hypervisor.task_timeout = "5s".to_string();
    config.readiness.poll_interval = "10ms".to_string();
    config.readiness.stage_timeout = "5s".to_string();
    config.provision.init_script = init.path().to_path_buf();
    config.provision.reboot_grace = "0s".to_string();
    config.provision.launch_stagger = "10ms".to_string();
    config.validate().unwrap();

    let provisioner =
        Arc::new(Provisioner::new(hv.clone(), remote.clone(), &config, cancel).unwrap());
    Harness {
        hv,
        remote,
        provisioner,
        _init: init,
        post_init,
    }
}

fn address(id: u32) -> IpAddr {
    format!("192.168.1.{}", 10 + id % 200).parse().unwrap()
}

// ── Cluster ───────────────────────────────────────────────────────

#[tokio::test]
async fn three_node_cluster_end_to_end() {
    let h = harness(CancelSignal::never());
    h.remote.respond("token create", 0, &format!("{JOIN}\n"));

    let requests = ["kb1", "kb2", "kb3"].map(NodeRequest::new).to_vec();
    let report = h.provisioner.provision_cluster(requests).await.unwrap();

    assert_eq!(h.hv.clone_calls().len(), 3);

    let mut ids: Vec<u32> = report
        .nodes
        .iter()
        .map(|n| n.identity().unwrap().id)
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| (500..1000).contains(id)));

    let master = report.master().unwrap().identity().unwrap().clone();
    assert_eq!(master.name, "kb1");
    assert_eq!(master.id, 500);

    let token_calls = h.remote.commands_matching("token create");
    assert_eq!(token_calls.len(), 1);
    assert_eq!(token_calls[0].address(), address(master.id));

    let workers = report.workers();
    assert_eq!(workers.len(), 2);
    let joins: Vec<Vec<String>> = workers
        .iter()
        .flat_map(|w| h.hv.agent_commands(w.identity().unwrap().id))
        .collect();
    assert_eq!(joins.len(), 2);
    for join in &joins {
        assert!(join[2].starts_with(JOIN));
        assert!(join[2].ends_with("--cri-socket=unix:///var/run/cri-dockerd.sock"));
    }
    assert!(h.hv.agent_commands(master.id).is_empty());

    // every VM was started and initialized with its own name
    for node in &report.nodes {
        let identity = node.identity().unwrap();
        assert_eq!(h.hv.vm_status(identity.id).as_deref(), Some("running"));
        let init = format!("bash /tmp/init.sh {}", identity.name);
        assert_eq!(h.remote.commands_matching(&init).len(), 1);
    }
}

#[tokio::test]
async fn empty_cluster_is_rejected() {
    let h = harness(CancelSignal::never());
    let err = h.provisioner.provision_cluster(Vec::new()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::NoNodes));
    assert!(h.hv.clone_calls().is_empty());
}

#[tokio::test]
async fn failed_token_stops_before_any_join() {
    let h = harness(CancelSignal::never());
    h.remote.respond("token create", 1, "");

    let requests = ["kb1", "kb2"].map(NodeRequest::new).to_vec();
    let err = h.provisioner.provision_cluster(requests).await.unwrap_err();
    assert!(matches!(err, ProvisionError::TokenFailed { .. }));
    assert!(h.hv.agent_commands(501).is_empty());
}

#[tokio::test]
async fn one_failed_node_does_not_stop_its_siblings() {
    let h = harness(CancelSignal::never());
    h.hv.fail_clone("kb2");

    let requests = ["kb1", "kb2", "kb3"].map(NodeRequest::new).to_vec();
    let err = h.provisioner.provision_nodes(requests).await.unwrap_err();
    match err {
        ProvisionError::NodesFailed(names) => assert_eq!(names, vec!["kb2".to_string()]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.remote.commands_matching("bash /tmp/init.sh kb1").len(), 1);
    assert_eq!(h.remote.commands_matching("bash /tmp/init.sh kb3").len(), 1);
    assert!(h.provisioner.inventory().vm_by_name("kb2").await.unwrap().is_none());
}

// ── Init script ───────────────────────────────────────────────────

#[tokio::test]
async fn accepted_init_exit_codes_continue() {
    for code in [0, 1, 255] {
        let h = harness(CancelSignal::never());
        h.remote.respond("init.sh", code, "");
        let request = NodeRequest::new("kb1").with_post_init_script(h.post_init.path());

        let report = h.provisioner.provision_node(request).await.unwrap();
        assert_eq!(report.identity().unwrap().id, 500);
        assert_eq!(report.address, address(500));
        assert_eq!(h.remote.commands_matching("/tmp/post-init-script").len(), 1);
        let files = h.hv.files_written(500);
        let paths: Vec<&str> = files.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(paths, vec!["/tmp/init.sh", "/tmp/post-init-script"]);
    }
}

#[tokio::test]
async fn rejected_init_exit_code_aborts_and_tears_down() {
    let h = harness(CancelSignal::never());
    h.remote.respond("init.sh", 17, "");
    let request = NodeRequest::new("kb1")
        .with_post_init_script(h.post_init.path())
        .with_teardown(true);

    let err = h.provisioner.provision_node(request).await.unwrap_err();
    assert!(matches!(err, ProvisionError::InitScript { code: 17, .. }));
    assert!(h.remote.commands_matching("/tmp/post-init-script").is_empty());

    assert_eq!(h.hv.vm_status(500), None);
    let calls = h.hv.calls();
    assert!(calls.contains(&GatewayCall::Stop(500)));
    assert!(calls.contains(&GatewayCall::Delete(500)));
    assert!(h.provisioner.inventory().vm_by_id(500).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_post_init_command_is_reported() {
    let h = harness(CancelSignal::never());
    h.remote.respond("/tmp/post-init-script", 2, "");
    let request = NodeRequest::new("kb1").with_post_init_script(h.post_init.path());

    let err = h.provisioner.provision_node(request).await.unwrap_err();
    assert!(matches!(err, ProvisionError::RemoteCommand { code: 2, .. }));
}

// ── Cancellation ──────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_still_tears_down() {
    let (handle, signal) = cancel_pair();
    let h = harness(signal);
    h.hv.set_default_agent_delay(u32::MAX);

    let provisioner = h.provisioner.clone();
    let task = tokio::spawn(async move {
        provisioner
            .provision_node(NodeRequest::new("kb1").with_teardown(true))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(h.hv.vm_status(500), None);
    assert!(h.hv.calls().contains(&GatewayCall::Delete(500)));
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn cancel_during_clone_waits_for_the_lock_before_teardown() {
    let (handle, signal) = cancel_pair();
    let h = harness(signal);
    h.hv.set_task_polls(50);

    let provisioner = h.provisioner.clone();
    let task = tokio::spawn(async move {
        provisioner
            .provision_node(NodeRequest::new("kb1").with_teardown(true))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(h.hv.vm_status(500), None);
    assert!(h.hv.calls().contains(&GatewayCall::Delete(500)));
    assert!(!h.hv.calls().contains(&GatewayCall::Start(500)));
}

#[tokio::test]
async fn cancelled_cluster_is_not_a_node_failure() {
    let (handle, signal) = cancel_pair();
    let h = harness(signal);
    h.hv.set_default_agent_delay(u32::MAX);

    let provisioner = h.provisioner.clone();
    let task = tokio::spawn(async move {
        let requests = ["kb1", "kb2"].map(|n| NodeRequest::new(n).with_teardown(true)).to_vec();
        provisioner.provision_cluster(requests).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ProvisionError::Cancelled(_)));
    assert!(h.hv.vm_ids().iter().all(|id| *id >= 1000));
}

// ── Destroy ───────────────────────────────────────────────────────

#[tokio::test]
async fn destroy_all_is_idempotent() {
    let h = harness(CancelSignal::never());
    h.hv.add_vm("tapir", 600, "old1", "running", 2);
    h.hv.add_vm("zebra", 601, "old2", "stopped", 2);

    let first = h.provisioner.destroy_all().await.unwrap();
    assert!(first.is_success());
    assert_eq!(first.destroyed.len(), 2);
    assert!(first.missing.is_empty());
    assert_eq!(h.hv.vm_ids(), vec![9010, 9011]);

    let second = h.provisioner.destroy_all().await.unwrap();
    assert!(second.destroyed.is_empty());
    assert!(second.failed.is_empty());
}

#[tokio::test]
async fn destroying_a_missing_vm_is_a_no_op() {
    let h = harness(CancelSignal::never());
    h.hv.add_vm("tapir", 600, "old1", "stopped", 2);
    let identity = VmIdentity {
        id: 600,
        name: "old1".to_string(),
        host: "tapir".to_string(),
    };

    assert_eq!(h.provisioner.destroy(&identity).await.unwrap(), DestroyOutcome::Destroyed);
    assert_eq!(h.provisioner.destroy(&identity).await.unwrap(), DestroyOutcome::Missing);
    assert_eq!(
        h.provisioner.destroy_by_name("old1").await.unwrap(),
        DestroyOutcome::Missing
    );
    let deletes = h
        .hv
        .calls()
        .into_iter()
        .filter(|c| *c == GatewayCall::Delete(600))
        .count();
    assert_eq!(deletes, 1);
}

#[tokio::test]
async fn protected_vms_are_never_destroyed() {
    let h = harness(CancelSignal::never());
    let err = h.provisioner.destroy_by_id(9010).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Protected(9010)));
    assert!(h.hv.vm_ids().contains(&9010));
}

#[tokio::test]
async fn explicit_id_is_used() {
    let h = harness(CancelSignal::never());
    let report = h
        .provisioner
        .provision_node(NodeRequest::new("kb7").with_id(742))
        .await
        .unwrap();
    assert_eq!(report.identity().unwrap().id, 742);
    assert!(matches!(
        h.remote.calls().first(),
        Some(RemoteCall::Run { .. })
    ));
}
