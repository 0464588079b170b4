//! Proxmox VE REST client.
//!
//! Talks to `https://<host>:8006/api2/json` with ticket authentication.
//! Responses are wrapped in a `{"data": ...}` envelope; calls that start a
//! task return the task handle as `data`. Failed task-starting calls often
//! still carry a handle in the error body, so those are surfaced as
//! [`TaskRef::Error`] rather than as hard errors.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use forge_core::VmId;
use forge_core::config::HypervisorConfig;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{
    AgentExecStatus, GuestInterface, HostRecord, HypervisorGateway, TaskRef, TaskStatus, VmRecord,
};

/// Authentication ticket issued by `/access/ticket`.
#[derive(Debug, Clone)]
struct Ticket {
    ticket: String,
    csrf_token: String,
}

/// [`HypervisorGateway`] backed by the Proxmox VE API.
pub struct ProxmoxClient {
    client: Client,
    base_url: String,
    user: String,
    password: String,
    ticket: RwLock<Option<Ticket>>,
}

// ── Wire types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Debug, Deserialize)]
struct NodeItem {
    node: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct NodeStatusData {
    cpuinfo: CpuInfo,
}

#[derive(Debug, Deserialize)]
struct CpuInfo {
    cpus: u32,
}

#[derive(Debug, Deserialize)]
struct ClusterResource {
    #[serde(default)]
    vmid: Option<VmId>,
}

#[derive(Debug, Deserialize)]
struct QemuItem {
    vmid: VmId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    cpus: u32,
}

#[derive(Debug, Deserialize)]
struct TaskItem {
    upid: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusData {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecData {
    pid: u64,
}

#[derive(Debug, Deserialize)]
struct ExecStatusData {
    #[serde(default)]
    exited: Value,
    #[serde(default)]
    exitcode: Option<i32>,
    #[serde(default)]
    signal: Option<i32>,
    #[serde(rename = "out-data", default)]
    out_data: Option<String>,
    #[serde(rename = "err-data", default)]
    err_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentResult<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct InterfaceData {
    name: String,
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<IpAddressData>,
}

#[derive(Debug, Deserialize)]
struct IpAddressData {
    #[serde(rename = "ip-address")]
    ip_address: String,
}

// ── Client ────────────────────────────────────────────────────────

impl ProxmoxClient {
    /// Build a client and log in.
    pub async fn connect(config: &HypervisorConfig, password: String) -> GatewayResult<Self> {
        let timeout = config
            .request_timeout()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let client = build_client(config.verify_tls, timeout)?;
        let base_url = format!("https://{}:{}/api2/json", config.api_host, config.port);
        let proxmox = Self {
            client,
            base_url,
            user: config.user.clone(),
            password,
            ticket: RwLock::new(None),
        };
        proxmox.login().await?;
        info!(host = %config.api_host, user = %config.user, "connected to hypervisor API");
        Ok(proxmox)
    }

    async fn login(&self) -> GatewayResult<Ticket> {
        let url = format!("{}/access/ticket", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[("username", self.user.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(GatewayError::Auth(format!(
                "{} for user {}",
                response.status(),
                self.user
            )));
        }
        let body: Envelope<TicketData> = response.json().await.map_err(decode)?;
        let ticket = Ticket {
            ticket: body.data.ticket,
            csrf_token: body.data.csrf_token,
        };
        *self.ticket.write().await = Some(ticket.clone());
        debug!(user = %self.user, "hypervisor ticket acquired");
        Ok(ticket)
    }

    async fn current_ticket(&self) -> GatewayResult<Ticket> {
        if let Some(ticket) = self.ticket.read().await.clone() {
            return Ok(ticket);
        }
        self.login().await
    }

    fn authorize(&self, builder: RequestBuilder, method: &Method, ticket: &Ticket) -> RequestBuilder {
        let builder = builder.header("Cookie", format!("PVEAuthCookie={}", ticket.ticket));
        if *method == Method::GET {
            builder
        } else {
            builder.header("CSRFPreventionToken", &ticket.csrf_token)
        }
    }

    /// Send a request, re-authenticating once on 401.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        form: &[(&str, String)],
    ) -> GatewayResult<(StatusCode, String)> {
        let url = format!("{}{}", self.base_url, path);
        let mut ticket = self.current_ticket().await?;

        for attempt in 0..2 {
            let mut builder = self.client.request(method.clone(), &url);
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if !form.is_empty() {
                builder = builder.form(form);
            }
            let response = self
                .authorize(builder, &method, &ticket)
                .send()
                .await
                .map_err(transport)?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!(%path, "ticket rejected, logging in again");
                ticket = self.login().await?;
                continue;
            }
            let body = response.text().await.map_err(transport)?;
            debug!(%method, %path, status = status.as_u16(), "hypervisor API call");
            return Ok((status, body));
        }
        Err(GatewayError::Auth(format!("ticket rejected for {path}")))
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> GatewayResult<T> {
        let (status, body) = self.send(Method::GET, path, query, &[]).await?;
        parse_data(status, &body)
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> GatewayResult<T> {
        let (status, body) = self.send(Method::POST, path, &[], form).await?;
        parse_data(status, &body)
    }

    /// A call that starts a task.
    async fn task_call(
        &self,
        method: Method,
        path: &str,
        form: &[(&str, String)],
    ) -> GatewayResult<TaskRef> {
        let (status, body) = self.send(method, path, &[], form).await?;
        task_ref(status, &body)
    }
}

fn build_client(verify_tls: bool, timeout: Duration) -> GatewayResult<Client> {
    Client::builder()
        .danger_accept_invalid_certs(!verify_tls)
        .timeout(timeout)
        .build()
        .map_err(transport)
}

fn transport(e: reqwest::Error) -> GatewayError {
    GatewayError::Transport(e.to_string())
}

fn decode(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Decode(e.to_string())
}

/// Unwrap the `data` envelope of a successful response.
fn parse_data<T: for<'de> Deserialize<'de>>(status: StatusCode, body: &str) -> GatewayResult<T> {
    if !status.is_success() {
        return Err(api_error(status, body));
    }
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(decode)?;
    Ok(envelope.data)
}

fn api_error(status: StatusCode, body: &str) -> GatewayError {
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("error").to_string()
    } else {
        body.trim().to_string()
    };
    if status == StatusCode::NOT_FOUND || message.contains("does not exist") {
        GatewayError::NotFound(message)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        GatewayError::Auth(message)
    } else {
        GatewayError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

/// Classify the response of a task-starting call.
fn task_ref(status: StatusCode, body: &str) -> GatewayResult<TaskRef> {
    if !status.is_success() {
        if body.contains("UPID:") {
            return Ok(TaskRef::Error {
                text: body.to_string(),
            });
        }
        return Err(api_error(status, body));
    }
    let envelope: Envelope<Value> = serde_json::from_str(body).map_err(decode)?;
    Ok(match envelope.data {
        Value::String(upid) => TaskRef::Handle(upid),
        other => TaskRef::Completed(other),
    })
}

/// Map guest-agent failures to `AgentUnavailable`, the transient case.
fn agent_error(e: GatewayError) -> GatewayError {
    match e {
        GatewayError::Api { status, message } if status >= 500 => {
            GatewayError::AgentUnavailable(message)
        }
        other => other,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

#[async_trait]
impl HypervisorGateway for ProxmoxClient {
    async fn list_hosts(&self) -> GatewayResult<Vec<HostRecord>> {
        let nodes: Vec<NodeItem> = self.get("/nodes", &[]).await?;
        Ok(nodes
            .into_iter()
            .map(|n| HostRecord {
                online: n.status != "offline",
                name: n.node,
            })
            .collect())
    }

    async fn host_cpus(&self, host: &str) -> GatewayResult<u32> {
        let status: NodeStatusData = self.get(&format!("/nodes/{host}/status"), &[]).await?;
        Ok(status.cpuinfo.cpus)
    }

    async fn list_vms(&self, host: &str) -> GatewayResult<Vec<VmRecord>> {
        let vms: Vec<QemuItem> = self.get(&format!("/nodes/{host}/qemu"), &[]).await?;
        Ok(vms
            .into_iter()
            .map(|vm| VmRecord {
                id: vm.vmid,
                name: vm.name,
                status: vm.status,
                cpus: vm.cpus,
            })
            .collect())
    }

    async fn cluster_vm_ids(&self) -> GatewayResult<Vec<VmId>> {
        let resources: Vec<ClusterResource> = self
            .get("/cluster/resources", &[("type", "vm".to_string())])
            .await?;
        Ok(resources.into_iter().filter_map(|r| r.vmid).collect())
    }

    async fn clone_vm(
        &self,
        host: &str,
        template: VmId,
        new_id: VmId,
        name: &str,
    ) -> GatewayResult<TaskRef> {
        self.task_call(
            Method::POST,
            &format!("/nodes/{host}/qemu/{template}/clone"),
            &[("newid", new_id.to_string()), ("name", name.to_string())],
        )
        .await
    }

    async fn start_vm(&self, host: &str, id: VmId) -> GatewayResult<TaskRef> {
        self.task_call(Method::POST, &format!("/nodes/{host}/qemu/{id}/status/start"), &[])
            .await
    }

    async fn stop_vm(&self, host: &str, id: VmId) -> GatewayResult<TaskRef> {
        self.task_call(Method::POST, &format!("/nodes/{host}/qemu/{id}/status/stop"), &[])
            .await
    }

    async fn delete_vm(&self, host: &str, id: VmId) -> GatewayResult<TaskRef> {
        self.task_call(Method::DELETE, &format!("/nodes/{host}/qemu/{id}"), &[])
            .await
    }

    async fn active_tasks(&self, host: &str) -> GatewayResult<Vec<String>> {
        let tasks: Vec<TaskItem> = self
            .get(&format!("/nodes/{host}/tasks"), &[("source", "active".to_string())])
            .await?;
        Ok(tasks.into_iter().map(|t| t.upid).collect())
    }

    async fn task_status(&self, host: &str, upid: &str) -> GatewayResult<TaskStatus> {
        let status: TaskStatusData = self
            .get(&format!("/nodes/{host}/tasks/{upid}/status"), &[])
            .await?;
        Ok(TaskStatus {
            status: status.status,
            exit_status: status.exitstatus,
        })
    }

    async fn agent_info(&self, host: &str, id: VmId) -> GatewayResult<()> {
        self.get::<Value>(&format!("/nodes/{host}/qemu/{id}/agent/info"), &[])
            .await
            .map(|_| ())
            .map_err(agent_error)
    }

    async fn agent_exec(
        &self,
        host: &str,
        id: VmId,
        command: &[String],
        input: Option<&str>,
    ) -> GatewayResult<u64> {
        let mut form: Vec<(&str, String)> = command.iter().map(|c| ("command", c.clone())).collect();
        if let Some(input) = input {
            form.push(("input-data", input.to_string()));
        }
        let exec: ExecData = self
            .post(&format!("/nodes/{host}/qemu/{id}/agent/exec"), &form)
            .await
            .map_err(agent_error)?;
        Ok(exec.pid)
    }

    async fn agent_exec_status(
        &self,
        host: &str,
        id: VmId,
        pid: u64,
    ) -> GatewayResult<AgentExecStatus> {
        let status: ExecStatusData = self
            .get(
                &format!("/nodes/{host}/qemu/{id}/agent/exec-status"),
                &[("pid", pid.to_string())],
            )
            .await
            .map_err(agent_error)?;
        Ok(AgentExecStatus {
            exited: truthy(&status.exited),
            exit_code: status.exitcode,
            signal: status.signal,
            out_data: status.out_data,
            err_data: status.err_data,
        })
    }

    async fn agent_file_write(
        &self,
        host: &str,
        id: VmId,
        path: &str,
        content: &[u8],
    ) -> GatewayResult<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        self.post::<Value>(
            &format!("/nodes/{host}/qemu/{id}/agent/file-write"),
            &[
                ("content", encoded),
                ("file", path.to_string()),
                // Content is already base64.
                ("encode", "0".to_string()),
            ],
        )
        .await
        .map(|_| ())
        .map_err(agent_error)
    }

    async fn agent_network_interfaces(
        &self,
        host: &str,
        id: VmId,
    ) -> GatewayResult<Vec<GuestInterface>> {
        let data: AgentResult<Vec<InterfaceData>> = self
            .get(
                &format!("/nodes/{host}/qemu/{id}/agent/network-get-interfaces"),
                &[],
            )
            .await
            .map_err(agent_error)?;
        Ok(data
            .result
            .into_iter()
            .map(|iface| GuestInterface {
                name: iface.name,
                addresses: iface.ip_addresses.into_iter().map(|a| a.ip_address).collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPID: &str = "UPID:tapir:0003A1F2:01B2C3D4:64F0A1B2:qmclone:9010:root@pam:";

    #[test]
    fn task_ref_from_handle() {
        let body = format!("{{\"data\":\"{UPID}\"}}");
        assert_eq!(
            task_ref(StatusCode::OK, &body).unwrap(),
            TaskRef::Handle(UPID.to_string())
        );
    }

    #[test]
    fn task_ref_from_null_data() {
        let task = task_ref(StatusCode::OK, "{\"data\":null}").unwrap();
        assert_eq!(task, TaskRef::Completed(Value::Null));
    }

    #[test]
    fn task_ref_from_error_body_with_handle() {
        let body = format!("{{\"errors\":{{\"vmid\":\"locked by {UPID}\"}}}}");
        let task = task_ref(StatusCode::INTERNAL_SERVER_ERROR, &body).unwrap();
        assert!(matches!(task, TaskRef::Error { text } if text.contains(UPID)));
    }

    #[test]
    fn task_ref_from_plain_error() {
        let err = task_ref(StatusCode::INTERNAL_SERVER_ERROR, "VM 500 already exists").unwrap_err();
        assert!(matches!(err, GatewayError::Api { status: 500, .. }));
    }

    #[test]
    fn missing_vm_maps_to_not_found() {
        let err = api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Configuration file 'nodes/tapir/qemu-server/501.conf' does not exist",
        );
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn parse_vm_list() {
        let body = r#"{"data":[{"vmid":501,"name":"kb1","status":"running","cpus":4},{"vmid":9010,"status":"stopped"}]}"#;
        let vms: Vec<QemuItem> = parse_data(StatusCode::OK, body).unwrap();
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[0].name, "kb1");
        assert_eq!(vms[1].cpus, 0);
    }

    #[test]
    fn parse_cluster_resources() {
        let body = r#"{"data":[{"id":"qemu/501","vmid":501,"node":"tapir","type":"qemu"},{"id":"lxc/620","vmid":620,"node":"okapi","type":"lxc"}]}"#;
        let resources: Vec<ClusterResource> = parse_data(StatusCode::OK, body).unwrap();
        let ids: Vec<VmId> = resources.into_iter().filter_map(|r| r.vmid).collect();
        assert_eq!(ids, vec![501, 620]);
    }

    #[test]
    fn parse_exec_status_with_integer_flag() {
        let body = r#"{"data":{"exited":1,"exitcode":0,"out-data":"hello\n"}}"#;
        let status: ExecStatusData = parse_data(StatusCode::OK, body).unwrap();
        assert!(truthy(&status.exited));
        assert_eq!(status.exitcode, Some(0));
        assert_eq!(status.out_data.as_deref(), Some("hello\n"));
    }

    #[test]
    fn parse_network_interfaces() {
        let body = r#"{"data":{"result":[
            {"name":"lo","ip-addresses":[{"ip-address":"127.0.0.1","ip-address-type":"ipv4","prefix":8}]},
            {"name":"eth0","ip-addresses":[{"ip-address":"192.168.1.50","ip-address-type":"ipv4","prefix":24}]},
            {"name":"docker0"}
        ]}}"#;
        let data: AgentResult<Vec<InterfaceData>> = parse_data(StatusCode::OK, body).unwrap();
        assert_eq!(data.result.len(), 3);
        assert_eq!(data.result[1].ip_addresses[0].ip_address, "192.168.1.50");
        assert!(data.result[2].ip_addresses.is_empty());
    }

    #[test]
    fn agent_server_errors_are_transient() {
        let err = agent_error(GatewayError::Api {
            status: 500,
            message: "QEMU guest agent is not running".to_string(),
        });
        assert!(matches!(err, GatewayError::AgentUnavailable(_)));
        assert!(err.is_transient());
    }
}
