// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Hyper-V cmdlets controller.
//!
//! The secondary backend: a narrow slice of the `Hypervisor` surface built
//! on `powershell -NoProfile -NonInteractive -Command`. Storage, network
//! and metric operations are not part of its contract and say so.
//!
//! Note: since Windows Server 2012 R2 the cmdlets call snapshots
//! "checkpoints"; the verbs below follow the cmdlet names.
use crate::exec::{Exec, ExecRequest, Program};
use crate::types::*;
use crate::vmerr;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};

/// Escapes an argument for interpolation into a powershell command.
///
/// Surrounds the argument with single quotes and doubles embedded single
/// quotes.
pub fn escape_pwsh<S: AsRef<str>>(s: S) -> String {
    let s = s.as_ref();
    let mut ret = String::with_capacity(s.len() + 2);
    ret.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            ret.push('\'');
        }
        ret.push(ch);
    }
    ret.push('\'');
    ret
}

pub struct HyperVCmd {
    exec: Arc<dyn Exec>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PsVm {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Id")]
    id: PsGuid,
    #[serde(rename = "State")]
    state: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PsGuid {
    Plain(String),
    // `ConvertTo-Json` renders System.Guid as an object with a Guid field.
    Object { #[serde(rename = "Guid")] guid: String },
}

impl PsGuid {
    fn into_string(self) -> String {
        match self {
            Self::Plain(s) => s,
            Self::Object { guid } => guid,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PsSnapshot {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Id")]
    id: PsGuid,
    #[serde(rename = "ParentSnapshotName")]
    parent: Option<String>,
}

impl HyperVCmd {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Self {
            exec,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one powershell command; the UI culture is pinned so the error
    /// phrases below stay matchable.
    async fn run_ps(&self, script: &str) -> VmResult<String> {
        let script = format!(
            "[Threading.Thread]::CurrentThread.CurrentUICulture = 'en-US'; {}",
            script
        );
        let out = self
            .exec
            .exec(
                ExecRequest::new(
                    Program::PowerShell,
                    ["-NoProfile", "-NonInteractive", "-Command", &script],
                )
                .timeout(self.timeout),
            )
            .await?;
        if out.success() && out.stderr.trim().is_empty() {
            return Ok(out.stdout);
        }
        Err(Self::handle_error(out.stderr.trim()))
    }

    fn handle_error(s: &str) -> VmError {
        // Cmdlet errors lead with "<Cmdlet-Name> : <text>".
        let msg = s
            .lines()
            .next()
            .and_then(|l| l.split_once(" : "))
            .map(|(_, m)| m.trim())
            .unwrap_or(s);
        if msg.starts_with("Hyper-V was unable to find a virtual machine") {
            return vmerr!(@e VmNotFound, "{}", msg);
        }
        if msg.starts_with("Unable to find a snapshot matching") {
            return vmerr!(@e VmNotFound, "{}", msg);
        }
        if msg.starts_with(
            "The operation cannot be performed while the virtual machine is",
        ) {
            return vmerr!(@e InvalidState, "{}", msg);
        }
        if msg.contains("already exists") {
            return vmerr!(@e ResourceConflict, "{}", msg);
        }
        if msg.starts_with("Cannot validate argument on parameter") {
            return vmerr!(@e InvalidArguments, "{}", msg);
        }
        vmerr!(@e HypervisorError, "{}", msg)
    }

    /// `ConvertTo-Json` collapses a single element to a bare object.
    fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> VmResult<Vec<T>> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(vec![]);
        }
        let r = if s.starts_with('[') {
            serde_json::from_str::<Vec<T>>(s)
        } else {
            serde_json::from_str::<T>(s).map(|v| vec![v])
        };
        r.map_err(|e| {
            vmerr!(@e AdapterParseError, "unreadable cmdlet JSON: {}", e)
                .with_details(serde_json::json!({ "raw": s }))
        })
    }

    fn state_from_ps(v: &serde_json::Value) -> VmState {
        // `State` is a string without -Compress enum handling, a number
        // otherwise; both spellings appear in the wild.
        match v {
            serde_json::Value::String(s) => match s.as_str() {
                "Running" => VmState::Running,
                "Off" => VmState::PowerOff,
                "Saved" => VmState::Saved,
                "Paused" => VmState::Paused,
                "Starting" => VmState::Starting,
                "Stopping" => VmState::Stopping,
                "Saving" => VmState::Saving,
                _ => VmState::Aborted,
            },
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(2) => VmState::Running,
                Some(3) => VmState::PowerOff,
                Some(6) => VmState::Saved,
                Some(9) => VmState::Paused,
                _ => VmState::Aborted,
            },
            _ => VmState::Aborted,
        }
    }

    fn unsupported(op: &str) -> VmError {
        vmerr!(@e HypervisorError,
            "{} is not supported by the hyperv backend", op)
    }

    async fn get_vm(&self, id: &str) -> VmResult<PsVm> {
        let script = format!(
            "Get-VM -Id {} | Select-Object Name,Id,State | ConvertTo-Json",
            escape_pwsh(id)
        );
        let out = self.run_ps(&script).await?;
        Self::from_json::<PsVm>(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| vmerr!(@e VmNotFound, "no VM with id {:?}", id))
    }

    /// Cmdlets address VMs by name; ids are resolved through `Get-VM -Id`.
    async fn vm_name_arg(&self, id: &str) -> VmResult<String> {
        Ok(escape_pwsh(self.get_vm(id).await?.name))
    }
}

#[async_trait::async_trait]
impl Hypervisor for HyperVCmd {
    fn backend_name(&self) -> &'static str { "hyperv" }

    async fn version(&self) -> VmResult<String> {
        let out = self
            .run_ps("(Get-Module -ListAvailable Hyper-V).Version.ToString()")
            .await?;
        Ok(out.trim().to_string())
    }

    async fn list_vms(&self) -> VmResult<Vec<Vm>> {
        let out = self
            .run_ps("Get-VM | Select-Object Name,Id,State | ConvertTo-Json")
            .await?;
        Ok(Self::from_json::<PsVm>(&out)?
            .into_iter()
            .map(|v| Vm {
                state: Some(Self::state_from_ps(&v.state)),
                id: v.id.into_string(),
                name: v.name,
            })
            .collect())
    }

    async fn list_running_vms(&self) -> VmResult<Vec<Vm>> {
        let mut vms = self.list_vms().await?;
        vms.retain(|v| v.state == Some(VmState::Running));
        Ok(vms)
    }

    async fn vm_info(&self, id: &str) -> VmResult<VmInfo> {
        let script = format!(
            "Get-VM -Id {} | Select-Object Name,Id,State,MemoryStartup,\
             ProcessorCount | ConvertTo-Json",
            escape_pwsh(id)
        );
        let out = self.run_ps(&script).await?;
        #[derive(Deserialize)]
        struct PsVmInfo {
            #[serde(rename = "Name")]
            name: String,
            #[serde(rename = "Id")]
            id: PsGuid,
            #[serde(rename = "State")]
            state: serde_json::Value,
            #[serde(rename = "MemoryStartup")]
            memory_startup: Option<u64>,
            #[serde(rename = "ProcessorCount")]
            processor_count: Option<u32>,
        }
        let info = Self::from_json::<PsVmInfo>(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| vmerr!(@e VmNotFound, "no VM with id {:?}", id))?;
        Ok(VmInfo {
            state: Self::state_from_ps(&info.state),
            id: info.id.into_string(),
            name: info.name,
            // The cmdlets do not track a guest OS type.
            os_type: "Unknown".to_string(),
            memory_mb: info.memory_startup.unwrap_or(0) / (1024 * 1024),
            cpu_count: info.processor_count.unwrap_or(0),
            storage_controllers: vec![],
            network_adapters: vec![],
            current_snapshot: None,
        })
    }

    async fn vm_state(&self, id: &str) -> VmResult<VmState> {
        Ok(Self::state_from_ps(&self.get_vm(id).await?.state))
    }

    async fn create_vm(&self, spec: &CreateVmSpec) -> VmResult<String> {
        let name = escape_pwsh(&spec.name);
        let mut script = format!(
            "New-VM -Name {} -MemoryStartupBytes {}MB | Out-Null; \
             Set-VM -Name {} -ProcessorCount {} | Out-Null;",
            name, spec.memory_mb, name, spec.cpu_count
        );
        if let Some(gb) = spec.disk_size_gb {
            script.push_str(&format!(
                " $vhd = Join-Path (Get-VMHost).VirtualHardDiskPath \
                 ({} + '.vhdx'); \
                 New-VHD -Path $vhd -SizeBytes {}GB -Dynamic | Out-Null; \
                 Add-VMHardDiskDrive -VMName {} -Path $vhd | Out-Null;",
                name, gb, name
            ));
        }
        script.push_str(&format!(" (Get-VM -Name {}).Id.Guid", name));
        let out = self.run_ps(&script).await?;
        let id = out.trim().to_string();
        if id.is_empty() {
            return vmerr!(
                HypervisorError,
                "New-VM finished but printed no id"
            );
        }
        Ok(id)
    }

    async fn delete_vm(&self, id: &str, _with_disks: bool) -> VmResult<()> {
        let name = self.vm_name_arg(id).await?;
        self.run_ps(&format!("Remove-VM -Name {} -Force", name))
            .await?;
        Ok(())
    }

    async fn clone_vm(
        &self,
        _src_id: &str,
        _new_name: &str,
        _mode: CloneMode,
    ) -> VmResult<String> {
        Err(Self::unsupported("clone_vm"))
    }

    async fn start_vm(&self, id: &str, _mode: StartMode) -> VmResult<()> {
        let name = self.vm_name_arg(id).await?;
        self.run_ps(&format!("Start-VM -Name {}", name)).await?;
        Ok(())
    }

    async fn control_vm(
        &self,
        id: &str,
        action: ControlAction,
    ) -> VmResult<()> {
        let name = self.vm_name_arg(id).await?;
        let script = match action {
            ControlAction::AcpiPowerButton => {
                format!("Stop-VM -Name {}", name)
            }
            ControlAction::PowerOff => {
                format!("Stop-VM -Name {} -TurnOff", name)
            }
            ControlAction::SaveState => format!("Save-VM -Name {}", name),
            ControlAction::Reset => {
                format!("Restart-VM -Name {} -Force", name)
            }
            ControlAction::Pause => format!("Suspend-VM -Name {}", name),
            ControlAction::Resume => format!("Resume-VM -Name {}", name),
        };
        self.run_ps(&script).await?;
        Ok(())
    }

    async fn take_snapshot(
        &self,
        id: &str,
        name: &str,
        _description: Option<&str>,
        _live: bool,
    ) -> VmResult<String> {
        let vm = self.vm_name_arg(id).await?;
        let snap = escape_pwsh(name);
        let script = format!(
            "Checkpoint-VM -Name {} -SnapshotName {} | Out-Null; \
             (Get-VMSnapshot -VMName {} -Name {}).Id.Guid",
            vm, snap, vm, snap
        );
        Ok(self.run_ps(&script).await?.trim().to_string())
    }

    async fn restore_snapshot(
        &self,
        id: &str,
        snapshot: &str,
    ) -> VmResult<()> {
        let vm = self.vm_name_arg(id).await?;
        self.run_ps(&format!(
            "Restore-VMCheckpoint -VMName {} -Name {} -Confirm:$false",
            vm,
            escape_pwsh(snapshot)
        ))
        .await?;
        Ok(())
    }

    async fn delete_snapshot(&self, id: &str, snapshot: &str) -> VmResult<()> {
        let vm = self.vm_name_arg(id).await?;
        self.run_ps(&format!(
            "Remove-VMCheckpoint -VMName {} -Name {} -Confirm:$false",
            vm,
            escape_pwsh(snapshot)
        ))
        .await?;
        Ok(())
    }

    async fn snapshot_tree(&self, id: &str) -> VmResult<SnapshotTree> {
        let vm = self.vm_name_arg(id).await?;
        let out = self
            .run_ps(&format!(
                "Get-VMSnapshot -VMName {} | Select-Object Name,Id,\
                 ParentSnapshotName | ConvertTo-Json",
                vm
            ))
            .await?;
        let flat = Self::from_json::<PsSnapshot>(&out)?;
        Ok(build_tree(flat))
    }

    async fn create_disk(
        &self,
        _path: &str,
        _size_mb: u64,
        _format: &str,
    ) -> VmResult<String> {
        Err(Self::unsupported("create_disk"))
    }

    async fn delete_disk(&self, _path: &str) -> VmResult<()> {
        Err(Self::unsupported("delete_disk"))
    }

    async fn attach_disk(
        &self,
        _id: &str,
        _attachment: &StorageAttachment,
    ) -> VmResult<()> {
        Err(Self::unsupported("attach_disk"))
    }

    async fn detach_disk(
        &self,
        _id: &str,
        _controller: &str,
        _port: u32,
        _device: u32,
    ) -> VmResult<()> {
        Err(Self::unsupported("detach_disk"))
    }

    async fn list_disks(&self) -> VmResult<Vec<DiskInfo>> {
        Err(Self::unsupported("list_disks"))
    }

    async fn list_adapters(
        &self,
        _id: &str,
    ) -> VmResult<Vec<NetworkAdapter>> {
        Err(Self::unsupported("list_adapters"))
    }

    async fn configure_adapter(
        &self,
        _id: &str,
        _config: &AdapterConfig,
    ) -> VmResult<()> {
        Err(Self::unsupported("configure_adapter"))
    }

    async fn list_hostonly_ifs(&self) -> VmResult<Vec<HostOnlyIf>> {
        Err(Self::unsupported("list_hostonly_ifs"))
    }

    async fn create_hostonly_if(&self) -> VmResult<String> {
        Err(Self::unsupported("create_hostonly_if"))
    }

    async fn setup_metrics(
        &self,
        _id: &str,
        _period_secs: u32,
    ) -> VmResult<()> {
        Err(Self::unsupported("setup_metrics"))
    }

    async fn sample_metrics(&self, _id: &str) -> VmResult<MetricSample> {
        Err(Self::unsupported("sample_metrics"))
    }

    async fn host_info(&self) -> VmResult<HostInfo> {
        let out = self
            .run_ps(
                "Get-VMHost | Select-Object LogicalProcessorCount,\
                 MemoryCapacity | ConvertTo-Json",
            )
            .await?;
        #[derive(Deserialize)]
        struct PsHost {
            #[serde(rename = "LogicalProcessorCount")]
            cpus: Option<u32>,
            #[serde(rename = "MemoryCapacity")]
            memory: Option<u64>,
        }
        let h = Self::from_json::<PsHost>(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                vmerr!(@e AdapterParseError, "Get-VMHost printed nothing")
            })?;
        Ok(HostInfo {
            cpu_count: h.cpus.unwrap_or(0),
            memory_mb: h.memory.unwrap_or(0) / (1024 * 1024),
            os: Some("Windows".to_string()),
            hypervisor_version: self.version().await.ok(),
        })
    }

    async fn os_types(&self) -> VmResult<Vec<OsType>> {
        // Generation is the closest notion the cmdlets have.
        Ok(vec![
            OsType {
                id: "Generation1".to_string(),
                description: "Hyper-V generation 1 VM".to_string(),
                family: None,
            },
            OsType {
                id: "Generation2".to_string(),
                description: "Hyper-V generation 2 VM".to_string(),
                family: None,
            },
        ])
    }
}

/// Rebuilds the checkpoint tree from the flat parent-name listing.
fn build_tree(flat: Vec<PsSnapshot>) -> SnapshotTree {
    fn attach(
        nodes: &[(String, Option<String>, String)],
        parent: Option<&str>,
    ) -> Vec<SnapshotNode> {
        nodes
            .iter()
            .filter(|(_, p, _)| p.as_deref() == parent)
            .map(|(name, _, id)| SnapshotNode {
                id: id.clone(),
                name: name.clone(),
                description: None,
                children: attach(nodes, Some(name)),
            })
            .collect()
    }
    let nodes: Vec<(String, Option<String>, String)> = flat
        .into_iter()
        .map(|s| (s.name, s.parent, s.id.into_string()))
        .collect();
    let mut roots = attach(&nodes, None);
    SnapshotTree {
        root: if roots.is_empty() {
            None
        } else {
            Some(roots.remove(0))
        },
        current: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_pwsh_doubles_single_quotes() {
        assert_eq!("''''''''", escape_pwsh("'''"));
        assert_eq!("'MSEdge - Win10'", escape_pwsh("MSEdge - Win10"));
        assert_eq!(
            "'MSEdge - Win10'';calc.exe #'",
            escape_pwsh("MSEdge - Win10';calc.exe #")
        );
    }

    #[test]
    fn cmdlet_error_phrases_classify() {
        let e = HyperVCmd::handle_error(
            "Get-VM : Hyper-V was unable to find a virtual machine with name \"x\".",
        );
        assert_eq!(e.kind, ErrorKind::VmNotFound);
        let e = HyperVCmd::handle_error(
            "Start-VM : The operation cannot be performed while the virtual machine is in its current state.",
        );
        assert_eq!(e.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn json_single_object_becomes_one_element() {
        let v: Vec<PsVm> = HyperVCmd::from_json(
            r#"{"Name":"w10","Id":{"Guid":"abc"},"State":"Running"}"#,
        )
        .unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].name, "w10");
    }

    #[test]
    fn checkpoint_tree_rebuilds_from_parent_names() {
        let tree = build_tree(vec![
            PsSnapshot {
                name: "base".into(),
                id: PsGuid::Plain("1".into()),
                parent: None,
            },
            PsSnapshot {
                name: "child".into(),
                id: PsGuid::Plain("2".into()),
                parent: Some("base".into()),
            },
        ]);
        let root = tree.root.unwrap();
        assert_eq!(root.name, "base");
        assert_eq!(root.children[0].name, "child");
    }
}
