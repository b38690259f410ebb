// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! VBoxManage controller.
//!
//! Every operation is one or a short sequence of `VBoxManage` invocations.
//! This module owns the CLI syntax; callers only see typed values.
use crate::exec::{Exec, ExecRequest, Program};
use crate::types::*;
use crate::virtualbox::parse;
use crate::vmerr;
use std::{path::Path, sync::Arc, time::Duration};

pub struct VBoxManage {
    exec: Arc<dyn Exec>,
    timeout: Duration,
}

impl VBoxManage {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Self {
            exec,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Sets the per-invocation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn req<I, S>(&self, args: I) -> ExecRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecRequest::new(Program::VBoxManage, args).timeout(self.timeout)
    }

    /// Runs a command and returns stdout; non-zero exits are classified
    /// from stderr, unknown failures become `HypervisorError`.
    async fn run<I, S>(&self, args: I) -> VmResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let out = self.exec.exec(self.req(args)).await?;
        if out.success() {
            return Ok(out.stdout);
        }
        Err(parse::classify_stderr(&out.stderr).unwrap_or_else(|| {
            vmerr!(@e HypervisorError,
                "VBoxManage exited with {:?}: {}",
                out.exit_code,
                out.stderr.trim())
        }))
    }

    async fn run_ok<I, S>(&self, args: I) -> VmResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run(args).await?;
        Ok(())
    }

    /// `createvm` prints `UUID: <uuid>` and `Settings file: '<path>'`.
    fn created_vm_uuid(stdout: &str) -> VmResult<(String, Option<String>)> {
        let mut uuid = None;
        let mut settings = None;
        for line in stdout.lines() {
            if let Some(v) = line.strip_prefix("UUID:") {
                uuid = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("Settings file:") {
                settings = Some(v.trim().trim_matches('\'').to_string());
            }
        }
        match uuid {
            Some(u) => Ok((u, settings)),
            None => vmerr!(AdapterParseError, "createvm printed no UUID")
                .map_err(|e| {
                    e.with_details(serde_json::json!({ "raw": stdout }))
                }),
        }
    }
}

#[async_trait::async_trait]
impl Hypervisor for VBoxManage {
    fn backend_name(&self) -> &'static str { "virtualbox" }

    async fn version(&self) -> VmResult<String> {
        Ok(self.run(["-v"]).await?.trim().to_string())
    }

    async fn list_vms(&self) -> VmResult<Vec<Vm>> {
        parse::parse_vm_list(&self.run(["list", "vms"]).await?)
    }

    async fn list_running_vms(&self) -> VmResult<Vec<Vm>> {
        parse::parse_vm_list(&self.run(["list", "runningvms"]).await?)
    }

    async fn vm_info(&self, id: &str) -> VmResult<VmInfo> {
        let s = self
            .run(["showvminfo", id, "--machinereadable"])
            .await?;
        parse::parse_vm_info(&s)
    }

    async fn vm_state(&self, id: &str) -> VmResult<VmState> {
        Ok(self.vm_info(id).await?.state)
    }

    async fn create_vm(&self, spec: &CreateVmSpec) -> VmResult<String> {
        let stdout = self
            .run([
                "createvm",
                "--name",
                spec.name.as_str(),
                "--ostype",
                spec.os_type.as_str(),
                "--register",
            ])
            .await?;
        let (uuid, settings) = Self::created_vm_uuid(&stdout)?;

        let memory = spec.memory_mb.to_string();
        let cpus = spec.cpu_count.to_string();
        let nic_mode = spec.network_mode.unwrap_or(NetworkMode::Nat).as_arg();
        self.run_ok([
            "modifyvm",
            uuid.as_str(),
            "--memory",
            memory.as_str(),
            "--cpus",
            cpus.as_str(),
            "--nic1",
            nic_mode,
        ])
        .await?;

        if let Some(gb) = spec.disk_size_gb {
            // The disk lives next to the settings file.
            let dir = settings
                .as_deref()
                .and_then(|p| Path::new(p).parent())
                .map(|p| p.to_path_buf())
                .unwrap_or_default();
            let disk_path = dir
                .join(format!("{}.vdi", spec.name))
                .to_string_lossy()
                .into_owned();
            self.create_disk(&disk_path, gb * 1024, "VDI").await?;
            self.run_ok([
                "storagectl",
                uuid.as_str(),
                "--name",
                "SATA",
                "--add",
                "sata",
                "--controller",
                "IntelAhci",
            ])
            .await?;
            self.attach_disk(
                &uuid,
                &StorageAttachment {
                    controller: "SATA".to_string(),
                    port: 0,
                    device: 0,
                    medium: Some(disk_path),
                },
            )
            .await?;
        }
        Ok(uuid)
    }

    async fn delete_vm(&self, id: &str, with_disks: bool) -> VmResult<()> {
        if with_disks {
            self.run_ok(["unregistervm", id, "--delete"]).await
        } else {
            self.run_ok(["unregistervm", id]).await
        }
    }

    async fn clone_vm(
        &self,
        src_id: &str,
        new_name: &str,
        mode: CloneMode,
    ) -> VmResult<String> {
        let mut args = vec![
            "clonevm".to_string(),
            src_id.to_string(),
            "--name".to_string(),
            new_name.to_string(),
            "--register".to_string(),
        ];
        if mode == CloneMode::Linked {
            // Linked clones need a snapshot base.
            args.extend(["--options".into(), "link".into()]);
            args.extend(["--snapshot".into(), "current".into()]);
        }
        self.run_ok(args).await?;
        // clonevm prints no UUID; resolve through the fresh listing.
        let vms = self.list_vms().await?;
        vms.into_iter()
            .find(|v| v.name == new_name)
            .map(|v| v.id)
            .ok_or_else(|| {
                vmerr!(@e HypervisorError,
                    "clone {:?} finished but the VM is not listed",
                    new_name)
            })
    }

    async fn start_vm(&self, id: &str, mode: StartMode) -> VmResult<()> {
        self.run_ok(["startvm", id, "--type", mode.as_arg()]).await
    }

    async fn control_vm(
        &self,
        id: &str,
        action: ControlAction,
    ) -> VmResult<()> {
        self.run_ok(["controlvm", id, action.as_arg()]).await
    }

    async fn take_snapshot(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        live: bool,
    ) -> VmResult<String> {
        let mut args = vec![
            "snapshot".to_string(),
            id.to_string(),
            "take".to_string(),
            name.to_string(),
        ];
        if let Some(d) = description {
            args.extend(["--description".into(), d.into()]);
        }
        if live {
            args.push("--live".into());
        }
        let stdout = self.run(args).await?;
        // "Snapshot taken. UUID: <uuid>"; older builds print nothing, in
        // which case the tree is the source of truth.
        if let Some(p) = stdout.find("UUID:") {
            let uuid = stdout[p + 5..].trim().trim_end_matches('.');
            if !uuid.is_empty() {
                return Ok(uuid.to_string());
            }
        }
        let tree = self.snapshot_tree(id).await?;
        tree.lookup(name).map(|n| n.id.clone()).ok_or_else(|| {
            vmerr!(@e HypervisorError,
                "snapshot {:?} was taken but is not listed",
                name)
        })
    }

    async fn restore_snapshot(
        &self,
        id: &str,
        snapshot: &str,
    ) -> VmResult<()> {
        self.run_ok(["snapshot", id, "restore", snapshot]).await
    }

    async fn delete_snapshot(&self, id: &str, snapshot: &str) -> VmResult<()> {
        self.run_ok(["snapshot", id, "delete", snapshot]).await
    }

    async fn snapshot_tree(&self, id: &str) -> VmResult<SnapshotTree> {
        let out = self
            .exec
            .exec(self.req(["snapshot", id, "list", "--machinereadable"]))
            .await?;
        if out.success() {
            return parse::parse_snapshot_tree(&out.stdout);
        }
        // A snapshot-less VM makes `snapshot list` exit non-zero; that is
        // an empty tree, not a failure.
        if out.stderr.contains("does not have any snapshots")
            || out.stdout.contains("does not have any snapshots")
        {
            return Ok(SnapshotTree::default());
        }
        Err(parse::classify_stderr(&out.stderr).unwrap_or_else(|| {
            vmerr!(@e HypervisorError,
                "VBoxManage exited with {:?}: {}",
                out.exit_code,
                out.stderr.trim())
        }))
    }

    async fn create_disk(
        &self,
        path: &str,
        size_mb: u64,
        format: &str,
    ) -> VmResult<String> {
        let size = size_mb.to_string();
        let stdout = self
            .run([
                "createmedium",
                "disk",
                "--filename",
                path,
                "--size",
                size.as_str(),
                "--format",
                format,
            ])
            .await?;
        // "Medium created. UUID: <uuid>"
        match stdout.find("UUID:") {
            Some(p) => Ok(stdout[p + 5..].trim().to_string()),
            None => vmerr!(AdapterParseError, "createmedium printed no UUID")
                .map_err(|e| {
                    e.with_details(serde_json::json!({ "raw": stdout }))
                }),
        }
    }

    async fn delete_disk(&self, path: &str) -> VmResult<()> {
        self.run_ok(["closemedium", "disk", path, "--delete"]).await
    }

    async fn attach_disk(
        &self,
        id: &str,
        attachment: &StorageAttachment,
    ) -> VmResult<()> {
        let medium = attachment.medium.as_deref().ok_or_else(|| {
            vmerr!(@e InvalidArguments, "attach_disk requires a medium path")
        })?;
        let port = attachment.port.to_string();
        let device = attachment.device.to_string();
        self.run_ok([
            "storageattach",
            id,
            "--storagectl",
            attachment.controller.as_str(),
            "--port",
            port.as_str(),
            "--device",
            device.as_str(),
            "--type",
            "hdd",
            "--medium",
            medium,
        ])
        .await
    }

    async fn detach_disk(
        &self,
        id: &str,
        controller: &str,
        port: u32,
        device: u32,
    ) -> VmResult<()> {
        let port = port.to_string();
        let device = device.to_string();
        self.run_ok([
            "storageattach",
            id,
            "--storagectl",
            controller,
            "--port",
            port.as_str(),
            "--device",
            device.as_str(),
            "--medium",
            "none",
        ])
        .await
    }

    async fn list_disks(&self) -> VmResult<Vec<DiskInfo>> {
        Ok(parse::parse_disk_list(&self.run(["list", "hdds"]).await?))
    }

    async fn list_adapters(&self, id: &str) -> VmResult<Vec<NetworkAdapter>> {
        Ok(self.vm_info(id).await?.network_adapters)
    }

    async fn configure_adapter(
        &self,
        id: &str,
        config: &AdapterConfig,
    ) -> VmResult<()> {
        if config.slot > 7 {
            return vmerr!(
                InvalidArguments,
                "adapter slot {} out of range 0-7",
                config.slot
            );
        }
        // showvminfo numbers slots from 1.
        let n = config.slot + 1;
        let mut args = vec![
            "modifyvm".to_string(),
            id.to_string(),
            format!("--nic{}", n),
            config.mode.as_arg().to_string(),
        ];
        if let Some(att) = &config.attachment {
            let flag = match config.mode {
                NetworkMode::Bridged => Some(format!("--bridgeadapter{}", n)),
                NetworkMode::HostOnly => {
                    Some(format!("--hostonlyadapter{}", n))
                }
                NetworkMode::Internal => Some(format!("--intnet{}", n)),
                NetworkMode::NatNetwork => {
                    Some(format!("--nat-network{}", n))
                }
                _ => None,
            };
            if let Some(flag) = flag {
                args.extend([flag, att.clone()]);
            }
        }
        if let Some(t) = &config.adapter_type {
            args.extend([format!("--nictype{}", n), t.clone()]);
        }
        if let Some(mac) = &config.mac {
            args.extend([format!("--macaddress{}", n), mac.clone()]);
        }
        if let Some(cable) = config.cable_connected {
            args.extend([
                format!("--cableconnected{}", n),
                if cable { "on" } else { "off" }.to_string(),
            ]);
        }
        self.run_ok(args).await
    }

    async fn list_hostonly_ifs(&self) -> VmResult<Vec<HostOnlyIf>> {
        Ok(parse::parse_hostonly_ifs(
            &self.run(["list", "hostonlyifs"]).await?,
        ))
    }

    async fn create_hostonly_if(&self) -> VmResult<String> {
        let stdout = self.run(["hostonlyif", "create"]).await?;
        // "Interface 'vboxnet1' was successfully created"
        let re = regex::Regex::new(r"Interface '([^']+)'").unwrap();
        re.captures(&stdout)
            .map(|c| c[1].to_string())
            .ok_or_else(|| {
                vmerr!(@e AdapterParseError,
                    "hostonlyif create printed no interface name")
                .with_details(serde_json::json!({ "raw": stdout }))
            })
    }

    async fn setup_metrics(&self, id: &str, period_secs: u32) -> VmResult<()> {
        let period = period_secs.to_string();
        self.run_ok([
            "metrics",
            "setup",
            "--period",
            period.as_str(),
            "--samples",
            "1",
            id,
        ])
        .await
    }

    async fn sample_metrics(&self, id: &str) -> VmResult<MetricSample> {
        let stdout = self
            .run([
                "metrics",
                "query",
                id,
                "CPU/Load/User,CPU/Load/Kernel,RAM/Usage/Used,\
                 Disk/Usage/Read,Disk/Usage/Written,Net/Rate/Rx,Net/Rate/Tx",
            ])
            .await?;
        parse::parse_metrics(&stdout, id)
    }

    async fn host_info(&self) -> VmResult<HostInfo> {
        let version = self.version().await.ok();
        let stdout = self.run(["list", "hostinfo"]).await?;
        parse::parse_host_info(&stdout, version)
    }

    async fn os_types(&self) -> VmResult<Vec<OsType>> {
        Ok(parse::parse_os_types(&self.run(["list", "ostypes"]).await?))
    }
}
