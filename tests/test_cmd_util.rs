// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Shared test plumbing: an in-memory `VBoxManage` stand-in.
//!
//! `FakeVBox` implements the executor seam and answers the same argv
//! shapes the real CLI does, against a tiny mutable VM world. Tests drive
//! the full stack (tools, registry, manager, backend) without a
//! hypervisor.
#![allow(dead_code)]
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use vboxmcp::config::{BackendKind, Config};
use vboxmcp::exec::{Exec, ExecOutput, ExecRequest};
use vboxmcp::manager::VmManager;
use vboxmcp::ops::Coordinator;
use vboxmcp::registry::ToolContext;
use vboxmcp::types::{VmError, VmResult};
use vboxmcp::virtualbox::VBoxManage;

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub id: String,
    pub state: String,
    pub snapshots: Vec<(String, String)>, // (name, uuid)
}

#[derive(Default)]
pub struct FakeWorld {
    pub vms: BTreeMap<String, FakeVm>, // keyed by name
    next_id: u64,
    /// Verb -> remaining injected failures, drained one per call.
    fail_once: Vec<(String, String)>,
}

impl FakeWorld {
    fn new_id(&mut self) -> String {
        self.next_id += 1;
        format!(
            "00000000-0000-0000-0000-{:012x}",
            self.next_id
        )
    }
}

pub struct FakeVBox {
    pub world: Arc<Mutex<FakeWorld>>,
    pub calls: Mutex<Vec<Vec<String>>>,
    /// Verb -> artificial latency, for overlap and cancellation tests.
    pub delays: Mutex<Vec<(String, Duration)>>,
}

impl FakeVBox {
    pub fn new() -> Self {
        Self {
            world: Arc::new(Mutex::new(FakeWorld::default())),
            calls: Mutex::new(Vec::new()),
            delays: Mutex::new(Vec::new()),
        }
    }

    pub fn with_vm(self, name: &str, state: &str) -> Self {
        {
            let mut w = self.world.lock().unwrap();
            let id = w.new_id();
            w.vms.insert(
                name.to_string(),
                FakeVm {
                    id,
                    state: state.to_string(),
                    snapshots: vec![],
                },
            );
        }
        self
    }

    pub fn delay(self, verb: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap()
            .push((verb.to_string(), delay));
        self
    }

    /// The next invocation of `verb` fails with this stderr line.
    pub fn fail_once(&self, verb: &str, stderr: &str) {
        self.world
            .lock()
            .unwrap()
            .fail_once
            .push((verb.to_string(), stderr.to_string()));
    }

    pub fn call_count(&self, verb: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some(verb))
            .count()
    }

    pub fn vm_state(&self, name: &str) -> Option<String> {
        self.world
            .lock()
            .unwrap()
            .vms
            .get(name)
            .map(|v| v.state.clone())
    }

    fn find_by_ref(w: &FakeWorld, vm_ref: &str) -> Option<String> {
        w.vms
            .iter()
            .find(|(name, vm)| *name == vm_ref || vm.id == vm_ref)
            .map(|(name, _)| name.clone())
    }

    fn ok(stdout: &str) -> VmResult<ExecOutput> {
        Ok(ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(1),
        })
    }

    fn err(stderr: &str) -> VmResult<ExecOutput> {
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: format!("VBoxManage: error: {}", stderr),
            exit_code: Some(1),
            duration: Duration::from_millis(1),
        })
    }

    fn not_found(vm_ref: &str) -> VmResult<ExecOutput> {
        Self::err(&format!(
            "Could not find a registered machine named '{}'",
            vm_ref
        ))
    }

    fn showvminfo(vm_name: &str, vm: &FakeVm) -> String {
        let mut s = format!(
            "name=\"{}\"\nostype=\"Ubuntu_64\"\nUUID=\"{}\"\nmemory=2048\ncpus=1\nVMState=\"{}\"\n\
             storagecontrollername0=\"SATA\"\nstoragecontrollertype0=\"IntelAhci\"\n\
             nic1=\"nat\"\nmacaddress1=\"080027000001\"\ncableconnected1=\"on\"\n",
            vm_name, vm.id, vm.state
        );
        if let Some((_, uuid)) = vm.snapshots.last() {
            s.push_str(&format!("CurrentSnapshotUUID=\"{}\"\n", uuid));
        }
        s
    }

    fn snapshot_list(vm: &FakeVm) -> VmResult<ExecOutput> {
        if vm.snapshots.is_empty() {
            return Self::err(
                "This machine does not have any snapshots",
            );
        }
        // Flat chain: each snapshot is the child of the previous one.
        let mut out = String::new();
        let mut path = String::new();
        for (i, (name, uuid)) in vm.snapshots.iter().enumerate() {
            out.push_str(&format!(
                "SnapshotName{p}=\"{}\"\nSnapshotUUID{p}=\"{}\"\nSnapshotDescription{p}=\"\"\n",
                name,
                uuid,
                p = path
            ));
            if i + 1 < vm.snapshots.len() {
                path.push_str("-1");
            }
        }
        let (name, uuid) = vm.snapshots.last().unwrap();
        out.push_str(&format!(
            "CurrentSnapshotName=\"{}\"\nCurrentSnapshotUUID=\"{}\"\n",
            name, uuid
        ));
        Self::ok(&out)
    }
}

impl Default for FakeVBox {
    fn default() -> Self { Self::new() }
}

#[async_trait::async_trait]
impl Exec for FakeVBox {
    async fn exec(&self, req: ExecRequest) -> VmResult<ExecOutput> {
        let args = req.args.clone();
        self.calls.lock().unwrap().push(args.clone());
        let verb = args.first().cloned().unwrap_or_default();

        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(v, _)| *v == verb)
            .map(|(_, d)| *d);
        if let Some(d) = delay {
            let cancel = req
                .cancel
                .clone()
                .or_else(vboxmcp::exec::current_cancel_token);
            if let Some(token) = cancel {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(VmError::new(
                            vboxmcp::types::ErrorKind::Cancelled,
                            "subprocess cancelled",
                        ));
                    }
                    _ = tokio::time::sleep(d) => {}
                }
            } else {
                tokio::time::sleep(d).await;
            }
        }

        {
            let mut w = self.world.lock().unwrap();
            if let Some(pos) =
                w.fail_once.iter().position(|(v, _)| *v == verb)
            {
                let (_, stderr) = w.fail_once.remove(pos);
                return Self::err(&stderr);
            }
        }

        let mut w = self.world.lock().unwrap();
        match verb.as_str() {
            "-v" => Self::ok("7.0.14r161095\n"),
            "list" => match args.get(1).map(String::as_str) {
                Some("vms") => {
                    let body: String = w
                        .vms
                        .iter()
                        .map(|(name, vm)| {
                            format!("\"{}\" {{{}}}\n", name, vm.id)
                        })
                        .collect();
                    Self::ok(&body)
                }
                Some("runningvms") => {
                    let body: String = w
                        .vms
                        .iter()
                        .filter(|(_, vm)| vm.state == "running")
                        .map(|(name, vm)| {
                            format!("\"{}\" {{{}}}\n", name, vm.id)
                        })
                        .collect();
                    Self::ok(&body)
                }
                Some("hostinfo") => Self::ok(
                    "Host Information:\n\nProcessor count: 8\nMemory size: 16384 MByte\nOperating system: Linux\n",
                ),
                Some("ostypes") => Self::ok(
                    "ID:          Ubuntu_64\nDescription: Ubuntu (64-bit)\nFamily ID:   Linux\n",
                ),
                Some("hdds") => Self::ok(
                    "UUID:           11111111-0000-0000-0000-000000000001\nLocation:       /vms/a.vdi\nStorage format: VDI\nCapacity:       10240 MBytes\n",
                ),
                Some("hostonlyifs") => Self::ok(
                    "Name:            vboxnet0\nIPAddress:       192.168.56.1\nNetworkMask:     255.255.255.0\n",
                ),
                _ => Self::ok(""),
            },
            "showvminfo" => {
                let vm_ref = args.get(1).cloned().unwrap_or_default();
                match Self::find_by_ref(&w, &vm_ref) {
                    Some(name) => {
                        let vm = w.vms.get(&name).unwrap();
                        Self::ok(&Self::showvminfo(&name, vm))
                    }
                    None => Self::not_found(&vm_ref),
                }
            }
            "startvm" => {
                let vm_ref = args.get(1).cloned().unwrap_or_default();
                let Some(name) = Self::find_by_ref(&w, &vm_ref) else {
                    return Self::not_found(&vm_ref);
                };
                let vm = w.vms.get_mut(&name).unwrap();
                match vm.state.as_str() {
                    "poweroff" | "saved" | "aborted" => {
                        vm.state = "running".to_string();
                        Self::ok("VM has been successfully started.\n")
                    }
                    _ => Self::err(
                        "The machine is already locked by a session (or being locked or unlocked)",
                    ),
                }
            }
            "controlvm" => {
                let vm_ref = args.get(1).cloned().unwrap_or_default();
                let action = args.get(2).cloned().unwrap_or_default();
                let Some(name) = Self::find_by_ref(&w, &vm_ref) else {
                    return Self::not_found(&vm_ref);
                };
                let vm = w.vms.get_mut(&name).unwrap();
                let running = vm.state == "running";
                let paused = vm.state == "paused";
                match action.as_str() {
                    "acpipowerbutton" | "poweroff" if running || paused => {
                        vm.state = "poweroff".to_string();
                        Self::ok("")
                    }
                    "savestate" if running || paused => {
                        vm.state = "saved".to_string();
                        Self::ok("")
                    }
                    "pause" if running => {
                        vm.state = "paused".to_string();
                        Self::ok("")
                    }
                    "resume" if paused => {
                        vm.state = "running".to_string();
                        Self::ok("")
                    }
                    "reset" if running => Self::ok(""),
                    _ => Self::err(&format!(
                        "Machine '{}' is not currently running",
                        name
                    )),
                }
            }
            "createvm" => {
                let name = args
                    .iter()
                    .position(|a| a == "--name")
                    .and_then(|i| args.get(i + 1))
                    .cloned()
                    .unwrap_or_default();
                if w.vms.contains_key(&name) {
                    return Self::err(&format!(
                        "Machine settings file '/vms/{}/{}.vbox' already exists",
                        name, name
                    ));
                }
                let id = w.new_id();
                w.vms.insert(
                    name.clone(),
                    FakeVm {
                        id: id.clone(),
                        state: "poweroff".to_string(),
                        snapshots: vec![],
                    },
                );
                Self::ok(&format!(
                    "Virtual machine '{}' is created and registered.\nUUID: {}\nSettings file: '/vms/{}/{}.vbox'\n",
                    name, id, name, name
                ))
            }
            "unregistervm" => {
                let vm_ref = args.get(1).cloned().unwrap_or_default();
                let Some(name) = Self::find_by_ref(&w, &vm_ref) else {
                    return Self::not_found(&vm_ref);
                };
                w.vms.remove(&name);
                Self::ok("")
            }
            "clonevm" => {
                let src_ref = args.get(1).cloned().unwrap_or_default();
                let new_name = args
                    .iter()
                    .position(|a| a == "--name")
                    .and_then(|i| args.get(i + 1))
                    .cloned()
                    .unwrap_or_default();
                if Self::find_by_ref(&w, &src_ref).is_none() {
                    return Self::not_found(&src_ref);
                }
                let id = w.new_id();
                w.vms.insert(
                    new_name.clone(),
                    FakeVm {
                        id,
                        state: "poweroff".to_string(),
                        snapshots: vec![],
                    },
                );
                Self::ok(&format!(
                    "Machine has been successfully cloned as \"{}\"\n",
                    new_name
                ))
            }
            "snapshot" => {
                let vm_ref = args.get(1).cloned().unwrap_or_default();
                let sub = args.get(2).cloned().unwrap_or_default();
                let Some(name) = Self::find_by_ref(&w, &vm_ref) else {
                    return Self::not_found(&vm_ref);
                };
                match sub.as_str() {
                    "take" => {
                        let snap =
                            args.get(3).cloned().unwrap_or_default();
                        let uuid = w.new_id();
                        let vm = w.vms.get_mut(&name).unwrap();
                        vm.snapshots.push((snap, uuid.clone()));
                        Self::ok(&format!(
                            "Snapshot taken. UUID: {}\n",
                            uuid
                        ))
                    }
                    "list" => {
                        let vm = w.vms.get(&name).unwrap();
                        Self::snapshot_list(vm)
                    }
                    "restore" | "delete" => {
                        let snap =
                            args.get(3).cloned().unwrap_or_default();
                        let vm = w.vms.get_mut(&name).unwrap();
                        let pos = vm.snapshots.iter().position(|(n, u)| {
                            *n == snap || *u == snap
                        });
                        match pos {
                            Some(i) => {
                                if sub == "delete" {
                                    vm.snapshots.remove(i);
                                }
                                Self::ok("")
                            }
                            None => Self::err(&format!(
                                "Could not find a snapshot named '{}'",
                                snap
                            )),
                        }
                    }
                    _ => Self::err("unknown snapshot subcommand"),
                }
            }
            "modifyvm" | "storagectl" | "storageattach" => Self::ok(""),
            "createmedium" => {
                let uuid = w.new_id();
                Self::ok(&format!("Medium created. UUID: {}\n", uuid))
            }
            "closemedium" => Self::ok(""),
            "hostonlyif" => {
                Self::ok("Interface 'vboxnet1' was successfully created\n")
            }
            "metrics" => match args.get(1).map(String::as_str) {
                Some("setup") => Self::ok(""),
                Some("query") => {
                    let vm_ref = args.get(2).cloned().unwrap_or_default();
                    if Self::find_by_ref(&w, &vm_ref).is_none() {
                        return Self::not_found(&vm_ref);
                    }
                    Self::ok(
                        "Object     Metric               Value\n\
                         vm         CPU/Load/User        7.00%\n\
                         vm         CPU/Load/Kernel      1.50%\n\
                         vm         RAM/Usage/Used       524288 kB\n\
                         vm         Net/Rate/Rx          1024 B/s\n\
                         vm         Net/Rate/Tx          512 B/s\n",
                    )
                }
                _ => Self::err("unknown metrics subcommand"),
            },
            _ => Self::err(&format!("unscripted command: {:?}", args)),
        }
    }
}

/// Builds the full stack over a `FakeVBox`.
pub fn build_ctx(fake: FakeVBox) -> (Arc<FakeVBox>, Arc<ToolContext>) {
    let fake = Arc::new(fake);
    let backend = Arc::new(VBoxManage::new(fake.clone()));
    let manager = Arc::new(VmManager::new(backend, Duration::from_secs(10)));
    let coordinator =
        Arc::new(Coordinator::new(manager.clone(), 4, Duration::from_secs(5)));
    let ctx = Arc::new(ToolContext {
        manager,
        coordinator,
        config: Arc::new(test_config()),
    });
    (fake, ctx)
}

pub fn test_config() -> Config {
    Config {
        backend: BackendKind::VirtualBox,
        hypervisor_path: Some("/usr/bin/VBoxManage".into()),
        log_level: log::LevelFilter::Debug,
        default_timeout: Duration::from_secs(10),
        worker_pool_size: 4,
        metric_interval: Duration::from_secs(5),
    }
}
