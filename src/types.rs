// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Shared types: the error taxonomy, VM entities and the backend trait.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr, time::Duration};

/// Stable error kinds surfaced to MCP clients.
///
/// The wire names are part of the tool contract; adding a kind is fine,
/// renaming one is a breaking change.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub enum ErrorKind {
    InvalidArguments,
    ToolNotFound,
    InvalidAction,
    VmNotFound,
    InvalidState,
    ResourceConflict,
    Timeout,
    Cancelled,
    HypervisorError,
    AdapterParseError,
    BinaryNotFound,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The one error type of the service.
///
/// `AdapterParseError` is logged where it happens and reaches clients as
/// `HypervisorError`; everything else passes through unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct VmError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl VmError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Wraps a programmer error with a correlation id that also lands in the
    /// stderr log, so an operator can match the two.
    pub fn internal<S: fmt::Display>(message: S) -> Self {
        let correlation_id = format!("{:08x}", rand::random::<u32>());
        log::error!("[{}] internal error: {}", correlation_id, message);
        Self::new(
            ErrorKind::Internal,
            format!("internal error (correlation id {})", correlation_id),
        )
        .with_details(serde_json::json!({ "correlation_id": correlation_id }))
    }

    pub fn is_retriable(&self) -> bool {
        self.kind == ErrorKind::ResourceConflict
            && self.message.contains("session")
    }

    /// Client-facing envelope, serialized into the MCP text content block.
    pub fn to_envelope(&self) -> Value {
        let mut v = serde_json::json!({
            "error_kind": self.public_kind(),
            "message": self.message,
        });
        if let Some(d) = &self.details {
            v["details"] = d.clone();
        }
        v
    }

    fn public_kind(&self) -> ErrorKind {
        match self.kind {
            ErrorKind::AdapterParseError => ErrorKind::HypervisorError,
            k => k,
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;

/// `vmerr!(Kind, "fmt", ..)` builds an `Err(VmError)`;
/// `vmerr!(@e Kind, "fmt", ..)` builds the bare error value.
#[macro_export]
macro_rules! vmerr {
    (@e $kind:ident, $($arg:tt)*) => {
        $crate::types::VmError::new(
            $crate::types::ErrorKind::$kind,
            format!($($arg)*),
        )
    };
    ($kind:ident, $($arg:tt)*) => {
        Err($crate::vmerr!(@e $kind, $($arg)*))
    };
}

/// VM power state, VirtualBox dialect.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    PowerOff,
    Saved,
    Aborted,
    Running,
    Paused,
    Stuck,
    Starting,
    Stopping,
    Saving,
    Restoring,
}

impl VmState {
    /// Transient states are observed while a commanded transition settles;
    /// they are never a valid polling end point.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Stopping | Self::Saving | Self::Restoring
        )
    }

    pub fn is_stable(&self) -> bool { !self.is_transient() }

    pub fn is_running(&self) -> bool { *self == Self::Running }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PowerOff => "poweroff",
            Self::Saved => "saved",
            Self::Aborted => "aborted",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stuck => "stuck",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Saving => "saving",
            Self::Restoring => "restoring",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = VmError;

    /// Accepts the `VMState` spellings of `showvminfo --machinereadable`.
    fn from_str(s: &str) -> VmResult<Self> {
        Ok(match s {
            "poweroff" => Self::PowerOff,
            "saved" => Self::Saved,
            "aborted" => Self::Aborted,
            "running" => Self::Running,
            "paused" => Self::Paused,
            // VBoxManage reports a wedged VM as "gurumeditation".
            "stuck" | "gurumeditation" => Self::Stuck,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            "saving" => Self::Saving,
            "restoring" => Self::Restoring,
            _ => {
                return vmerr!(
                    AdapterParseError,
                    "unknown VM state: {:?}",
                    s
                )
            }
        })
    }
}

/// One row of `list vms` / `list runningvms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub name: String,
    pub state: Option<VmState>,
}

/// Full configuration read back from the hypervisor on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub os_type: String,
    pub memory_mb: u64,
    pub cpu_count: u32,
    pub storage_controllers: Vec<StorageController>,
    pub network_adapters: Vec<NetworkAdapter>,
    pub current_snapshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageController {
    pub name: String,
    pub bus: String,
    pub attachments: Vec<StorageAttachment>,
}

/// `(controller, port, device)` pointing at a medium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageAttachment {
    pub controller: String,
    pub port: u32,
    pub device: u32,
    pub medium: Option<String>,
}

/// A registered disk image, one row of `list hdds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub uuid: String,
    pub path: String,
    pub format: Option<String>,
    pub size_mb: Option<u64>,
    pub state: Option<String>,
}

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Nat,
    Bridged,
    HostOnly,
    Internal,
    NatNetwork,
    None,
}

impl NetworkMode {
    /// The `modifyvm --nicN` argument spelling.
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Bridged => "bridged",
            Self::HostOnly => "hostonly",
            Self::Internal => "intnet",
            Self::NatNetwork => "natnetwork",
            Self::None => "none",
        }
    }
}

impl FromStr for NetworkMode {
    type Err = VmError;

    fn from_str(s: &str) -> VmResult<Self> {
        Ok(match s {
            "nat" => Self::Nat,
            "bridged" => Self::Bridged,
            "hostonly" => Self::HostOnly,
            "intnet" | "internal" => Self::Internal,
            "natnetwork" => Self::NatNetwork,
            "none" | "null" => Self::None,
            _ => {
                return vmerr!(
                    AdapterParseError,
                    "unknown network mode: {:?}",
                    s
                )
            }
        })
    }
}

/// Adapter slot 0-7 with its mode and mode-specific attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAdapter {
    pub slot: u8,
    pub mode: NetworkMode,
    pub adapter_type: Option<String>,
    pub mac: Option<String>,
    /// Bridged interface, host-only interface or internal network name,
    /// depending on the mode.
    pub attachment: Option<String>,
    pub cable_connected: bool,
}

/// Host-only interface, one block of `list hostonlyifs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostOnlyIf {
    pub name: String,
    pub ip: Option<String>,
    pub netmask: Option<String>,
}

/// One node of a VM's snapshot tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub children: Vec<SnapshotNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTree {
    pub root: Option<SnapshotNode>,
    /// UUID of the snapshot the `current` pointer sits on.
    pub current: Option<String>,
}

impl SnapshotTree {
    pub fn find<'a>(
        node: &'a SnapshotNode,
        name_or_id: &str,
    ) -> Option<&'a SnapshotNode> {
        if node.id == name_or_id || node.name == name_or_id {
            return Some(node);
        }
        node.children
            .iter()
            .find_map(|c| Self::find(c, name_or_id))
    }

    pub fn lookup(&self, name_or_id: &str) -> Option<&SnapshotNode> {
        self.root
            .as_ref()
            .and_then(|r| Self::find(r, name_or_id))
    }
}

/// One tick of the metric poll loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub vm_id: String,
    pub timestamp_ms: u64,
    pub cpu_pct: f64,
    pub mem_used_mb: u64,
    pub disk_read_bps: u64,
    pub disk_write_bps: u64,
    pub net_rx_bps: u64,
    pub net_tx_bps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub os: Option<String>,
    pub hypervisor_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsType {
    pub id: String,
    pub description: String,
    pub family: Option<String>,
}

/// Everything `create_vm` needs; network defaults to NAT on slot 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmSpec {
    pub name: String,
    pub os_type: String,
    pub memory_mb: u64,
    pub cpu_count: u32,
    pub disk_size_gb: Option<u64>,
    pub network_mode: Option<NetworkMode>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    Headless,
    Gui,
    Separate,
}

impl StartMode {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Headless => "headless",
            Self::Gui => "gui",
            Self::Separate => "separate",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopStyle {
    Acpi,
    Force,
    Save,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneMode {
    Full,
    Linked,
}

/// `controlvm` verbs the service issues.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ControlAction {
    AcpiPowerButton,
    PowerOff,
    SaveState,
    Reset,
    Pause,
    Resume,
}

impl ControlAction {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::AcpiPowerButton => "acpipowerbutton",
            Self::PowerOff => "poweroff",
            Self::SaveState => "savestate",
            Self::Reset => "reset",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

/// Field bundle for `configure_adapter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub slot: u8,
    pub mode: NetworkMode,
    pub attachment: Option<String>,
    pub adapter_type: Option<String>,
    pub mac: Option<String>,
    pub cable_connected: Option<bool>,
}

/// The typed VM management surface both backends implement.
///
/// Implementations translate each operation into one or more CLI
/// invocations and parse the output; they hold no VM state of their own.
/// All identifiers are canonical hypervisor ids; name resolution happens
/// in the manager above.
#[async_trait::async_trait]
pub trait Hypervisor: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn version(&self) -> VmResult<String>;
    async fn list_vms(&self) -> VmResult<Vec<Vm>>;
    async fn list_running_vms(&self) -> VmResult<Vec<Vm>>;
    async fn vm_info(&self, id: &str) -> VmResult<VmInfo>;
    async fn vm_state(&self, id: &str) -> VmResult<VmState>;

    async fn create_vm(&self, spec: &CreateVmSpec) -> VmResult<String>;
    async fn delete_vm(&self, id: &str, with_disks: bool) -> VmResult<()>;
    async fn clone_vm(
        &self,
        src_id: &str,
        new_name: &str,
        mode: CloneMode,
    ) -> VmResult<String>;
    async fn start_vm(&self, id: &str, mode: StartMode) -> VmResult<()>;
    async fn control_vm(
        &self,
        id: &str,
        action: ControlAction,
    ) -> VmResult<()>;

    async fn take_snapshot(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        live: bool,
    ) -> VmResult<String>;
    async fn restore_snapshot(&self, id: &str, snapshot: &str) -> VmResult<()>;
    async fn delete_snapshot(&self, id: &str, snapshot: &str) -> VmResult<()>;
    async fn snapshot_tree(&self, id: &str) -> VmResult<SnapshotTree>;

    async fn create_disk(
        &self,
        path: &str,
        size_mb: u64,
        format: &str,
    ) -> VmResult<String>;
    async fn delete_disk(&self, path: &str) -> VmResult<()>;
    async fn attach_disk(
        &self,
        id: &str,
        attachment: &StorageAttachment,
    ) -> VmResult<()>;
    async fn detach_disk(
        &self,
        id: &str,
        controller: &str,
        port: u32,
        device: u32,
    ) -> VmResult<()>;
    async fn list_disks(&self) -> VmResult<Vec<DiskInfo>>;

    async fn list_adapters(&self, id: &str) -> VmResult<Vec<NetworkAdapter>>;
    async fn configure_adapter(
        &self,
        id: &str,
        config: &AdapterConfig,
    ) -> VmResult<()>;
    async fn list_hostonly_ifs(&self) -> VmResult<Vec<HostOnlyIf>>;
    async fn create_hostonly_if(&self) -> VmResult<String>;

    async fn setup_metrics(&self, id: &str, period_secs: u32) -> VmResult<()>;
    async fn sample_metrics(&self, id: &str) -> VmResult<MetricSample>;

    async fn host_info(&self) -> VmResult<HostInfo>;
    async fn os_types(&self) -> VmResult<Vec<OsType>>;
}

/// Timeout applied to an adapter-level wait when the caller gives none.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parses_machinereadable_spellings() {
        assert_eq!("poweroff".parse::<VmState>(), Ok(VmState::PowerOff));
        assert_eq!("gurumeditation".parse::<VmState>(), Ok(VmState::Stuck));
        assert_eq!("restoring".parse::<VmState>(), Ok(VmState::Restoring));
        assert!("teleported".parse::<VmState>().is_err());
    }

    #[test]
    fn transient_states_are_not_stable() {
        for s in [
            VmState::Starting,
            VmState::Stopping,
            VmState::Saving,
            VmState::Restoring,
        ] {
            assert!(s.is_transient());
            assert!(!s.is_stable());
        }
        assert!(VmState::PowerOff.is_stable());
        assert!(VmState::Running.is_stable());
    }

    #[test]
    fn parse_error_surfaces_as_hypervisor_error() {
        let e = vmerr!(@e AdapterParseError, "bad payload");
        assert_eq!(
            e.to_envelope()["error_kind"],
            serde_json::json!("HypervisorError")
        );
        let e = vmerr!(@e VmNotFound, "no such VM");
        assert_eq!(
            e.to_envelope()["error_kind"],
            serde_json::json!("VmNotFound")
        );
    }

    #[test]
    fn snapshot_tree_lookup_descends() {
        let tree = SnapshotTree {
            root: Some(SnapshotNode {
                id: "a".into(),
                name: "base".into(),
                description: None,
                children: vec![SnapshotNode {
                    id: "b".into(),
                    name: "child".into(),
                    description: None,
                    children: vec![],
                }],
            }),
            current: Some("b".into()),
        };
        assert_eq!(tree.lookup("child").unwrap().id, "b");
        assert_eq!(tree.lookup("a").unwrap().name, "base");
        assert!(tree.lookup("missing").is_none());
    }

    #[test]
    fn error_envelope_carries_details() {
        let e = vmerr!(@e Timeout, "operation exceeded 120s")
            .with_details(serde_json::json!({"stdout_partial": "x"}));
        let v = e.to_envelope();
        assert_eq!(v["error_kind"], "Timeout");
        assert_eq!(v["details"]["stdout_partial"], "x");
    }
}
