// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Parsers for `VBoxManage` output.
//!
//! Machine-readable output (`key="value"` lines) is preferred wherever the
//! CLI offers it; the block-style listings (`list hdds`, `list hostonlyifs`,
//! `list ostypes`, `list hostinfo`) only exist in human form and are parsed
//! best-effort. Unrecognized keys are ignored; a missing required key is an
//! `AdapterParseError` carrying the raw payload.
use crate::types::*;
use crate::vmerr;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Parsed `--machinereadable` output: ordered pairs plus the raw payload
/// for diagnostics.
pub struct MachineReadable {
    raw: String,
    pairs: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl MachineReadable {
    pub fn parse(s: &str) -> Self {
        let mut pairs = Vec::new();
        let mut index = HashMap::new();
        for line in s.lines() {
            let line = line.trim_end_matches('\r');
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let k = unquote(k).to_string();
            let v = unquote(v).to_string();
            index.insert(k.clone(), pairs.len());
            pairs.push((k, v));
        }
        Self {
            raw: s.to_string(),
            pairs,
            index,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&i| self.pairs[i].1.as_str())
    }

    pub fn require(&self, key: &str) -> VmResult<&str> {
        self.get(key).ok_or_else(|| {
            vmerr!(@e AdapterParseError, "missing key {:?}", key)
                .with_details(serde_json::json!({ "raw": self.raw }))
        })
    }

    pub fn pairs(&self) -> &[(String, String)] { &self.pairs }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// `list vms` / `list runningvms`: one `"name" {uuid}` line per VM.
pub fn parse_vm_list(s: &str) -> VmResult<Vec<Vm>> {
    let mut out = Vec::new();
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // The name may contain spaces; the uuid never does.
        let Some((name_part, id_part)) = line.rsplit_once(' ') else {
            return vmerr!(AdapterParseError, "unrecognized vm line")
                .map_err(|e| e.with_details(serde_json::json!({ "raw": line })));
        };
        let name = name_part.trim();
        let name = if name.len() >= 2 && name.starts_with('"') {
            &name[1..name.len() - 1]
        } else {
            name
        };
        let id = id_part.trim().trim_matches(|c| c == '{' || c == '}');
        out.push(Vm {
            id: id.to_string(),
            name: name.to_string(),
            state: None,
        });
    }
    Ok(out)
}

/// `showvminfo --machinereadable`.
pub fn parse_vm_info(s: &str) -> VmResult<VmInfo> {
    let mr = MachineReadable::parse(s);
    let state: VmState = mr.require("VMState")?.parse()?;
    let memory_mb = mr
        .require("memory")?
        .parse::<u64>()
        .map_err(|_| bad_num(&mr, "memory"))?;
    let cpu_count = mr
        .require("cpus")?
        .parse::<u32>()
        .map_err(|_| bad_num(&mr, "cpus"))?;
    Ok(VmInfo {
        id: mr.require("UUID")?.to_string(),
        name: mr.require("name")?.to_string(),
        state,
        os_type: mr.require("ostype")?.to_string(),
        memory_mb,
        cpu_count,
        storage_controllers: parse_storage(&mr),
        network_adapters: parse_nics(&mr),
        current_snapshot: mr.get("CurrentSnapshotUUID").map(str::to_string),
    })
}

fn bad_num(mr: &MachineReadable, key: &str) -> VmError {
    vmerr!(@e AdapterParseError, "key {:?} is not a number", key)
        .with_details(serde_json::json!({ "raw": mr.raw }))
}

/// Storage controllers and their `name-port-device` attachment keys.
fn parse_storage(mr: &MachineReadable) -> Vec<StorageController> {
    let mut controllers = Vec::new();
    for i in 0..u32::MAX {
        let Some(name) = mr.get(&format!("storagecontrollername{}", i)) else {
            break;
        };
        let bus = mr
            .get(&format!("storagecontrollertype{}", i))
            .unwrap_or("unknown")
            .to_string();
        let mut attachments = Vec::new();
        for (k, v) in mr.pairs() {
            let Some(rest) = k.strip_prefix(name) else {
                continue;
            };
            // "<controller>-<port>-<device>"; skip "<controller>-ImageUUID-…".
            let mut it = rest.strip_prefix('-').unwrap_or("").splitn(2, '-');
            let (Some(port), Some(device)) = (it.next(), it.next()) else {
                continue;
            };
            let (Ok(port), Ok(device)) =
                (port.parse::<u32>(), device.parse::<u32>())
            else {
                continue;
            };
            if v == "none" {
                continue;
            }
            attachments.push(StorageAttachment {
                controller: name.to_string(),
                port,
                device,
                medium: if v == "emptydrive" {
                    None
                } else {
                    Some(v.clone())
                },
            });
        }
        controllers.push(StorageController {
            name: name.to_string(),
            bus,
            attachments,
        });
    }
    controllers
}

/// `nic1`..`nic8` and their per-slot companion keys.
fn parse_nics(mr: &MachineReadable) -> Vec<NetworkAdapter> {
    let mut out = Vec::new();
    for slot in 1u8..=8 {
        let Some(mode_raw) = mr.get(&format!("nic{}", slot)) else {
            continue;
        };
        let Ok(mode) = mode_raw.parse::<NetworkMode>() else {
            // Forward compatibility: an attachment type we don't know is
            // skipped, not fatal.
            continue;
        };
        let attachment = match mode {
            NetworkMode::Bridged => mr.get(&format!("bridgeadapter{}", slot)),
            NetworkMode::HostOnly => {
                mr.get(&format!("hostonlyadapter{}", slot))
            }
            NetworkMode::Internal => mr.get(&format!("intnet{}", slot)),
            NetworkMode::NatNetwork => {
                mr.get(&format!("nat-network{}", slot))
            }
            _ => None,
        };
        out.push(NetworkAdapter {
            slot: slot - 1,
            mode,
            adapter_type: mr
                .get(&format!("nictype{}", slot))
                .map(str::to_string),
            mac: mr
                .get(&format!("macaddress{}", slot))
                .map(str::to_string),
            attachment: attachment.map(str::to_string),
            cable_connected: mr
                .get(&format!("cableconnected{}", slot))
                .map(|v| v == "on")
                .unwrap_or(false),
        });
    }
    out
}

/// `snapshot <vm> list --machinereadable`.
///
/// The tree is flattened into suffixed keys: the root is `SnapshotName`,
/// its children `SnapshotName-1`, `SnapshotName-2`, grandchildren
/// `SnapshotName-1-1` and so on.
pub fn parse_snapshot_tree(s: &str) -> VmResult<SnapshotTree> {
    // A VM without snapshots prints a notice instead of key lines.
    if s.contains("does not have any snapshots") {
        return Ok(SnapshotTree::default());
    }
    let mr = MachineReadable::parse(s);
    let root = build_snapshot_node(&mr, "")?;
    if root.is_none() && mr.get("SnapshotName").is_some() {
        return vmerr!(AdapterParseError, "unreadable snapshot list")
            .map_err(|e| e.with_details(serde_json::json!({ "raw": s })));
    }
    Ok(SnapshotTree {
        root,
        current: mr.get("CurrentSnapshotUUID").map(str::to_string),
    })
}

fn build_snapshot_node(
    mr: &MachineReadable,
    path: &str,
) -> VmResult<Option<SnapshotNode>> {
    let Some(name) = mr.get(&format!("SnapshotName{}", path)) else {
        return Ok(None);
    };
    let id = mr.require(&format!("SnapshotUUID{}", path))?.to_string();
    let description = mr
        .get(&format!("SnapshotDescription{}", path))
        .filter(|d| !d.is_empty())
        .map(str::to_string);
    let mut children = Vec::new();
    for n in 1.. {
        let child_path = format!("{}-{}", path, n);
        match build_snapshot_node(mr, &child_path)? {
            Some(c) => children.push(c),
            None => break,
        }
    }
    Ok(Some(SnapshotNode {
        id,
        name: name.to_string(),
        description,
        children,
    }))
}

/// `metrics query <vm> <set>` is column output:
/// `Object  Metric  Value` rows with unit-suffixed values.
pub fn parse_metrics(s: &str, vm_id: &str) -> VmResult<MetricSample> {
    let mut sample = MetricSample {
        vm_id: vm_id.to_string(),
        timestamp_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        cpu_pct: 0.0,
        mem_used_mb: 0,
        disk_read_bps: 0,
        disk_write_bps: 0,
        net_rx_bps: 0,
        net_tx_bps: 0,
    };
    let mut matched = false;
    for line in s.lines().skip_while(|l| l.trim_start().starts_with("Object")) {
        let mut cols = line.split_whitespace();
        let (Some(_object), Some(metric), Some(value)) =
            (cols.next(), cols.next(), cols.next())
        else {
            continue;
        };
        let unit = cols.next().unwrap_or("");
        match metric {
            "CPU/Load/User" | "CPU/Load/Kernel" => {
                sample.cpu_pct += parse_pct(value);
                matched = true;
            }
            "RAM/Usage/Used" => {
                sample.mem_used_mb = parse_kb(value, unit) / 1024;
                matched = true;
            }
            "Disk/Usage/Read" => {
                sample.disk_read_bps = parse_rate(value, unit);
                matched = true;
            }
            "Disk/Usage/Written" => {
                sample.disk_write_bps = parse_rate(value, unit);
                matched = true;
            }
            "Net/Rate/Rx" => {
                sample.net_rx_bps = parse_rate(value, unit);
                matched = true;
            }
            "Net/Rate/Tx" => {
                sample.net_tx_bps = parse_rate(value, unit);
                matched = true;
            }
            // Future metric names pass through silently.
            _ => {}
        }
    }
    if !matched {
        return vmerr!(AdapterParseError, "no metrics in query output")
            .map_err(|e| e.with_details(serde_json::json!({ "raw": s })));
    }
    Ok(sample)
}

fn parse_pct(v: &str) -> f64 {
    v.trim_end_matches('%').parse().unwrap_or(0.0)
}

fn parse_kb(v: &str, unit: &str) -> u64 {
    let n: u64 = v.parse().unwrap_or(0);
    match unit {
        "kB" | "kB/s" => n,
        "MB" => n * 1024,
        _ => n,
    }
}

fn parse_rate(v: &str, unit: &str) -> u64 {
    let n: u64 = v.trim_end_matches("B/s").parse().unwrap_or(0);
    match unit {
        "kB/s" => n * 1024,
        "MB/s" => n * 1024 * 1024,
        _ => n,
    }
}

/// Block-style `list hdds` output.
pub fn parse_disk_list(s: &str) -> Vec<DiskInfo> {
    split_blocks(s)
        .into_iter()
        .filter_map(|b| {
            Some(DiskInfo {
                uuid: b.get("UUID")?.clone(),
                path: b.get("Location")?.clone(),
                format: b.get("Storage format").cloned(),
                size_mb: b
                    .get("Capacity")
                    .and_then(|c| c.split_whitespace().next()?.parse().ok()),
                state: b.get("State").cloned(),
            })
        })
        .collect()
}

/// Block-style `list hostonlyifs` output.
pub fn parse_hostonly_ifs(s: &str) -> Vec<HostOnlyIf> {
    split_blocks(s)
        .into_iter()
        .filter_map(|b| {
            Some(HostOnlyIf {
                name: b.get("Name")?.clone(),
                ip: b.get("IPAddress").cloned(),
                netmask: b.get("NetworkMask").cloned(),
            })
        })
        .collect()
}

/// Block-style `list ostypes` output.
pub fn parse_os_types(s: &str) -> Vec<OsType> {
    split_blocks(s)
        .into_iter()
        .filter_map(|b| {
            Some(OsType {
                id: b.get("ID")?.clone(),
                description: b.get("Description")?.clone(),
                family: b.get("Family ID").cloned(),
            })
        })
        .collect()
}

/// `list hostinfo`.
pub fn parse_host_info(s: &str, version: Option<String>) -> VmResult<HostInfo> {
    let blocks = split_blocks(s);
    let b = blocks.first().ok_or_else(|| {
        vmerr!(@e AdapterParseError, "empty hostinfo output")
            .with_details(serde_json::json!({ "raw": s }))
    })?;
    let cpu_count = b
        .get("Processor count")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let memory_mb = b
        .get("Memory size")
        .and_then(|v| v.split_whitespace().next()?.parse().ok())
        .unwrap_or(0);
    Ok(HostInfo {
        cpu_count,
        memory_mb,
        os: b.get("Operating system").cloned(),
        hypervisor_version: version,
    })
}

/// Splits `Key: value` listings into blocks separated by blank lines.
fn split_blocks(s: &str) -> Vec<HashMap<String, String>> {
    let mut blocks = Vec::new();
    let mut cur: HashMap<String, String> = HashMap::new();
    for line in s.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if !cur.is_empty() {
                blocks.push(std::mem::take(&mut cur));
            }
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            cur.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    if !cur.is_empty() {
        blocks.push(cur);
    }
    blocks
}

/// Maps the documented `VBoxManage` error phrases onto the taxonomy.
/// Unmatched stderr is the caller's `HypervisorError`.
pub fn classify_stderr(stderr: &str) -> Option<VmError> {
    let mut msg = stderr.trim();
    // "VBoxManage: error: <text>" or "VBoxManage.exe: error: <text>".
    for line in stderr.lines() {
        let lower = line.to_ascii_lowercase();
        if let Some(p) = lower.find(": error: ") {
            msg = line[p + ": error: ".len()..].trim();
            break;
        }
    }
    if msg.starts_with("Could not find a registered machine named")
        || msg.starts_with("Could not find a registered machine with UUID")
    {
        return Some(vmerr!(@e VmNotFound, "{}", msg));
    }
    if msg.starts_with("Could not find a snapshot") {
        return Some(vmerr!(@e VmNotFound, "{}", msg));
    }
    if msg.contains("is already locked by a session")
        || msg.contains("The object is not ready")
        || msg.contains("VBOX_E_INVALID_SESSION_STATE")
    {
        return Some(vmerr!(@e ResourceConflict, "VM session busy: {}", msg));
    }
    if msg.starts_with("Invalid machine state")
        || msg.contains("Machine in invalid state")
        || msg.ends_with("is not currently running")
        || msg.contains("is not running")
        || msg.contains("VBOX_E_INVALID_VM_STATE")
        || msg.contains("The machine is not mutable")
    {
        return Some(vmerr!(@e InvalidState, "{}", msg));
    }
    if msg.contains("already exists") {
        return Some(vmerr!(@e ResourceConflict, "{}", msg));
    }
    None
}
