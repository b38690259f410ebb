// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! `vm_management`: VM lifecycle.
use crate::registry::*;
use crate::types::*;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

const START_MODES: &[&str] = &["headless", "gui", "separate"];
const STOP_STYLES: &[&str] = &["acpi", "force", "save"];
const CLONE_MODES: &[&str] = &["full", "linked"];
const NETWORK_MODES: &[&str] =
    &["nat", "bridged", "hostonly", "internal", "natnetwork", "none"];

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "vm_management",
        description: "Create, inspect and drive the lifecycle of \
                      VirtualBox virtual machines",
        category: "vm",
        actions: vec![
            ActionSpec::new(
                "list",
                "List all registered VMs",
                ConcurrencyClass::Read,
                handler(list),
            ),
            ActionSpec::new(
                "info",
                "Full configuration and state of one VM",
                ConcurrencyClass::Read,
                handler(info),
            )
            .field(vm_name_field()),
            ActionSpec::new(
                "create",
                "Create and register a new VM",
                ConcurrencyClass::GlobalMutating,
                handler(create),
            )
            .long_running()
            .field(vm_name_field())
            .field(
                FieldSpec::string("os_type")
                    .required()
                    .describe("Guest OS type id, e.g. Ubuntu_64"),
            )
            .field(
                FieldSpec::integer("memory_mb")
                    .default_value(json!(1024))
                    .range(4, 1_048_576)
                    .describe("Memory in MiB"),
            )
            .field(
                FieldSpec::integer("cpu_count")
                    .default_value(json!(1))
                    .range(1, 64),
            )
            .field(
                FieldSpec::integer("disk_size_gb")
                    .range(1, 65_536)
                    .describe("Attach a fresh disk of this size"),
            )
            .field(FieldSpec::enumeration("network_mode", NETWORK_MODES)),
            ActionSpec::new(
                "start",
                "Start a VM and wait until it is running",
                ConcurrencyClass::VmMutating,
                handler(start),
            )
            .field(vm_name_field())
            .field(
                FieldSpec::enumeration("mode", START_MODES)
                    .default_value(json!("headless")),
            )
            .field(timeout_field()),
            ActionSpec::new(
                "stop",
                "Stop a VM and wait for the target state",
                ConcurrencyClass::VmMutating,
                handler(stop),
            )
            .field(vm_name_field())
            .field(
                FieldSpec::enumeration("style", STOP_STYLES)
                    .default_value(json!("acpi"))
                    .describe("acpi shutdown, hard poweroff, or save state"),
            )
            .field(timeout_field()),
            ActionSpec::new(
                "delete",
                "Unregister a VM, optionally deleting its disks",
                ConcurrencyClass::VmMutating,
                handler(delete),
            )
            .field(vm_name_field())
            .field(
                FieldSpec::boolean("delete_disks")
                    .default_value(json!(false)),
            ),
            ActionSpec::new(
                "clone",
                "Clone a stopped VM under a new name",
                ConcurrencyClass::VmMutating,
                handler(clone_vm),
            )
            .long_running()
            .field(vm_name_field())
            .field(
                FieldSpec::string("clone_name")
                    .required()
                    .length(1, 128),
            )
            .field(
                FieldSpec::enumeration("mode", CLONE_MODES)
                    .default_value(json!("full")),
            ),
            ActionSpec::new(
                "reset",
                "Hard-reset a running VM",
                ConcurrencyClass::VmMutating,
                handler(reset),
            )
            .field(vm_name_field()),
            ActionSpec::new(
                "pause",
                "Pause a running VM",
                ConcurrencyClass::VmMutating,
                handler(pause),
            )
            .field(vm_name_field())
            .field(timeout_field()),
            ActionSpec::new(
                "resume",
                "Resume a paused VM",
                ConcurrencyClass::VmMutating,
                handler(resume),
            )
            .field(vm_name_field())
            .field(timeout_field()),
        ],
    }
}

fn vm_name_field() -> FieldSpec {
    FieldSpec::string("vm_name")
        .required()
        .length(1, 128)
        .describe("VM name or UUID")
}

fn timeout_field() -> FieldSpec {
    FieldSpec::integer("timeout_sec")
        .range(1, 3600)
        .describe("Seconds to wait for the state transition")
}

fn timeout_arg(args: &Args) -> Option<Duration> {
    args.opt_u64("timeout_sec").map(Duration::from_secs)
}

async fn list(ctx: Arc<ToolContext>, _args: Args) -> VmResult<Value> {
    let vms = ctx.manager.list_vms().await?;
    Ok(json!({ "success": true, "count": vms.len(), "vms": vms }))
}

async fn info(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let vm = args.str("vm_name")?;
    let info = ctx.manager.vm_info(vm).await?;
    let snapshots = ctx.manager.snapshot_tree(vm).await.unwrap_or_default();
    Ok(json!({ "success": true, "vm": info, "snapshots": snapshots }))
}

async fn create(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let spec = CreateVmSpec {
        name: args.str("vm_name")?.to_string(),
        os_type: args.str("os_type")?.to_string(),
        memory_mb: args.u64("memory_mb")?,
        cpu_count: args.u64("cpu_count")? as u32,
        disk_size_gb: args.opt_u64("disk_size_gb"),
        network_mode: match args.opt_str("network_mode") {
            Some(m) => Some(m.parse()?),
            None => None,
        },
    };
    let id = ctx.manager.create_vm(&spec).await?;
    Ok(json!({ "success": true, "vm_id": id, "vm_name": spec.name }))
}

async fn start(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let mode = match args.opt_str("mode") {
        Some("gui") => StartMode::Gui,
        Some("separate") => StartMode::Separate,
        _ => StartMode::Headless,
    };
    ctx.manager
        .start_vm(args.str("vm_name")?, mode, timeout_arg(&args))
        .await?;
    Ok(json!({ "success": true, "state": VmState::Running }))
}

async fn stop(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let style = match args.opt_str("style") {
        Some("force") => StopStyle::Force,
        Some("save") => StopStyle::Save,
        _ => StopStyle::Acpi,
    };
    let state = ctx
        .manager
        .stop_vm(args.str("vm_name")?, style, timeout_arg(&args))
        .await?;
    Ok(json!({ "success": true, "state": state }))
}

async fn delete(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let with_disks = args.opt_bool("delete_disks").unwrap_or(false);
    ctx.manager
        .delete_vm(args.str("vm_name")?, with_disks)
        .await?;
    Ok(json!({ "success": true, "deleted": true }))
}

async fn clone_vm(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let mode = match args.opt_str("mode") {
        Some("linked") => CloneMode::Linked,
        _ => CloneMode::Full,
    };
    let id = ctx
        .manager
        .clone_vm(args.str("vm_name")?, args.str("clone_name")?, mode)
        .await?;
    Ok(json!({ "success": true, "vm_id": id }))
}

async fn reset(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    ctx.manager.reset_vm(args.str("vm_name")?).await?;
    Ok(json!({ "success": true }))
}

async fn pause(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    ctx.manager
        .pause_vm(args.str("vm_name")?, timeout_arg(&args))
        .await?;
    Ok(json!({ "success": true, "state": VmState::Paused }))
}

async fn resume(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    ctx.manager
        .resume_vm(args.str("vm_name")?, timeout_arg(&args))
        .await?;
    Ok(json!({ "success": true, "state": VmState::Running }))
}
