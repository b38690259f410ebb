// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! `snapshot_management`: snapshot tree operations.
use crate::registry::*;
use crate::types::*;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "snapshot_management",
        description: "Take, restore, delete and list VM snapshots",
        category: "snapshot",
        actions: vec![
            ActionSpec::new(
                "create",
                "Take a snapshot; running VMs get a live snapshot",
                ConcurrencyClass::VmMutating,
                handler(create),
            )
            .field(vm_name_field())
            .field(snapshot_name_field())
            .field(FieldSpec::string("description"))
            .field(
                FieldSpec::boolean("live").describe(
                    "Take the snapshot without pausing the VM; defaults to \
                     whatever the current state requires",
                ),
            ),
            ActionSpec::new(
                "restore",
                "Restore a snapshot on a stopped VM",
                ConcurrencyClass::VmMutating,
                handler(restore),
            )
            .long_running()
            .field(vm_name_field())
            .field(snapshot_name_field()),
            ActionSpec::new(
                "delete",
                "Delete a snapshot, folding it into its parent",
                ConcurrencyClass::VmMutating,
                handler(delete),
            )
            .field(vm_name_field())
            .field(snapshot_name_field()),
            ActionSpec::new(
                "list",
                "The VM's snapshot tree with the current marker",
                ConcurrencyClass::Read,
                handler(list),
            )
            .field(vm_name_field()),
        ],
    }
}

fn vm_name_field() -> FieldSpec {
    FieldSpec::string("vm_name")
        .required()
        .length(1, 128)
        .describe("VM name or UUID")
}

fn snapshot_name_field() -> FieldSpec {
    FieldSpec::string("snapshot_name")
        .required()
        .length(1, 256)
        .describe("Snapshot name or UUID")
}

async fn create(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let id = ctx
        .manager
        .take_snapshot(
            args.str("vm_name")?,
            args.str("snapshot_name")?,
            args.opt_str("description"),
            args.opt_bool("live"),
        )
        .await?;
    Ok(json!({ "success": true, "snapshot_id": id }))
}

async fn restore(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    ctx.manager
        .restore_snapshot(args.str("vm_name")?, args.str("snapshot_name")?)
        .await?;
    Ok(json!({ "success": true, "restored": true }))
}

async fn delete(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    ctx.manager
        .delete_snapshot(args.str("vm_name")?, args.str("snapshot_name")?)
        .await?;
    Ok(json!({ "success": true, "deleted": true }))
}

async fn list(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let tree = ctx.manager.snapshot_tree(args.str("vm_name")?).await?;
    Ok(json!({ "success": true, "snapshots": tree }))
}
