// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! `storage_management`: disks and attachments.
use crate::registry::*;
use crate::types::*;
use serde_json::{json, Value};
use std::sync::Arc;

const DISK_FORMATS: &[&str] = &["VDI", "VMDK", "VHD"];

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "storage_management",
        description: "Create, delete, attach and detach disk media",
        category: "storage",
        actions: vec![
            ActionSpec::new(
                "attach_disk",
                "Attach a disk image to a controller slot",
                ConcurrencyClass::VmMutating,
                handler(attach_disk),
            )
            .field(vm_name_field())
            .field(
                FieldSpec::string("disk_path")
                    .required()
                    .describe("Path to the disk image"),
            )
            .field(
                FieldSpec::string("controller")
                    .default_value(json!("SATA")),
            )
            .field(FieldSpec::integer("port").default_value(json!(0)).range(0, 29))
            .field(
                FieldSpec::integer("device")
                    .default_value(json!(0))
                    .range(0, 1),
            ),
            ActionSpec::new(
                "detach_disk",
                "Detach whatever medium sits in a controller slot",
                ConcurrencyClass::VmMutating,
                handler(detach_disk),
            )
            .field(vm_name_field())
            .field(
                FieldSpec::string("controller")
                    .default_value(json!("SATA")),
            )
            .field(FieldSpec::integer("port").default_value(json!(0)).range(0, 29))
            .field(
                FieldSpec::integer("device")
                    .default_value(json!(0))
                    .range(0, 1),
            ),
            ActionSpec::new(
                "create_disk",
                "Create a new disk image",
                ConcurrencyClass::GlobalMutating,
                handler(create_disk),
            )
            .field(
                FieldSpec::string("disk_path")
                    .required()
                    .describe("Where to create the image"),
            )
            .field(
                FieldSpec::integer("size_mb")
                    .required()
                    .range(1, 67_108_864),
            )
            .field(
                FieldSpec::enumeration("format", DISK_FORMATS)
                    .default_value(json!("VDI")),
            ),
            ActionSpec::new(
                "delete_disk",
                "Unregister a disk image and delete its file",
                ConcurrencyClass::GlobalMutating,
                handler(delete_disk),
            )
            .field(
                FieldSpec::string("disk_path")
                    .required()
                    .describe("Registered path or UUID of the image"),
            ),
            ActionSpec::new(
                "list_disks",
                "All registered hard disk images",
                ConcurrencyClass::Read,
                handler(list_disks),
            ),
        ],
    }
}

fn vm_name_field() -> FieldSpec {
    FieldSpec::string("vm_name")
        .required()
        .length(1, 128)
        .describe("VM name or UUID")
}

async fn attach_disk(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let attachment = StorageAttachment {
        controller: args
            .opt_str("controller")
            .unwrap_or("SATA")
            .to_string(),
        port: args.opt_u64("port").unwrap_or(0) as u32,
        device: args.opt_u64("device").unwrap_or(0) as u32,
        medium: Some(args.str("disk_path")?.to_string()),
    };
    ctx.manager
        .attach_disk(args.str("vm_name")?, &attachment)
        .await?;
    Ok(json!({ "success": true, "attached": attachment }))
}

async fn detach_disk(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    ctx.manager
        .detach_disk(
            args.str("vm_name")?,
            args.opt_str("controller").unwrap_or("SATA"),
            args.opt_u64("port").unwrap_or(0) as u32,
            args.opt_u64("device").unwrap_or(0) as u32,
        )
        .await?;
    Ok(json!({ "success": true, "detached": true }))
}

async fn create_disk(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let uuid = ctx
        .manager
        .create_disk(
            args.str("disk_path")?,
            args.u64("size_mb")?,
            args.opt_str("format").unwrap_or("VDI"),
        )
        .await?;
    Ok(json!({ "success": true, "disk_uuid": uuid }))
}

async fn delete_disk(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    ctx.manager.delete_disk(args.str("disk_path")?).await?;
    Ok(json!({ "success": true, "deleted": true }))
}

async fn list_disks(ctx: Arc<ToolContext>, _args: Args) -> VmResult<Value> {
    let disks = ctx.manager.list_disks().await?;
    Ok(json!({ "success": true, "count": disks.len(), "disks": disks }))
}
