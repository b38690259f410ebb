// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! `system_management`: host queries, tracked operations and metrics.
use crate::registry::*;
use crate::types::*;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "system_management",
        description: "Host information, long-running operation tracking \
                      and VM metric collection",
        category: "system",
        actions: vec![
            ActionSpec::new(
                "host_info",
                "CPU, memory and hypervisor version of the host",
                ConcurrencyClass::Read,
                handler(host_info),
            ),
            ActionSpec::new(
                "version",
                "Hypervisor CLI version",
                ConcurrencyClass::Read,
                handler(version),
            ),
            ActionSpec::new(
                "os_types",
                "Guest OS types the hypervisor knows",
                ConcurrencyClass::Read,
                handler(os_types),
            ),
            ActionSpec::new(
                "operation_status",
                "State of a tracked operation",
                ConcurrencyClass::Read,
                handler(operation_status),
            )
            .field(operation_id_field()),
            ActionSpec::new(
                "operation_cancel",
                "Signal a tracked operation to stop",
                ConcurrencyClass::Read,
                handler(operation_cancel),
            )
            .field(operation_id_field()),
            ActionSpec::new(
                "operation_list",
                "All tracked operations, oldest first",
                ConcurrencyClass::Read,
                handler(operation_list),
            ),
            ActionSpec::new(
                "metrics_start",
                "Start (or join) the metric poll loop for a VM",
                ConcurrencyClass::Read,
                handler(metrics_start),
            )
            .field(vm_name_field())
            .field(
                FieldSpec::integer("interval_sec")
                    .range(1, 300)
                    .describe("Polling interval; default 5"),
            ),
            ActionSpec::new(
                "metrics_stop",
                "Drop a metric subscription",
                ConcurrencyClass::Read,
                handler(metrics_stop),
            )
            .field(vm_name_field()),
            ActionSpec::new(
                "metrics_read",
                "Copy of the VM's sample ring, oldest first",
                ConcurrencyClass::Read,
                handler(metrics_read),
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

fn operation_id_field() -> FieldSpec {
    FieldSpec::string("operation_id").required().length(1, 64)
}

async fn host_info(ctx: Arc<ToolContext>, _args: Args) -> VmResult<Value> {
    let info = ctx.manager.host_info().await?;
    Ok(json!({ "success": true, "host": info }))
}

async fn version(ctx: Arc<ToolContext>, _args: Args) -> VmResult<Value> {
    let v = ctx.manager.version().await?;
    Ok(json!({ "success": true, "version": v }))
}

async fn os_types(ctx: Arc<ToolContext>, _args: Args) -> VmResult<Value> {
    let types = ctx.manager.os_types().await?;
    Ok(json!({ "success": true, "count": types.len(), "os_types": types }))
}

async fn operation_status(
    ctx: Arc<ToolContext>,
    args: Args,
) -> VmResult<Value> {
    let op = ctx.coordinator.get(args.str("operation_id")?)?;
    Ok(json!({ "success": true, "operation": op }))
}

async fn operation_cancel(
    ctx: Arc<ToolContext>,
    args: Args,
) -> VmResult<Value> {
    let observed = ctx.coordinator.cancel(args.str("operation_id")?)?;
    Ok(json!({ "success": true, "cancelled": observed }))
}

async fn operation_list(
    ctx: Arc<ToolContext>,
    _args: Args,
) -> VmResult<Value> {
    let ops = ctx.coordinator.list();
    Ok(json!({ "success": true, "count": ops.len(), "operations": ops }))
}

async fn metrics_start(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let id = ctx.manager.resolve(args.str("vm_name")?).await?;
    let interval = args.opt_u64("interval_sec").map(Duration::from_secs);
    ctx.coordinator.metrics_start(&id, interval).await?;
    Ok(json!({ "success": true, "vm_id": id }))
}

async fn metrics_stop(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let id = ctx.manager.resolve(args.str("vm_name")?).await?;
    let stopped = ctx.coordinator.metrics_stop(&id)?;
    Ok(json!({ "success": true, "stopped": stopped }))
}

async fn metrics_read(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let id = ctx.manager.resolve(args.str("vm_name")?).await?;
    let samples = ctx.coordinator.metrics_read(&id)?;
    Ok(json!({ "success": true, "count": samples.len(), "samples": samples }))
}
