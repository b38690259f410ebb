// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! `network_management`: adapter and host-only interface configuration.
use crate::registry::*;
use crate::types::*;
use serde_json::{json, Value};
use std::sync::Arc;

const NETWORK_MODES: &[&str] =
    &["nat", "bridged", "hostonly", "internal", "natnetwork", "none"];

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "network_management",
        description: "Inspect and configure VM network adapters and \
                      host-only interfaces",
        category: "network",
        actions: vec![
            ActionSpec::new(
                "list_adapters",
                "The VM's adapter slots and their modes",
                ConcurrencyClass::Read,
                handler(list_adapters),
            )
            .field(vm_name_field()),
            ActionSpec::new(
                "configure_adapter",
                "Reconfigure one adapter slot of a stopped VM",
                ConcurrencyClass::VmMutating,
                handler(configure_adapter),
            )
            .field(vm_name_field())
            .field(FieldSpec::integer("slot").required().range(0, 7))
            .field(
                FieldSpec::enumeration("mode", NETWORK_MODES).required(),
            )
            .field(FieldSpec::string("attachment").describe(
                "Bridged interface, host-only interface or internal \
                 network name, depending on the mode",
            ))
            .field(FieldSpec::string("adapter_type"))
            .field(FieldSpec::string("mac"))
            .field(FieldSpec::boolean("cable_connected")),
            ActionSpec::new(
                "list_hostonly_ifs",
                "Host-only interfaces on this host",
                ConcurrencyClass::Read,
                handler(list_hostonly_ifs),
            ),
            ActionSpec::new(
                "create_hostonly_if",
                "Create a host-only interface",
                ConcurrencyClass::GlobalMutating,
                handler(create_hostonly_if),
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

async fn list_adapters(ctx: Arc<ToolContext>, args: Args) -> VmResult<Value> {
    let adapters = ctx.manager.list_adapters(args.str("vm_name")?).await?;
    Ok(json!({ "success": true, "adapters": adapters }))
}

async fn configure_adapter(
    ctx: Arc<ToolContext>,
    args: Args,
) -> VmResult<Value> {
    let config = AdapterConfig {
        slot: args.u64("slot")? as u8,
        mode: args.str("mode")?.parse()?,
        attachment: args.opt_str("attachment").map(str::to_string),
        adapter_type: args.opt_str("adapter_type").map(str::to_string),
        mac: args.opt_str("mac").map(str::to_string),
        cable_connected: args.opt_bool("cable_connected"),
    };
    ctx.manager
        .configure_adapter(args.str("vm_name")?, &config)
        .await?;
    Ok(json!({ "success": true, "configured": config.slot }))
}

async fn list_hostonly_ifs(
    ctx: Arc<ToolContext>,
    _args: Args,
) -> VmResult<Value> {
    let ifs = ctx.manager.list_hostonly_ifs().await?;
    Ok(json!({ "success": true, "interfaces": ifs }))
}

async fn create_hostonly_if(
    ctx: Arc<ToolContext>,
    _args: Args,
) -> VmResult<Value> {
    let name = ctx.manager.create_hostonly_if().await?;
    Ok(json!({ "success": true, "name": name }))
}
