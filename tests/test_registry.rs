// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
mod test_cmd_util;

#[cfg(test)]
mod test_registry {
    use crate::test_cmd_util::{build_ctx, FakeVBox};
    use serde_json::json;
    use vboxmcp::tools::build_registry;
    use vboxmcp::types::ErrorKind;

    #[tokio::test]
    async fn unknown_tool_is_tool_not_found() {
        let (_fake, ctx) = build_ctx(FakeVBox::new());
        let registry = build_registry(false);
        let err = registry
            .call(&ctx, "teleport_management", json!({"action": "list"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolNotFound);
        assert!(err.details.unwrap()["available_tools"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t == "vm_management"));
    }

    #[tokio::test]
    async fn unknown_action_lists_the_valid_set() {
        let (fake, ctx) = build_ctx(FakeVBox::new().with_vm("v2", "poweroff"));
        let registry = build_registry(false);
        let err = registry
            .call(&ctx, "vm_management", json!({"action": "teleport"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAction);
        assert!(err.message.contains("start"));
        assert!(err.message.contains("clone"));
        // The VM was never touched.
        assert_eq!(fake.call_count("startvm"), 0);
        assert_eq!(fake.vm_state("v2").unwrap(), "poweroff");
    }

    #[tokio::test]
    async fn missing_action_is_invalid_action() {
        let (_fake, ctx) = build_ctx(FakeVBox::new());
        let registry = build_registry(false);
        let err = registry
            .call(&ctx, "vm_management", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAction);
    }

    #[tokio::test]
    async fn missing_required_field_never_reaches_the_handler() {
        let (fake, ctx) = build_ctx(FakeVBox::new());
        let registry = build_registry(false);
        let err = registry
            .call(&ctx, "vm_management", json!({"action": "start"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
        assert!(err.message.contains("vm_name"));
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn extra_unknown_fields_change_nothing() {
        let (_f1, ctx1) =
            build_ctx(FakeVBox::new().with_vm("v2", "poweroff"));
        let (_f2, ctx2) =
            build_ctx(FakeVBox::new().with_vm("v2", "poweroff"));
        let registry = build_registry(false);

        let plain = registry
            .call(
                &ctx1,
                "vm_management",
                json!({"action": "start", "vm_name": "v2"}),
            )
            .await
            .unwrap();
        let with_extra = registry
            .call(
                &ctx2,
                "vm_management",
                json!({
                    "action": "start",
                    "vm_name": "v2",
                    "experimental_flag": true,
                }),
            )
            .await
            .unwrap();
        assert_eq!(plain, with_extra);
        assert_eq!(plain["success"], true);
    }

    #[tokio::test]
    async fn list_call_returns_vms() {
        let (_fake, ctx) = build_ctx(
            FakeVBox::new()
                .with_vm("a", "poweroff")
                .with_vm("b", "running"),
        );
        let registry = build_registry(false);
        let out = registry
            .call(&ctx, "vm_management", json!({"action": "list"}))
            .await
            .unwrap();
        assert_eq!(out["count"], 2);
        let vms = out["vms"].as_array().unwrap();
        assert!(vms.iter().any(|v| v["name"] == "b"
            && v["state"] == "running"));
    }

    #[tokio::test]
    async fn enum_violation_is_invalid_arguments() {
        let (_fake, ctx) =
            build_ctx(FakeVBox::new().with_vm("v2", "poweroff"));
        let registry = build_registry(false);
        let err = registry
            .call(
                &ctx,
                "vm_management",
                json!({"action": "start", "vm_name": "v2", "mode": "warp"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
        assert!(err.message.contains("headless"));
    }

    #[test]
    fn listing_exposes_all_five_tools() {
        let registry = build_registry(false);
        let tools = registry.list();
        let names: Vec<&str> = tools
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for expected in [
            "vm_management",
            "snapshot_management",
            "storage_management",
            "network_management",
            "system_management",
        ] {
            assert!(names.contains(&expected), "{} missing", expected);
        }
        // Every schema requires its action discriminator.
        for t in &tools {
            assert_eq!(t["inputSchema"]["required"][0], "action");
        }
    }

    #[test]
    fn degraded_listing_drops_mutating_actions() {
        let registry = build_registry(true);
        let tools = registry.list();
        let vm = tools
            .iter()
            .find(|t| t["name"] == "vm_management")
            .unwrap();
        let actions: Vec<&str> = vm["inputSchema"]["properties"]["action"]
            ["enum"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(actions.contains(&"list"));
        assert!(actions.contains(&"info"));
        assert!(!actions.contains(&"start"));
        assert!(!actions.contains(&"create"));
    }

    #[tokio::test]
    async fn degraded_mutating_call_is_binary_not_found() {
        let (fake, ctx) =
            build_ctx(FakeVBox::new().with_vm("v2", "poweroff"));
        let registry = build_registry(true);
        let err = registry
            .call(
                &ctx,
                "vm_management",
                json!({"action": "start", "vm_name": "v2"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BinaryNotFound);
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_running_create_returns_an_operation_handle() {
        let (_fake, ctx) = build_ctx(FakeVBox::new());
        let registry = build_registry(false);
        let out = registry
            .call(
                &ctx,
                "vm_management",
                json!({
                    "action": "create",
                    "vm_name": "t1",
                    "os_type": "Ubuntu_64",
                    "memory_mb": 2048,
                    "cpu_count": 1,
                }),
            )
            .await
            .unwrap();
        let op_id = out["operation_id"].as_str().unwrap().to_string();
        assert_eq!(out["state"], "pending");

        // The handle resolves to a finished create.
        for _ in 0..100 {
            let snap = ctx.coordinator.get(&op_id).unwrap();
            if snap["state"] == "succeeded" {
                assert_eq!(snap["result"]["vm_name"], "t1");
                assert!(snap["result"]["vm_id"].is_string());
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("create never finished");
    }
}
