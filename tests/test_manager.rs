// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
mod test_cmd_util;

#[cfg(test)]
mod test_manager {
    use crate::test_cmd_util::{build_ctx, FakeVBox};
    use std::time::Duration;
    use vboxmcp::types::*;

    #[tokio::test]
    async fn resolves_names_and_ids_to_the_canonical_id() {
        let (fake, ctx) = build_ctx(FakeVBox::new().with_vm("v2", "poweroff"));
        let id_by_name = ctx.manager.resolve("v2").await.unwrap();
        let id_by_id = ctx.manager.resolve(&id_by_name).await.unwrap();
        assert_eq!(id_by_name, id_by_id);

        let err = ctx.manager.resolve("ghost").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VmNotFound);
        let _ = fake;
    }

    #[tokio::test]
    async fn resolution_uses_the_listing_cache() {
        let (fake, ctx) = build_ctx(FakeVBox::new().with_vm("v2", "poweroff"));
        ctx.manager.resolve("v2").await.unwrap();
        let listings = fake.call_count("list");
        // A second hit within the TTL stays in memory.
        ctx.manager.resolve("v2").await.unwrap();
        assert_eq!(fake.call_count("list"), listings);
    }

    #[tokio::test]
    async fn start_then_stop_round_trips_to_poweroff() {
        let (fake, ctx) = build_ctx(FakeVBox::new().with_vm("v2", "poweroff"));
        ctx.manager
            .start_vm("v2", StartMode::Headless, None)
            .await
            .unwrap();
        assert_eq!(fake.vm_state("v2").unwrap(), "running");
        let state = ctx
            .manager
            .stop_vm("v2", StopStyle::Force, None)
            .await
            .unwrap();
        assert_eq!(state, VmState::PowerOff);
        assert_eq!(fake.vm_state("v2").unwrap(), "poweroff");
    }

    #[tokio::test]
    async fn save_style_lands_in_saved() {
        let (fake, ctx) = build_ctx(FakeVBox::new().with_vm("v2", "running"));
        let state = ctx
            .manager
            .stop_vm("v2", StopStyle::Save, None)
            .await
            .unwrap();
        assert_eq!(state, VmState::Saved);
        assert_eq!(fake.vm_state("v2").unwrap(), "saved");
    }

    #[tokio::test]
    async fn stop_of_a_poweroff_vm_is_invalid_state_not_not_found() {
        let (_fake, ctx) = build_ctx(FakeVBox::new().with_vm("v2", "poweroff"));
        let err = ctx
            .manager
            .stop_vm("v2", StopStyle::Acpi, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn concurrent_starts_serialize_one_wins() {
        // The lock forces the second start to wait; it then sees `running`
        // and fails the pre-check instead of overlapping the transition.
        let (fake, ctx) = build_ctx(
            FakeVBox::new()
                .with_vm("v2", "poweroff")
                .delay("startvm", Duration::from_millis(150)),
        );
        let m1 = ctx.manager.clone();
        let m2 = ctx.manager.clone();
        let (r1, r2) = tokio::join!(
            m1.start_vm("v2", StartMode::Headless, None),
            m2.start_vm("v2", StartMode::Headless, None),
        );
        let results = [r1, r2];
        assert_eq!(
            results.iter().filter(|r| r.is_ok()).count(),
            1,
            "exactly one start must win: {:?}",
            results
        );
        let err = results.iter().find(|r| r.is_err()).unwrap();
        assert_eq!(
            err.as_ref().unwrap_err().kind,
            ErrorKind::InvalidState
        );
        // The hypervisor saw exactly one start command.
        assert_eq!(fake.call_count("startvm"), 1);
    }

    #[tokio::test]
    async fn transient_session_lock_is_retried() {
        let (fake, ctx) = build_ctx(FakeVBox::new().with_vm("v2", "running"));
        fake.fail_once(
            "controlvm",
            "The machine is already locked by a session (or being locked or unlocked)",
        );
        let state = ctx
            .manager
            .stop_vm("v2", StopStyle::Force, None)
            .await
            .unwrap();
        assert_eq!(state, VmState::PowerOff);
        assert_eq!(fake.call_count("controlvm"), 2);
    }

    #[tokio::test]
    async fn snapshot_flow_create_restore_delete() {
        let (_fake, ctx) = build_ctx(FakeVBox::new().with_vm("t1", "poweroff"));
        let snap_id = ctx
            .manager
            .take_snapshot("t1", "s1", Some("before the experiment"), None)
            .await
            .unwrap();
        assert!(!snap_id.is_empty());

        let tree = ctx.manager.snapshot_tree("t1").await.unwrap();
        assert_eq!(tree.root.as_ref().unwrap().name, "s1");
        assert_eq!(tree.current.as_deref(), Some(snap_id.as_str()));

        ctx.manager.restore_snapshot("t1", "s1").await.unwrap();
        ctx.manager.delete_snapshot("t1", "s1").await.unwrap();
        let tree = ctx.manager.snapshot_tree("t1").await.unwrap();
        assert!(tree.root.is_none());
    }

    #[tokio::test]
    async fn duplicate_snapshot_name_is_resource_conflict() {
        let (_fake, ctx) = build_ctx(FakeVBox::new().with_vm("t1", "poweroff"));
        ctx.manager
            .take_snapshot("t1", "s1", None, None)
            .await
            .unwrap();
        let err = ctx
            .manager
            .take_snapshot("t1", "s1", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceConflict);
    }

    #[tokio::test]
    async fn restore_on_a_running_vm_is_rejected() {
        let (fake, ctx) = build_ctx(FakeVBox::new().with_vm("t1", "poweroff"));
        ctx.manager
            .take_snapshot("t1", "s1", None, None)
            .await
            .unwrap();
        ctx.manager
            .start_vm("t1", StartMode::Headless, None)
            .await
            .unwrap();
        let err = ctx
            .manager
            .restore_snapshot("t1", "s1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(fake.vm_state("t1").unwrap(), "running");
    }

    #[tokio::test]
    async fn delete_of_a_running_vm_is_rejected() {
        let (_fake, ctx) = build_ctx(FakeVBox::new().with_vm("v2", "running"));
        let err = ctx.manager.delete_vm("v2", true).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn create_with_duplicate_name_is_resource_conflict() {
        let (_fake, ctx) = build_ctx(FakeVBox::new().with_vm("t1", "poweroff"));
        let spec = CreateVmSpec {
            name: "t1".to_string(),
            os_type: "Ubuntu_64".to_string(),
            memory_mb: 1024,
            cpu_count: 1,
            disk_size_gb: None,
            network_mode: None,
        };
        let err = ctx.manager.create_vm(&spec).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceConflict);
    }

    #[tokio::test]
    async fn full_lifecycle_create_start_snapshot_stop_delete() {
        let (_fake, ctx) = build_ctx(FakeVBox::new());
        let spec = CreateVmSpec {
            name: "t1".to_string(),
            os_type: "Ubuntu_64".to_string(),
            memory_mb: 2048,
            cpu_count: 1,
            disk_size_gb: Some(10),
            network_mode: None,
        };
        let id = ctx.manager.create_vm(&spec).await.unwrap();
        assert!(!id.is_empty());

        ctx.manager
            .start_vm("t1", StartMode::Headless, None)
            .await
            .unwrap();
        ctx.manager
            .take_snapshot("t1", "s1", None, None)
            .await
            .unwrap();
        let state = ctx
            .manager
            .stop_vm("t1", StopStyle::Force, None)
            .await
            .unwrap();
        assert_eq!(state, VmState::PowerOff);
        ctx.manager.delete_vm("t1", true).await.unwrap();

        let vms = ctx.manager.list_vms().await.unwrap();
        assert!(!vms.iter().any(|v| v.name == "t1"));
    }

    #[tokio::test]
    async fn vm_info_reads_config_and_state() {
        let (_fake, ctx) = build_ctx(FakeVBox::new().with_vm("v2", "running"));
        let info = ctx.manager.vm_info("v2").await.unwrap();
        assert_eq!(info.state, VmState::Running);
        assert_eq!(info.memory_mb, 2048);
        assert_eq!(info.os_type, "Ubuntu_64");
        assert_eq!(info.network_adapters.len(), 1);
    }
}
