//! End-to-end lifecycle workflows against the mock control plane.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hvmgr_hypervisor::descriptor::BootDevice;
use hvmgr_hypervisor::{
    Confirmation, ConnectionManager, DomainState, Fault, HypervisorError, ImageTool, Inventory,
    LifecycleController, MockHost, ResourceInput, RestartOutcome, StartOutcome, StopOutcome,
};
use tempfile::TempDir;

const URI: &str = "test:///default";

struct Fixture {
    images: TempDir,
    media: TempDir,
    host: Arc<MockHost>,
    connections: Arc<ConnectionManager>,
    controller: Arc<LifecycleController>,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_tool(touch_tool()).await
    }

    async fn with_tool(tool: ImageTool) -> Self {
        let images = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        std::fs::write(media.path().join("Windows.iso"), b"iso").unwrap();
        std::fs::write(media.path().join("virtio-win.iso"), b"iso").unwrap();

        let host = MockHost::new("hv-01").with_network("default", true);
        let connections = Arc::new(ConnectionManager::new(Arc::new(host.connector())));
        connections.connect(URI).await.unwrap();

        let controller = LifecycleController::new(connections.clone(), images.path())
            .with_image_tool(tool)
            .with_console_retry_delay(Duration::from_millis(10));

        Self {
            images,
            media,
            host,
            connections,
            controller: Arc::new(controller),
        }
    }

    fn input(&self, name: &str) -> ResourceInput {
        ResourceInput {
            name: name.to_string(),
            memory_mib: "2048".to_string(),
            vcpus: "2".to_string(),
            disk_gib: "20".to_string(),
            install_media: self.media.path().join("Windows.iso").to_string_lossy().into_owned(),
            driver_media: self.media.path().join("virtio-win.iso").to_string_lossy().into_owned(),
            network: "default".to_string(),
        }
    }

    fn image_dir(&self) -> &Path {
        self.images.path()
    }

    fn image_count(&self) -> usize {
        std::fs::read_dir(self.image_dir()).unwrap().count()
    }
}

/// Stands in for `qemu-img create -f <fmt> <path> <size>` by touching `<path>`.
fn touch_tool() -> ImageTool {
    ImageTool::new("sh").with_args(["-c", r#": > "$4""#, "qemu-img"])
}

#[tokio::test]
async fn test_create_defines_and_starts() {
    let f = Fixture::new().await;

    let report = f.controller.create(f.input("test-vm")).await.unwrap();

    let expected = f.image_dir().join("test-vm.qcow2");
    assert_eq!(report.descriptor.boot_order(), &[BootDevice::Cdrom, BootDevice::Disk]);
    assert_eq!(report.descriptor.disk_path(), Some(expected.as_path()));
    assert_eq!(report.disk.path, expected);
    assert_eq!(report.state, DomainState::Running);
    assert!(report.started());
    assert!(expected.exists());
    assert!(f.host.is_domain_active("test-vm"));
    assert_eq!(f.controller.state("test-vm").await.unwrap(), DomainState::Running);
}

#[tokio::test]
async fn test_definition_failure_rolls_back_disk() {
    let f = Fixture::new().await;
    f.host.set_fault(Fault::Define, true);

    let err = f.controller.create(f.input("test-vm")).await.unwrap_err();

    assert!(matches!(err, HypervisorError::Definition(_)));
    assert!(!f.image_dir().join("test-vm.qcow2").exists());
    assert!(f.host.domain_names().is_empty());
    assert_eq!(f.controller.state("test-vm").await.unwrap(), DomainState::Undefined);
}

#[tokio::test]
async fn test_start_failure_leaves_domain_defined() {
    let f = Fixture::new().await;
    f.host.set_fault(Fault::Start, true);

    let report = f.controller.create(f.input("test-vm")).await.unwrap();

    assert_eq!(report.state, DomainState::DefinedStopped);
    assert!(report.start_error.is_some());
    assert!(report.disk.path.exists());
    assert_eq!(f.host.domain_names(), vec!["test-vm"]);
    assert_eq!(f.controller.state("test-vm").await.unwrap(), DomainState::DefinedStopped);
}

#[tokio::test]
async fn test_invalid_numbers_create_no_disk() {
    let f = Fixture::new().await;

    for (memory, vcpus, disk) in [("0", "2", "20"), ("2048", "two", "20"), ("2048", "2", "-5")] {
        let mut input = f.input("test-vm");
        input.memory_mib = memory.to_string();
        input.vcpus = vcpus.to_string();
        input.disk_gib = disk.to_string();

        let err = f.controller.create(input).await.unwrap_err();
        assert_eq!(err.field(), Some("resources"));
    }

    assert_eq!(f.image_count(), 0);
    assert!(f.host.domain_names().is_empty());
}

#[tokio::test]
async fn test_out_of_range_memory_creates_no_disk() {
    let f = Fixture::new().await;

    let mut input = f.input("big");
    input.memory_mib = u64::MAX.to_string();

    let err = f.controller.spawn_create(input).wait().await.unwrap_err();
    assert_eq!(err.field(), Some("resources"), "got {err:?}");
    assert_eq!(f.image_count(), 0);
    assert!(f.host.domain_names().is_empty());

    // The name is free again and a sane size goes through.
    let report = f.controller.create(f.input("big")).await.unwrap();
    assert!(report.started());
    assert_eq!(f.image_count(), 1);
}

#[tokio::test]
async fn test_bad_name_is_rejected() {
    let f = Fixture::new().await;

    let err = f.controller.create(f.input("bad name!")).await.unwrap_err();

    assert_eq!(err.field(), Some("name"));
    assert_eq!(f.image_count(), 0);
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let f = Fixture::new().await;
    f.host.add_domain("test-vm", 1024, 1, false);

    let err = f.controller.create(f.input("test-vm")).await.unwrap_err();

    assert_eq!(err.field(), Some("name"));
    assert_eq!(f.image_count(), 0);
}

#[tokio::test]
async fn test_missing_network_offers_alternatives() {
    let f = Fixture::new().await;
    f.host.add_network("isolated", false);
    let mut input = f.input("test-vm");
    input.network = "lab".to_string();

    let err = f.controller.create(input).await.unwrap_err();

    match err {
        HypervisorError::Network { available, .. } => {
            assert!(available.contains("default"));
            assert!(available.contains("isolated"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(f.image_count(), 0);
}

#[tokio::test]
async fn test_inactive_network_is_started_on_create() {
    let f = Fixture::new().await;
    f.host.add_network("isolated", false);
    let mut input = f.input("test-vm");
    input.network = "isolated".to_string();

    f.controller.create(input).await.unwrap();

    assert_eq!(f.host.network_active("isolated"), Some(true));
}

#[tokio::test]
async fn test_concurrent_creates_with_same_name() {
    let f = Fixture::new().await;

    let (first, second) = tokio::join!(
        f.controller.create(f.input("test-vm")),
        f.controller.create(f.input("test-vm")),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results.iter().filter(|r| matches!(r, Err(e) if e.is_conflict())).count(),
        1
    );
    assert_eq!(f.host.domain_names(), vec!["test-vm"]);
}

#[tokio::test]
async fn test_distinct_names_run_concurrently() {
    let f = Fixture::new().await;

    let a = f.controller.spawn_create(f.input("vm-a"));
    let b = f.controller.spawn_create(f.input("vm-b"));

    assert!(a.wait().await.is_ok());
    assert!(b.wait().await.is_ok());
    assert_eq!(f.host.domain_names(), vec!["vm-a", "vm-b"]);
}

#[tokio::test]
async fn test_delete_during_create_conflicts() {
    let slow = ImageTool::new("sh").with_args(["-c", r#"sleep 0.3; : > "$4""#, "qemu-img"]);
    let f = Fixture::with_tool(slow).await;

    let create = f.controller.spawn_create(f.input("test-vm"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(f.controller.state("test-vm").await.unwrap(), DomainState::Defining);
    let err = f
        .controller
        .delete("test-vm", Confirmation::Granted)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    create.wait().await.unwrap();
    assert!(f.host.is_domain_active("test-vm"));
}

#[tokio::test]
async fn test_inventory_counts_every_domain() {
    let f = Fixture::new().await;
    f.host.add_domain("web", 1024, 1, true);
    f.host.add_domain("api", 1024, 1, true);
    f.host.add_domain("db", 4096, 4, false);
    f.host.add_domain("cache", 512, 1, false);
    f.host.set_fault(Fault::Start, true);
    f.controller.create(f.input("test-vm")).await.unwrap();

    let handle = f.connections.acquire().await.unwrap();
    let records = Inventory::list_all(&handle).await.unwrap();

    assert_eq!(records.len(), 5);
    let mut synthetic: Vec<u32> = records.iter().filter(|r| !r.running).map(|r| r.id.value()).collect();
    assert!(synthetic.iter().all(|id| *id >= 1000));
    synthetic.sort_unstable();
    synthetic.dedup();
    assert_eq!(synthetic.len(), 3);
}

#[tokio::test]
async fn test_start_and_restart() {
    let f = Fixture::new().await;
    f.host.add_domain("web", 1024, 1, false);

    assert_eq!(f.controller.restart("web").await.unwrap(), RestartOutcome::Started);
    assert!(f.host.is_domain_active("web"));
    assert_eq!(f.controller.restart("web").await.unwrap(), RestartOutcome::Rebooting);
    assert_eq!(f.controller.start("web").await.unwrap(), StartOutcome::AlreadyRunning);

    let err = f.controller.start("missing").await.unwrap_err();
    assert!(matches!(err, HypervisorError::NotFound(_)));
}

#[tokio::test]
async fn test_stop_and_force_stop() {
    let f = Fixture::new().await;
    f.host.add_domain("web", 1024, 1, true);
    f.host.add_domain("db", 1024, 1, true);

    assert_eq!(f.controller.stop("web").await.unwrap(), StopOutcome::ShutdownRequested);
    assert_eq!(f.controller.stop("web").await.unwrap(), StopOutcome::AlreadyStopped);
    assert_eq!(f.controller.force_stop("db").await.unwrap(), StopOutcome::Stopped);
    assert!(!f.host.is_domain_active("db"));
}

#[tokio::test]
async fn test_delete_requires_confirmation_and_keeps_disk() {
    let f = Fixture::new().await;
    let report = f.controller.create(f.input("test-vm")).await.unwrap();

    let err = f.controller.delete("test-vm", Confirmation::Denied).await.unwrap_err();
    assert!(matches!(err, HypervisorError::Unconfirmed(_)));
    assert!(f.host.is_domain_active("test-vm"));

    let deleted = f.controller.delete("test-vm", Confirmation::Granted).await.unwrap();
    assert_eq!(deleted.disk_paths, vec![report.disk.path.clone()]);
    assert!(f.host.domain_names().is_empty());
    assert!(report.disk.path.exists());

    let err = f
        .controller
        .remove_disk(&report.disk.path, Confirmation::Denied)
        .await
        .unwrap_err();
    assert!(matches!(err, HypervisorError::Unconfirmed(_)));

    f.controller.remove_disk(&report.disk.path, Confirmation::Granted).await.unwrap();
    assert!(!report.disk.path.exists());
}

#[tokio::test]
async fn test_remove_disk_refuses_outside_image_dir() {
    let f = Fixture::new().await;
    let outside = f.media.path().join("Windows.iso");

    let err = f
        .controller
        .remove_disk(&outside, Confirmation::Granted)
        .await
        .unwrap_err();

    assert_eq!(err.field(), Some("path"));
    assert!(outside.exists());
}

#[tokio::test]
async fn test_describe_reads_back_descriptor() {
    let f = Fixture::new().await;
    let report = f.controller.create(f.input("test-vm")).await.unwrap();

    let summary = f.controller.describe("test-vm").await.unwrap();

    assert_eq!(summary.state, DomainState::Running);
    assert_eq!(summary.memory_mib, 2048);
    assert_eq!(summary.vcpus, 2);
    assert_eq!(summary.arch.as_deref(), Some("x86_64"));
    assert!(summary.uuid.is_some());
    assert_eq!(summary.disk_paths, vec![report.disk.path]);
    assert!(summary.vnc_port.is_some());
}

#[tokio::test]
async fn test_console_endpoint_waits_for_port() {
    let f = Fixture::new().await;
    f.host.set_fault(Fault::ConsolePending, true);
    f.controller.create(f.input("test-vm")).await.unwrap();

    let endpoint = f.controller.console_endpoint("test-vm").await.unwrap();

    assert_eq!(endpoint.host, "localhost");
    assert!(endpoint.port >= 5900);
    assert_eq!(endpoint.to_string(), format!("localhost:{}", endpoint.port));
}

#[tokio::test]
async fn test_console_endpoint_requires_running_domain() {
    let f = Fixture::new().await;
    f.host.add_domain("db", 1024, 1, false);

    let err = f.controller.console_endpoint("db").await.unwrap_err();

    assert!(matches!(err, HypervisorError::InvalidState(_)));
}

#[tokio::test]
async fn test_unreachable_host_fails_before_side_effects() {
    let f = Fixture::new().await;
    f.host.set_reachable(false);

    let err = f.controller.create(f.input("test-vm")).await.unwrap_err();

    assert!(err.is_connection());
    assert_eq!(f.image_count(), 0);
}

#[tokio::test]
async fn test_operation_reconnects_after_daemon_restart() {
    let f = Fixture::new().await;
    f.host.add_domain("web", 1024, 1, false);
    f.host.restart_daemon();

    assert_eq!(f.controller.start("web").await.unwrap(), StartOutcome::Started);
    assert_eq!(f.connections.current().await.unwrap().generation(), 2);
}

#[tokio::test]
async fn test_reconnect_during_start_fails_old_call() {
    let f = Fixture::new().await;
    f.host.add_domain("web", 1024, 1, false);
    f.host.set_start_delay(Some(Duration::from_millis(200)));

    let start = f.controller.spawn_start("web");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let new = f.connections.connect(URI).await.unwrap();

    let err = start.wait().await.unwrap_err();
    assert!(err.is_connection());
    assert!(!f.host.is_domain_active("web"));

    f.host.set_start_delay(None);
    assert_eq!(f.controller.start("web").await.unwrap(), StartOutcome::Started);
    assert_eq!(f.connections.current().await.unwrap().generation(), new.generation());
}
