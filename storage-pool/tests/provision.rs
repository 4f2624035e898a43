use std::fs;
use std::path::Path;

use storage_pool::{PoolConfig, PoolRegistry, PoolState};
use storage_sys::{DryRunExecutor, PoolBackend, RecordingExecutor};
use storage_types::BackendKind;

const ZPOOL_MEMBERS: &str = "docker\t19G\t2.58M\t19G\t-\t-\t0%\t0%\t1.00x\tONLINE\t-\n\t/dev/sdb\t9.50G\t356K\t9.50G\t-\t-\t0%\t0.00%\t-\tONLINE\n";

fn config(dir: &Path, backend: BackendKind) -> PoolConfig {
    let mountinfo = dir.join("mountinfo");
    fs::write(&mountinfo, "").unwrap();
    PoolConfig {
        backend,
        mount_point: dir.join("docker"),
        mountinfo,
        ..PoolConfig::default()
    }
}

#[test]
fn zfs_pool_is_extended_and_retargeted() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), BackendKind::Zfs);
    let mount_point = config.mount_point.clone();
    let executor = RecordingExecutor::new()
        .respond(&["zpool", "list", "-H", "-o", "name"], "docker\n")
        .respond(&["zfs", "get"], "/old/docker\n")
        .respond(&["zpool", "list", "-v"], ZPOOL_MEMBERS);
    let registry = PoolRegistry::new(config, &executor);

    let provisioned = registry
        .provision(&["/dev/sdb".to_string(), "/dev/sdc".to_string()])
        .unwrap();

    assert_eq!(provisioned.previous, PoolState::PoolExists);
    assert_eq!(provisioned.added, vec!["/dev/sdc".to_string()]);

    let calls = executor.rendered_calls();
    let retargeted = calls
        .iter()
        .position(|call| *call == format!("zfs set mountpoint={} docker", mount_point.display()))
        .unwrap();
    let added = calls
        .iter()
        .position(|call| call == "zpool add docker /dev/sdc")
        .unwrap();
    assert!(retargeted < added);
    assert!(mount_point.is_dir());
}

#[test]
fn btrfs_lifecycle_through_registry_backend() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), BackendKind::Btrfs);
    let executor = RecordingExecutor::new().respond(
        &["btrfs", "filesystem", "show", "-m"],
        "Label: none  uuid: 1234\n\tTotal devices 1 FS bytes used 1.00MiB\n\tdevid    1 size 4.00GiB used 8.00MiB path /dev/loop0\n",
    );
    let registry = PoolRegistry::new(config, &executor);

    let provisioned = registry.provision(&["/dev/loop0".to_string()]).unwrap();
    assert_eq!(provisioned.previous, PoolState::NoPool);

    let backend = registry.backend();
    let pool = registry.open().unwrap();
    let size = backend.size(&pool).unwrap();

    assert_eq!(pool.devices(), ["/dev/loop0"]);
    assert_eq!(size.used_bytes, 1024 * 1024);
    assert_eq!(size.total_bytes, 4 * 1024 * 1024 * 1024);
}

#[test]
fn dry_run_decides_from_real_queries() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), BackendKind::Btrfs);
    let mount_point = config.mount_point.clone();
    fs::create_dir_all(&mount_point).unwrap();
    fs::write(
        &config.mountinfo,
        format!("90 36 0:61 / {} rw - btrfs /dev/sdb rw\n", mount_point.display()),
    )
    .unwrap();
    let executor = DryRunExecutor::new(RecordingExecutor::new().respond(
        &["btrfs", "filesystem", "show"],
        "Label: none  uuid: 1234\n\tTotal devices 1 FS bytes used 1.00MiB\n\tdevid    1 size 4.00GiB used 8.00MiB path /dev/sdb\n",
    ));
    let registry = PoolRegistry::new(config, &executor);

    let provisioned = registry
        .provision(&["/dev/sdb".to_string(), "/dev/sdc".to_string()])
        .unwrap();

    assert_eq!(provisioned.previous, PoolState::PoolExists);
    assert_eq!(provisioned.added, vec!["/dev/sdc".to_string()]);
    let data = mount_point.display();
    assert_eq!(
        executor.rendered_calls(),
        vec![
            format!("btrfs device add -f /dev/sdc {data}"),
            format!("btrfs balance {data}"),
        ]
    );
}

#[test]
fn dry_run_create_leaves_host_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), BackendKind::Btrfs);
    let mount_point = config.mount_point.clone();
    let executor = DryRunExecutor::new(RecordingExecutor::new());
    let registry = PoolRegistry::new(config, &executor);

    let provisioned = registry.provision(&["/dev/sdb".to_string()]).unwrap();

    assert_eq!(provisioned.previous, PoolState::NoPool);
    assert_eq!(
        executor.rendered_calls(),
        vec![
            "mkfs.btrfs -f -d raid0 /dev/sdb".to_string(),
            format!("mount /dev/sdb {}", mount_point.display()),
        ]
    );
    assert!(!mount_point.exists());
}
