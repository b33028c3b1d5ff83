// Session lifecycle: extraction, idempotence, release and failure reporting


use std::fs;
use std::sync::Arc;

use fwscope::{ExtractMode, FsType, ImageError, ImageStatus, RetentionPolicy, create_image};
use test_support::*;

const ROOTFS: &[(&str, &str)] = &[
    ("etc/passwd", "root:x:0:0:root:/root:/bin/sh"),
    ("proc/version", "Linux version 4.14.123 (builder@buildhost) #1 SMP"),
];

#[test]
fn test_create_image_classifies_once() {
    let fx = squashfs_fixture(ROOTFS);
    let image = create_image(&fx.image, fx.config.clone()).unwrap();

    assert_eq!(image.fs_type(), FsType::SquashFs);
    assert!(image.path().is_absolute());
    assert_eq!(image.status(), ImageStatus::Typed);
    assert!(!image.is_mounted());
    assert!(image.working_directory().is_none());
}

#[test]
fn test_missing_source_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = create_image(dir.path().join("nope.bin"), Default::default()).unwrap_err();
    assert!(matches!(err, ImageError::Io(_)));
}

#[test]
fn test_scanners_require_extraction() {
    let fx = squashfs_fixture(ROOTFS);
    let image = create_image(&fx.image, fx.config.clone()).unwrap();

    assert!(matches!(image.print_fs(), Err(ImageError::NotMounted)));
    assert!(matches!(image.get_kernel_version(), Err(ImageError::NotMounted)));
    assert!(matches!(image.get_command_injections(), Err(ImageError::NotMounted)));
}

#[test]
fn test_extract_is_idempotent() {
    let fx = squashfs_fixture(ROOTFS);
    let image = create_image(&fx.image, fx.config.clone()).unwrap();

    let first = image.extract_fs().unwrap();
    let second = image.extract_fs().unwrap();

    assert_eq!(first, second);
    assert_eq!(runs(&fx.counter), 1);
    assert_eq!(image.status(), ImageStatus::Extracted);
    assert!(!image.is_mounted());
    assert!(first.join("etc/passwd").is_file());
    assert!(first.starts_with(fx.dir.path().join("work")));
}

#[test]
fn test_session_directory_is_named_after_the_image() {
    let fx = squashfs_fixture(ROOTFS);
    let image = create_image(&fx.image, fx.config.clone()).unwrap();
    let root = image.extract_fs().unwrap();

    assert_eq!(root.file_name().unwrap(), "root");
    let session = root.parent().unwrap().file_name().unwrap().to_string_lossy();
    assert!(session.starts_with("firmware-"), "{}", session);
    assert_eq!(session.len(), "firmware-".len() + 8);
}

#[test]
fn test_unknown_image_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir.path().join("blob.bin"), &garbage(7, 8192));
    let counter = dir.path().join("runs.log");
    let tool = fake_tool(dir.path(), "unsquashfs", &populate_script(&counter, ROOTFS));
    let image = create_image(&path, unpack_config(dir.path(), "unsquashfs", &tool)).unwrap();

    assert_eq!(image.fs_type(), FsType::Unknown);
    assert!(matches!(image.extract_fs(), Err(ImageError::DetectionInconclusive(_))));
    assert_eq!(image.status(), ImageStatus::Typed);
    assert_eq!(runs(&counter), 0);
}

#[test]
fn test_missing_tool_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir.path().join("fw.squashfs"), &squashfs_image());
    let config = unpack_config(dir.path(), "unsquashfs", &dir.path().join("not-installed"));
    let image = create_image(&path, config).unwrap();

    match image.extract_fs() {
        Err(ImageError::ToolUnavailable(name)) => assert_eq!(name, "unsquashfs"),
        other => panic!("expected ToolUnavailable, got {:?}", other),
    }
}

#[test]
fn test_failed_unpack_is_not_success() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir.path().join("fw.squashfs"), &squashfs_image());
    // Writes one file, then dies like a corrupt payload would
    let tool = fake_tool(
        dir.path(),
        "unsquashfs",
        "mkdir -p \"$3/etc\"\necho partial > \"$3/etc/partial\"\necho 'FATAL ERROR: Data queue size is too large' >&2\nexit 1",
    );
    let image = create_image(&path, unpack_config(&dir.path().join("work"), "unsquashfs", &tool)).unwrap();

    match image.extract_fs() {
        Err(ImageError::UnpackFailed { fs_type, reason }) => {
            assert_eq!(fs_type, FsType::SquashFs);
            assert!(reason.contains("Data queue size"), "{}", reason);
        }
        other => panic!("expected UnpackFailed, got {:?}", other),
    }
    assert_eq!(image.status(), ImageStatus::Typed);
    assert!(image.working_directory().is_none());
}

#[test]
fn test_empty_output_is_unpack_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir.path().join("fw.squashfs"), &squashfs_image());
    let tool = fake_tool(dir.path(), "unsquashfs", "mkdir -p \"$3\"\nexit 0");
    let image = create_image(&path, unpack_config(&dir.path().join("work"), "unsquashfs", &tool)).unwrap();

    assert!(matches!(image.extract_fs(), Err(ImageError::UnpackFailed { .. })));
}

#[test]
fn test_permission_failure_is_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir.path().join("fw.squashfs"), &squashfs_image());
    let tool = fake_tool(
        dir.path(),
        "unsquashfs",
        "echo 'mknod: Operation not permitted' >&2\nexit 1",
    );
    let image = create_image(&path, unpack_config(&dir.path().join("work"), "unsquashfs", &tool)).unwrap();

    assert!(matches!(image.extract_fs(), Err(ImageError::PermissionDenied(_))));
}

#[test]
fn test_hung_tool_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir.path().join("fw.squashfs"), &squashfs_image());
    let tool = fake_tool(dir.path(), "unsquashfs", "sleep 30");
    let mut config = unpack_config(&dir.path().join("work"), "unsquashfs", &tool);
    config.tool_timeout_secs = Some(1);
    let image = create_image(&path, config).unwrap();

    match image.extract_fs() {
        Err(ImageError::UnpackFailed { reason, .. }) => assert!(reason.contains("timed out"), "{}", reason),
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[test]
fn test_mount_only_mode_rejects_packed_formats() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir.path().join("fw.jffs2"), &jffs2_image());
    let mut config = unpack_config(dir.path(), "jefferson", &dir.path().join("jefferson"));
    config.extract_mode = ExtractMode::Mount;
    let image = create_image(&path, config).unwrap();

    assert!(matches!(
        image.extract_fs(),
        Err(ImageError::UnsupportedType(FsType::Jffs2))
    ));
}

#[test]
fn test_unmount_retains_directory_for_scanning() {
    let fx = squashfs_fixture(&[
        ("a/b.txt", "b"),
        ("a/c.txt", "c"),
        ("d.txt", "d"),
    ]);
    let image = create_image(&fx.image, fx.config.clone()).unwrap();
    let root = image.extract_fs().unwrap();

    image.unmount().unwrap();

    assert_eq!(image.status(), ImageStatus::Released);
    assert!(!image.is_mounted());
    assert_eq!(image.working_directory(), Some(root.clone()));
    let listing = image.print_fs().unwrap();
    assert!(listing.contains("b.txt") && listing.contains("d.txt"));
    assert!(root.join("d.txt").exists());
}

#[test]
fn test_unmount_is_safe_without_extraction() {
    let fx = squashfs_fixture(ROOTFS);
    let image = create_image(&fx.image, fx.config.clone()).unwrap();

    image.unmount().unwrap();
    image.unmount().unwrap();
    assert_eq!(image.status(), ImageStatus::Typed);
}

#[test]
fn test_remove_policy_deletes_session() {
    let mut fx = squashfs_fixture(ROOTFS);
    fx.config.retention = RetentionPolicy::Remove;
    let image = create_image(&fx.image, fx.config.clone()).unwrap();
    let root = image.extract_fs().unwrap();
    let session = root.parent().unwrap().to_path_buf();

    image.unmount().unwrap();

    assert!(!session.exists());
    assert_eq!(image.status(), ImageStatus::Typed);
    assert!(matches!(image.print_fs(), Err(ImageError::NotMounted)));
}

#[test]
fn test_extract_after_release_starts_a_new_session() {
    let fx = squashfs_fixture(ROOTFS);
    let image = create_image(&fx.image, fx.config.clone()).unwrap();
    let first = image.extract_fs().unwrap();
    image.unmount().unwrap();

    let second = image.extract_fs().unwrap();
    assert_ne!(first, second);
    assert_eq!(runs(&fx.counter), 2);
    assert_eq!(image.status(), ImageStatus::Extracted);
}

#[test]
fn test_kernel_version_through_the_image() {
    let fx = squashfs_fixture(ROOTFS);
    let image = create_image(&fx.image, fx.config.clone()).unwrap();
    image.extract_fs().unwrap();

    assert_eq!(image.get_kernel_version().unwrap(), "4.14.123");
}

#[test]
fn test_missing_kernel_version_is_not_found() {
    let fx = squashfs_fixture(&[("etc/hostname", "router")]);
    let image = create_image(&fx.image, fx.config.clone()).unwrap();
    image.extract_fs().unwrap();

    assert!(matches!(image.get_kernel_version(), Err(ImageError::NotFound(_))));
    assert!(image.kernel_version_details().unwrap().is_none());
}

#[test]
fn test_persist_keeps_output_after_drop() {
    let fx = squashfs_fixture(ROOTFS);
    let mut config = fx.config.clone();
    config.retention = RetentionPolicy::Remove;
    let image = create_image(&fx.image, config).unwrap();
    image.extract_fs().unwrap();

    let root = image.persist().unwrap();
    assert!(root.join("etc/passwd").is_file());
}

#[test]
fn test_drop_applies_retention_policy() {
    let fx = squashfs_fixture(ROOTFS);
    let mut config = fx.config.clone();
    config.retention = RetentionPolicy::Remove;
    let image = create_image(&fx.image, config).unwrap();
    let root = image.extract_fs().unwrap();

    drop(image);
    assert!(!root.exists());
}

#[tokio::test]
async fn test_background_extraction() {
    let fx = squashfs_fixture(ROOTFS);
    let image = Arc::new(create_image(&fx.image, fx.config.clone()).unwrap());

    let root = image.extract_in_background().await.unwrap();
    assert!(root.join("proc/version").is_file());
    assert_eq!(image.status(), ImageStatus::Extracted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_extractions_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir.path().join("fw.squashfs"), &squashfs_image());
    let counter = dir.path().join("runs.log");
    // Slow enough that the second request arrives while the first runs
    let body = format!("sleep 1\n{}", populate_script(&counter, ROOTFS));
    let tool = fake_tool(dir.path(), "unsquashfs", &body);
    let image = Arc::new(create_image(&path, unpack_config(&dir.path().join("work"), "unsquashfs", &tool)).unwrap());

    let first = image.spawn_extraction();
    let second = image.spawn_extraction();
    let (first, second) = (first.await.unwrap().unwrap(), second.await.unwrap().unwrap());

    assert_eq!(first, second);
    assert_eq!(runs(&counter), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scans_share_the_working_directory() {
    let fx = squashfs_fixture(ROOTFS);
    let image = Arc::new(create_image(&fx.image, fx.config.clone()).unwrap());
    image.extract_in_background().await.unwrap();

    let tree = {
        let image = Arc::clone(&image);
        tokio::task::spawn_blocking(move || image.print_fs())
    };
    let kernel = {
        let image = Arc::clone(&image);
        tokio::task::spawn_blocking(move || image.get_kernel_version())
    };

    assert!(tree.await.unwrap().unwrap().contains("passwd"));
    assert_eq!(kernel.await.unwrap().unwrap(), "4.14.123");
    assert!(fs::metadata(image.working_directory().unwrap()).is_ok());
}

#[test]
fn test_released_mount_is_not_scanned() {
    if !can_mount_tmpfs() {
        eprintln!("skipping: this host cannot mount tmpfs");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let image_path = write_file(&dir.path().join("firmware.squashfs"), &squashfs_image());
    // mount -t <type> -o loop,ro <image> <target>
    let mount = fake_tool(
        dir.path(),
        "mount",
        "mount -t tmpfs tmpfs \"$6\" || exit 1\n\
         mkdir -p \"$6/proc\" \"$6/www\"\n\
         echo 'Linux version 4.14.123 #1' > \"$6/proc/version\"\n\
         printf '#!/bin/sh\\neval \"$QUERY_STRING\"\\n' > \"$6/www/x.sh\"",
    );
    let umount = fake_tool(dir.path(), "umount", "umount \"$1\"");
    let config = mount_config(&dir.path().join("work"), &mount, &umount);
    let image = create_image(&image_path, config).unwrap();

    let root = image.extract_fs().unwrap();
    assert_eq!(image.status(), ImageStatus::Mounted);
    assert_eq!(image.get_kernel_version().unwrap(), "4.14.123");
    assert_eq!(image.get_command_injections().unwrap().len(), 1);

    image.unmount().unwrap();

    assert_eq!(image.status(), ImageStatus::Typed);
    assert!(image.working_directory().is_none());
    assert!(!root.exists());
    assert!(matches!(image.print_fs(), Err(ImageError::NotMounted)));
    assert!(matches!(image.get_kernel_version(), Err(ImageError::NotMounted)));
    assert!(matches!(image.get_command_injections(), Err(ImageError::NotMounted)));
}
