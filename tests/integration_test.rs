use cookvfs::archive::{Mount, MountOptions};
use cookvfs::codec::CompressionType;
use cookvfs::error::CookfsError;
use tempfile::NamedTempFile;

fn temp_path() -> std::path::PathBuf {
    let f = NamedTempFile::new().unwrap();
    let path = f.path().to_path_buf();
    // drop the handle but keep the path: Mount::create truncates/creates on its own
    drop(f);
    path
}

#[test]
fn scenario_1_create_reopen_roundtrip() {
    let path = temp_path();
    let mut mount = Mount::create(&path, MountOptions::default()).unwrap();
    mount.add_file_bytes("/a.txt", b"hello").unwrap();
    mount.close().unwrap();

    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    assert_eq!(mount.read_file("/a.txt").unwrap(), b"hello");
}

#[test]
fn scenario_2_dedup_across_large_files() {
    let path = temp_path();
    let mut options = MountOptions::default();
    options.compression = CompressionType::Zlib;
    // force both writes through the large-file path, and make the page large
    // enough that each 300 KiB payload lands on exactly one page
    options.small_file_size = 0;
    options.page_size = 512 * 1024;

    let payload: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();

    let mut mount = Mount::create(&path, options).unwrap();
    mount.add_file_bytes("/x", &payload).unwrap();
    mount.add_file_bytes("/y", &payload).unwrap();
    mount.close().unwrap();

    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    // one data page plus dedup means page count stays at 1
    assert_eq!(mount.page_count().unwrap(), 1);
    assert_eq!(mount.read_file("/x").unwrap(), payload);
    assert_eq!(mount.read_file("/y").unwrap(), payload);
}

#[test]
fn scenario_3_small_file_packing_and_sort_order() {
    let path = temp_path();
    let mut options = MountOptions::default();
    options.small_file_size = 1024;
    options.page_size = 4096;

    let mut mount = Mount::create(&path, options).unwrap();
    let mut contents = Vec::new();
    for i in 0..10u8 {
        let name = format!("/f{}.txt", i);
        let data = vec![i; 300];
        mount.add_file_bytes(&name, &data).unwrap();
        contents.push((name, data));
    }
    assert_eq!(mount.pending_buffer_bytes(), 3000);
    mount.close().unwrap();

    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    assert_eq!(mount.page_count().unwrap(), 1);
    for (name, data) in contents {
        assert_eq!(mount.read_file(&name).unwrap(), data);
    }
}

#[test]
fn scenario_4_password_protects_and_rejects_wrong_password() {
    let path = temp_path();
    let mut options = MountOptions::default();
    options.password = Some("pw".to_string());

    let mut mount = Mount::create(&path, options).unwrap();
    mount.add_file_bytes("/secret", b"top").unwrap();
    mount.close().unwrap();

    let mut bad_options = MountOptions::default();
    bad_options.password = Some("bad".to_string());
    let err = Mount::open(&path, bad_options).unwrap_err();
    assert!(matches!(err, CookfsError::EncryptionError(_)));

    let mut good_options = MountOptions::default();
    good_options.password = Some("pw".to_string());
    let mut mount = Mount::open(&path, good_options).unwrap();
    assert_eq!(mount.read_file("/secret").unwrap(), b"top");
}

#[test]
fn scenario_5_aside_overlay_write_and_detach() {
    let path = temp_path();
    let mut mount = Mount::create(&path, MountOptions::default()).unwrap();
    mount.add_file_bytes("/base", b"original").unwrap();
    mount.close().unwrap();

    let aside_path = temp_path();
    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    mount.attach_aside(&aside_path, MountOptions::default()).unwrap();
    mount.add_file_bytes("/new", b"delta").unwrap();
    assert_eq!(mount.read_file("/new").unwrap(), b"delta");

    mount.detach_aside().unwrap();
    let err = mount.read_file("/new").unwrap_err();
    assert!(matches!(err, CookfsError::NotFound));
}

#[test]
fn scenario_6_seek_and_read_large_file() {
    let path = temp_path();
    let payload: Vec<u8> = (0..5 * 1024 * 1024).map(|i| (i % 256) as u8).collect();

    let mut mount = Mount::create(&path, MountOptions::default()).unwrap();
    mount.add_file_bytes("/big", &payload).unwrap();
    mount.close().unwrap();

    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    let slice = mount.read_range("/big", 1_048_576, 4).unwrap();
    assert_eq!(slice, &payload[1_048_576..1_048_580]);
}

#[test]
fn empty_file_reads_back_empty() {
    let path = temp_path();
    let mut mount = Mount::create(&path, MountOptions::default()).unwrap();
    mount.add_file_bytes("/empty", b"").unwrap();
    mount.close().unwrap();

    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    assert_eq!(mount.read_file("/empty").unwrap(), b"");
}

#[test]
fn reopen_with_no_changes_leaves_change_counter_at_zero() {
    let path = temp_path();
    let mut mount = Mount::create(&path, MountOptions::default()).unwrap();
    mount.add_file_bytes("/a.txt", b"hello").unwrap();
    mount.close().unwrap();

    let mount = Mount::open(&path, MountOptions::default()).unwrap();
    mount.close().unwrap();

    let size_after_first_close = std::fs::metadata(&path).unwrap().len();
    let mount = Mount::open(&path, MountOptions::default()).unwrap();
    mount.close().unwrap();
    let size_after_second_close = std::fs::metadata(&path).unwrap().len();
    assert_eq!(size_after_first_close, size_after_second_close);
}

#[test]
fn unset_pending_small_file_then_close_does_not_error() {
    let path = temp_path();
    let mut mount = Mount::create(&path, MountOptions::default()).unwrap();
    mount.add_file_bytes("/soon_deleted.txt", b"small").unwrap();
    mount.unset("/soon_deleted.txt", false).unwrap();
    mount.close().unwrap();

    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    assert!(matches!(
        mount.read_file("/soon_deleted.txt").unwrap_err(),
        CookfsError::NotFound
    ));
}

#[test]
fn unset_one_pending_small_file_keeps_another_readable() {
    let path = temp_path();
    let mut mount = Mount::create(&path, MountOptions::default()).unwrap();
    mount.add_file_bytes("/keep.txt", b"keep me").unwrap();
    mount.add_file_bytes("/drop.txt", b"drop me").unwrap();
    mount.unset("/drop.txt", false).unwrap();
    mount.close().unwrap();

    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    assert_eq!(mount.read_file("/keep.txt").unwrap(), b"keep me");
    assert!(matches!(
        mount.read_file("/drop.txt").unwrap_err(),
        CookfsError::NotFound
    ));
}

#[test]
fn small_file_dedup_survives_a_reopen() {
    let path = temp_path();
    let mut mount = Mount::create(&path, MountOptions::default()).unwrap();
    mount.add_file_bytes("/first.txt", b"shared content").unwrap();
    mount.close().unwrap();

    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    assert_eq!(mount.page_count().unwrap(), 1);
    mount.add_file_bytes("/second.txt", b"shared content").unwrap();
    mount.close().unwrap();

    let mut mount = Mount::open(&path, MountOptions::default()).unwrap();
    // the second write deduped against the first session's page instead of
    // allocating a new one
    assert_eq!(mount.page_count().unwrap(), 1);
    assert_eq!(mount.read_file("/first.txt").unwrap(), b"shared content");
    assert_eq!(mount.read_file("/second.txt").unwrap(), b"shared content");
}

#[test]
fn listing_and_unset_directory() {
    let path = temp_path();
    let mut mount = Mount::create(&path, MountOptions::default()).unwrap();
    mount.set_directory("/docs").unwrap();
    mount.add_file_bytes("/docs/readme.txt", b"hi").unwrap();

    let entries = mount.list("/docs").unwrap();
    assert_eq!(entries, vec!["readme.txt".to_string()]);

    assert!(mount.unset("/docs", false).is_err());
    mount.unset("/docs", true).unwrap();
    assert!(matches!(mount.read_file("/docs/readme.txt").unwrap_err(), CookfsError::NotFound));
}
