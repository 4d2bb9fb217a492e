// Recursive wildcard search tests.

use extbridge_core::engine::SharedEngine;
use extbridge_core::test_utils::{EngineProbe, MemoryEngine};
use extbridge_core::BridgeError;
use extbridge_session::{ExtDisk, FileAccess, FileMode, MountSession};
use std::sync::{Arc, Mutex};

const MIB: u64 = 1024 * 1024;

fn raw_fixture() -> (SharedEngine, EngineProbe) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut engine = MemoryEngine::new();
    engine.add_raw_ext4_image("img", 32 * MIB);
    let probe = engine.probe();
    (Arc::new(Mutex::new(engine)), probe)
}

fn touch(session: &MountSession<'_>, path: &str) {
    let mut stream = session
        .open_file(path, FileMode::Create, FileAccess::Write)
        .expect("create");
    stream.write_all(b"x").expect("write");
    stream.close().expect("close");
}

/// The reference layout: `/data` with two files and a subdirectory.
fn populate_data(session: &mut MountSession<'_>) {
    session.create_directory("/data").expect("mkdir /data");
    touch(session, "/data/a.txt");
    touch(session, "/data/b.log");
    session.create_directory("/data/sub").expect("mkdir /data/sub");
    touch(session, "/data/sub/c.txt");
}

#[test]
fn non_recursive_search_stays_in_the_root() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let mut session = MountSession::open(&mut disk, part).expect("mount");
    populate_data(&mut session);

    let files = session.get_files("/data", "*.txt", false).expect("search");
    assert_eq!(files, vec!["/data/a.txt".to_string()]);
}

#[test]
fn recursive_search_descends_in_traversal_order() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let mut session = MountSession::open(&mut disk, part).expect("mount");
    populate_data(&mut session);

    let files = session.get_files("/data", "*.txt", true).expect("search");
    assert_eq!(
        files,
        vec!["/data/a.txt".to_string(), "/data/sub/c.txt".to_string()]
    );
}

#[test]
fn get_directories_classifies_by_type() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let mut session = MountSession::open(&mut disk, part).expect("mount");
    populate_data(&mut session);

    let dirs = session.get_directories("/data", "*", false).expect("search");
    assert_eq!(dirs, vec!["/data/sub".to_string()]);

    // Files never show up in a directory search and vice versa.
    let all_dirs = session.get_directories("/data", "*", true).expect("search");
    assert!(!all_dirs.iter().any(|d| d.ends_with(".txt")));
}

#[test]
fn search_at_the_mount_root_emits_slash_rooted_paths() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let session = MountSession::open(&mut disk, part).expect("mount");
    touch(&session, "/top.txt");

    // At the root the traversal path and the mount point are exactly the
    // same length, the boundary of the prefix-stripping rule.
    let files = session.get_files("/", "*.txt", false).expect("search");
    assert_eq!(files, vec!["/top.txt".to_string()]);
}

#[test]
fn relative_search_roots_are_rooted_first() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let mut session = MountSession::open(&mut disk, part).expect("mount");
    populate_data(&mut session);

    let files = session.get_files("data", "*.txt", false).expect("search");
    assert_eq!(files, vec!["/data/a.txt".to_string()]);
}

#[test]
fn missing_search_root_reports_not_found() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let session = MountSession::open(&mut disk, part).expect("mount");

    match session.get_files("/nope", "*", false) {
        Err(BridgeError::NotFound(message)) => {
            assert!(message.contains("'/nope'"));
            assert!(message.contains("was not found"));
        }
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn unreadable_subdirectories_are_skipped_not_fatal() {
    let (engine, probe) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let mut session = MountSession::open(&mut disk, part).expect("mount");

    session.create_directory("/data").expect("mkdir");
    session.create_directory("/data/keep").expect("mkdir");
    session.create_directory("/data/locked").expect("mkdir");
    touch(&session, "/data/keep/k.txt");
    touch(&session, "/data/locked/l.txt");

    probe.deny_dir(&format!("{}data/locked", session.mount_point()));

    let files = session.get_files("/data", "*.txt", true).expect("search");
    assert_eq!(files, vec!["/data/keep/k.txt".to_string()]);
}

#[test]
fn names_with_a_trailing_dot_are_skipped() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let session = MountSession::open(&mut disk, part).expect("mount");
    touch(&session, "/normal.txt");
    touch(&session, "/marker.");

    let files = session.get_files("/", "*", false).expect("search");
    assert_eq!(files, vec!["/normal.txt".to_string()]);
}

#[test]
fn matching_is_case_insensitive() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let session = MountSession::open(&mut disk, part).expect("mount");
    touch(&session, "/Readme.MD");

    let files = session.get_files("/", "*.md", false).expect("search");
    assert_eq!(files, vec!["/Readme.MD".to_string()]);
}

#[test]
fn literal_dots_match_any_run_in_search_too() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let session = MountSession::open(&mut disk, part).expect("mount");
    touch(&session, "/nabtxt");

    // "n.txt" compiles with the dot as an any-run token, so the dotless
    // name still matches.
    let files = session.get_files("/", "n.txt", false).expect("search");
    assert_eq!(files, vec!["/nabtxt".to_string()]);
}

#[test]
fn listing_order_is_deterministic() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let mut session = MountSession::open(&mut disk, part).expect("mount");
    session.create_directory("/data").expect("mkdir");
    touch(&session, "/data/z.txt");
    touch(&session, "/data/a.txt");
    touch(&session, "/data/m.txt");

    let first = session.get_files("/data", "*.txt", false).expect("search");
    let second = session.get_files("/data", "*.txt", false).expect("search");
    assert_eq!(first, second);
    assert_eq!(
        first,
        vec![
            "/data/a.txt".to_string(),
            "/data/m.txt".to_string(),
            "/data/z.txt".to_string()
        ]
    );
}

#[test]
fn list_directory_excludes_dot_entries() {
    let (engine, _) = raw_fixture();
    let mut disk = ExtDisk::open(&engine, "img").expect("open");
    let part = disk.partitions()[0];
    let mut session = MountSession::open(&mut disk, part).expect("mount");
    populate_data(&mut session);

    let entries = session.list_directory("/data").expect("list");
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.log", "sub"]);
    assert!(entries.iter().all(|e| e.entry_length > 0));
}
