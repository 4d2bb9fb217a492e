// Disk discovery tests against the in-memory engine.

use extbridge_core::engine::SharedEngine;
use extbridge_core::test_utils::MemoryEngine;
use extbridge_core::{BridgeError, Partition};
use extbridge_session::ExtDisk;
use std::sync::{Arc, Mutex};

const MIB: u64 = 1024 * 1024;

fn share(engine: MemoryEngine) -> SharedEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(Mutex::new(engine))
}

#[test]
fn raw_image_yields_single_whole_source_partition() {
    let mut engine = MemoryEngine::new();
    engine.add_raw_ext4_image("rootfs.img", 32 * MIB);
    let engine = share(engine);

    let disk = ExtDisk::open(&engine, "rootfs.img").expect("raw image should open");
    assert!(disk.is_raw());
    assert_eq!(
        disk.partitions(),
        &[Partition {
            offset: 0,
            size: 32 * MIB
        }]
    );
    assert!(disk.geometry().is_none());
    assert_eq!(disk.capacity(), 0);
}

#[test]
fn open_with_empty_path_is_none() {
    let engine = share(MemoryEngine::new());
    assert!(ExtDisk::open(&engine, "").is_none());
}

#[test]
fn open_with_unreadable_path_is_none() {
    let engine = share(MemoryEngine::new());
    assert!(ExtDisk::open(&engine, "missing.img").is_none());
}

#[test]
fn mbr_disk_preserves_table_order() {
    // Deliberately not sorted by offset; the table order is the contract.
    let table = [
        (16 * MIB, 8 * MIB),
        (2 * MIB, 4 * MIB),
        (32 * MIB, 16 * MIB),
    ];
    let mut engine = MemoryEngine::new();
    engine.add_mbr_disk("/dev/sdb", 64 * MIB, &table);
    let engine = share(engine);

    let disk = ExtDisk::open(&engine, "/dev/sdb").expect("MBR disk should open");
    assert!(!disk.is_raw());
    let offsets: Vec<u64> = disk.partitions().iter().map(|p| p.offset).collect();
    assert_eq!(offsets, vec![16 * MIB, 2 * MIB, 32 * MIB]);

    let total: u64 = disk.partitions().iter().map(|p| p.size).sum();
    assert!(total <= disk.capacity());
    assert_eq!(disk.capacity(), 64 * MIB);

    let geometry = disk.geometry().expect("MBR disks report geometry");
    assert_eq!(geometry.size, 64 * MIB);
    assert_eq!(geometry.sectors_per_track, 63);
}

#[test]
fn raw_probe_wins_over_valid_mbr() {
    // A source that would satisfy both interpretations must come out raw:
    // the superblock probe runs before any table scan.
    let mut engine = MemoryEngine::new();
    engine.add_raw_ext4_image_with_mbr("dual.img", 16 * MIB, &[(MIB, 4 * MIB)]);
    let engine = share(engine);

    let disk = ExtDisk::open(&engine, "dual.img").expect("should open");
    assert!(disk.is_raw());
    assert_eq!(
        disk.partitions(),
        &[Partition {
            offset: 0,
            size: 16 * MIB
        }]
    );
}

#[test]
fn physical_disk_open_is_strict() {
    let mut engine = MemoryEngine::new();
    engine.add_mbr_disk("PhysicalDrive0", 64 * MIB, &[(MIB, 8 * MIB)]);
    let engine = share(engine);

    let disk = ExtDisk::open_disk_number(&engine, 0).expect("disk 0 is present");
    assert_eq!(disk.partitions().len(), 1);
    assert_eq!(disk.path(), "PhysicalDrive0");

    // No disk 1: unlike path-based open, this reports the failure.
    assert!(matches!(
        ExtDisk::open_disk_number(&engine, 1),
        Err(BridgeError::Io(_))
    ));
}

#[test]
fn physical_disk_open_has_no_raw_fallback() {
    let mut engine = MemoryEngine::new();
    engine.add_raw_ext4_image("PhysicalDrive2", 16 * MIB);
    let engine = share(engine);

    assert!(matches!(
        ExtDisk::open_disk_number(&engine, 2),
        Err(BridgeError::Io(_))
    ));
    // The same source opens fine through the path-based entry point.
    assert!(ExtDisk::open(&engine, "PhysicalDrive2").is_some());
}

#[test]
fn master_boot_record_returns_the_raw_sector() {
    let mut engine = MemoryEngine::new();
    engine.add_mbr_disk("/dev/sdc", 64 * MIB, &[(2 * MIB, 4 * MIB)]);
    let engine = share(engine);

    let disk = ExtDisk::open(&engine, "/dev/sdc").expect("should open");
    let sector = disk.master_boot_record().expect("MBR readable");
    assert_eq!(sector[510], 0x55);
    assert_eq!(sector[511], 0xAA);
    assert_eq!(sector[446 + 4], 0x83);
}

#[test]
fn master_boot_record_fails_on_raw_images() {
    let mut engine = MemoryEngine::new();
    engine.add_raw_ext4_image("rootfs.img", 16 * MIB);
    let engine = share(engine);

    let disk = ExtDisk::open(&engine, "rootfs.img").expect("should open");
    assert!(matches!(
        disk.master_boot_record(),
        Err(BridgeError::Io(_))
    ));
}
