// Boundary with the external ext4 engine.
// The engine owns all on-disk ext4 semantics (superblocks, allocation,
// journaling, raw I/O); this crate only defines the primitive surface the
// session layer drives and the status codes the engine answers with.

use crate::error::BridgeError;
use crate::types::MountStats;
use std::sync::{Arc, Mutex, MutexGuard};

/// Status code returned by every engine primitive. The session layer never
/// interprets these beyond success/failure; they are carried into error
/// messages for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    NoEntry,
    Exists,
    NotADirectory,
    IsADirectory,
    NotEmpty,
    PermissionDenied,
    ReadOnly,
    NoSpace,
    InvalidInput,
    Io,
}

pub type EngineResult<T> = Result<T, EngineStatus>;

/// Opaque handle to a block source registered with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDevHandle(pub u64);

/// Opaque handle to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// Opaque handle to an open directory iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle(pub u64);

/// Inode type as reported by the engine's directory iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEntryKind {
    Unknown,
    RegularFile,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

/// One raw directory record. Unlike the caller-facing listing, iteration
/// yields the `.` and `..` entries too.
#[derive(Debug, Clone)]
pub struct RawDirEntry {
    pub name: String,
    pub kind: RawEntryKind,
    /// On-disk record length of the entry.
    pub entry_length: u32,
}

/// A partition table record from an MBR scan, in on-disk table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRecord {
    pub offset: u64,
    pub size: u64,
}

/// Which of the three inode timestamps an accessor addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    Creation,
    Access,
    Modification,
}

/// The external ext4 engine collaborator.
///
/// All operations are synchronous; blocking is the engine's business. Paths
/// handed to the engine are always mount-point-prefixed absolute paths;
/// session-relative paths never cross this boundary. Timestamps are 32-bit
/// seconds since 1970-01-01T00:00:00 UTC. File open modes are `fopen`-style
/// strings (`"rb"`, `"r+b"`, `"wb"`, `"w+b"`, `"ab"`, `"a+b"`).
pub trait Ext4Engine: Send {
    // Block source.
    fn blockdev_open(&mut self, path: &str) -> EngineResult<BlockDevHandle>;
    fn blockdev_release(&mut self, dev: BlockDevHandle) -> EngineResult<()>;
    fn blockdev_size(&self, dev: BlockDevHandle) -> EngineResult<u64>;
    fn blockdev_geometry(&self, dev: BlockDevHandle) -> EngineResult<crate::types::Geometry>;
    /// Current (offset, size) window the block device is configured to.
    fn blockdev_partition(&self, dev: BlockDevHandle) -> EngineResult<(u64, u64)>;
    fn blockdev_set_partition(
        &mut self,
        dev: BlockDevHandle,
        offset: u64,
        size: u64,
    ) -> EngineResult<()>;
    /// Raw first sector as read by the most recent scan.
    fn blockdev_boot_sector(&self, dev: BlockDevHandle) -> EngineResult<[u8; 512]>;
    fn block_init(&mut self, dev: BlockDevHandle) -> EngineResult<()>;
    fn block_fini(&mut self, dev: BlockDevHandle) -> EngineResult<()>;

    // Discovery.
    /// Probe the source for a bare ext4 superblock (no partition table).
    fn probe_ext4(&mut self, dev: BlockDevHandle) -> EngineResult<()>;
    /// Scan the MBR partition table, returning records in table order.
    fn mbr_scan(&mut self, dev: BlockDevHandle) -> EngineResult<Vec<PartitionRecord>>;

    // Registration and mounting.
    fn device_register(&mut self, dev: BlockDevHandle, name: &str) -> EngineResult<()>;
    fn device_unregister(&mut self, name: &str) -> EngineResult<()>;
    fn mount(&mut self, name: &str, mount_point: &str, read_only: bool) -> EngineResult<()>;
    fn umount(&mut self, mount_point: &str) -> EngineResult<()>;
    fn mount_point_stats(&self, mount_point: &str) -> EngineResult<MountStats>;
    fn fs_read_only(&self, mount_point: &str) -> EngineResult<bool>;

    // Files.
    fn file_open(&mut self, path: &str, mode: &str) -> EngineResult<FileHandle>;
    fn file_close(&mut self, file: FileHandle) -> EngineResult<()>;
    fn file_read(&mut self, file: FileHandle, buf: &mut [u8]) -> EngineResult<usize>;
    fn file_write(&mut self, file: FileHandle, buf: &[u8]) -> EngineResult<usize>;
    fn file_truncate(&mut self, file: FileHandle, size: u64) -> EngineResult<()>;
    fn file_size(&self, file: FileHandle) -> EngineResult<u64>;
    fn file_remove(&mut self, path: &str) -> EngineResult<()>;
    fn file_rename(&mut self, from: &str, to: &str) -> EngineResult<()>;

    // Directories.
    fn dir_open(&mut self, path: &str) -> EngineResult<DirHandle>;
    /// Next raw entry, or `None` at end of listing.
    fn dir_read(&mut self, dir: DirHandle) -> EngineResult<Option<RawDirEntry>>;
    fn dir_close(&mut self, dir: DirHandle) -> EngineResult<()>;
    fn dir_make(&mut self, path: &str) -> EngineResult<()>;
    fn dir_remove(&mut self, path: &str) -> EngineResult<()>;
    fn dir_move(&mut self, from: &str, to: &str) -> EngineResult<()>;

    // Links.
    fn symlink_create(&mut self, target: &str, path: &str) -> EngineResult<()>;
    fn hardlink_create(&mut self, target: &str, path: &str) -> EngineResult<()>;
    fn readlink(&self, path: &str) -> EngineResult<String>;

    // Metadata.
    fn mode_get(&self, path: &str) -> EngineResult<u32>;
    fn mode_set(&mut self, path: &str, mode: u32) -> EngineResult<()>;
    fn owner_get(&self, path: &str) -> EngineResult<(u32, u32)>;
    fn owner_set(&mut self, path: &str, uid: u32, gid: u32) -> EngineResult<()>;
    fn time_get(&self, path: &str, kind: TimeKind) -> EngineResult<u32>;
    fn time_set(&mut self, path: &str, kind: TimeKind, seconds: u32) -> EngineResult<()>;
}

/// Shared, lock-guarded engine handle. Disks and the sessions opened from
/// them all talk to the engine through one of these.
pub type SharedEngine = Arc<Mutex<dyn Ext4Engine>>;

/// Lock the shared engine, surfacing lock poisoning as an IO failure rather
/// than a panic.
pub fn lock(engine: &SharedEngine) -> Result<MutexGuard<'_, dyn Ext4Engine + 'static>, BridgeError> {
    engine
        .lock()
        .map_err(|_| BridgeError::Io("ext4 engine lock poisoned".to_string()))
}
