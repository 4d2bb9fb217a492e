// Mount session lifecycle and the file/directory operation surface.
//
// A session binds one partition of an `ExtDisk` into the engine's namespace
// under a freshly generated device name and addresses everything beneath the
// resulting `/<name>/` mount point. Caller-supplied paths are always
// session-relative; they are prefixed with the mount point before they reach
// the engine.

use crate::devname;
use crate::disk::ExtDisk;
use crate::paths::{combine_paths, ensure_rooted};
use crate::stream::{ExtFileStream, FileAccess, FileMode};
use chrono::{DateTime, Utc};
use extbridge_core::engine::{self, RawEntryKind, SharedEngine, TimeKind};
use extbridge_core::{BridgeError, DirEntry, EntryKind, MountStats, Partition};
use log::{debug, warn};

/// Intermediate buffer size used by `copy_file`.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// An ext4 partition mounted read-write into the engine's namespace.
///
/// The mutable borrow of the disk lasts for the whole session, so a second
/// session cannot bind the same disk's block device while this one is alive.
pub struct MountSession<'d> {
    disk: &'d mut ExtDisk,
    engine: SharedEngine,
    device_name: String,
    mount_point: String,
    closed: bool,
}

impl<'d> MountSession<'d> {
    /// Configure the disk's block device to `partition`, register it under a
    /// fresh device name and mount it read-write.
    ///
    /// If registration succeeds but the mount fails, the device is
    /// unregistered again before the error is returned; a
    /// registered-but-unmounted device is never left behind.
    pub fn open(disk: &'d mut ExtDisk, partition: Partition) -> Result<Self, BridgeError> {
        let engine = disk.engine();
        let dev = disk.device();
        {
            let mut eng = engine::lock(&engine)?;
            eng.blockdev_set_partition(dev, partition.offset, partition.size)
                .map_err(|status| {
                    BridgeError::Io(format!(
                        "could not select partition at offset {}: {:?}",
                        partition.offset, status
                    ))
                })?;
            eng.block_init(dev).map_err(|status| {
                BridgeError::Io(format!(
                    "could not initialize block device '{}': {:?}",
                    disk.path(),
                    status
                ))
            })?;
        }

        let device_name = devname::reserve();
        let mount_point = format!("/{}/", device_name);

        let mut eng = match engine::lock(&engine) {
            Ok(eng) => eng,
            Err(e) => {
                devname::release(&device_name);
                return Err(e);
            }
        };
        if let Err(status) = eng.device_register(dev, &device_name) {
            drop(eng);
            devname::release(&device_name);
            return Err(BridgeError::Io(format!(
                "could not register device '{}': {:?}",
                device_name, status
            )));
        }
        if let Err(status) = eng.mount(&device_name, &mount_point, false) {
            if let Err(cleanup) = eng.device_unregister(&device_name) {
                warn!(
                    "cleanup unregister of '{}' reported: {:?}",
                    device_name, cleanup
                );
            }
            drop(eng);
            devname::release(&device_name);
            return Err(BridgeError::Io(format!(
                "could not mount partition: {:?}",
                status
            )));
        }
        drop(eng);

        debug!(
            "mounted partition at offset {} of '{}' at '{}'",
            partition.offset,
            disk.path(),
            mount_point
        );
        Ok(MountSession {
            disk,
            engine,
            device_name,
            mount_point,
            closed: false,
        })
    }

    /// Tear the session down: unmount, unregister the device, finalize the
    /// block device, in that order.
    ///
    /// Idempotent: a second call is a no-op. Every step runs even when an
    /// earlier one fails; the first failure is the one reported.
    pub fn close(&mut self) -> Result<(), BridgeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_error = None;
        match engine::lock(&self.engine) {
            Ok(mut eng) => {
                if let Err(status) = eng.umount(&self.mount_point) {
                    first_error.get_or_insert(BridgeError::Io(format!(
                        "could not unmount '{}': {:?}",
                        self.mount_point, status
                    )));
                }
                if let Err(status) = eng.device_unregister(&self.device_name) {
                    first_error.get_or_insert(BridgeError::Io(format!(
                        "could not unregister device '{}': {:?}",
                        self.device_name, status
                    )));
                }
                if let Err(status) = eng.block_fini(self.disk.device()) {
                    first_error.get_or_insert(BridgeError::Io(format!(
                        "could not finalize block device '{}': {:?}",
                        self.disk.path(),
                        status
                    )));
                }
            }
            Err(e) => first_error = Some(e),
        }
        devname::release(&self.device_name);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Namespace prefix of this session, always `/<device-name>/`.
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    // -- directories --

    pub fn create_directory(&mut self, path: &str) -> Result<(), BridgeError> {
        let full = self.require_path(path, "directory")?;
        engine::lock(&self.engine)?.dir_make(&full).map_err(|status| {
            BridgeError::Io(format!("could not create directory '{}': {:?}", path, status))
        })
    }

    pub fn delete_directory(&mut self, path: &str) -> Result<(), BridgeError> {
        let full = self.require_path(path, "directory")?;
        engine::lock(&self.engine)?.dir_remove(&full).map_err(|status| {
            BridgeError::Io(format!("could not delete directory '{}': {:?}", path, status))
        })
    }

    pub fn directory_exists(&self, path: &str) -> Result<bool, BridgeError> {
        let full = self.require_path(path, "directory")?;
        let mut eng = engine::lock(&self.engine)?;
        match eng.dir_open(&full) {
            Ok(dir) => {
                let _ = eng.dir_close(dir);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Move a directory. The destination must not exist yet.
    pub fn move_directory(&mut self, source: &str, destination: &str) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if source.is_empty() || destination.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "source or destination path is empty".to_string(),
            ));
        }
        if !self.directory_exists(source)? {
            return Err(BridgeError::NotFound(format!(
                "could not find directory '{}'",
                source
            )));
        }
        if self.directory_exists(destination)? {
            return Err(BridgeError::AlreadyExists(format!(
                "'{}' already exists",
                destination
            )));
        }
        let from = self.resolve(source);
        let to = self.resolve(destination);
        engine::lock(&self.engine)?.dir_move(&from, &to).map_err(|status| {
            BridgeError::Io(format!("could not move directory '{}': {:?}", source, status))
        })
    }

    /// List a directory, excluding the `.`/`..` self and parent entries.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, BridgeError> {
        self.ensure_open()?;
        let full = self.resolve(&ensure_rooted(path));
        self.list_directory_full(&full)
    }

    /// Listing over an already mount-prefixed path.
    pub(crate) fn list_directory_full(&self, full_path: &str) -> Result<Vec<DirEntry>, BridgeError> {
        let mut eng = engine::lock(&self.engine)?;
        let dir = eng.dir_open(full_path).map_err(|status| {
            BridgeError::Io(format!(
                "failed to open directory '{}': {:?}",
                full_path, status
            ))
        })?;
        let mut entries = Vec::new();
        loop {
            match eng.dir_read(dir) {
                Ok(Some(raw)) => {
                    if raw.name.is_empty() || raw.name == "." || raw.name == ".." {
                        continue;
                    }
                    let kind = if raw.kind == RawEntryKind::Directory {
                        EntryKind::Directory
                    } else {
                        EntryKind::RegularFile
                    };
                    entries.push(DirEntry {
                        name: raw.name,
                        entry_length: raw.entry_length,
                        kind,
                    });
                }
                Ok(None) => break,
                Err(status) => {
                    let _ = eng.dir_close(dir);
                    return Err(BridgeError::Io(format!(
                        "failed to read directory '{}': {:?}",
                        full_path, status
                    )));
                }
            }
        }
        eng.dir_close(dir).map_err(|status| {
            BridgeError::Io(format!(
                "failed to close directory '{}': {:?}",
                full_path, status
            ))
        })?;
        Ok(entries)
    }

    // -- files --

    pub fn delete_file(&mut self, path: &str) -> Result<(), BridgeError> {
        let full = self.require_path(path, "file")?;
        engine::lock(&self.engine)?.file_remove(&full).map_err(|status| {
            BridgeError::Io(format!("could not delete file '{}': {:?}", path, status))
        })
    }

    pub fn file_exists(&self, path: &str) -> Result<bool, BridgeError> {
        let full = self.require_path(path, "file")?;
        let mut eng = engine::lock(&self.engine)?;
        match eng.file_open(&full, "rb") {
            Ok(file) => {
                let _ = eng.file_close(file);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Rename a file. The destination must not exist yet.
    pub fn rename_file(&mut self, source: &str, destination: &str) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if source.is_empty() || destination.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "source or destination path is empty".to_string(),
            ));
        }
        if !self.file_exists(source)? {
            return Err(BridgeError::NotFound(format!(
                "could not find file '{}'",
                source
            )));
        }
        if self.file_exists(destination)? {
            return Err(BridgeError::AlreadyExists(format!(
                "'{}' already exists",
                destination
            )));
        }
        let from = self.resolve(source);
        let to = self.resolve(destination);
        engine::lock(&self.engine)?.file_rename(&from, &to).map_err(|status| {
            BridgeError::Io(format!("could not move file '{}': {:?}", source, status))
        })
    }

    /// Copy `source` to `destination` through a fixed-size buffer. With
    /// `overwrite` set, an existing destination is deleted first; without it,
    /// an existing destination is an error and keeps its contents.
    pub fn copy_file(
        &mut self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if source.is_empty() || destination.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "source or destination path is empty".to_string(),
            ));
        }
        if !self.file_exists(source)? {
            return Err(BridgeError::NotFound(format!(
                "could not find file '{}'",
                source
            )));
        }
        if self.file_exists(destination)? {
            if !overwrite {
                return Err(BridgeError::AlreadyExists(format!(
                    "'{}' already exists",
                    destination
                )));
            }
            self.delete_file(destination)?;
        }

        let mut src = self.open_file(source, FileMode::Open, FileAccess::Read)?;
        let mut dst = self.open_file(destination, FileMode::CreateNew, FileAccess::Write)?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])?;
        }
        src.close()?;
        dst.close()
    }

    /// Open a byte stream on a file in this session's namespace.
    pub fn open_file(
        &self,
        path: &str,
        mode: FileMode,
        access: FileAccess,
    ) -> Result<ExtFileStream, BridgeError> {
        self.ensure_open()?;
        ExtFileStream::open(self, path, mode, access)
    }

    /// Shrink or extend a regular file to `size` bytes.
    pub fn truncate(&mut self, path: &str, size: u64) -> Result<(), BridgeError> {
        let full = self.require_path(path, "file")?;
        if !self.file_exists(path)? {
            return Err(BridgeError::NotFound(format!(
                "could not find file '{}'",
                path
            )));
        }
        let mut eng = engine::lock(&self.engine)?;
        let file = eng.file_open(&full, "r+b").map_err(|status| {
            BridgeError::Io(format!("could not open file '{}': {:?}", path, status))
        })?;
        // Close on every exit path; a failed truncate must not leak the
        // engine handle.
        let truncated = eng.file_truncate(file, size);
        let closed = eng.file_close(file);
        truncated.map_err(|status| {
            BridgeError::Io(format!("could not truncate file '{}': {:?}", path, status))
        })?;
        closed.map_err(|status| {
            BridgeError::Io(format!("could not close file '{}': {:?}", path, status))
        })
    }

    pub fn get_file_length(&self, path: &str) -> Result<u64, BridgeError> {
        let full = self.require_path(path, "file")?;
        let mut eng = engine::lock(&self.engine)?;
        let file = eng.file_open(&full, "rb").map_err(|status| {
            BridgeError::Io(format!("could not open file '{}': {:?}", path, status))
        })?;
        let size = eng.file_size(file);
        let _ = eng.file_close(file);
        size.map_err(|status| {
            BridgeError::Io(format!("could not size file '{}': {:?}", path, status))
        })
    }

    // -- links --

    /// Create a symbolic link at `path` pointing at `target`. The target
    /// string is stored verbatim; only the link path lives in this session's
    /// namespace.
    pub fn create_sym_link(&mut self, target: &str, path: &str) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if target.is_empty() || path.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "target or link path is empty".to_string(),
            ));
        }
        let full = self.resolve(path);
        engine::lock(&self.engine)?
            .symlink_create(target, &full)
            .map_err(|status| {
                BridgeError::Io(format!(
                    "could not create symbolic link '{}': {:?}",
                    path, status
                ))
            })
    }

    /// Create a hard link at `path` for the file at `target`; both are
    /// session-relative.
    pub fn create_hard_link(&mut self, target: &str, path: &str) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if target.is_empty() || path.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "target or link path is empty".to_string(),
            ));
        }
        let full_target = self.resolve(target);
        let full = self.resolve(path);
        engine::lock(&self.engine)?
            .hardlink_create(&full_target, &full)
            .map_err(|status| {
                BridgeError::Io(format!("could not create hard link '{}': {:?}", path, status))
            })
    }

    pub fn read_sym_link(&self, path: &str) -> Result<String, BridgeError> {
        let full = self.require_path(path, "link")?;
        engine::lock(&self.engine)?.readlink(&full).map_err(|status| {
            BridgeError::Io(format!("could not read link '{}': {:?}", path, status))
        })
    }

    // -- metadata --

    /// Raw permission/type bitfield; no interpretation happens here.
    pub fn get_mode(&self, path: &str) -> Result<u32, BridgeError> {
        let full = self.require_path(path, "file")?;
        engine::lock(&self.engine)?.mode_get(&full).map_err(|status| {
            BridgeError::Io(format!("could not get mode '{}': {:?}", path, status))
        })
    }

    pub fn set_mode(&mut self, path: &str, mode: u32) -> Result<(), BridgeError> {
        let full = self.require_path(path, "file")?;
        engine::lock(&self.engine)?.mode_set(&full, mode).map_err(|status| {
            BridgeError::Io(format!("could not change mode '{}': {:?}", path, status))
        })
    }

    /// Owner as a raw (uid, gid) pair; no name-service lookup happens here.
    pub fn get_owner(&self, path: &str) -> Result<(u32, u32), BridgeError> {
        let full = self.require_path(path, "file")?;
        engine::lock(&self.engine)?.owner_get(&full).map_err(|status| {
            BridgeError::Io(format!("could not get owner '{}': {:?}", path, status))
        })
    }

    pub fn set_owner(&mut self, path: &str, uid: u32, gid: u32) -> Result<(), BridgeError> {
        let full = self.require_path(path, "file")?;
        engine::lock(&self.engine)?
            .owner_set(&full, uid, gid)
            .map_err(|status| {
                BridgeError::Io(format!("could not change owner '{}': {:?}", path, status))
            })
    }

    pub fn get_creation_time(&self, path: &str) -> Result<DateTime<Utc>, BridgeError> {
        self.time_get(path, TimeKind::Creation, "creation")
    }

    pub fn set_creation_time(&mut self, path: &str, time: DateTime<Utc>) -> Result<(), BridgeError> {
        self.time_set(path, TimeKind::Creation, time, "creation")
    }

    pub fn get_last_access_time(&self, path: &str) -> Result<DateTime<Utc>, BridgeError> {
        self.time_get(path, TimeKind::Access, "last access")
    }

    pub fn set_last_access_time(
        &mut self,
        path: &str,
        time: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        self.time_set(path, TimeKind::Access, time, "last access")
    }

    pub fn get_last_write_time(&self, path: &str) -> Result<DateTime<Utc>, BridgeError> {
        self.time_get(path, TimeKind::Modification, "last write")
    }

    pub fn set_last_write_time(
        &mut self,
        path: &str,
        time: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        self.time_set(path, TimeKind::Modification, time, "last write")
    }

    /// Whether the mounted filesystem accepts writes. Sessions are mounted
    /// read-write, so this reflects engine-enforced read-only state.
    pub fn can_write(&self) -> Result<bool, BridgeError> {
        self.ensure_open()?;
        let read_only = engine::lock(&self.engine)?
            .fs_read_only(&self.mount_point)
            .map_err(|status| {
                BridgeError::Io(format!(
                    "could not query mount state of '{}': {:?}",
                    self.mount_point, status
                ))
            })?;
        Ok(!read_only)
    }

    /// Volume label, or an empty string when the query fails. Deliberately
    /// lenient, unlike the other accessors: label display must not take a
    /// session down.
    pub fn volume_label(&self) -> String {
        if self.closed {
            return String::new();
        }
        let eng = match engine::lock(&self.engine) {
            Ok(eng) => eng,
            Err(_) => return String::new(),
        };
        match eng.mount_point_stats(&self.mount_point) {
            Ok(stats) => stats.volume_name,
            Err(_) => String::new(),
        }
    }

    /// Full mount-point statistics.
    pub fn mount_stats(&self) -> Result<MountStats, BridgeError> {
        self.ensure_open()?;
        engine::lock(&self.engine)?
            .mount_point_stats(&self.mount_point)
            .map_err(|status| {
                BridgeError::Io(format!(
                    "could not read mount statistics of '{}': {:?}",
                    self.mount_point, status
                ))
            })
    }

    // -- internals --

    pub(crate) fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed {
            Err(BridgeError::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn resolve(&self, path: &str) -> String {
        combine_paths(&self.mount_point, path)
    }

    pub(crate) fn engine_handle(&self) -> SharedEngine {
        self.engine.clone()
    }

    fn require_path(&self, path: &str, what: &str) -> Result<String, BridgeError> {
        self.ensure_open()?;
        if path.is_empty() {
            return Err(BridgeError::InvalidArgument(format!(
                "{} path is empty",
                what
            )));
        }
        Ok(self.resolve(path))
    }

    fn time_get(
        &self,
        path: &str,
        kind: TimeKind,
        what: &str,
    ) -> Result<DateTime<Utc>, BridgeError> {
        let full = self.require_path(path, "file")?;
        let seconds = engine::lock(&self.engine)?
            .time_get(&full, kind)
            .map_err(|status| {
                BridgeError::Io(format!(
                    "could not get {} time '{}': {:?}",
                    what, path, status
                ))
            })?;
        DateTime::from_timestamp(seconds as i64, 0).ok_or_else(|| {
            BridgeError::Io(format!(
                "engine returned unrepresentable {} time for '{}'",
                what, path
            ))
        })
    }

    fn time_set(
        &mut self,
        path: &str,
        kind: TimeKind,
        time: DateTime<Utc>,
        what: &str,
    ) -> Result<(), BridgeError> {
        let full = self.require_path(path, "file")?;
        // Fractional seconds are dropped; the engine stores whole seconds.
        let seconds = time.timestamp();
        if seconds < 0 || seconds > u32::MAX as i64 {
            return Err(BridgeError::InvalidArgument(format!(
                "{} time out of range for '{}'",
                what, path
            )));
        }
        engine::lock(&self.engine)?
            .time_set(&full, kind, seconds as u32)
            .map_err(|status| {
                BridgeError::Io(format!(
                    "could not set {} time '{}': {:?}",
                    what, path, status
                ))
            })
    }
}

impl Drop for MountSession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("session teardown for '{}' reported: {}", self.device_name, e);
        }
    }
}
