/// Test utilities and mock implementations for safe testing.
///
/// `MemoryEngine` is a complete in-memory `Ext4Engine`: block devices are
/// byte images, the MBR scan parses a real boot sector, and every mounted
/// partition gets its own tree of directories, files and symlinks. It never
/// touches real hardware.
use crate::engine::{
    BlockDevHandle, DirHandle, EngineResult, EngineStatus, Ext4Engine, FileHandle,
    PartitionRecord, RawDirEntry, RawEntryKind, TimeKind,
};
use crate::types::{Geometry, MountStats};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

const SECTOR_SIZE: u64 = 512;
const MBR_TABLE_OFFSET: usize = 446;

#[derive(Debug, Clone)]
struct Meta {
    mode: u32,
    uid: u32,
    gid: u32,
    ctime: u32,
    atime: u32,
    mtime: u32,
}

impl Meta {
    fn with_mode(mode: u32) -> Self {
        Meta {
            mode,
            uid: 0,
            gid: 0,
            ctime: 0,
            atime: 0,
            mtime: 0,
        }
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Dir(BTreeMap<String, Node>),
    File(Vec<u8>),
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    meta: Meta,
}

impl Node {
    fn dir() -> Self {
        Node {
            kind: NodeKind::Dir(BTreeMap::new()),
            meta: Meta::with_mode(0o040755),
        }
    }

    fn file() -> Self {
        Node {
            kind: NodeKind::File(Vec::new()),
            meta: Meta::with_mode(0o100644),
        }
    }

    fn symlink(target: &str) -> Self {
        Node {
            kind: NodeKind::Symlink(target.to_string()),
            meta: Meta::with_mode(0o120777),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }
}

fn lookup<'a>(mut node: &'a Node, comps: &[String]) -> EngineResult<&'a Node> {
    for comp in comps {
        match &node.kind {
            NodeKind::Dir(children) => {
                node = children.get(comp).ok_or(EngineStatus::NoEntry)?;
            }
            _ => return Err(EngineStatus::NotADirectory),
        }
    }
    Ok(node)
}

fn lookup_mut<'a>(mut node: &'a mut Node, comps: &[String]) -> EngineResult<&'a mut Node> {
    for comp in comps {
        match &mut node.kind {
            NodeKind::Dir(children) => {
                node = children.get_mut(comp).ok_or(EngineStatus::NoEntry)?;
            }
            _ => return Err(EngineStatus::NotADirectory),
        }
    }
    Ok(node)
}

/// Mutable children map of the parent directory plus the final name.
fn parent_mut<'a>(
    root: &'a mut Node,
    comps: &'a [String],
) -> EngineResult<(&'a mut BTreeMap<String, Node>, &'a str)> {
    let (name, dir_comps) = comps.split_last().ok_or(EngineStatus::InvalidInput)?;
    let parent = lookup_mut(root, dir_comps)?;
    match &mut parent.kind {
        NodeKind::Dir(children) => Ok((children, name.as_str())),
        _ => Err(EngineStatus::NotADirectory),
    }
}

fn move_node(
    root: &mut Node,
    from: &[String],
    to: &[String],
    want_dir: bool,
) -> EngineResult<()> {
    if from.is_empty() || to.is_empty() {
        return Err(EngineStatus::InvalidInput);
    }
    let source = lookup(root, from)?;
    if want_dir && !source.is_dir() {
        return Err(EngineStatus::NotADirectory);
    }
    if !want_dir && source.is_dir() {
        return Err(EngineStatus::IsADirectory);
    }
    if lookup(root, to).is_ok() {
        return Err(EngineStatus::Exists);
    }
    let (to_name, to_dir) = to.split_last().ok_or(EngineStatus::InvalidInput)?;
    if !lookup(root, to_dir)?.is_dir() {
        return Err(EngineStatus::NotADirectory);
    }
    let node = {
        let (children, name) = parent_mut(root, from)?;
        children.remove(name).ok_or(EngineStatus::NoEntry)?
    };
    let dest = lookup_mut(root, to_dir)?;
    match &mut dest.kind {
        NodeKind::Dir(children) => {
            children.insert(to_name.clone(), node);
            Ok(())
        }
        _ => Err(EngineStatus::NotADirectory),
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenFlags {
    read: bool,
    write: bool,
    create: bool,
    truncate: bool,
    append: bool,
}

fn parse_open_mode(mode: &str) -> EngineResult<OpenFlags> {
    let normalized: String = mode.chars().filter(|c| *c != 'b').collect();
    let flags = match normalized.as_str() {
        "r" => OpenFlags {
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
        },
        "r+" => OpenFlags {
            read: true,
            write: true,
            create: false,
            truncate: false,
            append: false,
        },
        "w" => OpenFlags {
            read: false,
            write: true,
            create: true,
            truncate: true,
            append: false,
        },
        "w+" => OpenFlags {
            read: true,
            write: true,
            create: true,
            truncate: true,
            append: false,
        },
        "a" => OpenFlags {
            read: false,
            write: true,
            create: true,
            truncate: false,
            append: true,
        },
        "a+" => OpenFlags {
            read: true,
            write: true,
            create: true,
            truncate: false,
            append: true,
        },
        _ => return Err(EngineStatus::InvalidInput),
    };
    Ok(flags)
}

struct MemBlockDevice {
    path: String,
    size: u64,
    /// Boot sector bytes; empty for raw ext4 images.
    image: Vec<u8>,
    /// Whether the raw superblock probe succeeds on this source.
    is_ext4: bool,
    part_offset: u64,
    part_size: u64,
    geometry: Geometry,
    read_only: bool,
    volume_name: String,
    /// One filesystem tree per partition byte offset; created on first mount.
    filesystems: HashMap<u64, Node>,
}

struct OpenFile {
    dev: u64,
    fs_key: u64,
    comps: Vec<String>,
    pos: usize,
    flags: OpenFlags,
}

struct OpenDir {
    entries: Vec<RawDirEntry>,
    cursor: usize,
}

#[derive(Clone, Copy)]
struct MountedFs {
    dev: u64,
    fs_key: u64,
    read_only: bool,
}

#[derive(Debug, Default)]
struct ProbeState {
    events: Vec<String>,
    registered: HashSet<String>,
    mounted: HashSet<String>,
    open_files: usize,
    denied_dirs: HashSet<String>,
    fail_next_register: bool,
    fail_next_mount: bool,
    fail_next_truncate: bool,
}

/// Observation and fault-injection handle onto a `MemoryEngine`.
///
/// Cloneable; tests keep one around after the engine itself has been moved
/// behind the shared lock.
#[derive(Clone, Default)]
pub struct EngineProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl EngineProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lifecycle events in the order the engine saw them
    /// (`register`/`unregister`/`mount`/`umount`/`block_init`/`block_fini`).
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn registered_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().registered.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn mounted_points(&self) -> Vec<String> {
        let mut points: Vec<String> = self.lock().mounted.iter().cloned().collect();
        points.sort();
        points
    }

    pub fn open_file_count(&self) -> usize {
        self.lock().open_files
    }

    /// Make `dir_open` fail with `PermissionDenied` for one absolute path.
    pub fn deny_dir(&self, path: &str) {
        self.lock().denied_dirs.insert(path.to_string());
    }

    pub fn fail_next_register(&self) {
        self.lock().fail_next_register = true;
    }

    pub fn fail_next_mount(&self) {
        self.lock().fail_next_mount = true;
    }

    pub fn fail_next_truncate(&self) {
        self.lock().fail_next_truncate = true;
    }
}

/// In-memory engine double. See the module docs.
#[derive(Default)]
pub struct MemoryEngine {
    devices: HashMap<u64, MemBlockDevice>,
    by_path: HashMap<String, u64>,
    registered: HashMap<String, u64>,
    mounts: HashMap<String, MountedFs>,
    open_files: HashMap<u64, OpenFile>,
    open_dirs: HashMap<u64, OpenDir>,
    next_handle: u64,
    probe: EngineProbe,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> EngineProbe {
        self.probe.clone()
    }

    /// A source that answers the raw ext4 superblock probe.
    pub fn add_raw_ext4_image(&mut self, path: &str, size: u64) {
        self.add_device(path, size, true, Vec::new());
    }

    /// An MBR-partitioned source; `partitions` are byte (offset, size) pairs
    /// in the order they should appear in the table.
    pub fn add_mbr_disk(&mut self, path: &str, size: u64, partitions: &[(u64, u64)]) {
        self.add_device(path, size, false, Self::build_mbr_sector(partitions));
    }

    /// A source that passes the raw probe but also carries a valid MBR, for
    /// exercising probing order.
    pub fn add_raw_ext4_image_with_mbr(
        &mut self,
        path: &str,
        size: u64,
        partitions: &[(u64, u64)],
    ) {
        self.add_device(path, size, true, Self::build_mbr_sector(partitions));
    }

    pub fn set_volume_name(&mut self, path: &str, name: &str) {
        if let Some(handle) = self.by_path.get(path) {
            if let Some(dev) = self.devices.get_mut(handle) {
                dev.volume_name = name.to_string();
            }
        }
    }

    pub fn set_read_only(&mut self, path: &str, read_only: bool) {
        if let Some(handle) = self.by_path.get(path) {
            if let Some(dev) = self.devices.get_mut(handle) {
                dev.read_only = read_only;
            }
        }
    }

    /// A 512-byte MBR sector with up to four primary partitions: 16-byte
    /// entries at offset 446, LBA start and sector count little-endian,
    /// `0x55AA` signature.
    pub fn build_mbr_sector(partitions: &[(u64, u64)]) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        for (i, &(offset, size)) in partitions.iter().take(4).enumerate() {
            let entry = MBR_TABLE_OFFSET + i * 16;
            sector[entry + 4] = 0x83; // Linux native
            let start_lba = (offset / SECTOR_SIZE) as u32;
            let sectors = (size / SECTOR_SIZE) as u32;
            sector[entry + 8..entry + 12].copy_from_slice(&start_lba.to_le_bytes());
            sector[entry + 12..entry + 16].copy_from_slice(&sectors.to_le_bytes());
        }
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    fn add_device(&mut self, path: &str, size: u64, is_ext4: bool, image: Vec<u8>) {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.devices.insert(
            handle,
            MemBlockDevice {
                path: path.to_string(),
                size,
                image,
                is_ext4,
                part_offset: 0,
                part_size: size,
                geometry: Geometry {
                    size,
                    track_count: 255,
                    sectors_per_track: 63,
                    block_size: SECTOR_SIZE as u32,
                },
                read_only: false,
                volume_name: String::new(),
                filesystems: HashMap::new(),
            },
        );
        self.by_path.insert(path.to_string(), handle);
    }

    fn record(&self, event: String) {
        self.probe.lock().events.push(event);
    }

    fn dev(&self, dev: BlockDevHandle) -> EngineResult<&MemBlockDevice> {
        self.devices.get(&dev.0).ok_or(EngineStatus::NoEntry)
    }

    fn dev_mut(&mut self, dev: BlockDevHandle) -> EngineResult<&mut MemBlockDevice> {
        self.devices.get_mut(&dev.0).ok_or(EngineStatus::NoEntry)
    }

    /// Match `path` against the registered mount points and split off the
    /// in-filesystem components.
    fn resolve_mount(&self, path: &str) -> EngineResult<(MountedFs, Vec<String>)> {
        for (mount_point, mounted) in &self.mounts {
            let trimmed = &mount_point[..mount_point.len() - 1];
            if path == trimmed || path.starts_with(mount_point.as_str()) {
                let rest = if path.len() >= mount_point.len() {
                    &path[mount_point.len()..]
                } else {
                    ""
                };
                let comps = rest
                    .split('/')
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect();
                return Ok((*mounted, comps));
            }
        }
        Err(EngineStatus::NoEntry)
    }

    fn fs_root(&self, mounted: MountedFs) -> EngineResult<&Node> {
        self.devices
            .get(&mounted.dev)
            .and_then(|dev| dev.filesystems.get(&mounted.fs_key))
            .ok_or(EngineStatus::NoEntry)
    }

    fn fs_root_mut(&mut self, mounted: MountedFs) -> EngineResult<&mut Node> {
        self.devices
            .get_mut(&mounted.dev)
            .and_then(|dev| dev.filesystems.get_mut(&mounted.fs_key))
            .ok_or(EngineStatus::NoEntry)
    }

    fn node_at(&self, path: &str) -> EngineResult<&Node> {
        let (mounted, comps) = self.resolve_mount(path)?;
        lookup(self.fs_root(mounted)?, &comps)
    }

    fn node_at_mut(&mut self, path: &str) -> EngineResult<&mut Node> {
        let (mounted, comps) = self.resolve_mount(path)?;
        lookup_mut(self.fs_root_mut(mounted)?, &comps)
    }

    fn writable_mount(&self, path: &str) -> EngineResult<(MountedFs, Vec<String>)> {
        let (mounted, comps) = self.resolve_mount(path)?;
        if mounted.read_only {
            return Err(EngineStatus::ReadOnly);
        }
        Ok((mounted, comps))
    }
}

impl Ext4Engine for MemoryEngine {
    fn blockdev_open(&mut self, path: &str) -> EngineResult<BlockDevHandle> {
        self.by_path
            .get(path)
            .copied()
            .map(BlockDevHandle)
            .ok_or(EngineStatus::NoEntry)
    }

    fn blockdev_release(&mut self, dev: BlockDevHandle) -> EngineResult<()> {
        // Releasing a handle does not destroy the source; the same path can
        // be opened again later.
        let path = self.dev(dev)?.path.clone();
        self.record(format!("blockdev_release {}", path));
        Ok(())
    }

    fn blockdev_size(&self, dev: BlockDevHandle) -> EngineResult<u64> {
        Ok(self.dev(dev)?.size)
    }

    fn blockdev_geometry(&self, dev: BlockDevHandle) -> EngineResult<Geometry> {
        Ok(self.dev(dev)?.geometry)
    }

    fn blockdev_partition(&self, dev: BlockDevHandle) -> EngineResult<(u64, u64)> {
        let dev = self.dev(dev)?;
        Ok((dev.part_offset, dev.part_size))
    }

    fn blockdev_set_partition(
        &mut self,
        dev: BlockDevHandle,
        offset: u64,
        size: u64,
    ) -> EngineResult<()> {
        let dev = self.dev_mut(dev)?;
        dev.part_offset = offset;
        dev.part_size = size;
        Ok(())
    }

    fn blockdev_boot_sector(&self, dev: BlockDevHandle) -> EngineResult<[u8; 512]> {
        let dev = self.dev(dev)?;
        if dev.image.len() < 512 {
            return Err(EngineStatus::Io);
        }
        let mut sector = [0u8; 512];
        sector.copy_from_slice(&dev.image[..512]);
        Ok(sector)
    }

    fn block_init(&mut self, dev: BlockDevHandle) -> EngineResult<()> {
        let path = self.dev(dev)?.path.clone();
        self.record(format!("block_init {}", path));
        Ok(())
    }

    fn block_fini(&mut self, dev: BlockDevHandle) -> EngineResult<()> {
        let path = self.dev(dev)?.path.clone();
        self.record(format!("block_fini {}", path));
        Ok(())
    }

    fn probe_ext4(&mut self, dev: BlockDevHandle) -> EngineResult<()> {
        if self.dev(dev)?.is_ext4 {
            Ok(())
        } else {
            Err(EngineStatus::Io)
        }
    }

    fn mbr_scan(&mut self, dev: BlockDevHandle) -> EngineResult<Vec<PartitionRecord>> {
        let device = self.dev_mut(dev)?;
        if device.image.len() < 512 || device.image[510] != 0x55 || device.image[511] != 0xAA {
            return Err(EngineStatus::Io);
        }
        let mut records = Vec::new();
        for i in 0..4 {
            let entry = MBR_TABLE_OFFSET + i * 16;
            if device.image[entry + 4] == 0 {
                continue;
            }
            let start_lba = u32::from_le_bytes(
                device.image[entry + 8..entry + 12]
                    .try_into()
                    .map_err(|_| EngineStatus::Io)?,
            );
            let sectors = u32::from_le_bytes(
                device.image[entry + 12..entry + 16]
                    .try_into()
                    .map_err(|_| EngineStatus::Io)?,
            );
            records.push(PartitionRecord {
                offset: start_lba as u64 * SECTOR_SIZE,
                size: sectors as u64 * SECTOR_SIZE,
            });
        }
        // The scan leaves the parent window spanning the whole source; the
        // session reads the offset back as the disk capacity.
        device.part_offset = device.size;
        device.part_size = device.size;
        device.geometry.size = device.size;
        Ok(records)
    }

    fn device_register(&mut self, dev: BlockDevHandle, name: &str) -> EngineResult<()> {
        if self.probe.lock().fail_next_register {
            self.probe.lock().fail_next_register = false;
            self.record(format!("register_failed {}", name));
            return Err(EngineStatus::Io);
        }
        if !self.devices.contains_key(&dev.0) {
            return Err(EngineStatus::NoEntry);
        }
        if self.registered.contains_key(name) {
            return Err(EngineStatus::Exists);
        }
        self.registered.insert(name.to_string(), dev.0);
        {
            let mut probe = self.probe.lock();
            probe.registered.insert(name.to_string());
            probe.events.push(format!("register {}", name));
        }
        Ok(())
    }

    fn device_unregister(&mut self, name: &str) -> EngineResult<()> {
        self.registered.remove(name).ok_or(EngineStatus::NoEntry)?;
        let mut probe = self.probe.lock();
        probe.registered.remove(name);
        probe.events.push(format!("unregister {}", name));
        Ok(())
    }

    fn mount(&mut self, name: &str, mount_point: &str, read_only: bool) -> EngineResult<()> {
        if self.probe.lock().fail_next_mount {
            self.probe.lock().fail_next_mount = false;
            self.record(format!("mount_failed {}", mount_point));
            return Err(EngineStatus::Io);
        }
        let dev_handle = *self.registered.get(name).ok_or(EngineStatus::NoEntry)?;
        if self.mounts.contains_key(mount_point) {
            return Err(EngineStatus::Exists);
        }
        let (fs_key, device_read_only) = {
            let device = self.devices.get_mut(&dev_handle).ok_or(EngineStatus::NoEntry)?;
            let key = device.part_offset;
            device.filesystems.entry(key).or_insert_with(Node::dir);
            (key, device.read_only)
        };
        self.mounts.insert(
            mount_point.to_string(),
            MountedFs {
                dev: dev_handle,
                fs_key,
                read_only: read_only || device_read_only,
            },
        );
        let mut probe = self.probe.lock();
        probe.mounted.insert(mount_point.to_string());
        probe.events.push(format!("mount {}", mount_point));
        Ok(())
    }

    fn umount(&mut self, mount_point: &str) -> EngineResult<()> {
        self.mounts
            .remove(mount_point)
            .ok_or(EngineStatus::NoEntry)?;
        let mut probe = self.probe.lock();
        probe.mounted.remove(mount_point);
        probe.events.push(format!("umount {}", mount_point));
        Ok(())
    }

    fn mount_point_stats(&self, mount_point: &str) -> EngineResult<MountStats> {
        let mounted = self.mounts.get(mount_point).ok_or(EngineStatus::NoEntry)?;
        let device = self.devices.get(&mounted.dev).ok_or(EngineStatus::NoEntry)?;
        let blocks = device.part_size / 4096;
        Ok(MountStats {
            volume_name: device.volume_name.clone(),
            block_size: 4096,
            blocks_count: blocks,
            free_blocks_count: blocks / 2,
            inodes_count: 8192,
            free_inodes_count: 4096,
        })
    }

    fn fs_read_only(&self, mount_point: &str) -> EngineResult<bool> {
        Ok(self
            .mounts
            .get(mount_point)
            .ok_or(EngineStatus::NoEntry)?
            .read_only)
    }

    fn file_open(&mut self, path: &str, mode: &str) -> EngineResult<FileHandle> {
        let flags = parse_open_mode(mode)?;
        let (mounted, comps) = if flags.write || flags.create {
            self.writable_mount(path)?
        } else {
            self.resolve_mount(path)?
        };
        if comps.is_empty() {
            return Err(EngineStatus::IsADirectory);
        }
        let root = self.fs_root_mut(mounted)?;
        let needs_create = match lookup(&*root, &comps) {
            Ok(node) => match &node.kind {
                NodeKind::Dir(_) => return Err(EngineStatus::IsADirectory),
                NodeKind::Symlink(_) => return Err(EngineStatus::InvalidInput),
                NodeKind::File(_) => false,
            },
            Err(EngineStatus::NoEntry) if flags.create => true,
            Err(status) => return Err(status),
        };
        if needs_create {
            let (children, name) = parent_mut(root, &comps)?;
            children.insert(name.to_string(), Node::file());
        }
        let node = lookup_mut(root, &comps)?;
        let pos = match &mut node.kind {
            NodeKind::File(data) => {
                if flags.truncate {
                    data.clear();
                }
                if flags.append {
                    data.len()
                } else {
                    0
                }
            }
            _ => return Err(EngineStatus::InvalidInput),
        };
        self.next_handle += 1;
        let handle = self.next_handle;
        self.open_files.insert(
            handle,
            OpenFile {
                dev: mounted.dev,
                fs_key: mounted.fs_key,
                comps,
                pos,
                flags,
            },
        );
        self.probe.lock().open_files += 1;
        Ok(FileHandle(handle))
    }

    fn file_close(&mut self, file: FileHandle) -> EngineResult<()> {
        self.open_files
            .remove(&file.0)
            .ok_or(EngineStatus::InvalidInput)?;
        self.probe.lock().open_files -= 1;
        Ok(())
    }

    fn file_read(&mut self, file: FileHandle, buf: &mut [u8]) -> EngineResult<usize> {
        let of = self
            .open_files
            .get_mut(&file.0)
            .ok_or(EngineStatus::InvalidInput)?;
        if !of.flags.read {
            return Err(EngineStatus::PermissionDenied);
        }
        let device = self.devices.get_mut(&of.dev).ok_or(EngineStatus::NoEntry)?;
        let root = device
            .filesystems
            .get_mut(&of.fs_key)
            .ok_or(EngineStatus::NoEntry)?;
        let node = lookup_mut(root, &of.comps)?;
        let data = match &node.kind {
            NodeKind::File(data) => data,
            _ => return Err(EngineStatus::InvalidInput),
        };
        let available = data.len().saturating_sub(of.pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&data[of.pos..of.pos + n]);
        of.pos += n;
        Ok(n)
    }

    fn file_write(&mut self, file: FileHandle, buf: &[u8]) -> EngineResult<usize> {
        let of = self
            .open_files
            .get_mut(&file.0)
            .ok_or(EngineStatus::InvalidInput)?;
        if !of.flags.write {
            return Err(EngineStatus::PermissionDenied);
        }
        let device = self.devices.get_mut(&of.dev).ok_or(EngineStatus::NoEntry)?;
        let root = device
            .filesystems
            .get_mut(&of.fs_key)
            .ok_or(EngineStatus::NoEntry)?;
        let node = lookup_mut(root, &of.comps)?;
        let data = match &mut node.kind {
            NodeKind::File(data) => data,
            _ => return Err(EngineStatus::InvalidInput),
        };
        if of.flags.append {
            of.pos = data.len();
        }
        if of.pos > data.len() {
            data.resize(of.pos, 0);
        }
        let end = of.pos + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[of.pos..end].copy_from_slice(buf);
        of.pos = end;
        Ok(buf.len())
    }

    fn file_truncate(&mut self, file: FileHandle, size: u64) -> EngineResult<()> {
        if self.probe.lock().fail_next_truncate {
            self.probe.lock().fail_next_truncate = false;
            return Err(EngineStatus::Io);
        }
        let of = self
            .open_files
            .get(&file.0)
            .ok_or(EngineStatus::InvalidInput)?;
        if !of.flags.write {
            return Err(EngineStatus::PermissionDenied);
        }
        let dev = of.dev;
        let fs_key = of.fs_key;
        let comps = of.comps.clone();
        let device = self.devices.get_mut(&dev).ok_or(EngineStatus::NoEntry)?;
        let root = device
            .filesystems
            .get_mut(&fs_key)
            .ok_or(EngineStatus::NoEntry)?;
        let node = lookup_mut(root, &comps)?;
        match &mut node.kind {
            NodeKind::File(data) => {
                data.resize(size as usize, 0);
                Ok(())
            }
            _ => Err(EngineStatus::InvalidInput),
        }
    }

    fn file_size(&self, file: FileHandle) -> EngineResult<u64> {
        let of = self
            .open_files
            .get(&file.0)
            .ok_or(EngineStatus::InvalidInput)?;
        let device = self.devices.get(&of.dev).ok_or(EngineStatus::NoEntry)?;
        let root = device
            .filesystems
            .get(&of.fs_key)
            .ok_or(EngineStatus::NoEntry)?;
        match &lookup(root, &of.comps)?.kind {
            NodeKind::File(data) => Ok(data.len() as u64),
            _ => Err(EngineStatus::InvalidInput),
        }
    }

    fn file_remove(&mut self, path: &str) -> EngineResult<()> {
        let (mounted, comps) = self.writable_mount(path)?;
        let root = self.fs_root_mut(mounted)?;
        if lookup(root, &comps)?.is_dir() {
            return Err(EngineStatus::IsADirectory);
        }
        let (children, name) = parent_mut(root, &comps)?;
        children.remove(name).ok_or(EngineStatus::NoEntry)?;
        Ok(())
    }

    fn file_rename(&mut self, from: &str, to: &str) -> EngineResult<()> {
        let (mounted, from_comps) = self.writable_mount(from)?;
        let (_, to_comps) = self.writable_mount(to)?;
        let root = self.fs_root_mut(mounted)?;
        move_node(root, &from_comps, &to_comps, false)
    }

    fn dir_open(&mut self, path: &str) -> EngineResult<DirHandle> {
        if self.probe.lock().denied_dirs.contains(path) {
            return Err(EngineStatus::PermissionDenied);
        }
        let node = self.node_at(path)?;
        let children = match &node.kind {
            NodeKind::Dir(children) => children,
            _ => return Err(EngineStatus::NotADirectory),
        };
        let mut entries = vec![
            RawDirEntry {
                name: ".".to_string(),
                kind: RawEntryKind::Directory,
                entry_length: 12,
            },
            RawDirEntry {
                name: "..".to_string(),
                kind: RawEntryKind::Directory,
                entry_length: 12,
            },
        ];
        for (name, child) in children {
            let kind = match child.kind {
                NodeKind::Dir(_) => RawEntryKind::Directory,
                NodeKind::File(_) => RawEntryKind::RegularFile,
                NodeKind::Symlink(_) => RawEntryKind::Symlink,
            };
            entries.push(RawDirEntry {
                name: name.clone(),
                kind,
                entry_length: ((8 + name.len() as u32) + 3) & !3,
            });
        }
        self.next_handle += 1;
        let handle = self.next_handle;
        self.open_dirs.insert(handle, OpenDir { entries, cursor: 0 });
        Ok(DirHandle(handle))
    }

    fn dir_read(&mut self, dir: DirHandle) -> EngineResult<Option<RawDirEntry>> {
        let od = self
            .open_dirs
            .get_mut(&dir.0)
            .ok_or(EngineStatus::InvalidInput)?;
        if od.cursor >= od.entries.len() {
            return Ok(None);
        }
        let entry = od.entries[od.cursor].clone();
        od.cursor += 1;
        Ok(Some(entry))
    }

    fn dir_close(&mut self, dir: DirHandle) -> EngineResult<()> {
        self.open_dirs
            .remove(&dir.0)
            .ok_or(EngineStatus::InvalidInput)?;
        Ok(())
    }

    fn dir_make(&mut self, path: &str) -> EngineResult<()> {
        let (mounted, comps) = self.writable_mount(path)?;
        let root = self.fs_root_mut(mounted)?;
        if comps.is_empty() {
            return Err(EngineStatus::Exists);
        }
        let (children, name) = parent_mut(root, &comps)?;
        if children.contains_key(name) {
            return Err(EngineStatus::Exists);
        }
        children.insert(name.to_string(), Node::dir());
        Ok(())
    }

    fn dir_remove(&mut self, path: &str) -> EngineResult<()> {
        let (mounted, comps) = self.writable_mount(path)?;
        let root = self.fs_root_mut(mounted)?;
        if !lookup(root, &comps)?.is_dir() {
            return Err(EngineStatus::NotADirectory);
        }
        // Removal is recursive, matching the engine contract.
        let (children, name) = parent_mut(root, &comps)?;
        children.remove(name).ok_or(EngineStatus::NoEntry)?;
        Ok(())
    }

    fn dir_move(&mut self, from: &str, to: &str) -> EngineResult<()> {
        let (mounted, from_comps) = self.writable_mount(from)?;
        let (_, to_comps) = self.writable_mount(to)?;
        let root = self.fs_root_mut(mounted)?;
        move_node(root, &from_comps, &to_comps, true)
    }

    fn symlink_create(&mut self, target: &str, path: &str) -> EngineResult<()> {
        let (mounted, comps) = self.writable_mount(path)?;
        let root = self.fs_root_mut(mounted)?;
        let (children, name) = parent_mut(root, &comps)?;
        if children.contains_key(name) {
            return Err(EngineStatus::Exists);
        }
        children.insert(name.to_string(), Node::symlink(target));
        Ok(())
    }

    fn hardlink_create(&mut self, target: &str, path: &str) -> EngineResult<()> {
        let linked = {
            let node = self.node_at(target)?;
            if node.is_dir() {
                return Err(EngineStatus::IsADirectory);
            }
            node.clone()
        };
        let (mounted, comps) = self.writable_mount(path)?;
        let root = self.fs_root_mut(mounted)?;
        let (children, name) = parent_mut(root, &comps)?;
        if children.contains_key(name) {
            return Err(EngineStatus::Exists);
        }
        children.insert(name.to_string(), linked);
        Ok(())
    }

    fn readlink(&self, path: &str) -> EngineResult<String> {
        match &self.node_at(path)?.kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(EngineStatus::InvalidInput),
        }
    }

    fn mode_get(&self, path: &str) -> EngineResult<u32> {
        Ok(self.node_at(path)?.meta.mode)
    }

    fn mode_set(&mut self, path: &str, mode: u32) -> EngineResult<()> {
        self.node_at_mut(path)?.meta.mode = mode;
        Ok(())
    }

    fn owner_get(&self, path: &str) -> EngineResult<(u32, u32)> {
        let meta = &self.node_at(path)?.meta;
        Ok((meta.uid, meta.gid))
    }

    fn owner_set(&mut self, path: &str, uid: u32, gid: u32) -> EngineResult<()> {
        let meta = &mut self.node_at_mut(path)?.meta;
        meta.uid = uid;
        meta.gid = gid;
        Ok(())
    }

    fn time_get(&self, path: &str, kind: TimeKind) -> EngineResult<u32> {
        let meta = &self.node_at(path)?.meta;
        Ok(match kind {
            TimeKind::Creation => meta.ctime,
            TimeKind::Access => meta.atime,
            TimeKind::Modification => meta.mtime,
        })
    }

    fn time_set(&mut self, path: &str, kind: TimeKind, seconds: u32) -> EngineResult<()> {
        let meta = &mut self.node_at_mut(path)?.meta;
        match kind {
            TimeKind::Creation => meta.ctime = seconds,
            TimeKind::Access => meta.atime = seconds,
            TimeKind::Modification => meta.mtime = seconds,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbr_sector_round_trips_through_scan() {
        let parts = [(1048576u64, 4194304u64), (8388608, 2097152)];
        let mut engine = MemoryEngine::new();
        engine.add_mbr_disk("/dev/sdz", 64 * 1024 * 1024, &parts);
        let dev = engine.blockdev_open("/dev/sdz").unwrap();
        let records = engine.mbr_scan(dev).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 1048576);
        assert_eq!(records[0].size, 4194304);
        assert_eq!(records[1].offset, 8388608);
        assert_eq!(records[1].size, 2097152);
    }

    #[test]
    fn scan_rejects_missing_signature() {
        let mut engine = MemoryEngine::new();
        engine.add_raw_ext4_image("img", 1024 * 1024);
        let dev = engine.blockdev_open("img").unwrap();
        assert_eq!(engine.mbr_scan(dev), Err(EngineStatus::Io));
    }

    #[test]
    fn open_mode_strings_parse_like_fopen() {
        assert!(!parse_open_mode("rb").unwrap().write);
        assert!(parse_open_mode("r+b").unwrap().write);
        assert!(parse_open_mode("w+b").unwrap().truncate);
        assert!(parse_open_mode("a+b").unwrap().append);
        assert!(parse_open_mode("x").is_err());
    }

    #[test]
    fn mount_and_file_lifecycle() {
        let mut engine = MemoryEngine::new();
        engine.add_raw_ext4_image("img", 1024 * 1024);
        let dev = engine.blockdev_open("img").unwrap();
        engine.device_register(dev, "t0").unwrap();
        engine.mount("t0", "/t0/", false).unwrap();

        engine.dir_make("/t0/data").unwrap();
        let f = engine.file_open("/t0/data/hello", "w+b").unwrap();
        engine.file_write(f, b"hi").unwrap();
        engine.file_close(f).unwrap();

        let f = engine.file_open("/t0/data/hello", "rb").unwrap();
        let mut buf = [0u8; 8];
        let n = engine.file_read(f, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        engine.file_close(f).unwrap();

        engine.umount("/t0/").unwrap();
        engine.device_unregister("t0").unwrap();
        assert!(engine.probe().registered_devices().is_empty());
    }

    #[test]
    fn directory_iteration_yields_dot_entries() {
        let mut engine = MemoryEngine::new();
        engine.add_raw_ext4_image("img", 1024 * 1024);
        let dev = engine.blockdev_open("img").unwrap();
        engine.device_register(dev, "t1").unwrap();
        engine.mount("t1", "/t1/", false).unwrap();
        engine.dir_make("/t1/sub").unwrap();

        let d = engine.dir_open("/t1/").unwrap();
        let mut names = Vec::new();
        while let Some(entry) = engine.dir_read(d).unwrap() {
            names.push(entry.name);
        }
        engine.dir_close(d).unwrap();
        assert_eq!(names, vec![".", "..", "sub"]);
    }
}
