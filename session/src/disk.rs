// Disk discovery: raw ext4 images and MBR-partitioned block devices.

use extbridge_core::engine::{self, BlockDevHandle, SharedEngine};
use extbridge_core::{BridgeError, Geometry, Partition};
use log::{debug, warn};

/// A block source opened for ext4 access: either a bare ext4 filesystem
/// (raw mode) or an MBR-partitioned disk.
///
/// The disk exclusively owns its block source for its whole lifetime; a
/// `MountSession` borrows it mutably while a partition is bound, so only one
/// session can ever be bound to a disk at a time.
pub struct ExtDisk {
    engine: SharedEngine,
    dev: BlockDevHandle,
    path: String,
    capacity: u64,
    geometry: Option<Geometry>,
    partitions: Vec<Partition>,
    raw_mode: bool,
}

impl ExtDisk {
    /// Open a disk image, partition, or device node by path.
    ///
    /// The raw ext4 interpretation is tried first: a bare ext4 image has no
    /// MBR signature, so the superblock probe has to win before any partition
    /// table scan is attempted. If neither interpretation holds, the answer
    /// is `None`: this entry point deliberately reports "not available"
    /// instead of distinguishing failure causes. `open_disk_number` is the
    /// strict counterpart.
    pub fn open(engine: &SharedEngine, path: &str) -> Option<ExtDisk> {
        if path.is_empty() {
            return None;
        }
        let dev = {
            let mut eng = engine::lock(engine).ok()?;
            match eng.blockdev_open(path) {
                Ok(dev) => dev,
                Err(status) => {
                    warn!("could not open block source '{}': {:?}", path, status);
                    return None;
                }
            }
        };

        match Self::try_raw(engine, dev, path) {
            Ok(Some(disk)) => return Some(disk),
            Ok(None) => {}
            Err(e) => {
                warn!("raw ext4 probe of '{}' failed: {}", path, e);
                Self::release(engine, dev);
                return None;
            }
        }

        match Self::scan_mbr(engine, dev, path) {
            Ok(disk) => Some(disk),
            Err(e) => {
                warn!("could not open '{}' as an MBR disk: {}", path, e);
                Self::release(engine, dev);
                None
            }
        }
    }

    /// Open a physical disk by its platform index (`PhysicalDrive{n}`).
    ///
    /// Unlike `open`, this path has no raw-ext4 fallback and reports scan
    /// failures as errors.
    pub fn open_disk_number(engine: &SharedEngine, number: u32) -> Result<ExtDisk, BridgeError> {
        let path = format!("PhysicalDrive{}", number);
        let dev = engine::lock(engine)?
            .blockdev_open(&path)
            .map_err(|status| {
                BridgeError::Io(format!("could not open physical disk '{}': {:?}", path, status))
            })?;
        match Self::scan_mbr(engine, dev, &path) {
            Ok(disk) => Ok(disk),
            Err(e) => {
                Self::release(engine, dev);
                Err(e)
            }
        }
    }

    /// Re-scan and return the raw first sector of the disk.
    pub fn master_boot_record(&self) -> Result<[u8; 512], BridgeError> {
        let mut eng = engine::lock(&self.engine)?;
        eng.mbr_scan(self.dev).map_err(|status| {
            BridgeError::Io(format!("could not read disk MBR '{}': {:?}", self.path, status))
        })?;
        eng.blockdev_boot_sector(self.dev).map_err(|status| {
            BridgeError::Io(format!("could not read disk MBR '{}': {:?}", self.path, status))
        })
    }

    /// Total disk capacity in bytes, as reported by the partition scan.
    /// Zero for raw-mode disks.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Geometry snapshot taken at open time; `None` for raw-mode disks.
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    /// Partitions in on-disk table order. A raw-mode disk has exactly one
    /// synthetic partition spanning the whole source.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn is_raw(&self) -> bool {
        self.raw_mode
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn device(&self) -> BlockDevHandle {
        self.dev
    }

    pub(crate) fn engine(&self) -> SharedEngine {
        self.engine.clone()
    }

    /// Raw interpretation: superblock probe, then one whole-source partition.
    fn try_raw(
        engine: &SharedEngine,
        dev: BlockDevHandle,
        path: &str,
    ) -> Result<Option<ExtDisk>, BridgeError> {
        let mut eng = engine::lock(engine)?;
        if eng.probe_ext4(dev).is_err() {
            return Ok(None);
        }
        let size = eng.blockdev_size(dev).map_err(|status| {
            BridgeError::Io(format!("could not size block source '{}': {:?}", path, status))
        })?;
        debug!("'{}' carries a bare ext4 filesystem ({} bytes)", path, size);
        Ok(Some(ExtDisk {
            engine: engine.clone(),
            dev,
            path: path.to_string(),
            capacity: 0,
            geometry: None,
            partitions: vec![Partition { offset: 0, size }],
            raw_mode: true,
        }))
    }

    /// MBR interpretation: scan the table, snapshot geometry, keep the
    /// partition sequence in table order. The list stays empty until the
    /// whole scan has succeeded.
    fn scan_mbr(
        engine: &SharedEngine,
        dev: BlockDevHandle,
        path: &str,
    ) -> Result<ExtDisk, BridgeError> {
        let mut eng = engine::lock(engine)?;
        let records = eng.mbr_scan(dev).map_err(|status| {
            BridgeError::Io(format!("could not read disk MBR '{}': {:?}", path, status))
        })?;
        let (capacity, _) = eng.blockdev_partition(dev).map_err(|status| {
            BridgeError::Io(format!("could not read block window of '{}': {:?}", path, status))
        })?;
        let geometry = eng.blockdev_geometry(dev).map_err(|status| {
            BridgeError::Io(format!("could not read geometry of '{}': {:?}", path, status))
        })?;
        let partitions = records
            .iter()
            .map(|r| Partition {
                offset: r.offset,
                size: r.size,
            })
            .collect::<Vec<_>>();
        debug!(
            "'{}': MBR scan found {} partition(s), capacity {} bytes",
            path,
            partitions.len(),
            capacity
        );
        Ok(ExtDisk {
            engine: engine.clone(),
            dev,
            path: path.to_string(),
            capacity,
            geometry: Some(geometry),
            partitions,
            raw_mode: false,
        })
    }

    fn release(engine: &SharedEngine, dev: BlockDevHandle) {
        if let Ok(mut eng) = engine::lock(engine) {
            if let Err(status) = eng.blockdev_release(dev) {
                warn!("block source release reported: {:?}", status);
            }
        }
    }
}

impl Drop for ExtDisk {
    fn drop(&mut self) {
        Self::release(&self.engine, self.dev);
    }
}
