use serde::{Deserialize, Serialize};

/// A partition on a block source: byte offset from the start of the device
/// and size in bytes.
///
/// A raw (non-MBR) ext4 image is represented as a single synthetic partition
/// spanning the whole source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub offset: u64,
    pub size: u64,
}

/// Disk geometry snapshot, taken once at disk-open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Total sector/partition size as reported by the block device.
    pub size: u64,
    pub track_count: u32,
    pub sectors_per_track: u32,
    pub block_size: u32,
}

/// Classification of a directory entry as seen by callers.
///
/// Engine-reported types other than directory collapse to `RegularFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    RegularFile,
}

/// One directory listing entry. `.` and `..` are never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    /// Raw on-disk record length as reported by the engine.
    pub entry_length: u32,
    pub kind: EntryKind,
}

/// Mount-point statistics reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountStats {
    pub volume_name: String,
    pub block_size: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub inodes_count: u32,
    pub free_inodes_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_serializes_for_marshalling() {
        let partition = Partition {
            offset: 1048576,
            size: 8388608,
        };
        let json = serde_json::to_string(&partition).unwrap();
        let back: Partition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, partition);
    }

    #[test]
    fn dir_entry_round_trips_through_json() {
        let entry = DirEntry {
            name: "a.txt".to_string(),
            entry_length: 16,
            kind: EntryKind::RegularFile,
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: DirEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
