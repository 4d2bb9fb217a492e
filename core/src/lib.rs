pub mod engine;
pub mod error;
pub mod test_utils;
pub mod types;

pub use engine::{Ext4Engine, SharedEngine};
pub use error::BridgeError;
pub use types::{DirEntry, EntryKind, Geometry, MountStats, Partition};
