// extbridge-session: expose ext4 volumes as a navigable namespace.
//
// The heavy lifting (on-disk structures, allocation, journaling, raw I/O)
// belongs to an external ext4 engine behind the `Ext4Engine` trait. This
// crate is the host-side session layer on top of it: deciding whether a
// block source is a bare ext4 filesystem or an MBR-partitioned disk, binding
// a chosen partition into a private mount namespace, and translating
// caller-supplied paths, patterns and metadata on the way in and out.

pub mod disk;
mod devname;
pub mod mount;
pub mod paths;
pub mod search;
pub mod stream;

pub use disk::ExtDisk;
pub use mount::MountSession;
pub use paths::combine_paths;
pub use search::wildcard_to_regex;
pub use stream::{ExtFileStream, FileAccess, FileMode};
