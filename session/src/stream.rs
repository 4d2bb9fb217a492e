// Byte-stream adapter over the engine's open-file primitives.

use crate::mount::MountSession;
use extbridge_core::engine::{self, FileHandle, SharedEngine};
use extbridge_core::BridgeError;
use log::warn;
use std::io;

/// How an existing (or missing) file is treated at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Open an existing file; missing is an error.
    Open,
    /// Open an existing file or create an empty one.
    OpenOrCreate,
    /// Create the file, truncating an existing one.
    Create,
    /// Create the file; an existing one is an error.
    CreateNew,
    /// Open an existing file and drop its contents.
    Truncate,
    /// Open or create, with writes going to the end.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
    ReadWrite,
}

/// An open byte stream on a file inside a mounted session.
///
/// The stream owns its engine handle independently of the session that opened
/// it, so several streams can be live at once (`copy_file` relies on this).
/// Dropping the stream closes the handle if `close` was never called.
pub struct ExtFileStream {
    engine: SharedEngine,
    handle: FileHandle,
    path: String,
    readable: bool,
    writable: bool,
    closed: bool,
}

impl ExtFileStream {
    pub(crate) fn open(
        session: &MountSession<'_>,
        path: &str,
        mode: FileMode,
        access: FileAccess,
    ) -> Result<Self, BridgeError> {
        if path.is_empty() {
            return Err(BridgeError::InvalidArgument("file path is empty".to_string()));
        }
        if access == FileAccess::Read && requires_write(mode) {
            return Err(BridgeError::InvalidArgument(format!(
                "mode {:?} needs write access, got {:?}",
                mode, access
            )));
        }
        let exists = session.file_exists(path)?;
        match mode {
            FileMode::CreateNew if exists => {
                return Err(BridgeError::AlreadyExists(format!("'{}' already exists", path)));
            }
            FileMode::Open | FileMode::Truncate if !exists => {
                return Err(BridgeError::NotFound(format!("could not find file '{}'", path)));
            }
            _ => {}
        }
        let full = session.resolve(path);
        let engine = session.engine_handle();
        let handle = engine::lock(&engine)?
            .file_open(&full, engine_mode(mode, access, exists))
            .map_err(|status| {
                BridgeError::Io(format!("could not open file '{}': {:?}", path, status))
            })?;
        Ok(ExtFileStream {
            engine,
            handle,
            path: path.to_string(),
            readable: access != FileAccess::Write,
            writable: access != FileAccess::Read,
            closed: false,
        })
    }

    /// Read into `buf`, returning how many bytes arrived; 0 means end of
    /// file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, BridgeError> {
        self.ensure_open()?;
        if !self.readable {
            return Err(BridgeError::InvalidArgument(format!(
                "'{}' is not open for reading",
                self.path
            )));
        }
        engine::lock(&self.engine)?
            .file_read(self.handle, buf)
            .map_err(|status| {
                BridgeError::Io(format!("could not read file '{}': {:?}", self.path, status))
            })
    }

    /// Write from `buf`, returning how many bytes the engine took.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, BridgeError> {
        self.ensure_open()?;
        if !self.writable {
            return Err(BridgeError::InvalidArgument(format!(
                "'{}' is not open for writing",
                self.path
            )));
        }
        engine::lock(&self.engine)?
            .file_write(self.handle, buf)
            .map_err(|status| {
                BridgeError::Io(format!("could not write file '{}': {:?}", self.path, status))
            })
    }

    /// Write the whole of `buf`.
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<(), BridgeError> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(BridgeError::Io(format!(
                    "could not write file '{}': engine made no progress",
                    self.path
                )));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64, BridgeError> {
        self.ensure_open()?;
        engine::lock(&self.engine)?
            .file_size(self.handle)
            .map_err(|status| {
                BridgeError::Io(format!("could not size file '{}': {:?}", self.path, status))
            })
    }

    /// Close the engine handle. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), BridgeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        engine::lock(&self.engine)?
            .file_close(self.handle)
            .map_err(|status| {
                BridgeError::Io(format!("could not close file '{}': {:?}", self.path, status))
            })
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed {
            Err(BridgeError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl Drop for ExtFileStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("stream close for '{}' reported: {}", self.path, e);
        }
    }
}

impl io::Read for ExtFileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ExtFileStream::read(self, buf).map_err(io::Error::other)
    }
}

impl io::Write for ExtFileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ExtFileStream::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn requires_write(mode: FileMode) -> bool {
    matches!(
        mode,
        FileMode::Create | FileMode::CreateNew | FileMode::Truncate | FileMode::Append
    )
}

/// `fopen`-style mode string for a (mode, access) pair, the shape the engine
/// understands.
fn engine_mode(mode: FileMode, access: FileAccess, exists: bool) -> &'static str {
    match (mode, access) {
        (FileMode::Open, FileAccess::Read) => "rb",
        (FileMode::Open, _) => "r+b",
        (FileMode::OpenOrCreate, FileAccess::Read) if exists => "rb",
        (FileMode::OpenOrCreate, FileAccess::Read) => "w+b",
        (FileMode::OpenOrCreate, _) if exists => "r+b",
        (FileMode::OpenOrCreate, _) => "w+b",
        (FileMode::Create, FileAccess::Write) => "wb",
        (FileMode::Create, _) => "w+b",
        (FileMode::CreateNew, FileAccess::Write) => "wb",
        (FileMode::CreateNew, _) => "w+b",
        (FileMode::Truncate, FileAccess::Write) => "wb",
        (FileMode::Truncate, _) => "w+b",
        (FileMode::Append, FileAccess::Write) => "ab",
        (FileMode::Append, _) => "a+b",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_modes_reject_read_only_access() {
        assert!(requires_write(FileMode::CreateNew));
        assert!(requires_write(FileMode::Append));
        assert!(!requires_write(FileMode::Open));
        assert!(!requires_write(FileMode::OpenOrCreate));
    }

    #[test]
    fn engine_mode_strings() {
        assert_eq!(engine_mode(FileMode::Open, FileAccess::Read, true), "rb");
        assert_eq!(engine_mode(FileMode::Open, FileAccess::ReadWrite, true), "r+b");
        assert_eq!(engine_mode(FileMode::OpenOrCreate, FileAccess::Write, false), "w+b");
        assert_eq!(engine_mode(FileMode::CreateNew, FileAccess::Write, false), "wb");
        assert_eq!(engine_mode(FileMode::Append, FileAccess::Write, true), "ab");
    }
}
