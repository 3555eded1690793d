//! Per-process file descriptors and the global file table.
//!
//! The VFS proper is a consumer of the process layer, not part of it; the
//! core only needs the contract that every operation either succeeds or
//! returns a typed failure. Files are capability objects behind
//! [`FileLike`]; descriptors carry access bits and a byte offset guarded
//! by a per-entry mutex, and the global [`FileTable`] serializes resize
//! under its own mutex.

use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::sync::Mutex;

/// Errors from the descriptor layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdError {
    /// The descriptor number is unused.
    BadDescriptor,
    /// The file was not opened for this access.
    AccessMode,
    /// The backing file rejected the operation.
    Io,
}

bitflags::bitflags! {
    /// Access bits carried by a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        /// Reads permitted.
        const READ   = 1 << 0;
        /// Writes permitted.
        const WRITE  = 1 << 1;
        /// Seek to the end before every write.
        const APPEND = 1 << 2;
    }
}

/// The capability set every file-ish object implements.
pub trait FileLike: Send + Sync {
    /// Reads at `offset` into `buf`, returning the byte count.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ()>;
    /// Writes `buf` at `offset`, returning the byte count.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, ()>;
    /// Current size in bytes.
    fn size(&self) -> u64;
}

/// One open descriptor: a file reference, access bits, and the offset.
pub struct FdEntry {
    file: Arc<dyn FileLike>,
    mode: OpenMode,
    /// Byte offset; the per-entry mutex makes read-modify-write of the
    /// offset exclusive.
    offset: Mutex<u64>,
}

impl core::fmt::Debug for FdEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FdEntry").field("mode", &self.mode).finish()
    }
}

impl FdEntry {
    /// Reads from the current offset, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, FdError> {
        if !self.mode.contains(OpenMode::READ) {
            return Err(FdError::AccessMode);
        }
        let mut offset = self.offset.lock();
        let n = self.file.read_at(*offset, buf).map_err(|()| FdError::Io)?;
        *offset += n as u64;
        Ok(n)
    }

    /// Writes at the current offset (or the end, for append mode),
    /// advancing it.
    pub fn write(&self, buf: &[u8]) -> Result<usize, FdError> {
        if !self.mode.contains(OpenMode::WRITE) {
            return Err(FdError::AccessMode);
        }
        let mut offset = self.offset.lock();
        if self.mode.contains(OpenMode::APPEND) {
            *offset = self.file.size();
        }
        let n = self.file.write_at(*offset, buf).map_err(|()| FdError::Io)?;
        *offset += n as u64;
        Ok(n)
    }

    /// The access bits this descriptor was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

/// A per-process descriptor table with tombstone reuse.
#[derive(Default)]
pub struct FdTable {
    entries: Vec<Option<Arc<FdEntry>>>,
}

impl FdTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Opens `file` with the given access bits and returns the descriptor
    /// number.
    pub fn open(&mut self, file: Arc<dyn FileLike>, mode: OpenMode) -> usize {
        let entry = Arc::new(FdEntry {
            file,
            mode,
            offset: Mutex::new(0),
        });
        for (fd, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return fd;
            }
        }
        self.entries.push(Some(entry));
        self.entries.len() - 1
    }

    /// Closes a descriptor.
    pub fn close(&mut self, fd: usize) -> Result<(), FdError> {
        match self.entries.get_mut(fd) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(FdError::BadDescriptor),
        }
    }

    /// Looks up a descriptor.
    pub fn get(&self, fd: usize) -> Result<Arc<FdEntry>, FdError> {
        self.entries
            .get(fd)
            .and_then(|s| s.clone())
            .ok_or(FdError::BadDescriptor)
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }
}

/// The global file table: every file object live in the system, indexed
/// by a stable slot. The table mutex only guards registration and
/// removal; per-file use goes through the entries themselves.
pub struct FileTable {
    files: Mutex<Vec<Option<Arc<dyn FileLike>>>>,
}

impl FileTable {
    /// Creates an empty file table.
    pub const fn new() -> Self {
        Self {
            files: Mutex::new(Vec::new()),
        }
    }

    /// Registers a file and returns its slot.
    pub fn register(&self, file: Arc<dyn FileLike>) -> usize {
        let mut files = self.files.lock();
        for (i, slot) in files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return i;
            }
        }
        files.push(Some(file));
        files.len() - 1
    }

    /// Drops a registration.
    pub fn unregister(&self, slot: usize) {
        let mut files = self.files.lock();
        if let Some(entry) = files.get_mut(slot) {
            *entry = None;
        }
    }

    /// Fetches a registered file.
    pub fn get(&self, slot: usize) -> Option<Arc<dyn FileLike>> {
        self.files.lock().get(slot).and_then(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Growable in-memory file for tests.
    struct MemFile {
        data: Mutex<Vec<u8>>,
    }

    impl MemFile {
        fn new(initial: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(initial.to_vec()),
            })
        }
    }

    impl FileLike for MemFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ()> {
            let data = self.data.lock();
            let start = (offset as usize).min(data.len());
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(n)
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, ()> {
            let mut data = self.data.lock();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn size(&self) -> u64 {
            self.data.lock().len() as u64
        }
    }

    #[test]
    fn read_advances_the_offset() {
        let mut table = FdTable::new();
        let fd = table.open(MemFile::new(b"hello world"), OpenMode::READ);
        let entry = table.get(fd).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(entry.read(&mut buf), Ok(5));
        assert_eq!(&buf, b"hello");
        assert_eq!(entry.read(&mut buf), Ok(5));
        assert_eq!(&buf, b" worl");
    }

    #[test]
    fn write_requires_write_mode() {
        let mut table = FdTable::new();
        let fd = table.open(MemFile::new(b""), OpenMode::READ);
        let entry = table.get(fd).unwrap();
        assert_eq!(entry.write(b"x"), Err(FdError::AccessMode));
    }

    #[test]
    fn append_always_writes_at_the_end() {
        let mut table = FdTable::new();
        let file = MemFile::new(b"abc");
        let fd = table.open(
            file.clone(),
            OpenMode::WRITE | OpenMode::APPEND | OpenMode::READ,
        );
        let entry = table.get(fd).unwrap();

        assert_eq!(entry.write(b"def"), Ok(3));
        assert_eq!(file.size(), 6);
        // Even after external growth, append lands at the new end.
        file.write_at(6, b"xyz").unwrap();
        assert_eq!(entry.write(b"!"), Ok(1));
        assert_eq!(file.size(), 10);
    }

    #[test]
    fn close_frees_the_slot_for_reuse() {
        let mut table = FdTable::new();
        let a = table.open(MemFile::new(b""), OpenMode::READ);
        let b = table.open(MemFile::new(b""), OpenMode::READ);
        table.close(a).unwrap();
        assert_eq!(table.get(a).unwrap_err(), FdError::BadDescriptor);
        assert_eq!(table.close(a).unwrap_err(), FdError::BadDescriptor);

        let c = table.open(MemFile::new(b""), OpenMode::READ);
        assert_eq!(a, c);
        assert_ne!(b, c);
        assert_eq!(table.open_count(), 2);
    }

    #[test]
    fn file_table_registration_roundtrip() {
        let table = FileTable::new();
        let slot = table.register(MemFile::new(b"dev"));
        assert!(table.get(slot).is_some());
        table.unregister(slot);
        assert!(table.get(slot).is_none());
        // Slot reuse after unregister.
        assert_eq!(table.register(MemFile::new(b"dev2")), slot);
    }
}
