use crate::{Result, WasmError};

/// A random-access byte source backing a tar archive.
///
/// The embedded packages reader, downloaded-package readers and the user
/// bundle all satisfy this.
pub trait TarReader {
    /// Reads bytes at `offset` into `buf`, returning the number of bytes read.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Like [TarReader::read], but fails unless `buf` can be filled completely.
    fn read_exact(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(WasmError::ShortRead {
                    offset,
                    requested: buf.len(),
                    size: offset + filled as u64,
                });
            }
            filled += n;
        }
        Ok(())
    }
}

/// The user bundle: a flat list of named blobs (module sources and data).
pub trait MetadataReader {
    fn names(&self) -> &[String];

    fn sizes(&self) -> &[u64];

    /// Reads bytes of the blob at `idx`, starting at `pos`.
    fn read(&self, idx: usize, pos: u64, buf: &mut [u8]) -> Result<usize>;
}

/// A random-access source holding a previously captured snapshot artifact.
pub trait SnapshotReader {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn total_size(&self) -> u64;

    /// Releases the underlying storage. Must be called exactly once, after
    /// the heap has been copied out.
    fn dispose(&mut self);
}

/// Where captured snapshot bytes end up.
///
/// Both operations are fire-and-forget beyond reporting success.
pub trait ArtifactSink {
    /// Validator mode: hand over the whole artifact together with the module
    /// list it was captured with.
    fn store(&mut self, snapshot: &[u8], imported_modules: Option<&[String]>, snapshot_type: &str) -> bool;

    /// Disk mode: persist `bytes` under `name`.
    fn put(&mut self, name: &str, bytes: &[u8]) -> Result<()>;
}

/// A byte source held entirely in memory.
///
/// Backs the embedded packages archive and is what the CLI wraps files in.
#[derive(Debug, Clone)]
pub struct InMemoryReader(Vec<u8>);

impl InMemoryReader {
    pub fn new(bytes: Vec<u8>) -> Self {
        InMemoryReader(bytes)
    }

    pub fn len(&self) -> u64 {
        self.0.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TarReader for InMemoryReader {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let Some(available) = (self.0.len() as u64).checked_sub(offset) else {
            return Ok(0);
        };
        let n = buf.len().min(available as usize);
        buf[..n].copy_from_slice(&self.0[offset as usize..offset as usize + n]);
        Ok(n)
    }
}

impl SnapshotReader for InMemoryReader {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        TarReader::read(self, offset, buf)
    }

    fn total_size(&self) -> u64 {
        self.len()
    }

    fn dispose(&mut self) {
        self.0 = Vec::new();
    }
}
