//! Read-only virtual file systems served to the interpreter.
//!
//! Two backings exist: indexed package archives ([TarFs]) and the user's
//! bundle ([MetadataFs]); [ReadonlyFs] wraps either behind the fixed
//! operation set the interpreter's VFS layer calls into.

mod metadata;
mod tar_fs;

use pyboot_wasm::{Errno, FileAttr, MountedFs};

pub use metadata::{MetaFsOps, MetaNode, MetadataFs};
pub use tar_fs::TarFs;

pub const FS_BLOCK_SIZE: u32 = 4096;

/// WASI `EINVAL`, returned for out-of-range seeks.
pub const EINVAL: Errno = Errno(28);
/// WASI `EIO`, returned when a backing reader fails mid-read.
pub const EIO: Errno = Errno(29);

pub(crate) const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// Origin of a stream seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl Whence {
    pub fn from_raw(raw: u32) -> Option<Whence> {
        match raw {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// The fixed operation set the interpreter's VFS expects from a mount.
pub trait FsOps {
    type Node;

    fn root(&self) -> &Self::Node;

    fn node_mode(&self, node: &Self::Node) -> u32;

    fn node_attributes(&self, node: &Self::Node) -> FileAttr;

    fn readdir(&self, node: &Self::Node) -> Result<Vec<String>, Errno>;

    fn lookup<'a>(&'a self, dir: &'a Self::Node, name: &str) -> Result<&'a Self::Node, Errno>;

    /// Reads `length` bytes of `node` at `position` into
    /// `buf[offset_in_buf..]`, clamped to what the file still has.
    fn read(
        &self,
        node: &Self::Node,
        buf: &mut [u8],
        offset_in_buf: usize,
        length: usize,
        position: u64,
    ) -> Result<usize, Errno>;

    /// Opens a stream over `node`, capturing its backing reader.
    fn open(&self, node: &Self::Node) -> Result<FileStream, Errno>;
}

/// An open file handle.
///
/// The read function is captured at open time: reassigning a mount's op
/// table afterwards cannot substitute another reader under this stream.
pub struct FileStream {
    used_bytes: u64,
    position: u64,
    read_at: Box<dyn Fn(u64, &mut [u8]) -> Result<usize, Errno>>,
}

impl FileStream {
    pub(crate) fn new(used_bytes: u64, read_at: Box<dyn Fn(u64, &mut [u8]) -> Result<usize, Errno>>) -> Self {
        FileStream {
            used_bytes,
            position: 0,
            read_at,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u64 {
        self.used_bytes
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, Errno> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.position,
            Whence::End => self.used_bytes,
        };
        let target = base as i64 + offset;
        if target < 0 {
            return Err(EINVAL);
        }
        self.position = target as u64;
        Ok(self.position)
    }

    /// Reads up to `length` bytes at `position` into `buf[offset_in_buf..]`,
    /// clamped to `used_bytes - position`, and advances the stream.
    pub fn read(
        &mut self,
        buf: &mut [u8],
        offset_in_buf: usize,
        length: usize,
        position: u64,
    ) -> Result<usize, Errno> {
        let left = self.used_bytes.saturating_sub(position);
        let n = length.min(left as usize).min(buf.len().saturating_sub(offset_in_buf));
        if n == 0 {
            self.position = position;
            return Ok(0);
        }
        let read = (self.read_at)(position, &mut buf[offset_in_buf..offset_in_buf + n])?;
        self.position = position + read as u64;
        Ok(read)
    }

    /// Reads from the current stream position.
    pub fn read_next(&mut self, buf: &mut [u8], offset_in_buf: usize, length: usize) -> Result<usize, Errno> {
        self.read(buf, offset_in_buf, length, self.position)
    }
}

/// A read-only mount over some [FsOps] backing.
pub struct ReadonlyFs<O: FsOps> {
    ops: O,
    trusted: bool,
}

impl<O: FsOps> ReadonlyFs<O> {
    /// Wraps `ops`. `trusted` marks mounts that may back dynamic-library
    /// loads; mounts without the marker are refused by the loader.
    pub fn new(ops: O, trusted: bool) -> Self {
        ReadonlyFs { ops, trusted }
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn trusted(&self) -> bool {
        self.trusted
    }

    /// Resolves `path` (absolute or relative to the mount root) to a node.
    pub fn resolve(&self, path: &str) -> Result<&O::Node, Errno> {
        let mut node = self.ops.root();
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            node = self.ops.lookup(node, component)?;
        }
        Ok(node)
    }

    pub fn getattr_path(&self, path: &str) -> Result<FileAttr, Errno> {
        Ok(self.ops.node_attributes(self.resolve(path)?))
    }

    /// Opens a stream over the file at `path`.
    pub fn open_path(&self, path: &str) -> Result<FileStream, Errno> {
        self.ops.open(self.resolve(path)?)
    }

    /// Reads a whole file out of the mount.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, Errno> {
        let mut stream = self.open_path(path)?;
        let mut buf = vec![0u8; stream.size() as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = buf.len() - filled;
            let n = stream.read_next(&mut buf, filled, remaining)?;
            if n == 0 {
                return Err(EIO);
            }
            filled += n;
        }
        Ok(buf)
    }
}

impl<O: FsOps> MountedFs for ReadonlyFs<O> {
    fn getattr(&self, path: &str) -> Result<FileAttr, Errno> {
        self.getattr_path(path)
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>, Errno> {
        self.ops.readdir(self.resolve(path)?)
    }

    fn read_at(&self, path: &str, pos: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let node = self.resolve(path)?;
        let len = buf.len();
        self.ops.read(node, buf, 0, len, pos)
    }

    fn trusted(&self) -> bool {
        self.trusted
    }
}

/// Attributes in the exact shape the interpreter's `getattr` returns.
pub(crate) fn file_attributes(ifmt: u32, mode: u32, size: u64, mtime: u64) -> FileAttr {
    FileAttr {
        mode: ifmt | mode,
        size,
        atime: mtime,
        mtime,
        ctime: mtime,
        blksize: FS_BLOCK_SIZE,
        blocks: size.div_ceil(u64::from(FS_BLOCK_SIZE)),
        nlink: 1,
        uid: 0,
        gid: 0,
    }
}

pub(crate) fn dir_attributes(mode: u32, mtime: u64) -> FileAttr {
    file_attributes(S_IFDIR, mode, 0, mtime)
}

pub(crate) fn reg_attributes(mode: u32, size: u64, mtime: u64) -> FileAttr {
    file_attributes(S_IFREG, mode, size, mtime)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use pyboot_wasm::{InMemoryReader, ENOENT};
    use similar_asserts::assert_eq;

    use super::*;
    use crate::archive::index_archive;

    fn sample_fs() -> ReadonlyFs<TarFs> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_path("pkg/").unwrap();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(99);
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_path("pkg/data.bin").unwrap();
        header.set_size(10);
        header.set_mode(0o644);
        header.set_mtime(99);
        header.set_cksum();
        builder.append(&header, &b"0123456789"[..]).unwrap();
        let index = index_archive(Rc::new(InMemoryReader::new(builder.into_inner().unwrap()))).unwrap();
        ReadonlyFs::new(TarFs::new(index.root), true)
    }

    #[test]
    fn getattr_reports_size_times_and_blocks() {
        let fs = sample_fs();
        let attr = fs.getattr_path("pkg/data.bin").unwrap();
        assert_eq!(attr.size, 10);
        assert_eq!(attr.mode, 0o100644);
        assert_eq!((attr.atime, attr.mtime, attr.ctime), (99, 99, 99));
        assert_eq!(attr.blksize, 4096);
        assert_eq!(attr.blocks, 1);
        assert_eq!((attr.nlink, attr.uid, attr.gid), (1, 0, 0));

        let dir = fs.getattr_path("pkg").unwrap();
        assert_eq!(dir.mode, 0o040755);
    }

    #[test]
    fn lookup_of_missing_entries_is_enoent() {
        let fs = sample_fs();
        assert_eq!(fs.resolve("pkg/missing.py").unwrap_err(), ENOENT);
        // A lookup below a file is also ENOENT.
        assert_eq!(fs.resolve("pkg/data.bin/child").unwrap_err(), ENOENT);
    }

    #[test]
    fn readdir_yields_child_names() {
        let fs = sample_fs();
        assert_eq!(MountedFs::readdir(&fs, "pkg").unwrap(), vec!["data.bin".to_owned()]);
    }

    #[test]
    fn seek_follows_whence_rules() {
        let fs = sample_fs();
        let mut stream = fs.open_path("pkg/data.bin").unwrap();
        assert_eq!(stream.seek(4, Whence::Set).unwrap(), 4);
        assert_eq!(stream.seek(2, Whence::Cur).unwrap(), 6);
        assert_eq!(stream.seek(-3, Whence::End).unwrap(), 7);
        assert_eq!(stream.seek(-8, Whence::Set).unwrap_err(), EINVAL);
    }

    #[test]
    fn read_clamps_to_remaining_bytes() {
        let fs = sample_fs();
        let mut stream = fs.open_path("pkg/data.bin").unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf, 2, 16, 6).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[2..6], b"6789");
        assert_eq!(stream.position(), 10);
        assert_eq!(stream.read_next(&mut buf, 0, 4).unwrap(), 0);
    }

    #[test]
    fn streams_survive_backing_swap_attempts() {
        // The stream captures its reader at open time; dropping or replacing
        // the mount afterwards must not affect reads.
        let fs = sample_fs();
        let mut stream = fs.open_path("pkg/data.bin").unwrap();
        drop(fs);
        let mut buf = [0u8; 10];
        assert_eq!(stream.read(&mut buf, 0, 10, 0).unwrap(), 10);
        assert_eq!(&buf, b"0123456789");
    }
}
