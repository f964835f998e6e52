/// The errno value the interpreter's VFS expects for a failed lookup.
pub const ENOENT: Errno = Errno(44);

/// A WASI-style errno as the interpreter's VFS layer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub u16);

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == ENOENT {
            write!(f, "ENOENT")
        } else {
            write!(f, "errno {}", self.0)
        }
    }
}

/// File attributes in the shape the interpreter's `getattr` operation expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub mode: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

/// A read-only file system the interpreter can mount at a path.
///
/// This is the object-safe, path-addressed facade over the node-level
/// operation set; the interpreter host only ever talks to mounts through it.
pub trait MountedFs {
    fn getattr(&self, path: &str) -> Result<FileAttr, Errno>;

    fn readdir(&self, path: &str) -> Result<Vec<String>, Errno>;

    /// Reads file content starting at `pos` into `buf`, returning the number
    /// of bytes read.
    fn read_at(&self, path: &str, pos: u64, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Whether dynamic-library bytes may be loaded out of this mount.
    fn trusted(&self) -> bool;
}
