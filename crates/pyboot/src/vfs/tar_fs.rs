use pyboot_wasm::{Errno, FileAttr, ENOENT};

use super::{dir_attributes, reg_attributes, EIO, FileStream, FsOps};
use crate::archive::TarNode;

/// [FsOps] over an indexed archive tree.
pub struct TarFs {
    root: TarNode,
}

impl TarFs {
    /// Wraps an archive tree. `root` must be a directory node.
    pub fn new(root: TarNode) -> Self {
        TarFs { root }
    }

    pub fn root_node(&self) -> &TarNode {
        &self.root
    }
}

impl FsOps for TarFs {
    type Node = TarNode;

    fn root(&self) -> &TarNode {
        &self.root
    }

    fn node_mode(&self, node: &TarNode) -> u32 {
        self.node_attributes(node).mode
    }

    fn node_attributes(&self, node: &TarNode) -> FileAttr {
        match node {
            TarNode::Dir(dir) => dir_attributes(dir.mode, dir.mtime),
            TarNode::File(file) => reg_attributes(file.mode, file.size, file.mtime),
        }
    }

    fn readdir(&self, node: &TarNode) -> Result<Vec<String>, Errno> {
        match node.as_dir() {
            Some(dir) => Ok(dir.children.keys().cloned().collect()),
            None => Err(ENOENT),
        }
    }

    fn lookup<'a>(&'a self, dir: &'a TarNode, name: &str) -> Result<&'a TarNode, Errno> {
        dir.lookup(name).ok_or(ENOENT)
    }

    fn read(
        &self,
        node: &TarNode,
        buf: &mut [u8],
        offset_in_buf: usize,
        length: usize,
        position: u64,
    ) -> Result<usize, Errno> {
        let Some(file) = node.as_file() else {
            return Err(ENOENT);
        };
        let end = (offset_in_buf + length).min(buf.len());
        file.read_at(position, &mut buf[offset_in_buf..end]).map_err(|_| EIO)
    }

    fn open(&self, node: &TarNode) -> Result<FileStream, Errno> {
        let Some(file) = node.as_file() else {
            return Err(ENOENT);
        };
        let file = file.clone();
        Ok(FileStream::new(
            file.size,
            Box::new(move |position, buf| file.read_at(position, buf).map_err(|_| EIO)),
        ))
    }
}
