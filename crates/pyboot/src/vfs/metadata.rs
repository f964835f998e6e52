use std::rc::Rc;

use indexmap::IndexMap;
use pyboot_wasm::{Errno, FileAttr, MetadataReader, ENOENT};

use super::{dir_attributes, reg_attributes, EIO, FileStream, FsOps, ReadonlyFs};

/// A node in the user-bundle tree, built from the bundle's flat name list.
#[derive(Debug)]
pub enum MetaNode {
    Dir {
        name: String,
        children: IndexMap<String, MetaNode>,
    },
    File {
        name: String,
        /// Index of the blob within the [MetadataReader].
        index: usize,
        size: u64,
    },
}

impl MetaNode {
    fn lookup(&self, name: &str) -> Option<&MetaNode> {
        match self {
            MetaNode::Dir { children, .. } => children.get(name),
            MetaNode::File { .. } => None,
        }
    }
}

/// [FsOps] over the user's bundle of module sources and data blobs.
pub struct MetaFsOps {
    root: MetaNode,
    reader: Rc<dyn MetadataReader>,
}

/// The user-bundle mount, served read-only at the metadata path.
pub type MetadataFs = ReadonlyFs<MetaFsOps>;

impl MetaFsOps {
    /// Indexes the reader's flat name list into a tree, splitting on `/`.
    pub fn new(reader: Rc<dyn MetadataReader>) -> Self {
        let mut root = IndexMap::new();
        for (index, name) in reader.names().iter().enumerate() {
            let size = reader.sizes().get(index).copied().unwrap_or(0);
            insert(&mut root, name, index, size);
        }
        MetaFsOps {
            root: MetaNode::Dir {
                name: String::new(),
                children: root,
            },
            reader,
        }
    }
}

fn insert(root: &mut IndexMap<String, MetaNode>, path: &str, index: usize, size: u64) {
    let mut children = root;
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return;
    }
    for component in &components[..components.len() - 1] {
        let entry = children
            .entry((*component).to_owned())
            .or_insert_with(|| MetaNode::Dir {
                name: (*component).to_owned(),
                children: IndexMap::new(),
            });
        children = match entry {
            MetaNode::Dir { children, .. } => children,
            // A file and a directory share a name; the directory wins.
            MetaNode::File { .. } => {
                *entry = MetaNode::Dir {
                    name: (*component).to_owned(),
                    children: IndexMap::new(),
                };
                match entry {
                    MetaNode::Dir { children, .. } => children,
                    MetaNode::File { .. } => unreachable!(),
                }
            }
        };
    }
    let name = components[components.len() - 1].to_owned();
    children.insert(
        name.clone(),
        MetaNode::File { name, index, size },
    );
}

impl FsOps for MetaFsOps {
    type Node = MetaNode;

    fn root(&self) -> &MetaNode {
        &self.root
    }

    fn node_mode(&self, node: &MetaNode) -> u32 {
        self.node_attributes(node).mode
    }

    fn node_attributes(&self, node: &MetaNode) -> FileAttr {
        match node {
            MetaNode::Dir { .. } => dir_attributes(0o555, 0),
            MetaNode::File { size, .. } => reg_attributes(0o444, *size, 0),
        }
    }

    fn readdir(&self, node: &MetaNode) -> Result<Vec<String>, Errno> {
        match node {
            MetaNode::Dir { children, .. } => Ok(children.keys().cloned().collect()),
            MetaNode::File { .. } => Err(ENOENT),
        }
    }

    fn lookup<'a>(&'a self, dir: &'a MetaNode, name: &str) -> Result<&'a MetaNode, Errno> {
        dir.lookup(name).ok_or(ENOENT)
    }

    fn read(
        &self,
        node: &MetaNode,
        buf: &mut [u8],
        offset_in_buf: usize,
        length: usize,
        position: u64,
    ) -> Result<usize, Errno> {
        let MetaNode::File { index, size, .. } = node else {
            return Err(ENOENT);
        };
        let left = size.saturating_sub(position);
        let end = (offset_in_buf + length).min(buf.len());
        let n = (end - offset_in_buf).min(left as usize);
        if n == 0 {
            return Ok(0);
        }
        self.reader
            .read(*index, position, &mut buf[offset_in_buf..offset_in_buf + n])
            .map_err(|_| EIO)
    }

    fn open(&self, node: &MetaNode) -> Result<FileStream, Errno> {
        let MetaNode::File { index, size, .. } = node else {
            return Err(ENOENT);
        };
        let (index, size) = (*index, *size);
        let reader = Rc::clone(&self.reader);
        Ok(FileStream::new(
            size,
            Box::new(move |position, buf| {
                let left = size.saturating_sub(position);
                let n = buf.len().min(left as usize);
                if n == 0 {
                    return Ok(0);
                }
                reader.read(index, position, &mut buf[..n]).map_err(|_| EIO)
            }),
        ))
    }
}
