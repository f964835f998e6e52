use std::rc::Rc;

use indexmap::IndexMap;
use pyboot_wasm::TarReader;

/// A single node in an indexed archive tree.
#[derive(Clone)]
pub enum TarNode {
    Dir(DirNode),
    File(FileNode),
}

/// A directory. Children keep the insertion order of the archive walk;
/// lookup is by name.
#[derive(Clone)]
pub struct DirNode {
    pub name: String,
    pub path: String,
    pub mode: u32,
    pub mtime: u64,
    pub children: IndexMap<String, TarNode>,
}

/// A regular file, backed by a range of its reader.
#[derive(Clone)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub mode: u32,
    pub mtime: u64,
    pub size: u64,
    /// Absolute offset of the file content within `reader`.
    pub content_offset: u64,
    pub reader: Rc<dyn TarReader>,
}

impl DirNode {
    pub fn new_root() -> Self {
        DirNode {
            name: String::new(),
            path: String::new(),
            mode: 0o755,
            mtime: 0,
            children: IndexMap::new(),
        }
    }
}

impl FileNode {
    /// Reads file bytes starting at `position`, clamped to the file size.
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> pyboot_wasm::Result<usize> {
        let Some(left) = self.size.checked_sub(position) else {
            return Ok(0);
        };
        let n = buf.len().min(left as usize);
        if n == 0 {
            return Ok(0);
        }
        self.reader.read_exact(self.content_offset + position, &mut buf[..n])?;
        Ok(n)
    }

    /// Reads the whole file into a fresh buffer.
    pub fn read_all(&self) -> pyboot_wasm::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size as usize];
        self.reader.read_exact(self.content_offset, &mut buf)?;
        Ok(buf)
    }
}

impl TarNode {
    pub fn name(&self) -> &str {
        match self {
            TarNode::Dir(dir) => &dir.name,
            TarNode::File(file) => &file.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            TarNode::Dir(dir) => &dir.path,
            TarNode::File(file) => &file.path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, TarNode::Dir(_))
    }

    pub fn as_dir(&self) -> Option<&DirNode> {
        match self {
            TarNode::Dir(dir) => Some(dir),
            TarNode::File(_) => None,
        }
    }

    pub fn as_dir_mut(&mut self) -> Option<&mut DirNode> {
        match self {
            TarNode::Dir(dir) => Some(dir),
            TarNode::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            TarNode::Dir(_) => None,
            TarNode::File(file) => Some(file),
        }
    }

    /// Looks up a direct child by name.
    pub fn lookup(&self, name: &str) -> Option<&TarNode> {
        self.as_dir().and_then(|dir| dir.children.get(name))
    }

    /// Descends the tree along `components`, returning the node at the end of
    /// the walk.
    pub fn walk<'a, I>(&self, components: I) -> Option<&TarNode>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut node = self;
        for component in components {
            node = node.lookup(component)?;
        }
        Some(node)
    }

    fn render(&self, f: &mut std::fmt::Formatter<'_>, depth: usize) -> std::fmt::Result {
        if let TarNode::Dir(dir) = self {
            let last = dir.children.len().saturating_sub(1);
            for (idx, child) in dir.children.values().enumerate() {
                for _ in 0..depth {
                    write!(f, "│   ")?;
                }
                let marker = if idx == last { "└── " } else { "├── " };
                writeln!(f, "{}{}", marker, child.name())?;
                child.render(f, depth + 1)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TarNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", if self.path().is_empty() { "." } else { self.path() })?;
        self.render(f, 0)
    }
}
