//! Indexing of USTAR package archives into in-memory trees.
//!
//! Nothing is extracted: every file node records the absolute offset of its
//! content within the backing [TarReader], and the interpreter later reads
//! straight out of the archive through the virtual file system.

mod node;

use std::rc::Rc;

use pyboot_wasm::TarReader;

pub use node::{DirNode, FileNode, TarNode};

use crate::error::{InternalError, Result};

const BLOCK_SIZE: u64 = 512;

const NAME_FIELD: std::ops::Range<usize> = 0..100;
const MODE_FIELD: std::ops::Range<usize> = 100..108;
const SIZE_FIELD: std::ops::Range<usize> = 124..136;
const MTIME_FIELD: std::ops::Range<usize> = 136..148;
const TYPE_OFFSET: usize = 156;
const PREFIX_FIELD: std::ops::Range<usize> = 345..500;

const TYPE_FILE: u8 = b'0';
const TYPE_FILE_OLD: u8 = 0;
const TYPE_DIR: u8 = b'5';
const TYPE_GNU_LONG_NAME: u8 = b'L';

/// A parsed archive: the directory tree plus every `.so` file encountered
/// during the walk (as path components), in archive order.
#[derive(Debug)]
pub struct TarIndex {
    pub root: TarNode,
    pub so_files: Vec<Vec<String>>,
}

/// Parses a USTAR byte stream into a [TarIndex].
///
/// Handled entry types are directories, regular files and GNU long-name
/// records; `PaxHeader` entries are skipped, anything else is a parse error.
pub fn index_archive(reader: Rc<dyn TarReader>) -> Result<TarIndex> {
    let mut root = DirNode::new_root();
    let mut so_files = Vec::new();

    let mut pos: u64 = 0;
    let mut pending_long_name: Option<String> = None;
    let mut header = [0u8; BLOCK_SIZE as usize];
    loop {
        match reader.read_exact(pos, &mut header) {
            Ok(()) => {}
            // An archive without the trailing zero blocks simply ends here.
            Err(pyboot_wasm::WasmError::ShortRead { .. }) => break,
            Err(e) => return Err(e.into()),
        }

        if header[NAME_FIELD.start] == 0 && header[PREFIX_FIELD.start] == 0 {
            break;
        }

        let size = parse_octal(&header[SIZE_FIELD], "size", pos)?;
        let mode = parse_octal(&header[MODE_FIELD], "mode", pos)? as u32;
        let mtime = parse_octal(&header[MTIME_FIELD], "mtime", pos)?;
        let type_byte = header[TYPE_OFFSET];

        let content_offset = pos + BLOCK_SIZE;
        let next = pos + BLOCK_SIZE * (size.div_ceil(BLOCK_SIZE) + 1);

        if type_byte == TYPE_GNU_LONG_NAME {
            let mut name = vec![0u8; size as usize];
            reader.read_exact(content_offset, &mut name)?;
            pending_long_name = Some(read_cstr(&name));
            pos = next;
            continue;
        }

        let mut path = match pending_long_name.take() {
            Some(long_name) => long_name,
            None => compose_name(&header),
        };
        if let Some(stripped) = path.strip_prefix("./") {
            path = stripped.to_owned();
        }

        // PaxHeader entries rarely have a corresponding directory entry and
        // would break the placement walk below.
        if path.contains("PaxHeader") {
            pos = next;
            continue;
        }

        while path.ends_with('/') {
            path.pop();
        }
        if path.is_empty() {
            pos = next;
            continue;
        }

        match type_byte {
            TYPE_DIR => {
                let components: Vec<&str> = path.split('/').collect();
                let node = TarNode::Dir(DirNode {
                    name: components[components.len() - 1].to_owned(),
                    path: path.clone(),
                    mode,
                    mtime,
                    children: indexmap::IndexMap::new(),
                });
                place(&mut root, &components, node, &path)?;
            }
            TYPE_FILE | TYPE_FILE_OLD => {
                let components: Vec<&str> = path.split('/').collect();
                let name = components[components.len() - 1].to_owned();
                if name.ends_with(".so") {
                    so_files.push(components.iter().map(|c| (*c).to_owned()).collect());
                }
                let node = TarNode::File(FileNode {
                    name,
                    path: path.clone(),
                    mode,
                    mtime,
                    size,
                    content_offset,
                    reader: Rc::clone(&reader),
                });
                place(&mut root, &components, node, &path)?;
            }
            other => {
                return Err(InternalError::UnknownType {
                    type_byte: other,
                    path,
                }
                .into());
            }
        }

        pos = next;
    }

    Ok(TarIndex {
        root: TarNode::Dir(root),
        so_files,
    })
}

/// Inserts `node` under the directory named by all but the last component.
///
/// The archive is required to emit directory entries before their children,
/// so every intermediate must already exist.
fn place(root: &mut DirNode, components: &[&str], node: TarNode, full_path: &str) -> Result<()> {
    let mut dir = root;
    for component in &components[..components.len() - 1] {
        dir = match dir.children.get_mut(*component) {
            Some(TarNode::Dir(child)) => child,
            _ => {
                return Err(InternalError::OrphanEntry {
                    path: full_path.to_owned(),
                }
                .into());
            }
        };
    }
    dir.children.insert(components[components.len() - 1].to_owned(), node);
    Ok(())
}

/// `prefix(155) || base(100)`, each NUL-terminated.
fn compose_name(header: &[u8]) -> String {
    let base = read_cstr(&header[NAME_FIELD]);
    let prefix = read_cstr(&header[PREFIX_FIELD]);
    if prefix.is_empty() {
        base
    } else {
        format!("{prefix}/{base}")
    }
}

fn read_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decodes an octal header field. Leading spaces are allowed, the value ends
/// at the first NUL or space, and anything else is a hard parse error.
fn parse_octal(field: &[u8], name: &'static str, offset: u64) -> Result<u64, InternalError> {
    let mut value: u64 = 0;
    let mut seen_digit = false;
    for byte in field {
        match byte {
            b'0'..=b'7' => {
                value = value * 8 + u64::from(byte - b'0');
                seen_digit = true;
            }
            b' ' if !seen_digit => {}
            b' ' | 0 => break,
            _ => return Err(InternalError::InvalidHeader { field: name, offset }),
        }
    }
    Ok(value)
}
