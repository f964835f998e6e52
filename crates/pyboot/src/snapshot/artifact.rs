//! The snapshot artifact wire format.
//!
//! ```text
//! offset 0   : magic  b"\0snp"
//! offset 4   : u32 LE format version (= 2)
//! offset 8   : u32 LE heap_offset    (>= 16, 8-byte aligned)
//! offset 12  : u32 LE json_len
//! offset 16  : UTF-8 JSON metadata, zero-padded up to heap_offset
//! heap_offset..EOF : raw linear-memory bytes
//! ```
//!
//! Artifacts that predate the header carry no magic: their first 8 bytes are
//! `heap_offset` and `json_len` directly, and the JSON uses the legacy
//! schema handled in [super::meta].

use pyboot_wasm::SnapshotReader;

use super::meta::{decode_meta, SnapshotMeta};
use crate::error::{InternalError, Result};

pub const MAGIC: [u8; 4] = *b"\0snp";
pub const FORMAT_VERSION: u32 = 2;
pub const HEADER_SIZE: u64 = 16;

/// The decoded fixed-size prefix of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub heap_offset: u32,
    pub json_len: u32,
    /// Set when the artifact has no magic and uses the 8-byte header.
    pub legacy_layout: bool,
}

impl ArtifactHeader {
    fn json_start(&self) -> u64 {
        if self.legacy_layout {
            8
        } else {
            HEADER_SIZE
        }
    }

    pub fn heap_len(&self, total_size: u64) -> u64 {
        total_size.saturating_sub(u64::from(self.heap_offset))
    }
}

/// Encodes metadata and heap into artifact bytes.
pub fn encode(meta: &SnapshotMeta, heap: &[u8]) -> Result<Vec<u8>, InternalError> {
    let json = serde_json::to_vec(meta).map_err(|e| InternalError::MalformedMetadata(e.to_string()))?;
    let heap_offset = (HEADER_SIZE + json.len() as u64).next_multiple_of(8);

    let mut out = Vec::with_capacity(heap_offset as usize + heap.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(heap_offset as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&json);
    out.resize(heap_offset as usize, 0);
    out.extend_from_slice(heap);
    Ok(out)
}

/// Reads and validates the artifact header.
pub fn read_header(reader: &dyn SnapshotReader) -> Result<ArtifactHeader> {
    let total = reader.total_size();
    let mut prefix = [0u8; HEADER_SIZE as usize];
    read_exact(reader, 0, &mut prefix)?;

    let header = if prefix[..4] == MAGIC {
        let version = u32::from_le_bytes(prefix[4..8].try_into().expect("4 bytes"));
        if version != FORMAT_VERSION {
            return Err(InternalError::UnsupportedArtifactVersion(version).into());
        }
        ArtifactHeader {
            heap_offset: u32::from_le_bytes(prefix[8..12].try_into().expect("4 bytes")),
            json_len: u32::from_le_bytes(prefix[12..16].try_into().expect("4 bytes")),
            legacy_layout: false,
        }
    } else {
        ArtifactHeader {
            heap_offset: u32::from_le_bytes(prefix[0..4].try_into().expect("4 bytes")),
            json_len: u32::from_le_bytes(prefix[4..8].try_into().expect("4 bytes")),
            legacy_layout: true,
        }
    };

    let json_end = header.json_start() + u64::from(header.json_len);
    if json_end > u64::from(header.heap_offset) || u64::from(header.heap_offset) > total {
        return Err(InternalError::TruncatedArtifact(format!(
            "heap offset {} does not fit metadata of {} bytes in {} total",
            header.heap_offset, header.json_len, total
        ))
        .into());
    }
    Ok(header)
}

/// Reads and decodes the metadata blob described by `header`.
pub fn read_meta(reader: &dyn SnapshotReader, header: &ArtifactHeader) -> Result<SnapshotMeta> {
    let mut json = vec![0u8; header.json_len as usize];
    read_exact(reader, header.json_start(), &mut json)?;
    Ok(decode_meta(&json)?)
}

/// Streams the heap out of the artifact in chunks, handing each to `write`
/// together with its offset within linear memory.
pub fn stream_heap(
    reader: &dyn SnapshotReader,
    header: &ArtifactHeader,
    mut write: impl FnMut(u64, &[u8]) -> pyboot_wasm::Result<()>,
) -> Result<()> {
    const CHUNK: usize = 1 << 20;

    let heap_len = header.heap_len(reader.total_size());
    let mut buf = vec![0u8; CHUNK.min(heap_len as usize).max(1)];
    let mut copied: u64 = 0;
    while copied < heap_len {
        let n = (heap_len - copied).min(buf.len() as u64) as usize;
        read_exact(reader, u64::from(header.heap_offset) + copied, &mut buf[..n])?;
        write(copied, &buf[..n])?;
        copied += n as u64;
    }
    Ok(())
}

/// Decodes a whole in-memory artifact. The CLI and tests use this; restore
/// streams instead.
pub fn decode_bytes(bytes: &[u8]) -> Result<(SnapshotMeta, Vec<u8>)> {
    let reader = pyboot_wasm::InMemoryReader::new(bytes.to_vec());
    let header = read_header(&reader)?;
    let meta = read_meta(&reader, &header)?;
    let mut heap = vec![0u8; header.heap_len(reader.total_size()) as usize];
    read_exact(&reader, u64::from(header.heap_offset), &mut heap)?;
    Ok((meta, heap))
}

fn read_exact(reader: &dyn SnapshotReader, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(offset + filled as u64, &mut buf[filled..])
            .map_err(crate::error::BootError::Host)?;
        if n == 0 {
            return Err(InternalError::TruncatedArtifact(format!(
                "wanted {} bytes at offset {offset}, got {filled}",
                buf.len()
            ))
            .into());
        }
        filled += n;
    }
    Ok(())
}
