//! Shared test fixtures: archive builders and an in-memory interpreter fake.

use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use pyboot_wasm::{
    ArtifactSink, DsoOpts, ForeignValue, InMemoryReader, MetadataReader, MountedFs, PlacementOracle,
    PlacementRequest, RunOutcome, SerializedRef, SnapshotReader, TarReader, WasmError,
};

use crate::archive::{index_archive, DirNode, TarIndex, TarNode};

/// Builds and indexes a USTAR archive from `paths`; entries ending in `/`
/// become directories, everything else becomes a file whose content is its
/// own path.
pub(crate) fn indexed_tree(paths: &[&str]) -> TarIndex {
    index_archive(Rc::new(InMemoryReader::new(archive_bytes(paths)))).unwrap()
}

pub(crate) fn archive_bytes(paths: &[&str]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for path in paths {
        let mut header = tar::Header::new_ustar();
        header.set_mtime(1_700_000_000);
        if let Some(dir) = path.strip_suffix('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_path(format!("{dir}/")).unwrap();
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, std::io::empty()).unwrap();
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_path(path).unwrap();
            header.set_size(path.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, path.as_bytes()).unwrap();
        }
    }
    builder.into_inner().unwrap()
}

/// Pre-order paths of every node under `root`, joined with `/`.
pub(crate) fn tree_paths(root: &DirNode) -> Vec<String> {
    fn visit(dir: &DirNode, prefix: &str, out: &mut Vec<String>) {
        for (name, child) in &dir.children {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            out.push(path.clone());
            if let TarNode::Dir(child) = child {
                visit(child, &path, out);
            }
        }
    }
    let mut out = Vec::new();
    visit(root, "", &mut out);
    out
}

/// A user bundle held in memory.
pub(crate) struct FakeBundle {
    names: Vec<String>,
    sizes: Vec<u64>,
    blobs: Vec<Vec<u8>>,
}

impl FakeBundle {
    pub(crate) fn new(files: &[(&str, &[u8])]) -> Self {
        FakeBundle {
            names: files.iter().map(|(name, _)| (*name).to_owned()).collect(),
            sizes: files.iter().map(|(_, blob)| blob.len() as u64).collect(),
            blobs: files.iter().map(|(_, blob)| blob.to_vec()).collect(),
        }
    }
}

impl MetadataReader for FakeBundle {
    fn names(&self) -> &[String] {
        &self.names
    }

    fn sizes(&self) -> &[u64] {
        &self.sizes
    }

    fn read(&self, idx: usize, pos: u64, buf: &mut [u8]) -> pyboot_wasm::Result<usize> {
        let blob = &self.blobs[idx];
        let Some(available) = blob.len().checked_sub(pos as usize) else {
            return Ok(0);
        };
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&blob[pos as usize..pos as usize + n]);
        Ok(n)
    }
}

/// A snapshot reader that counts its disposals.
pub(crate) struct CountingReader {
    inner: InMemoryReader,
    disposals: Rc<Cell<u32>>,
}

impl CountingReader {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        CountingReader {
            inner: InMemoryReader::new(bytes),
            disposals: Rc::new(Cell::new(0)),
        }
    }

    pub(crate) fn disposals(&self) -> Rc<Cell<u32>> {
        Rc::clone(&self.disposals)
    }
}

impl SnapshotReader for CountingReader {
    fn read(&self, offset: u64, buf: &mut [u8]) -> pyboot_wasm::Result<usize> {
        TarReader::read(&self.inner, offset, buf)
    }

    fn total_size(&self) -> u64 {
        self.inner.len()
    }

    fn dispose(&mut self) {
        self.disposals.set(self.disposals.get() + 1);
        SnapshotReader::dispose(&mut self.inner);
    }
}

/// An artifact sink that records what reaches it.
#[derive(Default)]
pub(crate) struct FakeSink {
    pub stored: Vec<(usize, Option<Vec<String>>, String)>,
    pub puts: Vec<(String, usize)>,
    pub accept: bool,
}

impl FakeSink {
    pub(crate) fn accepting() -> Self {
        FakeSink {
            accept: true,
            ..FakeSink::default()
        }
    }
}

impl ArtifactSink for FakeSink {
    fn store(&mut self, snapshot: &[u8], imported_modules: Option<&[String]>, snapshot_type: &str) -> bool {
        self.stored.push((
            snapshot.len(),
            imported_modules.map(<[String]>::to_vec),
            snapshot_type.to_owned(),
        ));
        self.accept
    }

    fn put(&mut self, name: &str, bytes: &[u8]) -> pyboot_wasm::Result<()> {
        if !self.accept {
            return Err(WasmError::Other("sink rejected the artifact".into()));
        }
        self.puts.push((name.to_owned(), bytes.len()));
        Ok(())
    }
}

/// A host object for hiwire-serialization tests.
#[derive(Default, Clone)]
pub(crate) struct FakeForeign {
    pub type_name: String,
    pub keys: Option<Vec<String>>,
    pub stack: Option<String>,
    pub json: Option<serde_json::Value>,
    pub serialized: Option<SerializedRef>,
}

impl ForeignValue for FakeForeign {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn keys(&self) -> Option<Vec<String>> {
        self.keys.clone()
    }

    fn stack(&self) -> Option<String> {
        self.stack.clone()
    }

    fn json_repr(&self) -> Option<serde_json::Value> {
        self.json.clone()
    }

    fn as_serialized_ref(&self) -> Option<SerializedRef> {
        self.serialized.clone()
    }
}

/// An in-memory interpreter instance that records everything the bootstrap
/// core asks of it.
pub(crate) struct FakeModule {
    pub heap: Vec<u8>,
    pub next_alloc: u32,
    pub table_len: u32,
    pub free_table: Vec<u32>,
    pub table_grow_per_load: u32,
    pub image_sizes: BTreeMap<String, u32>,
    pub dsos: Vec<String>,
    pub handle_bindings: BTreeMap<String, Vec<u32>>,
    pub loads: Vec<(String, u32)>,
    pub runs: Vec<String>,
    pub scripted_runs: VecDeque<RunOutcome>,
    pub hiwire_values: Vec<FakeForeign>,
    pub finalized_hiwire: Option<Option<serde_json::Value>>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<(String, Rc<dyn MountedFs>)>,
    pub mkdirs: Vec<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub search_paths: Vec<String>,
    pub run_deps: Vec<String>,
    pub removed_run_deps: Vec<String>,
    pub skip_main: bool,
    pub caches_invalidated: bool,
}

impl FakeModule {
    pub(crate) fn new() -> Self {
        FakeModule {
            heap: Vec::new(),
            next_alloc: 0x20000,
            table_len: 128,
            free_table: Vec::new(),
            table_grow_per_load: 16,
            image_sizes: BTreeMap::new(),
            dsos: Vec::new(),
            handle_bindings: BTreeMap::new(),
            loads: Vec::new(),
            runs: Vec::new(),
            scripted_runs: VecDeque::new(),
            hiwire_values: Vec::new(),
            finalized_hiwire: None,
            env: BTreeMap::new(),
            mounts: Vec::new(),
            mkdirs: Vec::new(),
            files: BTreeMap::new(),
            search_paths: Vec::new(),
            run_deps: Vec::new(),
            removed_run_deps: Vec::new(),
            skip_main: false,
            caches_invalidated: false,
        }
    }

    pub(crate) fn base_of(&self, path: &str) -> Option<u32> {
        self.loads
            .iter()
            .find(|(loaded, _)| loaded == path)
            .map(|(_, base)| *base)
    }
}

impl pyboot_wasm::Module for FakeModule {
    fn heap_size(&self) -> u64 {
        self.heap.len() as u64
    }

    fn heap_snapshot(&self) -> Vec<u8> {
        self.heap.clone()
    }

    fn grow_memory(&mut self, size: u64) -> pyboot_wasm::Result<()> {
        if (self.heap.len() as u64) < size {
            self.heap.resize(size as usize, 0);
        }
        Ok(())
    }

    fn write_heap(&mut self, offset: u64, bytes: &[u8]) -> pyboot_wasm::Result<()> {
        let end = offset + bytes.len() as u64;
        if end > self.heap.len() as u64 {
            return Err(WasmError::MemoryBounds {
                offset,
                end,
                heap_size: self.heap.len() as u64,
            });
        }
        self.heap[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    fn wasm_table_length(&self) -> u32 {
        self.table_len
    }

    fn empty_table_slot(&mut self) -> u32 {
        if let Some(slot) = self.free_table.pop() {
            slot
        } else {
            self.table_len += 1;
            self.table_len - 1
        }
    }

    fn push_free_table_index(&mut self, idx: u32) {
        self.free_table.push(idx);
    }

    fn new_dso(&mut self, path: &str, _opts: DsoOpts) -> pyboot_wasm::Result<()> {
        self.dsos.push(path.to_owned());
        Ok(())
    }

    fn bind_dso_handles(&mut self, path: &str, handles: &[u32]) -> pyboot_wasm::Result<()> {
        self.handle_bindings.insert(path.to_owned(), handles.to_vec());
        Ok(())
    }

    fn load_wasm_module(
        &mut self,
        _bytes: &[u8],
        path: &str,
        oracle: &mut dyn PlacementOracle,
    ) -> pyboot_wasm::Result<()> {
        let image_size = self.image_sizes.get(path).copied().unwrap_or(0x10000);
        let request = PlacementRequest {
            path,
            image_size,
            table_length: self.table_len,
        };
        let next_alloc = &mut self.next_alloc;
        let mut alloc = |size: u32| -> pyboot_wasm::Result<u32> {
            let base = *next_alloc;
            *next_alloc += size.next_multiple_of(16);
            Ok(base)
        };
        let base = oracle.place(request, &mut alloc)?;
        self.loads.push((path.to_owned(), base));
        self.table_len += self.table_grow_per_load;
        Ok(())
    }

    fn raw_run(&mut self, code: &str) -> pyboot_wasm::Result<RunOutcome> {
        self.runs.push(code.to_owned());
        Ok(self.scripted_runs.pop_front().unwrap_or(RunOutcome {
            status: 0,
            stderr: String::new(),
        }))
    }

    fn serialize_hiwire_state(
        &mut self,
        serializer: &mut dyn FnMut(&dyn ForeignValue) -> pyboot_wasm::Result<SerializedRef>,
    ) -> pyboot_wasm::Result<Option<serde_json::Value>> {
        if self.hiwire_values.is_empty() {
            return Ok(None);
        }
        let mut serialized = Vec::new();
        for value in &self.hiwire_values {
            serialized.push(serializer(value)?);
        }
        Ok(Some(serde_json::to_value(serialized).expect("serializable refs")))
    }

    fn finalize_bootstrap(
        &mut self,
        hiwire: Option<&serde_json::Value>,
        deserializer: &mut dyn FnMut(&SerializedRef) -> pyboot_wasm::Result<()>,
    ) -> pyboot_wasm::Result<()> {
        self.finalized_hiwire = Some(hiwire.cloned());
        if let Some(blob) = hiwire {
            let refs: Vec<SerializedRef> =
                serde_json::from_value(blob.clone()).map_err(|e| WasmError::Other(e.to_string().into()))?;
            for reference in &refs {
                deserializer(reference)?;
            }
        }
        Ok(())
    }

    fn add_run_dependency(&mut self, name: &str) {
        self.run_deps.push(name.to_owned());
    }

    fn remove_run_dependency(&mut self, name: &str) {
        self.removed_run_deps.push(name.to_owned());
    }

    fn set_skip_main(&mut self) {
        self.skip_main = true;
    }

    fn invalidate_import_caches(&mut self) -> pyboot_wasm::Result<()> {
        self.caches_invalidated = true;
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> pyboot_wasm::Result<()> {
        self.mkdirs.push(path.to_owned());
        Ok(())
    }

    fn mount(&mut self, path: &str, fs: Rc<dyn MountedFs>) -> pyboot_wasm::Result<()> {
        self.mounts.push((path.to_owned(), fs));
        Ok(())
    }

    fn write_file(&mut self, path: &str, bytes: &[u8]) -> pyboot_wasm::Result<()> {
        self.files.insert(path.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn set_env(&mut self, name: &str, value: &str) {
        self.env.insert(name.to_owned(), value.to_owned());
    }

    fn env(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn append_module_search_path(&mut self, path: &str) -> pyboot_wasm::Result<()> {
        self.search_paths.push(path.to_owned());
        Ok(())
    }
}
