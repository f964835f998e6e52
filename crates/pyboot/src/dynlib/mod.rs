//! Pre-initialisation dynamic linking.
//!
//! Extension modules are instantiated before the interpreter's `main` runs,
//! and their memory and function-table placement is recorded so a later
//! restore can land every image at the very same addresses. Relocated code
//! dereferences garbage otherwise.

use std::collections::BTreeMap;
use std::rc::Rc;

use indexmap::IndexMap;
use pyboot_wasm::{DsoOpts, Module, PlacementOracle, PlacementRequest};

use crate::error::{InternalError, Result};
use crate::layout::{DYNLIB_PATH, METADATA_PATH};
use crate::vfs::{MetadataFs, ReadonlyFs, TarFs, S_IFDIR};

/// Everything a snapshot must know to reproduce dynamic-library placement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DsoRecord {
    /// Linear-memory base of each image, keyed by both the full install path
    /// and the bare file name.
    pub memory_bases: IndexMap<String, u32>,
    /// Function-table base of each image, keyed the same way.
    pub table_bases: IndexMap<String, u32>,
    /// Full install paths in load order. Replay must reproduce it.
    pub load_order: Vec<String>,
    /// Outstanding dlopen-style handles per path.
    pub handles: BTreeMap<String, Vec<u32>>,
}

impl DsoRecord {
    /// The recorded base for `path`, under either of its keys.
    pub fn base_for(&self, path: &str) -> Option<u32> {
        self.memory_bases
            .get(path)
            .or_else(|| self.memory_bases.get(file_name(path)))
            .copied()
    }

    pub fn table_base_for(&self, path: &str) -> Option<u32> {
        self.table_bases
            .get(path)
            .or_else(|| self.table_bases.get(file_name(path)))
            .copied()
    }
}

/// Where dynamic-library bytes may come from, in resolution order.
pub struct DsoSources {
    pub site: Rc<ReadonlyFs<TarFs>>,
    pub dynlib: Rc<ReadonlyFs<TarFs>>,
    pub metadata: Option<Rc<MetadataFs>>,
    /// Absolute path of the mounted site-packages root.
    pub site_prefix: String,
}

impl DsoSources {
    /// Turns a preload fragment into the absolute path it will be loaded as.
    pub fn absolutize(&self, fragment: &[String]) -> Result<String> {
        let joined = fragment.join("/");
        if self
            .site
            .ops()
            .root_node()
            .walk(fragment.iter().map(String::as_str))
            .is_some()
        {
            return Ok(format!("{}/{joined}", self.site_prefix));
        }
        if self
            .dynlib
            .ops()
            .root_node()
            .walk(fragment.iter().map(String::as_str))
            .is_some()
        {
            return Ok(format!("{DYNLIB_PATH}/{joined}"));
        }
        Err(InternalError::DynlibNotFound(joined).into())
    }

    /// Resolves a full install path to the library's bytes: the site-packages
    /// tree first, then the dynlib tree, then the user bundle.
    fn resolve_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let site_relative = path
            .strip_prefix(&self.site_prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(path);
        if let Some(bytes) = read_trusted(&self.site, site_relative, path)? {
            return Ok(bytes);
        }

        let dynlib_relative = path
            .strip_prefix(DYNLIB_PATH)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(path);
        if let Some(bytes) = read_trusted(&self.dynlib, dynlib_relative, path)? {
            return Ok(bytes);
        }

        if let Some(rest) = path.strip_prefix(METADATA_PATH) {
            if let Some(metadata) = &self.metadata {
                if let Some(bytes) = read_trusted(metadata, rest.trim_start_matches('/'), path)? {
                    return Ok(bytes);
                }
            }
        }

        Err(InternalError::DynlibNotFound(path.to_owned()).into())
    }
}

fn read_trusted<O: crate::vfs::FsOps>(
    fs: &ReadonlyFs<O>,
    relative: &str,
    full_path: &str,
) -> Result<Option<Vec<u8>>> {
    let Ok(node) = fs.resolve(relative) else {
        return Ok(None);
    };
    if !fs.trusted() {
        return Err(InternalError::UntrustedDynlibSource(full_path.to_owned()).into());
    }
    // A hit that is a directory has nothing to load.
    if fs.ops().node_attributes(node).mode & S_IFDIR != 0 {
        return Err(InternalError::MissingContentOffset(full_path.to_owned()).into());
    }
    match fs.read_file(relative) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(errno) => {
            tracing::debug!("failed to read `{relative}`: {errno}");
            Ok(None)
        }
    }
}

/// Loads extension modules and keeps the [DsoRecord] faithful to where each
/// image actually landed.
pub struct DynlibLoader {
    sources: DsoSources,
    record: DsoRecord,
}

impl DynlibLoader {
    /// A loader for a fresh capture. `record` starts out empty unless this
    /// run compounds on a previously restored snapshot, in which case it is
    /// seeded with that snapshot's placement so every already-known library
    /// keeps its base.
    pub fn new(sources: DsoSources, record: DsoRecord) -> Self {
        DynlibLoader { sources, record }
    }

    pub fn record(&self) -> &DsoRecord {
        &self.record
    }

    pub fn into_record(self) -> DsoRecord {
        self.record
    }

    pub fn sources(&self) -> &DsoSources {
        &self.sources
    }

    /// Loads every library in `paths`, in order.
    pub fn preload(&mut self, module: &mut dyn Module, paths: &[String]) -> Result<()> {
        for path in paths {
            self.load_one(module, path)?;
        }
        Ok(())
    }

    fn load_one(&mut self, module: &mut dyn Module, path: &str) -> Result<()> {
        tracing::debug!("loading dynamic library `{path}`");
        let bytes = self.sources.resolve_bytes(path)?;

        // Preloaded libraries are never reclaimed.
        module.new_dso(path, DsoOpts::default())?;

        let mut oracle = RecordingOracle {
            record: &mut self.record,
        };
        module.load_wasm_module(&bytes, path, &mut oracle)?;

        if let Some(handles) = self.record.handles.get(path) {
            if !handles.is_empty() {
                module.bind_dso_handles(path, handles)?;
            }
        }
        Ok(())
    }
}

/// The allocator interposition: replays recorded bases and records fresh
/// ones under both the full path and the bare file name.
struct RecordingOracle<'a> {
    record: &'a mut DsoRecord,
}

impl PlacementOracle for RecordingOracle<'_> {
    fn place(
        &mut self,
        request: PlacementRequest<'_>,
        alloc: &mut dyn FnMut(u32) -> pyboot_wasm::Result<u32>,
    ) -> pyboot_wasm::Result<u32> {
        if let Some(base) = self.record.base_for(request.path) {
            return Ok(base);
        }

        let base = alloc(request.image_size)?;
        let name = file_name(request.path).to_owned();
        self.record.memory_bases.insert(request.path.to_owned(), base);
        self.record.memory_bases.insert(name.clone(), base);
        self.record.table_bases.insert(request.path.to_owned(), request.table_length);
        self.record.table_bases.insert(name, request.table_length);
        self.record.load_order.push(request.path.to_owned());
        Ok(base)
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Orders preload fragments: `_lzma.so` first, `_ssl.so` second, the rest by
/// their `/`-joined path.
pub fn sort_so_files(files: &mut [Vec<String>]) {
    files.sort_by_key(|components| {
        let name = components.last().map(String::as_str).unwrap_or_default();
        (name != "_lzma.so", name != "_ssl.so", components.join("/"))
    });
}

/// The fixed preload selection used before `load_order` was recorded in
/// snapshots (compat mode `0.26.0a2`): baseline-related runs preload only
/// `_lzma.so` and `_ssl.so`, everything else preloads the full sorted list.
pub fn legacy_preload_fragments(preload: &[Vec<String>], baseline: bool) -> Vec<Vec<String>> {
    if baseline {
        return vec![vec!["_lzma.so".to_owned()], vec!["_ssl.so".to_owned()]];
    }
    let mut fragments = preload.to_vec();
    sort_so_files(&mut fragments);
    fragments
}
