use std::rc::Rc;

use crate::{ForeignValue, MountedFs, Result, SerializedRef};

/// The status and captured stderr of a no-FFI python execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: i32,
    pub stderr: String,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

/// Options for registering a DSO with the interpreter.
#[derive(Debug, Clone, Copy)]
pub struct DsoOpts {
    /// Make the library's symbols visible to subsequently loaded libraries.
    pub global: bool,
    /// Never reclaim the registry entry. Preloaded libraries are pinned this
    /// way so their refcount is effectively infinite.
    pub nodelete: bool,
}

impl Default for DsoOpts {
    fn default() -> Self {
        DsoOpts {
            global: true,
            nodelete: true,
        }
    }
}

/// Everything the interpreter knows at the moment it asks where to place a
/// library image.
#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest<'a> {
    /// The path the library is being loaded as.
    pub path: &'a str,
    /// Byte size of the memory region the image needs.
    pub image_size: u32,
    /// Current length of the indirect function table.
    pub table_length: u32,
}

/// Decides the linear-memory base of each dynamic-library image.
///
/// The interpreter calls [PlacementOracle::place] instead of its own
/// allocator while a library is being loaded; `alloc` is that underlying
/// allocator, for the case where no base is mandated.
pub trait PlacementOracle {
    fn place(&mut self, req: PlacementRequest<'_>, alloc: &mut dyn FnMut(u32) -> Result<u32>) -> Result<u32>;
}

/// The WebAssembly-embedded interpreter instance, as seen by the bootstrap
/// core. One instance owns one linear memory; none of this is shareable.
pub trait Module {
    // Linear memory.

    /// Current byte size of the linear memory.
    fn heap_size(&self) -> u64;

    /// Copies the entire linear memory out of the instance.
    fn heap_snapshot(&self) -> Vec<u8>;

    /// Grows the linear memory so that at least `size` bytes are addressable.
    fn grow_memory(&mut self, size: u64) -> Result<()>;

    /// Copies `bytes` into the linear memory starting at `offset`.
    fn write_heap(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;

    // Indirect function table.

    fn wasm_table_length(&self) -> u32;

    /// Pops a free function-table slot, growing the table when none is free.
    fn empty_table_slot(&mut self) -> u32;

    /// Returns a slot obtained from [Module::empty_table_slot] to the free list.
    fn push_free_table_index(&mut self, idx: u32);

    // DSO registry.

    /// Registers a new DSO record for `path` with the interpreter.
    fn new_dso(&mut self, path: &str, opts: DsoOpts) -> Result<()>;

    /// Re-associates previously issued dlopen-style handles with the DSO at
    /// `path`, so user code holding them keeps resolving the same library.
    fn bind_dso_handles(&mut self, path: &str, handles: &[u32]) -> Result<()>;

    /// Instantiates a library image, consulting `oracle` for the placement of
    /// its memory region.
    fn load_wasm_module(&mut self, bytes: &[u8], path: &str, oracle: &mut dyn PlacementOracle) -> Result<()>;

    // Execution.

    /// Runs python source without crossing the FFI boundary.
    fn raw_run(&mut self, code: &str) -> Result<RunOutcome>;

    // Host-object (hiwire) tables.

    /// Walks the interpreter's table of host-object references, serializing
    /// each through `serializer`. Returns the opaque state blob, or `None`
    /// when the table is empty.
    fn serialize_hiwire_state(
        &mut self,
        serializer: &mut dyn FnMut(&dyn ForeignValue) -> Result<SerializedRef>,
    ) -> Result<Option<serde_json::Value>>;

    /// Completes a restore: re-installs the host-object table captured in
    /// `hiwire`, resolving each opaque token through `deserializer`.
    fn finalize_bootstrap(
        &mut self,
        hiwire: Option<&serde_json::Value>,
        deserializer: &mut dyn FnMut(&SerializedRef) -> Result<()>,
    ) -> Result<()>;

    // Startup sequencing.

    /// Holds off the interpreter's `main` until the dependency is removed.
    fn add_run_dependency(&mut self, name: &str);

    fn remove_run_dependency(&mut self, name: &str);

    /// Marks the instance as restored-from-snapshot: `main` must not run.
    fn set_skip_main(&mut self);

    /// Drops the interpreter's importer caches. Required after a heap
    /// restore, as file-system contents may differ from capture time.
    fn invalidate_import_caches(&mut self) -> Result<()>;

    // Interpreter VFS and environment.

    fn mkdir(&mut self, path: &str) -> Result<()>;

    fn mount(&mut self, path: &str, fs: Rc<dyn MountedFs>) -> Result<()>;

    fn write_file(&mut self, path: &str, bytes: &[u8]) -> Result<()>;

    fn set_env(&mut self, name: &str, value: &str);

    fn env(&self, name: &str) -> Option<String>;

    /// Appends a directory to the interpreter's module search path.
    fn append_module_search_path(&mut self, path: &str) -> Result<()>;
}
