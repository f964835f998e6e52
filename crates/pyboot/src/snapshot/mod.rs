//! Capture and restore of interpreter memory snapshots.
//!
//! A capture warms the interpreter (dynlib preload, import prelude, the
//! worker's own imports), then freezes the linear memory together with the
//! metadata needed to rebuild the identical address layout. A restore
//! replays that layout, copies the heap back and rehydrates host-object
//! references, skipping the bulk of interpreter startup.

mod artifact;
mod hiwire;
mod meta;
mod prelude;
mod upload;

use std::collections::BTreeMap;
use std::time::Duration;

pub use artifact::{
    decode_bytes, encode, read_header, read_meta, stream_heap, ArtifactHeader, FORMAT_VERSION, HEADER_SIZE, MAGIC,
};
pub use hiwire::{describe_value, HiwireRegistry};
pub use meta::{decode_meta, DsoHandles, SnapshotMeta, SnapshotSettings, SnapshotType, META_VERSION};
pub use prelude::{
    baseline_snapshot_imports, filter_user_imports, local_modules_from_bundle, package_snapshot_imports,
    prelude_code, user_import_code, IMPORT_PRELUDE,
};
pub use upload::PendingUpload;

use pyboot_wasm::{Module, SnapshotReader, WasmError};

use crate::context::BootstrapContext;
use crate::dynlib::{legacy_preload_fragments, sort_so_files, DynlibLoader};
use crate::error::{InternalError, Result, UserError};
use crate::layout::{BUNDLE_LIB_PATH, METADATA_PATH};

/// The compat version whose artifacts predate recorded load order; restores
/// and captures in this mode reproduce its fixed preload ordering.
pub const LEGACY_PRELOAD_COMPAT: &str = "0.26.0a2";

const MEMORY_SNAPSHOT_DEP: &str = "memory-snapshot";

/// How this interpreter instance boots, selected from host configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    /// No snapshot available: full init, no capture.
    ColdStart,
    /// Full init, fixed prelude only, capture.
    CreateBaseline,
    /// Full init, prelude plus the worker's analysed imports, capture.
    CreatePackage,
    /// Like package, but captured after the user's top-level code ran.
    CreateDedicated,
    /// Boot from an existing artifact.
    Restore,
}

impl BootstrapMode {
    pub fn snapshot_type(&self) -> Option<SnapshotType> {
        match self {
            BootstrapMode::CreateBaseline => Some(SnapshotType::Baseline),
            BootstrapMode::CreatePackage => Some(SnapshotType::Package),
            BootstrapMode::CreateDedicated => Some(SnapshotType::Dedicated),
            BootstrapMode::ColdStart | BootstrapMode::Restore => None,
        }
    }
}

/// Snapshot-related host configuration for one interpreter.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub mode: BootstrapMode,
    pub dedicated_snapshots_enabled: bool,
    /// The host's second validation phase only ever accepts dedicated
    /// snapshots.
    pub validation_phase: bool,
    pub compat_flags: BTreeMap<String, bool>,
    pub compat_version: Option<String>,
    pub api_version: u32,
}

impl SnapshotConfig {
    pub fn new(mode: BootstrapMode) -> Self {
        SnapshotConfig {
            mode,
            dedicated_snapshots_enabled: mode == BootstrapMode::CreateDedicated,
            validation_phase: false,
            compat_flags: BTreeMap::new(),
            compat_version: None,
            api_version: 1,
        }
    }

    pub fn legacy_preload_order(&self) -> bool {
        self.compat_version.as_deref() == Some(LEGACY_PRELOAD_COMPAT)
    }
}

/// Drives bootstrap of one interpreter instance.
pub struct SnapshotEngine<'ctx> {
    ctx: &'ctx mut BootstrapContext,
}

impl<'ctx> SnapshotEngine<'ctx> {
    pub fn new(ctx: &'ctx mut BootstrapContext) -> Self {
        SnapshotEngine { ctx }
    }

    /// Warms the interpreter and captures its memory into a [PendingUpload]
    /// parked on the context.
    ///
    /// For dedicated captures the host calls this only after the user's
    /// top-level code has run, so the host-object table is included. If the
    /// host aborts before the artifact reaches its sink, the buffer is
    /// simply dropped and the instance is discarded as poisoned.
    pub fn capture(&mut self, module: &mut dyn Module, analyzed_imports: &[String]) -> Result<()> {
        let snapshot_type = self
            .ctx
            .config
            .mode
            .snapshot_type()
            .ok_or(InternalError::Unreachable("capture requested in a non-capturing mode"))?;

        self.preload_dynlibs_for_capture(module, snapshot_type)?;
        self.run_prelude(module)?;
        let imported = self.import_user_modules(module, analyzed_imports, snapshot_type)?;

        let hiwire = if snapshot_type == SnapshotType::Dedicated {
            let registry = HiwireRegistry::default();
            let mut serializer = registry.serializer();
            module
                .serialize_hiwire_state(&mut serializer)
                .map_err(hiwire::serialization_user_error)?
        } else {
            None
        };

        let meta = SnapshotMeta::from_record(
            &self.ctx.dso_record,
            imported.clone(),
            hiwire,
            SnapshotSettings {
                snapshot_type,
                compat_flags: self.ctx.config.compat_flags.clone(),
            },
        );
        let heap = module.heap_snapshot();
        let bytes = artifact::encode(&meta, &heap)?;
        tracing::info!(
            "captured a {snapshot_type} snapshot: {} bytes of heap, {} libraries",
            heap.len(),
            meta.load_order.len()
        );
        self.ctx.created_snapshot = Some(PendingUpload::new(bytes, snapshot_type, imported));
        Ok(())
    }

    /// Boots from an artifact: replays library placement, maps the heap and
    /// rehydrates host state.
    pub fn restore(&mut self, module: &mut dyn Module, mut reader: Box<dyn SnapshotReader>) -> Result<()> {
        let header = artifact::read_header(reader.as_ref())?;
        let meta = artifact::read_meta(reader.as_ref(), &header)?;
        self.check_snapshot_type(&meta)?;

        module.set_skip_main();
        module.add_run_dependency(MEMORY_SNAPSHOT_DEP);

        self.ctx.dso_record = meta.dso_record();
        module.grow_memory(header.heap_len(reader.total_size()))?;

        let order = if meta.load_order.is_empty() {
            // Artifacts that predate recorded load order used a fixed one.
            let baseline = meta.settings.snapshot_type == SnapshotType::Baseline;
            let sources = self.ctx.sources();
            legacy_preload_fragments(&self.ctx.so_preload, baseline)
                .iter()
                .map(|fragment| sources.absolutize(fragment))
                .collect::<Result<Vec<_>>>()?
        } else {
            meta.load_order.clone()
        };

        // Keep one initializer's table slot where capture left it.
        let reserved_slot = module.empty_table_slot();
        let mut loader = DynlibLoader::new(self.ctx.sources(), std::mem::take(&mut self.ctx.dso_record));
        loader.preload(module, &order)?;
        self.ctx.dso_record = loader.into_record();
        module.push_free_table_index(reserved_slot);

        self.log_unreplayed_bases();

        artifact::stream_heap(reader.as_ref(), &header, |offset, chunk| module.write_heap(offset, chunk))?;
        reader.dispose();
        module.remove_run_dependency(MEMORY_SNAPSHOT_DEP);

        // Mounted contents may differ from capture time.
        module.invalidate_import_caches()?;

        let registry = HiwireRegistry::default();
        let mut unknown: Option<String> = None;
        let finalized = module.finalize_bootstrap(meta.hiwire.as_ref(), &mut |reference| {
            if registry.recognises(reference) {
                Ok(())
            } else {
                unknown = Some(reference.to_string());
                Err(WasmError::Other("unrecognised host-object reference".into()))
            }
        });
        if let Some(reference) = unknown {
            return Err(InternalError::UnknownSerializedRef(reference).into());
        }
        finalized?;

        self.configure_user_paths(module)?;
        tracing::info!(
            "restored a {} snapshot: {} libraries replayed",
            meta.settings.snapshot_type,
            order.len()
        );
        self.ctx.loaded_snapshot = Some(meta);
        Ok(())
    }

    /// Appends the user-bundle paths to the interpreter's module search path
    /// and library path. Runs after `finalize_bootstrap` on restores; cold
    /// boots call it once the runtime is initialised.
    pub fn configure_user_paths(&mut self, module: &mut dyn Module) -> Result<()> {
        let library_path = match module.env("LD_LIBRARY_PATH") {
            Some(existing) if !existing.is_empty() => format!("{existing}:{BUNDLE_LIB_PATH}"),
            _ => BUNDLE_LIB_PATH.to_owned(),
        };
        module.set_env("LD_LIBRARY_PATH", &library_path);

        if self.ctx.metadata_fs.is_some() {
            module.append_module_search_path(METADATA_PATH)?;
        }
        module.append_module_search_path(&self.ctx.python.site_packages_path())?;
        Ok(())
    }

    /// Preloads every library of the composed view that is not already
    /// placed, in the deterministic capture order.
    fn preload_dynlibs_for_capture(&mut self, module: &mut dyn Module, snapshot_type: SnapshotType) -> Result<()> {
        let baseline_related = snapshot_type == SnapshotType::Baseline
            || self
                .ctx
                .loaded_snapshot
                .as_ref()
                .is_some_and(|meta| meta.settings.snapshot_type == SnapshotType::Baseline);

        let fragments = if self.ctx.config.legacy_preload_order() {
            legacy_preload_fragments(&self.ctx.so_preload, baseline_related)
        } else {
            let mut fragments = self.ctx.so_preload.clone();
            sort_so_files(&mut fragments);
            fragments
        };

        let sources = self.ctx.sources();
        let mut paths = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            let path = sources.absolutize(fragment)?;
            // Libraries a restored baseline already placed stay put.
            if !self.ctx.dso_record.load_order.contains(&path) {
                paths.push(path);
            }
        }

        let mut loader = DynlibLoader::new(sources, std::mem::take(&mut self.ctx.dso_record));
        loader.preload(module, &paths)?;
        self.ctx.dso_record = loader.into_record();
        Ok(())
    }

    fn run_prelude(&mut self, module: &mut dyn Module) -> Result<()> {
        let outcome = module.raw_run(&prelude::prelude_code())?;
        if !outcome.succeeded() {
            return Err(WasmError::PythonRun {
                status: outcome.status,
                stderr: outcome.stderr,
            }
            .into());
        }
        Ok(())
    }

    /// Imports the worker's statically analysed top-level modules.
    ///
    /// Baseline snapshots never include user-derived imports. Package
    /// captures tolerate import failures; dedicated captures must not, as
    /// they would freeze an incomplete interpreter state.
    fn import_user_modules(
        &mut self,
        module: &mut dyn Module,
        analyzed_imports: &[String],
        snapshot_type: SnapshotType,
    ) -> Result<Option<Vec<String>>> {
        if snapshot_type == SnapshotType::Baseline {
            return Ok(None);
        }

        let local_modules = self
            .ctx
            .metadata_reader
            .as_ref()
            .map(|reader| prelude::local_modules_from_bundle(reader.names()))
            .unwrap_or_default();
        let imports = prelude::filter_user_imports(analyzed_imports, &local_modules);
        if imports.is_empty() {
            return Ok(Some(imports));
        }

        let tolerate_failures = snapshot_type == SnapshotType::Package;
        let outcome = module.raw_run(&prelude::user_import_code(&imports, tolerate_failures))?;
        if !outcome.succeeded() {
            if !tolerate_failures {
                return Err(UserError::UserImportFailed {
                    stderr: outcome.stderr,
                }
                .into());
            }
            tracing::warn!("user imports failed during a package capture; continuing without them");
            for line in outcome.stderr.lines() {
                tracing::warn!("  {line}");
            }
        } else if !outcome.stderr.is_empty() {
            for line in outcome.stderr.lines() {
                tracing::warn!("optional import skipped: {line}");
            }
        }
        Ok(Some(imports))
    }

    fn check_snapshot_type(&self, meta: &SnapshotMeta) -> Result<()> {
        let found = meta.settings.snapshot_type;
        if self.ctx.config.validation_phase && found != SnapshotType::Dedicated {
            return Err(InternalError::SnapshotTypeMismatch {
                found,
                requirement: "the validation phase requires a dedicated snapshot",
            }
            .into());
        }
        match (found == SnapshotType::Dedicated, self.ctx.config.dedicated_snapshots_enabled) {
            (true, false) => Err(InternalError::SnapshotTypeMismatch {
                found,
                requirement: "the dedicated-snapshot flag is off",
            }
            .into()),
            (false, true) => Err(InternalError::SnapshotTypeMismatch {
                found,
                requirement: "the dedicated-snapshot flag is on",
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// A replaced sanity check: base-table keys the preload never touched
    /// are only reported, not failed on.
    fn log_unreplayed_bases(&self) {
        for path in self.ctx.dso_record.memory_bases.keys() {
            let in_order = self
                .ctx
                .dso_record
                .load_order
                .iter()
                .any(|loaded| loaded == path || loaded.ends_with(&format!("/{path}")));
            if !in_order {
                tracing::debug!("snapshot base for `{path}` was never queried during preload");
            }
        }
    }
}

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_secs(5);

/// Runs a download with the fixed retry policy of the local-development
/// path: up to three attempts, five seconds apart.
pub fn fetch_with_retry<T>(what: &str, fetch: impl FnMut() -> anyhow::Result<T>) -> anyhow::Result<T> {
    fetch_with_retry_using(what, fetch, std::thread::sleep)
}

fn fetch_with_retry_using<T>(
    what: &str,
    mut fetch: impl FnMut() -> anyhow::Result<T>,
    mut sleep: impl FnMut(Duration),
) -> anyhow::Result<T> {
    let mut attempt = 1;
    loop {
        match fetch() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < FETCH_ATTEMPTS => {
                tracing::warn!("fetching {what} failed (attempt {attempt}/{FETCH_ATTEMPTS}): {e:#}");
                sleep(FETCH_BACKOFF);
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("fetching {what} failed after {FETCH_ATTEMPTS} attempts"))),
        }
    }
}
