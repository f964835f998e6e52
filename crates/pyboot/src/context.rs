//! Per-interpreter bootstrap state.
//!
//! Everything the original runtime kept in module-scope globals lives in one
//! [BootstrapContext], constructed when the interpreter is created and
//! threaded through each component. It is frozen before the interpreter
//! starts executing anything user-visible; after bootstrap it is effectively
//! immutable.

use std::collections::BTreeSet;
use std::rc::Rc;

use pyboot_wasm::{MetadataReader, Module, MountedFs};

use crate::dynlib::{DsoRecord, DsoSources};
use crate::error::Result;
use crate::layout::{self, PythonVersion};
use crate::site::{canonical_package_name, VirtualizedDir};
use crate::snapshot::{PendingUpload, SnapshotConfig, SnapshotMeta};
use crate::vfs::{MetaFsOps, MetadataFs, ReadonlyFs, TarFs};

pub struct BootstrapContext {
    pub(crate) config: SnapshotConfig,
    pub(crate) python: PythonVersion,
    pub(crate) site: Rc<ReadonlyFs<TarFs>>,
    pub(crate) dynlib: Rc<ReadonlyFs<TarFs>>,
    pub(crate) metadata_fs: Option<Rc<MetadataFs>>,
    pub(crate) metadata_reader: Option<Rc<dyn MetadataReader>>,
    pub(crate) so_preload: Vec<Vec<String>>,
    pub(crate) loaded_requirements: BTreeSet<String>,
    pub(crate) dso_record: DsoRecord,
    pub(crate) loaded_snapshot: Option<SnapshotMeta>,
    pub(crate) created_snapshot: Option<PendingUpload>,
}

impl BootstrapContext {
    /// Freezes the composed package view and the user bundle into the state
    /// one interpreter will boot from.
    pub fn new(
        config: SnapshotConfig,
        python: PythonVersion,
        vdir: VirtualizedDir,
        metadata_reader: Option<Rc<dyn MetadataReader>>,
    ) -> Self {
        let mounts = vdir.into_mounts();
        let metadata_fs = metadata_reader
            .as_ref()
            .map(|reader| Rc::new(ReadonlyFs::new(MetaFsOps::new(Rc::clone(reader)), true)));
        BootstrapContext {
            config,
            python,
            site: mounts.site,
            dynlib: mounts.dynlib,
            metadata_fs,
            metadata_reader,
            so_preload: mounts.so_preload,
            loaded_requirements: mounts.loaded_requirements,
            dso_record: DsoRecord::default(),
            loaded_snapshot: None,
            created_snapshot: None,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn python(&self) -> PythonVersion {
        self.python
    }

    pub fn has_requirement_loaded(&self, name: &str) -> bool {
        self.loaded_requirements.contains(&canonical_package_name(name))
    }

    pub fn dso_record(&self) -> &DsoRecord {
        &self.dso_record
    }

    pub fn loaded_snapshot(&self) -> Option<&SnapshotMeta> {
        self.loaded_snapshot.as_ref()
    }

    pub fn created_snapshot(&self) -> Option<&PendingUpload> {
        self.created_snapshot.as_ref()
    }

    pub fn created_snapshot_mut(&mut self) -> Option<&mut PendingUpload> {
        self.created_snapshot.as_mut()
    }

    /// Sets up the interpreter's file-system view and environment. Must run
    /// before the interpreter's `main`.
    pub fn mount_filesystems(&self, module: &mut dyn Module, stdlib_zip: &[u8]) -> Result<()> {
        module.set_env("HOME", layout::HOME);
        module.set_env("PYTHONHASHSEED", layout::PYTHON_HASH_SEED);

        // The stdlib zip is a writable copy of the embedded asset.
        module.write_file(&self.python.stdlib_zip_path(), stdlib_zip)?;
        module.mkdir(&self.python.stdlib_site_packages_path())?;
        module.mkdir(layout::HOME)?;

        let site_path = self.python.site_packages_path();
        module.mkdir(&site_path)?;
        module.mount(&site_path, Rc::clone(&self.site) as Rc<dyn MountedFs>)?;

        module.mkdir(layout::DYNLIB_PATH)?;
        module.mount(layout::DYNLIB_PATH, Rc::clone(&self.dynlib) as Rc<dyn MountedFs>)?;

        if let Some(metadata) = &self.metadata_fs {
            module.mkdir(layout::METADATA_PATH)?;
            module.mount(layout::METADATA_PATH, Rc::clone(metadata) as Rc<dyn MountedFs>)?;
        }
        Ok(())
    }

    pub(crate) fn sources(&self) -> DsoSources {
        DsoSources {
            site: Rc::clone(&self.site),
            dynlib: Rc::clone(&self.dynlib),
            metadata: self.metadata_fs.clone(),
            site_prefix: self.python.site_packages_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::site::InstallDir;
    use crate::snapshot::{BootstrapMode, SnapshotConfig};
    use crate::testutil::{indexed_tree, FakeBundle, FakeModule};

    fn context() -> BootstrapContext {
        let mut vdir = VirtualizedDir::new();
        let packages = indexed_tree(&["requests/", "requests/__init__.py"]);
        vdir.add_small_bundle(packages.root, packages.so_files, "Requests", InstallDir::Site)
            .unwrap();
        let bundle = FakeBundle::new(&[("worker.py", b"import requests\n")]);
        BootstrapContext::new(
            SnapshotConfig::new(BootstrapMode::ColdStart),
            PythonVersion::new(3, 13),
            vdir,
            Some(Rc::new(bundle)),
        )
    }

    #[test]
    fn mounting_prepares_environment_and_file_systems() {
        let ctx = context();
        let mut module = FakeModule::new();
        ctx.mount_filesystems(&mut module, b"stdlib-zip-bytes").unwrap();

        assert_eq!(module.env.get("HOME").unwrap(), "/session");
        assert_eq!(module.env.get("PYTHONHASHSEED").unwrap(), "111");
        assert_eq!(module.files.get("/lib/python313.zip").unwrap(), b"stdlib-zip-bytes");
        assert!(module.mkdirs.contains(&"/lib/python3.13/site-packages".to_owned()));

        let mounted: Vec<&str> = module.mounts.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(
            mounted,
            vec![
                "/session/lib/python3.13/site-packages",
                "/usr/lib",
                "/session/metadata",
            ]
        );
        // Dynamic-library loads are only allowed from trusted mounts.
        assert!(module.mounts.iter().all(|(_, fs)| fs.trusted()));
        // The composed view is reachable through the mount.
        let (_, site) = &module.mounts[0];
        assert_eq!(site.readdir("/").unwrap(), vec!["requests".to_owned()]);
    }

    #[test]
    fn requirement_lookups_use_canonical_names() {
        let ctx = context();
        assert!(ctx.has_requirement_loaded("requests"));
        assert!(ctx.has_requirement_loaded("REQUESTS"));
        assert!(!ctx.has_requirement_loaded("flask"));
    }
}
