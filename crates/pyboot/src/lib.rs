mod archive;
pub use archive::{index_archive, DirNode, FileNode, TarIndex, TarNode};
mod config;
pub use config::{Command, Config};
mod context;
pub use context::BootstrapContext;
mod dynlib;
pub use dynlib::{legacy_preload_fragments, sort_so_files, DsoRecord, DsoSources, DynlibLoader};
mod error;
pub use error::{report_fatal, BootError, InternalError, UserError};
mod layout;
pub use layout::PythonVersion;
mod logging;
pub use logging::init_logging;
mod site;
pub use site::{canonical_package_name, InstallDir, SiteMounts, VirtualizedDir};
mod snapshot;
pub use snapshot::{
    decode_bytes, fetch_with_retry, BootstrapMode, HiwireRegistry, PendingUpload, SnapshotConfig, SnapshotEngine,
    SnapshotMeta, SnapshotType,
};
mod vfs;
pub use vfs::{FileStream, FsOps, MetadataFs, ReadonlyFs, TarFs, Whence};

#[cfg(test)]
mod testutil;
