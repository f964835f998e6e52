use std::borrow::Cow;

use thiserror::Error;

mod fs;
mod io;
mod module;
mod value;

pub use fs::{Errno, FileAttr, MountedFs, ENOENT};
pub use io::{ArtifactSink, InMemoryReader, MetadataReader, SnapshotReader, TarReader};
pub use module::{DsoOpts, Module, PlacementOracle, PlacementRequest, RunOutcome};
pub use value::{AccessorStep, ForeignValue, SerializedRef};

pub type Result<T> = std::result::Result<T, WasmError>;

/// Errors raised while talking to the interpreter host or its byte sources.
#[derive(Error, Debug)]
pub enum WasmError {
    #[error("failed to perform an I/O operation: {description}")]
    IoError {
        description: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },
    #[error("read of {requested} bytes at offset {offset} is outside the source (size {size})")]
    ShortRead { offset: u64, requested: usize, size: u64 },
    #[error("the interpreter rejected a module load for '{path}': {reason}")]
    ModuleLoad { path: String, reason: Cow<'static, str> },
    #[error("linear memory access at {offset}..{end} is outside the heap (size {heap_size})")]
    MemoryBounds { offset: u64, end: u64, heap_size: u64 },
    #[error("python exited with status {status}")]
    PythonRun { status: i32, stderr: String },
    #[error("failed to serialize the host object table: {0}")]
    HiwireSerialization(Cow<'static, str>),
    #[error("{0}")]
    Other(Cow<'static, str>),
}

impl WasmError {
    pub fn from_io_error_with_description(
        source: std::io::Error,
        description: impl Fn() -> Cow<'static, str>,
    ) -> WasmError {
        WasmError::IoError {
            description: description(),
            source,
        }
    }
}
