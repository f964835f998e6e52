use thiserror::Error;

use crate::snapshot::SnapshotType;

/// A bug or corrupted input.
///
/// These are fatal: the interpreter instance is abandoned and the host gets
/// the cause via [report_fatal].
#[derive(Error, Debug)]
pub enum InternalError {
    #[error("invalid tar header: field `{field}` at archive offset {offset} is not octal")]
    InvalidHeader { field: &'static str, offset: u64 },
    #[error("unsupported tar entry type {type_byte:#04x} for `{path}`")]
    UnknownType { type_byte: u8, path: String },
    #[error("tar entry `{path}` has no parent directory in the archive")]
    OrphanEntry { path: String },
    #[error("snapshot artifact does not contain valid metadata: {0}")]
    MalformedMetadata(String),
    #[error("snapshot artifact version {0} is not supported")]
    UnsupportedArtifactVersion(u32),
    #[error("snapshot artifact is truncated: {0}")]
    TruncatedArtifact(String),
    #[error("snapshot type mismatch: the artifact is `{found}` but {requirement}")]
    SnapshotTypeMismatch {
        found: SnapshotType,
        requirement: &'static str,
    },
    #[error("file `{0}` has no content offset")]
    MissingContentOffset(String),
    #[error("dynamic library `{0}` was not found in any mounted tree")]
    DynlibNotFound(String),
    #[error("refusing to load dynamic library `{0}` from an untrusted mount")]
    UntrustedDynlibSource(String),
    #[error("cannot rehydrate unknown host-object reference `{0}`")]
    UnknownSerializedRef(String),
    #[error("unreachable state: {0}")]
    Unreachable(&'static str),
}

/// A problem in the user's code or configuration.
///
/// Messages are user-facing: short problem statement, a descriptor of the
/// offending value where there is one, and the recommended remediation.
#[derive(Error, Debug)]
pub enum UserError {
    #[error("unknown package requirement `{0}`: it is not part of the package bundle")]
    MissingRequirement(String),
    #[error("duplicate entry `{path}`: more than one package installs this file")]
    DuplicateEntry { path: String },
    #[error("{0}")]
    UnserializableGlobal(String),
    #[error("failed to import user modules while capturing a dedicated snapshot:\n{stderr}")]
    UserImportFailed { stderr: String },
}

#[derive(Error, Debug)]
pub enum BootError {
    #[error(transparent)]
    Internal(#[from] InternalError),
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Host(#[from] pyboot_wasm::WasmError),
}

impl BootError {
    /// Whether this error should be surfaced to the user rather than treated
    /// as an internal failure.
    pub fn is_user_error(&self) -> bool {
        matches!(self, BootError::User(_))
    }
}

pub type Result<T, E = BootError> = std::result::Result<T, E>;

/// Logs a fatal error as a one-line cause followed by the error chain, one
/// log line per link. Log collectors tend to collapse newlines, so a single
/// multi-line record would become unreadable.
pub fn report_fatal(err: &dyn std::error::Error) {
    tracing::error!("{err}");
    let mut source = err.source();
    let mut depth = 1;
    while let Some(cause) = source {
        tracing::error!("  {depth}: {cause}");
        source = cause.source();
        depth += 1;
    }
}
