//! The steady-state file-system layout inside the interpreter.

/// The session home directory.
pub const HOME: &str = "/session";

/// Where the user bundle is mounted.
pub const METADATA_PATH: &str = "/session/metadata";

/// Where the dynamic-library view is mounted.
pub const DYNLIB_PATH: &str = "/usr/lib";

/// Appended to `LD_LIBRARY_PATH` once bootstrap has finished, so vendored
/// native modules in the user bundle resolve.
pub const BUNDLE_LIB_PATH: &str = "/session/metadata/python_modules/lib/";

/// Hash randomisation is disabled: there is no cryptographic RNG available
/// this early in the instance's life.
pub const PYTHON_HASH_SEED: &str = "111";

/// The interpreter's python version, which the session paths embed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

impl PythonVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        PythonVersion { major, minor }
    }

    /// The session site-packages directory backed by the virtualized view.
    pub fn site_packages_path(&self) -> String {
        format!("/session/lib/python{}.{}/site-packages", self.major, self.minor)
    }

    /// The writable copy of the embedded stdlib zip.
    pub fn stdlib_zip_path(&self) -> String {
        format!("/lib/python{}{}.zip", self.major, self.minor)
    }

    /// An empty placeholder the interpreter expects to exist.
    pub fn stdlib_site_packages_path(&self) -> String {
        format!("/lib/python{}.{}/site-packages", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_paths_embed_the_python_version() {
        let python = PythonVersion::new(3, 13);
        assert_eq!(python.site_packages_path(), "/session/lib/python3.13/site-packages");
        assert_eq!(python.stdlib_zip_path(), "/lib/python313.zip");
        assert_eq!(python.stdlib_site_packages_path(), "/lib/python3.13/site-packages");
    }
}
