//! Overlay composition of package trees into a single site-packages view.
//!
//! Packages arrive as independent archive trees; [VirtualizedDir] unions
//! them under two roots (site-packages and the dynamic-library directory),
//! refusing collisions instead of silently shadowing files.

use std::collections::BTreeSet;
use std::rc::Rc;

use crate::archive::{DirNode, TarNode};
use crate::error::{InternalError, Result, UserError};
use crate::vfs::{ReadonlyFs, TarFs};

/// Which root a small bundle is mounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallDir {
    Site,
    Dynlib,
}

/// The composed, not-yet-mounted view of everything installed for a worker.
pub struct VirtualizedDir {
    site_packages_root: DirNode,
    dynlib_root: DirNode,
    /// `.so` path fragments (relative to their root) to preload, in install
    /// order.
    so_preload: Vec<Vec<String>>,
    loaded_requirements: BTreeSet<String>,
}

/// The frozen mounts produced by [VirtualizedDir::into_mounts]. Both are
/// trusted: dynamic-library bytes may be read out of them.
pub struct SiteMounts {
    pub site: Rc<ReadonlyFs<TarFs>>,
    pub dynlib: Rc<ReadonlyFs<TarFs>>,
    pub so_preload: Vec<Vec<String>>,
    pub loaded_requirements: BTreeSet<String>,
}

impl Default for VirtualizedDir {
    fn default() -> Self {
        VirtualizedDir::new()
    }
}

impl VirtualizedDir {
    pub fn new() -> Self {
        VirtualizedDir {
            site_packages_root: DirNode::new_root(),
            dynlib_root: DirNode::new_root(),
            so_preload: Vec::new(),
            loaded_requirements: BTreeSet::new(),
        }
    }

    /// Mounts the whole `tree` under the chosen root.
    ///
    /// Directories union with what is already there; any other collision is
    /// a hard [UserError::DuplicateEntry], and the view is left untouched
    /// when one is found.
    pub fn add_small_bundle(
        &mut self,
        tree: TarNode,
        so_paths: Vec<Vec<String>>,
        requirement: &str,
        install_dir: InstallDir,
    ) -> Result<()> {
        let tree = into_dir(tree)?;
        let root = match install_dir {
            InstallDir::Site => &mut self.site_packages_root,
            InstallDir::Dynlib => &mut self.dynlib_root,
        };

        let mut merged = root.clone();
        overlay(&mut merged, tree)?;
        *root = merged;

        self.so_preload.extend(so_paths);
        self.loaded_requirements.insert(canonical_package_name(requirement));
        Ok(())
    }

    /// Installs the selected `requirements` out of a big bundle whose direct
    /// children are canonical package names.
    ///
    /// Each selected subtree is overlaid under site-packages; `.so` paths are
    /// kept only when their first component names a selected package, and
    /// that component is dropped from the recorded fragment.
    pub fn add_big_bundle(
        &mut self,
        tree: TarNode,
        so_paths: Vec<Vec<String>>,
        requirements: &BTreeSet<String>,
    ) -> Result<()> {
        let mut tree = into_dir(tree)?;

        // Bundle children are matched canonically, so `Foo_Bar` in a lock
        // file finds the bundle's `foo-bar` directory and vice versa.
        let mut selected: Vec<(String, String)> = Vec::with_capacity(requirements.len());
        for requested in requirements {
            let wanted = canonical_package_name(requested);
            let child = tree
                .children
                .keys()
                .find(|name| canonical_package_name(name) == wanted)
                .cloned();
            match child {
                Some(child) if matches!(tree.children.get(&child), Some(TarNode::Dir(_))) => {
                    selected.push((child, wanted));
                }
                _ => return Err(UserError::MissingRequirement(requested.clone()).into()),
            }
        }

        let mut merged = self.site_packages_root.clone();
        for (child, _) in &selected {
            let Some(TarNode::Dir(subtree)) = tree.children.shift_remove(child) else {
                return Err(InternalError::Unreachable("big-bundle subtree vanished between check and merge").into());
            };
            overlay(&mut merged, subtree)?;
        }
        self.site_packages_root = merged;

        let wanted: BTreeSet<&str> = selected.iter().map(|(_, name)| name.as_str()).collect();
        for so_path in so_paths {
            if so_path.len() < 2 {
                continue;
            }
            if wanted.contains(canonical_package_name(&so_path[0]).as_str()) {
                self.so_preload.push(so_path[1..].to_vec());
            }
        }
        self.loaded_requirements.extend(selected.into_iter().map(|(_, name)| name));
        Ok(())
    }

    /// Whether `name` is already installed into this view.
    pub fn has_requirement_loaded(&self, name: &str) -> bool {
        self.loaded_requirements.contains(&canonical_package_name(name))
    }

    pub fn site_packages_root(&self) -> &DirNode {
        &self.site_packages_root
    }

    pub fn dynlib_root(&self) -> &DirNode {
        &self.dynlib_root
    }

    pub fn so_preload(&self) -> &[Vec<String>] {
        &self.so_preload
    }

    /// Freezes the composed view into the two mounts the interpreter gets.
    pub fn into_mounts(self) -> SiteMounts {
        SiteMounts {
            site: Rc::new(ReadonlyFs::new(TarFs::new(TarNode::Dir(self.site_packages_root)), true)),
            dynlib: Rc::new(ReadonlyFs::new(TarFs::new(TarNode::Dir(self.dynlib_root)), true)),
            so_preload: self.so_preload,
            loaded_requirements: self.loaded_requirements,
        }
    }
}

/// The canonical form of a package name: lower-cased, with runs of `-`, `_`
/// and `.` collapsed to a single `-`.
pub fn canonical_package_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut previous_was_separator = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !previous_was_separator {
                out.push('-');
            }
            previous_was_separator = true;
        } else {
            out.extend(ch.to_lowercase());
            previous_was_separator = false;
        }
    }
    out
}

fn into_dir(tree: TarNode) -> Result<DirNode> {
    match tree {
        TarNode::Dir(dir) => Ok(dir),
        TarNode::File(_) => Err(InternalError::Unreachable("bundle root is a file").into()),
    }
}

/// Unions `src` into `dst`. Directories merge; a file meeting anything, or
/// anything meeting a file, is a [UserError::DuplicateEntry].
fn overlay(dst: &mut DirNode, src: DirNode) -> Result<()> {
    for (name, src_child) in src.children {
        match dst.children.get_mut(&name) {
            None => {
                dst.children.insert(name, src_child);
            }
            Some(TarNode::Dir(dst_dir)) => match src_child {
                TarNode::Dir(src_dir) => overlay(dst_dir, src_dir)?,
                TarNode::File(src_file) => {
                    return Err(UserError::DuplicateEntry { path: src_file.path }.into());
                }
            },
            Some(existing) => {
                return Err(UserError::DuplicateEntry {
                    path: existing.path().to_owned(),
                }
                .into());
            }
        }
    }
    Ok(())
}
