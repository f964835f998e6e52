//! The no-FFI python code run to warm an interpreter before capture.

use std::collections::BTreeSet;
use std::fmt::Write;

/// The fixed import prelude, in order. The `asyncio` import dominates the
/// cost.
pub const IMPORT_PRELUDE: [&str; 17] = [
    "_pyodide.docstring",
    "_pyodide._core_docs",
    "traceback",
    "collections.abc",
    "asyncio",
    "inspect",
    "tarfile",
    "importlib.metadata",
    "re",
    "shutil",
    "sysconfig",
    "importlib.machinery",
    "pathlib",
    "site",
    "tempfile",
    "typing",
    "zipfile",
];

/// What a baseline snapshot warms.
pub fn baseline_snapshot_imports() -> &'static [&'static str] {
    &IMPORT_PRELUDE
}

/// What a package snapshot warms on top of the user's own imports. The list
/// has been identical across api versions so far.
pub fn package_snapshot_imports(_api_version: u32) -> Vec<&'static str> {
    IMPORT_PRELUDE.to_vec()
}

/// The capture prelude: import everything, force the `sysconfig` cache to
/// materialise, then drop the top-level aliases so only imported module
/// state survives into the snapshot, not global names.
pub fn prelude_code() -> String {
    let mut code = String::new();
    for module in IMPORT_PRELUDE {
        writeln!(code, "import {module}").expect("write to string");
    }
    writeln!(code, "sysconfig.get_config_vars()").expect("write to string");
    writeln!(code, "del {}", top_level_aliases(&IMPORT_PRELUDE).join(", ")).expect("write to string");
    code
}

/// Import code for the user's statically analysed top-level imports.
///
/// Package captures are best-effort: a missing optional import must not
/// prevent snapshot creation, so every import is individually guarded and
/// failures are only reported on stderr. Dedicated captures import plainly
/// and fail the capture instead.
pub fn user_import_code(modules: &[String], tolerate_failures: bool) -> String {
    let borrowed: Vec<&str> = modules.iter().map(String::as_str).collect();
    let aliases = top_level_aliases(&borrowed);

    let mut code = String::new();
    if tolerate_failures {
        writeln!(code, "_failed = []").expect("write to string");
        for module in modules {
            writeln!(code, "try:").expect("write to string");
            writeln!(code, "    import {module}").expect("write to string");
            writeln!(code, "except Exception as _exc:").expect("write to string");
            writeln!(code, "    _failed.append('{module}: ' + str(_exc))").expect("write to string");
        }
        writeln!(code, "if _failed:").expect("write to string");
        writeln!(code, "    import sys").expect("write to string");
        writeln!(code, "    print('\\n'.join(_failed), file=sys.stderr)").expect("write to string");
        writeln!(code, "    del sys").expect("write to string");
        if aliases.is_empty() {
            writeln!(code, "del _failed").expect("write to string");
        } else {
            // A failed import leaves its alias unbound, so pop instead of del.
            let quoted: Vec<String> = aliases.iter().map(|alias| format!("'{alias}'")).collect();
            writeln!(code, "for _name in [{}]:", quoted.join(", ")).expect("write to string");
            writeln!(code, "    globals().pop(_name, None)").expect("write to string");
            writeln!(code, "del _failed, _name").expect("write to string");
        }
    } else {
        for module in modules {
            writeln!(code, "import {module}").expect("write to string");
        }
        if !aliases.is_empty() {
            writeln!(code, "del {}", aliases.join(", ")).expect("write to string");
        }
    }
    code
}

/// Filters statically analysed imports: duplicates collapse, and modules the
/// user bundle itself provides are dropped (importing them would pin user
/// code into the snapshot).
pub fn filter_user_imports(modules: &[String], local_modules: &BTreeSet<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    modules
        .iter()
        .filter(|module| {
            let top_level = module.split('.').next().unwrap_or(module);
            !local_modules.contains(top_level)
        })
        .filter(|module| seen.insert((*module).clone()))
        .cloned()
        .collect()
}

/// Top-level module names the user bundle provides, derived from its flat
/// file list.
pub fn local_modules_from_bundle(names: &[String]) -> BTreeSet<String> {
    let mut locals = BTreeSet::new();
    for name in names {
        let name = name.trim_start_matches('/');
        match name.split_once('/') {
            Some((top_level, _)) => {
                locals.insert(top_level.to_owned());
            }
            None => {
                if let Some(stem) = name.strip_suffix(".py") {
                    locals.insert(stem.to_owned());
                }
            }
        }
    }
    locals
}

/// First components of `modules`, deduplicated, in first-seen order.
fn top_level_aliases<'a>(modules: &[&'a str]) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for module in modules {
        let alias = module.split('.').next().unwrap_or(module);
        if seen.insert(alias) {
            out.push(alias);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn prelude_imports_then_warms_sysconfig_then_drops_aliases() {
        let code = prelude_code();
        let lines: Vec<&str> = code.lines().collect();
        assert_eq!(lines[0], "import _pyodide.docstring");
        assert_eq!(lines[4], "import asyncio");
        assert_eq!(lines[IMPORT_PRELUDE.len()], "sysconfig.get_config_vars()");
        assert_eq!(
            lines[IMPORT_PRELUDE.len() + 1],
            "del _pyodide, traceback, collections, asyncio, inspect, tarfile, importlib, re, shutil, \
             sysconfig, pathlib, site, tempfile, typing, zipfile"
        );
    }

    #[test]
    fn strict_user_imports_are_plain() {
        let code = user_import_code(&["numpy".to_owned(), "pandas.io".to_owned()], false);
        assert_eq!(code, "import numpy\nimport pandas.io\ndel numpy, pandas\n");
    }

    #[test]
    fn tolerant_user_imports_guard_each_module() {
        let code = user_import_code(&["numpy".to_owned()], true);
        assert!(code.contains("try:\n    import numpy\nexcept Exception as _exc:"));
        assert!(code.contains("print('\\n'.join(_failed), file=sys.stderr)"));
        assert!(code.contains("globals().pop(_name, None)"));
        assert!(code.ends_with("del _failed, _name\n"));
    }

    #[test]
    fn user_imports_are_deduplicated_and_stripped_of_local_modules() {
        let locals = local_modules_from_bundle(&[
            "worker.py".to_owned(),
            "helpers/util.py".to_owned(),
            "assets/logo.bin".to_owned(),
        ]);
        assert!(locals.contains("worker"));
        assert!(locals.contains("helpers"));
        assert!(locals.contains("assets"));
        assert!(!locals.contains("worker.py"));

        let filtered = filter_user_imports(
            &[
                "numpy".to_owned(),
                "worker".to_owned(),
                "numpy".to_owned(),
                "helpers.util".to_owned(),
                "yaml".to_owned(),
            ],
            &locals,
        );
        assert_eq!(filtered, vec!["numpy".to_owned(), "yaml".to_owned()]);
    }
}
