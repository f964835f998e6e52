use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use pyboot::{decode_bytes, index_archive, init_logging, Command, Config};
use pyboot_wasm::InMemoryReader;

fn main() -> anyhow::Result<()> {
    let config = Config::new()?;
    init_logging(Some(config.log_dir()))?;

    match config.command() {
        Command::Inspect { artifact } => inspect(artifact),
        Command::Index { archive } => index(archive),
    }
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path).context("failed to read the artifact")?;
    let (meta, heap) = decode_bytes(&bytes).context("failed to decode the artifact")?;

    println!("format:         {}", if meta.is_legacy() { "legacy (no magic)" } else { "v2" });
    println!("snapshot type:  {}", meta.settings.snapshot_type);
    println!("heap bytes:     {}", heap.len());
    if let Some(imported) = &meta.imported_modules_list {
        println!("user imports:   {}", imported.join(", "));
    }
    if !meta.load_order.is_empty() {
        println!("load order:");
        for library in &meta.load_order {
            println!("  {library}");
        }
    }
    if !meta.so_memory_bases.is_empty() {
        println!("memory bases:");
        for (key, base) in &meta.so_memory_bases {
            println!("  {key} -> {base:#x}");
        }
    }
    if !meta.so_table_bases.is_empty() {
        println!("table bases:");
        for (key, base) in &meta.so_table_bases {
            println!("  {key} -> {base}");
        }
    }
    if !meta.dso_handles.is_empty() {
        println!("outstanding handles:");
        for (path, dso) in &meta.dso_handles {
            println!("  {path}: {:?}", dso.handles);
        }
    }
    Ok(())
}

fn index(path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path).context("failed to read the archive")?;
    let index = index_archive(Rc::new(InMemoryReader::new(bytes))).context("failed to index the archive")?;

    print!("{:?}", index.root);
    if !index.so_files.is_empty() {
        println!("dynamic libraries:");
        for so_file in &index.so_files {
            println!("  {}", so_file.join("/"));
        }
    }
    Ok(())
}
