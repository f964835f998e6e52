use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use dirs::home_dir;

#[derive(Parser)]
#[command(version, about)]
struct Arg {
    #[arg(short = 'l', long)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone)]
pub enum Command {
    /// Decode a snapshot artifact and print its metadata
    Inspect { artifact: PathBuf },
    /// Index a packages archive and print its tree
    Index { archive: PathBuf },
}

pub struct Config {
    log_dir: PathBuf,
    command: Command,
}

impl Config {
    pub fn new() -> anyhow::Result<Self> {
        let Arg { log_dir, command } = Arg::parse();

        let log_dir = log_dir
            .or_else(|| {
                let mut home = home_dir()?;
                home.push(".pyboot");
                Some(home)
            })
            .context("failed to get the log directory")?;

        std::fs::create_dir_all(&log_dir).context("failed to create the log directory")?;

        Ok(Config { log_dir, command })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}
