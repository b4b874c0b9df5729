use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use amar::AmarError;
use clap::{ArgAction, Parser, Subcommand};
use env_logger::Env;
use serde::Deserialize;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "amarchiver")]
#[command(about = "Create, list and extract amanda archives")]
#[command(author, version, long_about = None)]
pub struct Cli {
    /// Archive to read or write, stdin/stdout when absent or "-"
    #[arg(short, long, value_name = "FILE", global = true)]
    pub file: Option<PathBuf>,

    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// More output, repeat for more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Archive the given files
    Create {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List the files in an archive
    List,

    /// Extract every attribute to <filename>.<attrid>
    Extract {
        /// Directory to extract into
        #[arg(short = 'C', long, value_name = "DIR", default_value = ".")]
        directory: PathBuf,

        /// Only extract these files
        names: Vec<String>,
    },
}

impl Cli {
    /// The archive path, `None` for stdin/stdout.
    pub fn archive(&self) -> Option<&Path> {
        self.file.as_deref().filter(|p| *p != Path::new("-"))
    }
}

// Configuration
#[derive(Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Write a header record before every file as a seek anchor
    pub anchors: bool,

    /// Reassembly minimum for extract, 0 streams every record through
    pub fragment_size: usize,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Config, CliError> {
        let Some(path) = path else {
            return Ok(Config::default());
        };

        let text = fs::read_to_string(path).map_err(|source| CliError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| CliError::Config {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Archive(#[from] AmarError),
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error("{}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("invalid config {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("extraction stopped: {0}")]
    Stopped(io::Error),
}

/// Warn by default, each `-v` raises the level. `RUST_LOG` wins.
pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();
}
