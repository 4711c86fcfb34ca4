//! Command-line interface definition.

use burrow_storage::StoragePath;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default size of each uploaded chunk: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

fn storage_path(value: &str) -> Result<StoragePath, String> {
    StoragePath::parse(value).map_err(|e| (*e).to_string())
}

#[derive(Debug, Parser)]
#[command(name = "burrow", version, about = "File store with chunked uploads and a cached metadata layer")]
pub struct Cli {
    /// Configuration file (toml, yaml or json), layered over the defaults.
    #[arg(long, short, global = true, env = "BURROW_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the direct children of a directory
    Ls {
        #[arg(default_value = "/", value_parser = storage_path)]
        path: StoragePath,
    },
    /// Count files, folders and bytes beneath a path
    Stats {
        #[arg(default_value = "/", value_parser = storage_path)]
        path: StoragePath,
    },
    /// Find entries whose name contains a keyword (case-insensitive)
    Search { keyword: String },
    /// Show recent search keywords
    History,
    /// Create a directory (and any missing parents)
    Mkdir {
        #[arg(value_parser = storage_path)]
        path: StoragePath,
    },
    /// Delete a file or directory
    Rm {
        #[arg(value_parser = storage_path)]
        path: StoragePath,
        /// Delete directories even if they are not empty
        #[arg(long, short)]
        force: bool,
    },
    /// Rename an entry within its directory
    Rename {
        #[arg(value_parser = storage_path)]
        path: StoragePath,
        new_name: String,
    },
    /// Copy a file or directory
    Cp {
        #[arg(value_parser = storage_path)]
        src: StoragePath,
        #[arg(value_parser = storage_path)]
        dest: StoragePath,
    },
    /// Move a file or directory
    Mv {
        #[arg(value_parser = storage_path)]
        src: StoragePath,
        #[arg(value_parser = storage_path)]
        dest: StoragePath,
    },
    /// Download a file to stdout, or to a local file
    Get {
        #[arg(value_parser = storage_path)]
        path: StoragePath,
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Upload a local file in chunks
    Put {
        file: PathBuf,
        /// Directory to upload into
        #[arg(long, short, default_value = "/", value_parser = storage_path)]
        dir: StoragePath,
        /// Name to store the file under (defaults to the local file name)
        #[arg(long, short)]
        name: Option<String>,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_name = "BYTES")]
        chunk_size: u64,
        /// Replace an existing file
        #[arg(long)]
        overwrite: bool,
    },
    /// Show the progress of an upload
    Progress {
        #[arg(value_parser = storage_path)]
        dir: StoragePath,
        name: String,
    },
    /// Abandon an upload, discarding the chunks received so far
    Abort {
        #[arg(value_parser = storage_path)]
        dir: StoragePath,
        name: String,
    },
    /// Manage favorites
    #[command(subcommand)]
    Fav(Favorite),
    /// Remove abandoned uploads and expired cache entries once
    Sweep,
}

#[derive(Debug, Subcommand)]
pub enum Favorite {
    /// Bookmark a path
    Add {
        #[arg(value_parser = storage_path)]
        path: StoragePath,
    },
    /// Remove a bookmark
    Rm {
        #[arg(value_parser = storage_path)]
        path: StoragePath,
    },
    /// List bookmarks, newest first
    Ls,
}
