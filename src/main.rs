mod cli;

use crate::cli::{Cli, Command, Favorite};
use burrow_config::Config;
use burrow_service::{FileService, Files, UploadOutcome};
use burrow_storage::StoragePath;
use clap::Parser;
use derive_more::{Display, Error};
use exn::ResultExt;
use serde::Serialize;
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

type Result<T> = std::result::Result<T, exn::Exn<ErrorKind>>;

#[derive(Debug, Display, Error)]
enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("operation failed")]
    Service,
    #[display("invalid argument: {_0}")]
    Invalid(#[error(not(source))] String),
    #[display("local I/O error")]
    Io,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:?}");
            return ExitCode::FAILURE;
        },
    };
    init_logging(&config.log.level);
    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        },
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run(command: Command, config: &Config) -> Result<()> {
    let files = Files::open(config).await.or_raise(|| ErrorKind::Service)?;
    let result = execute(&files, command, config).await;
    files.close().await;
    result
}

async fn execute(files: &Files, command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Ls { path } => print(&files.list(&path).await.or_raise(|| ErrorKind::Service)?),
        Command::Stats { path } => print(&files.stats(&path).await.or_raise(|| ErrorKind::Service)?),
        Command::Search { keyword } => print(&files.search(&keyword).await.or_raise(|| ErrorKind::Service)?),
        Command::History => print(&files.search_history().await.or_raise(|| ErrorKind::Service)?),
        Command::Mkdir { path } => print(&files.create_folder(&path).await.or_raise(|| ErrorKind::Service)?),
        Command::Rm { path, force } => files.delete(&path, force).await.or_raise(|| ErrorKind::Service),
        Command::Rename { path, new_name } => {
            print(&files.rename(&path, &new_name).await.or_raise(|| ErrorKind::Service)?)
        },
        Command::Cp { src, dest } => print(&files.copy(&src, &dest).await.or_raise(|| ErrorKind::Service)?),
        Command::Mv { src, dest } => print(&files.move_to(&src, &dest).await.or_raise(|| ErrorKind::Service)?),
        Command::Get { path, output } => get(files, &path, output).await,
        Command::Put { file, dir, name, chunk_size, overwrite } => {
            print(&put(files, &file, &dir, name, chunk_size, overwrite).await?)
        },
        Command::Progress { dir, name } => {
            print(&files.upload_progress(&dir, &name).await.or_raise(|| ErrorKind::Service)?)
        },
        Command::Abort { dir, name } => files.abort_upload(&dir, &name).await.or_raise(|| ErrorKind::Service),
        Command::Fav(Favorite::Add { path }) => {
            print(&files.add_favorite(&path).await.or_raise(|| ErrorKind::Service)?)
        },
        Command::Fav(Favorite::Rm { path }) => {
            print(&files.remove_favorite(&path).await.or_raise(|| ErrorKind::Service)?)
        },
        Command::Fav(Favorite::Ls) => print(&files.favorites().await.or_raise(|| ErrorKind::Service)?),
        Command::Sweep => {
            let janitor = files.janitor(config.upload.stale_after, config.upload.sweep_interval);
            print(&janitor.run_once().await.or_raise(|| ErrorKind::Service)?)
        },
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).or_raise(|| ErrorKind::Io)?;
    writeln!(stdout).or_raise(|| ErrorKind::Io)
}

async fn get(files: &Files, path: &StoragePath, output: Option<PathBuf>) -> Result<()> {
    let download = files.download(path).await.or_raise(|| ErrorKind::Service)?;
    let mut reader = download.reader;
    let to_file = output.is_some();
    tokio::task::spawn_blocking(move || match output {
        Some(output) => std::io::copy(&mut reader, &mut std::fs::File::create(output)?),
        None => std::io::copy(&mut reader, &mut std::io::stdout().lock()),
    })
    .await
    .or_raise(|| ErrorKind::Io)?
    .or_raise(|| ErrorKind::Io)?;
    // Keep stdout for the file contents themselves.
    match to_file {
        true => print(&download.entry),
        false => Ok(()),
    }
}

/// Number of chunks needed for `len` bytes; an empty file is one empty chunk.
fn chunk_count(len: u64, chunk_size: u64) -> Result<u32> {
    if chunk_size == 0 {
        exn::bail!(ErrorKind::Invalid("chunk size must be at least one byte".to_string()));
    }
    let count = len.div_ceil(chunk_size).max(1);
    u32::try_from(count).or_raise(|| ErrorKind::Invalid(format!("{count} chunks is too many; raise --chunk-size")))
}

async fn put(
    files: &Files,
    local: &Path,
    dir: &StoragePath,
    name: Option<String>,
    chunk_size: u64,
    overwrite: bool,
) -> Result<UploadOutcome> {
    let name = match name.or_else(|| local.file_name().and_then(OsStr::to_str).map(str::to_string)) {
        Some(name) => name,
        None => exn::bail!(ErrorKind::Invalid(format!("cannot derive a file name from {}", local.display()))),
    };
    let mut file = tokio::fs::File::open(local).await.or_raise(|| ErrorKind::Io)?;
    let len = file.metadata().await.or_raise(|| ErrorKind::Io)?.len();
    let total = chunk_count(len, chunk_size)?;
    tracing::info!(file = %local.display(), dest = %dir, name = %name, total, "Uploading");
    for index in 1..total {
        let outcome = files
            .upload_chunk_from(dir, &name, index, total, overwrite, (&mut file).take(chunk_size))
            .await
            .or_raise(|| ErrorKind::Service)?;
        tracing::debug!(?outcome, "Sent chunk");
    }
    files
        .upload_chunk_from(dir, &name, total, total, overwrite, (&mut file).take(chunk_size))
        .await
        .or_raise(|| ErrorKind::Service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_config::{CacheConfig, StorageConfig};
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case(0, 4, 1)]
    #[case(1, 4, 1)]
    #[case(4, 4, 1)]
    #[case(5, 4, 2)]
    #[case(9, 3, 3)]
    fn test_chunk_count(#[case] len: u64, #[case] chunk_size: u64, #[case] expected: u32) {
        assert_eq!(chunk_count(len, chunk_size).unwrap(), expected);
    }

    #[test]
    fn test_chunk_count_limits() {
        assert!(chunk_count(10, 0).is_err());
        assert!(chunk_count(u64::MAX, 1).is_err());
    }

    #[tokio::test]
    async fn test_put_uploads_in_chunks() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            storage: StorageConfig { upload_dir: dir.path().join("upload"), temp_dir: dir.path().join("tmp") },
            cache: CacheConfig { database: PathBuf::from(":memory:"), ..CacheConfig::default() },
            ..Config::default()
        };
        let files = Files::open(&config).await.unwrap();
        let local = dir.path().join("local.txt");
        std::fs::write(&local, b"AAABBBCCC").unwrap();

        let outcome = put(&files, &local, &StoragePath::parse("a/b").unwrap(), None, 3, false).await.unwrap();
        let UploadOutcome::Merged(entry) = outcome else {
            panic!("upload should complete");
        };
        assert_eq!(entry.name, "local.txt");
        assert_eq!(entry.size, 9);
        assert_eq!(std::fs::read(dir.path().join("upload/a/b/local.txt")).unwrap(), b"AAABBBCCC");

        let err = put(&files, &local, &StoragePath::parse("a/b").unwrap(), None, 3, false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Service));
        files.close().await;
    }
}
