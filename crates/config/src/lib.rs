//! Layered configuration for burrow.
//!
//! Sources are merged in order, later sources overriding earlier ones:
//!
//! 1. Built-in defaults.
//! 2. `config.toml`, `config.yaml` and `config.json` in the platform config
//!    directory (for example `~/.config/burrow/` on Linux), if present.
//! 3. An explicitly requested file (`--config <file>`), which must exist.
//! 4. Environment variables prefixed with `BURROW_`, using `__` to separate
//!    sections: `BURROW_CACHE__LISTING_TTL=30`.
//!
//! Durations are given in whole seconds.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "BURROW_";
const IN_MEMORY_DATABASE: &str = ":memory:";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "burrow")
}

fn default_data_dir() -> PathBuf {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf()).unwrap_or_else(|| PathBuf::from("data"))
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the live file tree.
    pub upload_dir: PathBuf,
    /// Root of the chunk staging area. Must not be inside `upload_dir`.
    pub temp_dir: PathBuf,
}
impl Default for StorageConfig {
    fn default() -> Self {
        let base = default_data_dir();
        Self { upload_dir: base.join("upload"), temp_dir: base.join("tmp") }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// SQLite database file, or `:memory:` for a cache that lives only as long
    /// as the process.
    pub database: PathBuf,
    #[serde(with = "seconds")]
    pub listing_ttl: Duration,
    #[serde(with = "seconds")]
    pub stats_ttl: Duration,
    #[serde(with = "seconds")]
    pub search_ttl: Duration,
    #[serde(with = "seconds")]
    pub favorites_ttl: Duration,
}
impl CacheConfig {
    pub fn in_memory(&self) -> bool {
        self.database.as_os_str() == IN_MEMORY_DATABASE
    }
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database: default_data_dir().join("cache.sqlite3"),
            listing_ttl: Duration::from_secs(300),
            stats_ttl: Duration::from_secs(300),
            search_ttl: Duration::from_secs(60),
            favorites_ttl: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// How long an upload progress record survives without updates.
    #[serde(with = "seconds")]
    pub progress_ttl: Duration,
    /// Upload sessions idle for longer than this are swept.
    #[serde(with = "seconds")]
    pub stale_after: Duration,
    /// How often the janitor runs.
    #[serde(with = "seconds")]
    pub sweep_interval: Duration,
}
impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            progress_ttl: Duration::from_secs(3600),
            stale_after: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default log filter; `RUST_LOG` takes precedence when set.
    pub level: String,
}
impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub upload: UploadConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from every source, using the platform config
    /// directory.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_dir = project_dirs().map(|dirs| dirs.config_dir().to_path_buf());
        Self::load_from(config_dir.as_deref(), explicit)
    }

    /// Load configuration from every source, looking for `config.*` files in
    /// `config_dir`.
    pub fn load_from(config_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(config_dir, explicit)?.extract().or_raise(|| ErrorKind::Load)?;
        let cwd = std::env::current_dir().or_raise(|| ErrorKind::Load)?;
        config.validate(&cwd)
    }

    fn figment(config_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(dir) = config_dir {
            tracing::debug!(dir = %dir.display(), "Looking for configuration files");
            figment = figment
                .merge(Toml::file(dir.join("config.toml")))
                .merge(Yaml::file(dir.join("config.yaml")))
                .merge(Json::file(dir.join("config.json")));
        }
        if let Some(path) = explicit {
            if !path.is_file() {
                exn::bail!(ErrorKind::Invalid(format!("configuration file not found: {}", path.display())));
            }
            let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
            figment = match extension.as_deref() {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::Invalid(format!(
                    "unsupported configuration format (expected toml, yaml or json): {}",
                    path.display()
                ))),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Resolve relative paths against `cwd` and reject unusable settings.
    pub fn validate(mut self, cwd: &Path) -> Result<Self> {
        self.storage.upload_dir = absolutize(cwd, &self.storage.upload_dir);
        self.storage.temp_dir = absolutize(cwd, &self.storage.temp_dir);
        if !self.cache.in_memory() {
            self.cache.database = absolutize(cwd, &self.cache.database);
        }
        if self.storage.temp_dir.starts_with(&self.storage.upload_dir) {
            exn::bail!(ErrorKind::Invalid(format!(
                "temp_dir ({}) must not be inside upload_dir ({})",
                self.storage.temp_dir.display(),
                self.storage.upload_dir.display()
            )));
        }
        // Everything directly under temp_dir is subject to the stale upload sweep.
        if self.storage.upload_dir.starts_with(&self.storage.temp_dir) {
            exn::bail!(ErrorKind::Invalid(format!(
                "upload_dir ({}) must not be inside temp_dir ({})",
                self.storage.upload_dir.display(),
                self.storage.temp_dir.display()
            )));
        }
        if !self.cache.in_memory() && self.cache.database.starts_with(&self.storage.temp_dir) {
            exn::bail!(ErrorKind::Invalid(format!(
                "cache.database ({}) must not be inside temp_dir ({})",
                self.cache.database.display(),
                self.storage.temp_dir.display()
            )));
        }
        let durations = [
            ("cache.listing_ttl", self.cache.listing_ttl),
            ("cache.stats_ttl", self.cache.stats_ttl),
            ("cache.search_ttl", self.cache.search_ttl),
            ("cache.favorites_ttl", self.cache.favorites_ttl),
            ("upload.progress_ttl", self.upload.progress_ttl),
            ("upload.stale_after", self.upload.stale_after),
            ("upload.sweep_interval", self.upload.sweep_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, duration)| duration.is_zero()) {
            exn::bail!(ErrorKind::Invalid(format!("{name} must be at least one second")));
        }
        Ok(self)
    }
}

/// Lexically resolve `path` against `base`; the target doesn't have to exist
/// yet.
fn absolutize(base: &Path, path: &Path) -> PathBuf {
    let joined = match path.is_absolute() {
        true => path.to_path_buf(),
        false => base.join(path),
    };
    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                resolved.pop();
            },
            other => resolved.push(other),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    fn load_in(jail: &Jail, explicit: Option<&str>) -> Result<Config> {
        let explicit = explicit.map(|name| jail.directory().join(name));
        Config::load_from(Some(&jail.directory().join("conf.d")), explicit.as_deref())
    }

    #[test]
    fn test_defaults() {
        Jail::expect_with(|jail| {
            let config = load_in(jail, None).unwrap();
            assert_eq!(config.cache.listing_ttl, Duration::from_secs(300));
            assert_eq!(config.cache.search_ttl, Duration::from_secs(60));
            assert_eq!(config.upload.progress_ttl, Duration::from_secs(3600));
            assert!(config.storage.upload_dir.ends_with("upload"));
            assert!(config.storage.upload_dir.is_absolute());
            assert_eq!(config.log.level, "info");
            Ok(())
        });
    }

    #[test]
    fn test_layering() {
        Jail::expect_with(|jail| {
            std::fs::create_dir(jail.directory().join("conf.d")).unwrap();
            jail.create_file("conf.d/config.toml", "[cache]\nlisting_ttl = 10\nstats_ttl = 20\n")?;
            jail.create_file("explicit.yaml", "cache:\n  stats_ttl: 30\nstorage:\n  upload_dir: files\n")?;
            jail.set_env("BURROW_CACHE__SEARCH_TTL", "5");
            let config = load_in(jail, Some("explicit.yaml")).unwrap();
            // Platform directory file
            assert_eq!(config.cache.listing_ttl, Duration::from_secs(10));
            // Explicit file beats platform directory
            assert_eq!(config.cache.stats_ttl, Duration::from_secs(30));
            // Environment
            assert_eq!(config.cache.search_ttl, Duration::from_secs(5));
            // Relative paths resolve against the working directory
            assert_eq!(config.storage.upload_dir, absolutize(jail.directory(), Path::new("files")));
            Ok(())
        });
    }

    #[test]
    fn test_environment_beats_files() {
        Jail::expect_with(|jail| {
            jail.create_file("burrow.json", r#"{"log": {"level": "debug"}}"#)?;
            jail.set_env("BURROW_LOG__LEVEL", "trace");
            let config = load_in(jail, Some("burrow.json")).unwrap();
            assert_eq!(config.log.level, "trace");
            Ok(())
        });
    }

    #[test]
    fn test_explicit_file_must_exist() {
        Jail::expect_with(|jail| {
            let err = load_in(jail, Some("missing.toml")).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(_)));
            jail.create_file("config.ini", "")?;
            assert!(load_in(jail, Some("config.ini")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_malformed_values_fail_to_load() {
        Jail::expect_with(|jail| {
            jail.set_env("BURROW_CACHE__LISTING_TTL", "soon");
            let err = load_in(jail, None).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Load));
            Ok(())
        });
    }

    #[rstest]
    #[case("/srv/upload", "/srv/upload")]
    #[case("/srv/upload", "/srv/upload/tmp")]
    #[case("/srv/upload", "/srv/upload/../upload/.tmp")]
    fn test_temp_dir_inside_upload_dir(#[case] upload: &str, #[case] temp: &str) {
        let mut config = Config::default();
        config.storage.upload_dir = PathBuf::from(upload);
        config.storage.temp_dir = PathBuf::from(temp);
        let err = config.validate(Path::new("/")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[rstest]
    #[case("/srv/burrow", "/srv/burrow/upload")]
    #[case("/srv/burrow/tmp", "/srv/burrow/tmp/../tmp/files")]
    fn test_upload_dir_inside_temp_dir(#[case] temp: &str, #[case] upload: &str) {
        let mut config = Config::default();
        config.storage.upload_dir = PathBuf::from(upload);
        config.storage.temp_dir = PathBuf::from(temp);
        let err = config.validate(Path::new("/")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(message) if message.starts_with("upload_dir")));
    }

    #[rstest]
    #[case("/srv/tmp/cache.sqlite3")]
    #[case("tmp/db/cache.sqlite3")]
    fn test_database_inside_temp_dir(#[case] database: &str) {
        let mut config = Config::default();
        config.storage.upload_dir = PathBuf::from("/srv/upload");
        config.storage.temp_dir = PathBuf::from("/srv/tmp");
        config.cache.database = PathBuf::from(database);
        let err = config.validate(Path::new("/srv")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(message) if message.starts_with("cache.database")));
    }

    #[test]
    fn test_default_layout_is_valid() {
        let config = Config::default().validate(Path::new("/srv")).unwrap();
        assert!(!config.storage.upload_dir.starts_with(&config.storage.temp_dir));
        assert!(!config.cache.database.starts_with(&config.storage.temp_dir));
    }

    #[test]
    fn test_sibling_directories_are_fine() {
        let mut config = Config::default();
        config.storage.upload_dir = PathBuf::from("data/upload");
        config.storage.temp_dir = PathBuf::from("data/upload-tmp");
        let config = config.validate(Path::new("/srv")).unwrap();
        assert_eq!(config.storage.temp_dir, PathBuf::from("/srv/data/upload-tmp"));
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let mut config = Config::default();
        config.cache.stats_ttl = Duration::ZERO;
        let err = config.validate(Path::new("/")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(message) if message.contains("cache.stats_ttl")));
    }

    #[test]
    fn test_in_memory_database_is_left_alone() {
        let mut config = Config::default();
        config.cache.database = PathBuf::from(":memory:");
        let config = config.validate(Path::new("/srv")).unwrap();
        assert!(config.cache.in_memory());
    }
}
