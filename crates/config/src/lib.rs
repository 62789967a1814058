//! Layered configuration for the `stash` command.
//!
//! Sources are merged in order, later ones winning:
//!
//! 1. built-in defaults,
//! 2. a configuration file (`--config`, or `stash.toml` in the platform's
//!    config directory if it exists); `.yaml`, `.yml` and `.json` files are
//!    read as such, anything else as TOML,
//! 3. `STASH_`-prefixed environment variables, with `__` separating nested
//!    keys (`STASH_STORAGE__BACKEND=s3`, `STASH_CLEANUP__MAX_AGE_DAYS=3`).

pub mod error;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "STASH_";
const FILE_NAME: &str = "stash.toml";
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub cleanup: CleanupConfig,
    pub restore: RestoreConfig,
    pub rebuild: RebuildConfig,
}

/// Where archives are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// A directory on the local filesystem. Must be absolute.
    Local { root: PathBuf },
    /// An S3-compatible bucket.
    S3 {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        #[serde(default = "default_region")]
        region: String,
        /// Custom endpoint for S3-compatible services (MinIO, R2, ...).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        key_id: String,
        key_secret: String,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = directories::ProjectDirs::from("", "", "stash")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("stash"));
        Self::Local { root }
    }
}

impl StorageConfig {
    /// Name the backend is logged under.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::S3 { .. } => "s3",
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes buffered between the archive and storage ends of a transfer.
    pub buffer_size: usize,
    /// Abort a transfer that takes longer than this. Unlimited if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { buffer_size: 64 * 1024, timeout_secs: None }
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Entries untouched for longer than this many days are evicted.
    pub max_age_days: u64,
    /// Only consider entries below this prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<PathBuf>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { max_age_days: 7, prefix: None }
    }
}

impl CleanupConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days.saturating_mul(SECONDS_PER_DAY))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Directory archives are extracted into.
    pub dir: PathBuf,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from(".") }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    /// Directory that rebuild sources are resolved against.
    pub workdir: PathBuf,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self { workdir: PathBuf::from(".") }
    }
}

impl Config {
    /// Load and validate configuration.
    ///
    /// `path` must exist when given; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path
            && !path.is_file()
        {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        let config: Self = Self::figment(path).extract().or_raise(|| ErrorKind::Parse)?;
        config.validate()?;
        tracing::debug!(storage = config.storage.name(), "Configuration loaded");
        Ok(config)
    }

    /// The merged configuration sources, without extracting them.
    pub fn figment(path: Option<&Path>) -> Figment {
        let figment = Figment::from(Serialized::defaults(Self::default()));
        let figment = match path.map(Path::to_path_buf).or_else(default_path) {
            Some(path) => match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            },
            None => figment,
        };
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn validate(&self) -> Result<()> {
        if self.transfer.buffer_size == 0 {
            exn::bail!(ErrorKind::Invalid("transfer.buffer_size must be at least 1".to_string()));
        }
        match &self.storage {
            StorageConfig::Local { root } if !root.is_absolute() => {
                exn::bail!(ErrorKind::Invalid(format!("storage.root must be absolute, got {}", root.display())))
            },
            StorageConfig::S3 { bucket, .. } if bucket.is_empty() => {
                exn::bail!(ErrorKind::Invalid("storage.bucket must not be empty".to_string()))
            },
            _ => Ok(()),
        }
    }
}

fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "stash").map(|dirs| dirs.config_dir().join(FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(matches!(&config.storage, StorageConfig::Local { root } if root.is_absolute()));
        assert_eq!(config.transfer.buffer_size, 64 * 1024);
        assert_eq!(config.transfer.timeout(), None);
        assert_eq!(config.cleanup.max_age(), Duration::from_secs(7 * SECONDS_PER_DAY));
        assert_eq!(config.restore.dir, Path::new("."));
        assert_eq!(config.rebuild.workdir, Path::new("."));
    }

    #[test]
    fn test_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "stash.toml",
                r#"
                [storage]
                backend = "local"
                root = "/srv/cache"

                [transfer]
                timeout_secs = 30

                [cleanup]
                max_age_days = 3
                prefix = "project"
                "#,
            )?;
            let config = Config::load(Some(Path::new("stash.toml"))).unwrap();
            assert_eq!(config.storage, StorageConfig::Local { root: PathBuf::from("/srv/cache") });
            assert_eq!(config.transfer.timeout(), Some(Duration::from_secs(30)));
            assert_eq!(config.transfer.buffer_size, 64 * 1024);
            assert_eq!(config.cleanup.max_age_days, 3);
            assert_eq!(config.cleanup.prefix, Some(PathBuf::from("project")));
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("stash.yaml", "cleanup:\n  max_age_days: 3\n")?;
            jail.set_env("STASH_CLEANUP__MAX_AGE_DAYS", "30");
            jail.set_env("STASH_STORAGE__BACKEND", "s3");
            jail.set_env("STASH_STORAGE__BUCKET", "builds");
            jail.set_env("STASH_STORAGE__KEY_ID", "id");
            jail.set_env("STASH_STORAGE__KEY_SECRET", "secret");
            let config = Config::load(Some(Path::new("stash.yaml"))).unwrap();
            assert_eq!(config.cleanup.max_age_days, 30);
            assert_eq!(
                config.storage,
                StorageConfig::S3 {
                    bucket: "builds".to_string(),
                    prefix: None,
                    region: "us-east-1".to_string(),
                    endpoint: None,
                    key_id: "id".to_string(),
                    key_secret: "secret".to_string(),
                }
            );
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        Jail::expect_with(|_| {
            let err = Config::load(Some(Path::new("absent.toml"))).unwrap_err();
            assert_eq!(*err, ErrorKind::NotFound(PathBuf::from("absent.toml")));
            Ok(())
        });
    }

    #[rstest]
    #[case("[transfer]\nbuffer_size = 0\n", "transfer.buffer_size")]
    #[case("[storage]\nbackend = \"local\"\nroot = \"relative/cache\"\n", "storage.root")]
    #[case("[storage]\nbackend = \"s3\"\nbucket = \"\"\nkey_id = \"a\"\nkey_secret = \"b\"\n", "storage.bucket")]
    fn test_invalid(#[case] contents: &str, #[case] field: &str) {
        Jail::expect_with(|jail| {
            jail.create_file("stash.toml", contents)?;
            let err = Config::load(Some(Path::new("stash.toml"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(message) if message.contains(field)));
            Ok(())
        });
    }

    #[test]
    fn test_unparseable() {
        Jail::expect_with(|jail| {
            jail.create_file("stash.toml", "[storage]\nbackend = \"ftp\"\n")?;
            let err = Config::load(Some(Path::new("stash.toml"))).unwrap_err();
            assert_eq!(*err, ErrorKind::Parse);
            Ok(())
        });
    }
}
