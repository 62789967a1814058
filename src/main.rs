//! `stash`: keep build caches as single archives in local or S3 storage.

mod cli;

use crate::cli::{CleanupArgs, Cli, Command, RebuildArgs, RestoreArgs};
use clap::Parser;
use derive_more::{Display, Error};
use exn::ResultExt;
use stash_cache::{Cache, Transfer};
use stash_config::{Config, StorageConfig};
use stash_storage::BackendHandle;
use stash_storage::backend::LocalBackend;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

type Error = exn::Exn<ErrorKind>;
type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not open {_0} storage")]
    Storage(#[error(not(source))] &'static str),
    #[cfg(not(feature = "s3"))]
    #[display("{_0} storage support is not compiled in")]
    Unsupported(#[error(not(source))] &'static str),
    #[display("cache rebuild failed")]
    Rebuild,
    #[display("cache cleanup failed")]
    Cleanup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.filter()));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "{}", *err);
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let storage = storage(&config.storage).await?;
    let transfer = Transfer::default()
        .with_buffer_size(config.transfer.buffer_size)
        .with_timeout(config.transfer.timeout());
    let cache = Cache::new(storage).with_transfer(transfer);

    match cli.command {
        Command::Rebuild(args) => rebuild(cache, &config, args).await,
        Command::Restore(args) => {
            restore(cache, &config, args).await;
            Ok(())
        },
        Command::Cleanup(args) => cleanup(cache, &config, args).await,
    }
}

async fn storage(config: &StorageConfig) -> Result<BackendHandle> {
    let name = config.name();
    match config {
        StorageConfig::Local { root } => {
            let backend = LocalBackend::new(name, root).or_raise(|| ErrorKind::Storage(name))?;
            Ok(Arc::new(backend))
        },
        #[cfg(feature = "s3")]
        StorageConfig::S3 { bucket, prefix, region, endpoint, key_id, key_secret } => {
            let backend = stash_storage::backend::S3Backend::new(
                name,
                bucket,
                prefix.clone(),
                region,
                endpoint.as_deref(),
                key_id,
                key_secret,
            )
            .await
            .or_raise(|| ErrorKind::Storage(name))?;
            Ok(Arc::new(backend))
        },
        #[cfg(not(feature = "s3"))]
        StorageConfig::S3 { .. } => exn::bail!(ErrorKind::Unsupported(name)),
    }
}

async fn rebuild(cache: Cache, config: &Config, args: RebuildArgs) -> Result<()> {
    let workdir = args.workdir.unwrap_or_else(|| config.rebuild.workdir.clone());
    let cache = cache.with_workdir(workdir);
    cache.rebuild(&args.sources, &args.key).await.or_raise(|| ErrorKind::Rebuild)
}

async fn restore(cache: Cache, config: &Config, args: RestoreArgs) {
    let dir = args.dir.unwrap_or_else(|| config.restore.dir.clone());
    let cache = cache.with_restore_dir(dir);
    let restored = cache.restore(&args.key, args.fallback.as_deref()).await;
    tracing::info!(?restored, "Restore finished");
}

async fn cleanup(cache: Cache, config: &Config, args: CleanupArgs) -> Result<()> {
    let mut policy = config.cleanup.clone();
    if let Some(days) = args.max_age_days {
        policy.max_age_days = days;
    }
    if let Some(prefix) = args.prefix {
        policy.prefix = Some(prefix);
    }
    let deleted = cache.cleanup(policy.prefix.as_deref(), policy.max_age()).await.or_raise(|| ErrorKind::Cleanup)?;
    for entry in &deleted {
        println!("{}", entry.path.display());
    }
    Ok(())
}
