use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stash")]
#[command(author, version, about = "Persist, restore and evict build caches")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (defaults to stash.toml in the user config directory)
    #[arg(short, long, env = "STASH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Archive paths and store them under a cache key
    Rebuild(RebuildArgs),

    /// Extract a cached archive, trying a fallback key on failure
    ///
    /// Always exits successfully: a cold cache must not fail the build.
    Restore(RestoreArgs),

    /// Delete cache entries that have not been modified recently
    Cleanup(CleanupArgs),
}

#[derive(Args)]
pub struct RebuildArgs {
    /// Cache key; its suffix selects the archive format (.tar, .tar.gz, ...)
    pub key: PathBuf,

    /// Paths to archive, relative to the working directory
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,

    /// Resolve sources against this directory
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Cache key to restore
    pub key: PathBuf,

    /// Key to restore when KEY is missing or unreadable
    #[arg(short, long)]
    pub fallback: Option<PathBuf>,

    /// Extract into this directory
    #[arg(short, long)]
    pub dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct CleanupArgs {
    /// Only consider entries below this prefix
    #[arg(short, long)]
    pub prefix: Option<PathBuf>,

    /// Evict entries untouched for longer than this many days
    #[arg(long)]
    pub max_age_days: Option<u64>,
}

impl Cli {
    /// Default log filter for the requested verbosity.
    pub fn filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_rebuild() {
        let cli = Cli::try_parse_from(["stash", "-vv", "rebuild", "proj/main.tar.gz", "target", "node_modules"]).unwrap();
        assert_eq!(cli.filter(), "debug");
        let Command::Rebuild(args) = cli.command else {
            panic!("expected rebuild");
        };
        assert_eq!(args.key, PathBuf::from("proj/main.tar.gz"));
        assert_eq!(args.sources, vec![PathBuf::from("target"), PathBuf::from("node_modules")]);
    }

    #[test]
    fn test_rebuild_needs_sources() {
        assert!(Cli::try_parse_from(["stash", "rebuild", "proj/main.tar"]).is_err());
    }

    #[test]
    fn test_parse_restore() {
        let cli = Cli::try_parse_from(["stash", "restore", "proj/feature.tar", "--fallback", "proj/main.tar"]).unwrap();
        let Command::Restore(args) = cli.command else {
            panic!("expected restore");
        };
        assert_eq!(args.fallback, Some(PathBuf::from("proj/main.tar")));
        assert_eq!(args.dir, None);
    }

    #[rstest]
    #[case(&["stash", "cleanup"], 0, "warn")]
    #[case(&["stash", "cleanup", "-v"], 1, "info")]
    #[case(&["stash", "-vvvv", "cleanup"], 4, "trace")]
    fn test_verbosity(#[case] argv: &[&str], #[case] count: u8, #[case] filter: &str) {
        let cli = Cli::try_parse_from(argv).unwrap();
        assert_eq!(cli.verbose, count);
        assert_eq!(cli.filter(), filter);
    }
}
