//! herdd — the herd daemon.
//!
//! Single binary that assembles the herd:
//! - State store (redb) for images, the machine database and settings
//! - Node controllers and the scan loop
//! - JSON-over-TCP transport to subs
//! - Operator REST API
//!
//! `herdd sub` runs the other end: it scans a root, applies updates to it
//! and serves the herd protocol on the sub port.
//!
//! # Usage
//!
//! ```text
//! herdd run --config /etc/herd.toml --data-dir /var/lib/herd --port 6976
//! herdd check-config --config /etc/herd.toml
//! herdd sub --root / --objects-from /srv/objects --port 6969
//! ```

mod daemon;
mod sub;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use herd_core::HerdConfig;

#[derive(Parser)]
#[command(name = "herdd", about = "Herd daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the herd and serve the operator API.
    Run {
        /// Path to herd.toml.
        #[arg(long, default_value = "/etc/herd.toml")]
        config: PathBuf,

        /// Data directory for persistent state and objects.
        #[arg(long, default_value = "/var/lib/herd")]
        data_dir: PathBuf,

        /// Port for the operator API.
        #[arg(long, default_value = "6976")]
        port: u16,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, default_value = "/etc/herd.toml")]
        config: PathBuf,
    },
    /// Serve a root directory as a sub.
    Sub(sub::SubArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,herdd=debug,herd=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
        } => daemon::run(&config, data_dir, port).await,
        Command::CheckConfig { config } => check_config(&config),
        Command::Sub(args) => sub::run(args).await,
    }
}

fn check_config(path: &std::path::Path) -> anyhow::Result<()> {
    let config = daemon::load_config(path)?;
    println!("{}: ok", path.display());
    println!("{}", summarize(&config));
    Ok(())
}

fn summarize(config: &HerdConfig) -> String {
    format!(
        "subs: {}, default image: {}, scan interval: {}s, polls: {}, pushes: {}, fast updates: {}",
        config.subs.len(),
        config.herd.default_image.as_deref().unwrap_or("(none)"),
        config.herd.scan_interval_secs,
        config.limits.max_concurrent_polls,
        config.limits.max_concurrent_pushes,
        config.limits.max_concurrent_fast_updates,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::parse_from(["herdd", "run", "--port", "7000"]);
        match cli.command {
            Command::Run {
                config,
                data_dir,
                port,
            } => {
                assert_eq!(config, PathBuf::from("/etc/herd.toml"));
                assert_eq!(data_dir, PathBuf::from("/var/lib/herd"));
                assert_eq!(port, 7000);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn sub_flags() {
        let cli = Cli::parse_from([
            "herdd",
            "sub",
            "--root",
            "/srv/tree",
            "--objects-from",
            "/srv/objects",
            "--disruption-manager",
            "/usr/sbin/disruption-manager",
            "--disruption-arg",
            "web",
        ]);
        match cli.command {
            Command::Sub(args) => {
                assert_eq!(args.root, PathBuf::from("/srv/tree"));
                assert_eq!(args.port, 6969);
                assert_eq!(args.disruption_args, vec!["web"]);
                assert!(!args.dry_run);
            }
            _ => panic!("expected sub"),
        }
    }

    #[test]
    fn summary_mentions_subs() {
        let config = HerdConfig::parse("[[subs]]\nhostname = \"a\"\n").unwrap();
        assert!(summarize(&config).starts_with("subs: 1, default image: (none)"));
    }
}
