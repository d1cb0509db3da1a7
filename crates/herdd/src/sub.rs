//! Sub mode: scan a root and serve the herd protocol for it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use herd::DirObjects;
use herd_applier::{ServiceRunner, SystemRunner};
use herd_disruption::{DisruptionConfig, DisruptionTiming, start_coordinator};
use herd_node::{ObjectGetter, SubClient, tcp};
use herd_sub::{LocalSub, SubOptions};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Args)]
pub struct SubArgs {
    /// Root of the tree the herd manages.
    #[arg(long, default_value = "/")]
    pub root: PathBuf,

    /// Object cache and saved triggers. Defaults to `<root>/.subd`.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Directory of objects fetched on the herd's behalf.
    #[arg(long)]
    pub objects_from: PathBuf,

    /// Port the herd dials.
    #[arg(long, default_value = "6969")]
    pub port: u16,

    /// Program asked before disruptive updates. Without one they always
    /// proceed.
    #[arg(long)]
    pub disruption_manager: Option<PathBuf>,

    /// Extra arguments passed to the disruption manager.
    #[arg(long = "disruption-arg")]
    pub disruption_args: Vec<String>,

    /// Log service actions instead of running them.
    #[arg(long)]
    pub dry_run: bool,
}

impl SubArgs {
    fn options(&self) -> SubOptions {
        let mut options = SubOptions::new(&self.root);
        if let Some(state_dir) = &self.state_dir {
            options.state_dir = state_dir.clone();
        }
        options
    }

    fn disruption(&self) -> DisruptionConfig {
        DisruptionConfig {
            manager: self.disruption_manager.clone(),
            manager_args: self.disruption_args.clone(),
        }
    }
}

pub async fn run(args: SubArgs) -> anyhow::Result<()> {
    info!(root = %args.root.display(), "sub starting");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let disruption = start_coordinator(
        args.disruption().policy(),
        DisruptionTiming::default(),
        shutdown_rx.clone(),
    );
    let source: Arc<dyn ObjectGetter> = Arc::new(DirObjects::new(&args.objects_from));
    let runner: Arc<dyn ServiceRunner> = Arc::new(SystemRunner {
        dry_run: args.dry_run,
    });
    let sub = LocalSub::new(args.options(), source, runner, disruption)
        .with_context(|| format!("opening sub at {}", args.root.display()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "serving herd protocol");

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tcp::serve(listener, Arc::new(sub) as Arc<dyn SubClient>, shutdown_rx).await?;
    info!("sub stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_lives_under_the_root_unless_given() {
        let args = SubArgs {
            root: PathBuf::from("/srv/tree"),
            state_dir: None,
            objects_from: PathBuf::from("/srv/objects"),
            port: 6969,
            disruption_manager: None,
            disruption_args: Vec::new(),
            dry_run: false,
        };
        assert_eq!(args.options().state_dir, PathBuf::from("/srv/tree/.subd"));
        assert!(args.disruption().manager.is_none());

        let args = SubArgs {
            state_dir: Some(PathBuf::from("/var/lib/subd")),
            ..args
        };
        assert_eq!(args.options().state_dir, PathBuf::from("/var/lib/subd"));
    }
}
