//! Relaychat server binary: parses the CLI, loads the static cluster
//! config, and runs one `ServerNode` until Ctrl-C (spec §4.6, §6).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use relaychat::{ClusterConfig, ServerNode};

#[derive(Parser, Debug)]
#[command(about = "Relaychat replicated chat server")]
struct Cli {
    /// This process's server_id, must match an entry in --config.
    #[arg(long)]
    server_id: String,

    /// Path to the cluster TOML shared by every peer.
    #[arg(long, default_value = "cluster.toml")]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level: log::LevelFilter = cli.log_level.parse().unwrap_or(log::LevelFilter::Info);
    relaychat::logger_init(&cli.server_id, level);

    let cluster = match ClusterConfig::from_toml_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{} | fatal: {}", cli.server_id, e);
            std::process::exit(1);
        }
    };

    let node = match ServerNode::bind(&cli.server_id, cluster).await {
        Ok(n) => Arc::new(n),
        Err(e) => {
            log::error!("{} | fatal: {}", cli.server_id, e);
            std::process::exit(1);
        }
    };

    let stop_node = node.clone();
    let runtime_handle = tokio::runtime::Handle::current();
    ctrlc::set_handler(move || {
        let stop_node = stop_node.clone();
        runtime_handle.spawn(async move {
            stop_node.stop().await;
        });
    })
    .expect("failed to install Ctrl-C handler");

    node.run().await;
}
