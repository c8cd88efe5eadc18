//! # CLI Interface
//!
//! Defines the command-line argument structure for `conduit-node` using
//! `clap` derive. Every `run` option can also come from a `CONDUIT_*`
//! environment variable.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use conduit_protocol::config::{self, TransportConfig};

/// Conduit job-event transport node.
///
/// Joins the cluster's gossip overlay, logs every job event it sees and
/// exposes transport metrics for Prometheus.
#[derive(Parser, Debug)]
#[command(
    name = "conduit-node",
    about = "Conduit job-event transport node",
    version,
    propagate_version = true
)]
pub struct ConduitNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the Conduit node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the cluster and relay job events until interrupted.
    Run(RunArgs),
    /// Create (or load) the identity for a port and print the address
    /// other nodes should bootstrap from.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Interface to listen on.
    #[arg(long, env = "CONDUIT_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: IpAddr,

    /// TCP port for the gossip overlay. Also selects which key file is used.
    #[arg(long, short = 'p', env = "CONDUIT_PORT", default_value_t = config::DEFAULT_P2P_PORT)]
    pub port: u16,

    /// Bootstrap peers, each `/ip4/<host>/tcp/<port>/p2p/<peer-id>`.
    ///
    /// Comma separated. Leave empty to start a seed node.
    #[arg(long, env = "CONDUIT_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Directory holding node keys. Defaults to `$HOME/.conduit`.
    #[arg(long, env = "CONDUIT_KEY_DIR")]
    pub key_dir: Option<PathBuf>,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "CONDUIT_METRICS_PORT", default_value_t = config::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "CONDUIT_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl RunArgs {
    /// The transport configuration these arguments describe.
    pub fn transport_config(&self) -> TransportConfig {
        let mut cfg = TransportConfig {
            listen_host: self.listen_host,
            port: self.port,
            ..TransportConfig::default()
        }
        .with_peers(self.peers.iter().cloned());
        if let Some(dir) = &self.key_dir {
            cfg.key_dir = dir.clone();
        }
        cfg
    }
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Port the node will listen on. Each port has its own key.
    #[arg(long, short = 'p', env = "CONDUIT_PORT", default_value_t = config::DEFAULT_P2P_PORT)]
    pub port: u16,

    /// Host to advertise in the printed address.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Directory holding node keys. Defaults to `$HOME/.conduit`.
    #[arg(long, env = "CONDUIT_KEY_DIR")]
    pub key_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        ConduitNodeCli::command().debug_assert();
    }

    #[test]
    fn run_args_build_transport_config() {
        let cli = ConduitNodeCli::parse_from([
            "conduit-node",
            "run",
            "--port",
            "4001",
            "--peers",
            "/ip4/10.0.0.1/tcp/1235/p2p/QmA,/ip4/10.0.0.2/tcp/1235/p2p/QmB",
            "--key-dir",
            "/tmp/keys",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let cfg = args.transport_config();
        assert_eq!(cfg.port, 4001);
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.key_dir, PathBuf::from("/tmp/keys"));
        assert_eq!(cfg.key_ref(), "private_key.4001");
        assert_eq!(cfg.topic, config::JOB_EVENT_TOPIC);
    }

    #[test]
    fn run_defaults_to_a_seed_node() {
        let cli = ConduitNodeCli::parse_from(["conduit-node", "run"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.peers.is_empty());
        assert_eq!(args.metrics_port, config::DEFAULT_METRICS_PORT);
    }
}
