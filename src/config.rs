use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    /// In-process store; state is lost on restart.
    Embedded,
    /// Shared redis instance; required when running more than one replica.
    Remote,
}

#[derive(Debug, Parser)]
#[command(
    name = "maildrift",
    author,
    version,
    about = "Replication controller for mail server clusters"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to (events, probes, metrics).
    #[arg(long, env = "MAILDRIFT_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Storage backend for the pending set and replication state.
    #[arg(long, env = "MAILDRIFT_STORE_MODE", value_enum, default_value_t = StoreMode::Embedded)]
    pub store_mode: StoreMode,

    /// Redis connection URI, used in remote store mode.
    #[arg(
        long,
        env = "MAILDRIFT_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    /// Key namespace prefix; lets several deployments share one backend.
    #[arg(long, env = "MAILDRIFT_NAMESPACE", default_value = "maildrift")]
    pub namespace: String,

    /// Number of concurrent sync workers.
    #[arg(long, env = "MAILDRIFT_NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Base URL of the primary's doveadm HTTP API.
    #[arg(
        long,
        env = "MAILDRIFT_DOVEADM_URL",
        default_value = "http://127.0.0.1:8081"
    )]
    pub doveadm_url: String,

    /// Password for the doveadm HTTP API.
    #[arg(long, env = "MAILDRIFT_DOVEADM_PASSWORD", default_value = "")]
    pub doveadm_password: String,

    /// dsync destination passed on every sync call.
    #[arg(long, env = "MAILDRIFT_DESTINATION", default_value = "imap")]
    pub destination: String,

    /// Days before stored cursors and last-sync timestamps expire.
    #[arg(long, env = "MAILDRIFT_CURSOR_TTL_DAYS", default_value_t = 30)]
    pub cursor_ttl_days: u64,

    /// Enable the background reconciliation sweep.
    #[arg(
        long,
        env = "MAILDRIFT_RECONCILER_ENABLED",
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    pub reconciler_enabled: bool,

    /// Seconds between reconciliation passes.
    #[arg(
        long,
        env = "MAILDRIFT_RECONCILER_INTERVAL_SECS",
        default_value_t = 3600
    )]
    pub reconciler_interval_secs: u64,

    /// Maximum age of a user's last sync before the reconciler requeues them.
    #[arg(
        long,
        env = "MAILDRIFT_RECONCILER_THRESHOLD_SECS",
        default_value_t = 86_400
    )]
    pub reconciler_threshold_secs: u64,

    /// Grace period for draining workers during shutdown.
    #[arg(long, env = "MAILDRIFT_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub store_mode: StoreMode,
    pub redis_url: String,
    pub namespace: String,
    pub num_workers: usize,
    pub doveadm_url: String,
    pub doveadm_password: String,
    pub destination: String,
    pub cursor_ttl: Duration,
    pub reconciler_enabled: bool,
    pub reconciler_interval: Duration,
    pub reconciler_threshold: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        anyhow::ensure!(cli.num_workers > 0, "num-workers must be positive");
        anyhow::ensure!(cli.cursor_ttl_days > 0, "cursor-ttl-days must be positive");
        anyhow::ensure!(
            cli.reconciler_interval_secs > 0,
            "reconciler-interval-secs must be positive"
        );
        anyhow::ensure!(
            cli.reconciler_threshold_secs > 0,
            "reconciler-threshold-secs must be positive"
        );
        anyhow::ensure!(
            !cli.doveadm_password.is_empty(),
            "doveadm password is required (set MAILDRIFT_DOVEADM_PASSWORD)"
        );

        Ok(ServerConfig {
            listen_addr,
            store_mode: cli.store_mode,
            redis_url: cli.redis_url,
            namespace: cli.namespace,
            num_workers: cli.num_workers,
            doveadm_url: cli.doveadm_url,
            doveadm_password: cli.doveadm_password,
            destination: cli.destination,
            cursor_ttl: Duration::from_secs(cli.cursor_ttl_days * 24 * 60 * 60),
            reconciler_enabled: cli.reconciler_enabled,
            reconciler_interval: Duration::from_secs(cli.reconciler_interval_secs),
            reconciler_threshold: Duration::from_secs(cli.reconciler_threshold_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
