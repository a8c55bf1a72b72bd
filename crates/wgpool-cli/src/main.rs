//! wgpool CLI - per-worker tunnels from a shared key pool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wgpool_cli::config::{ConfigManager, Overrides, Settings};
use wgpool_cli::report::{render_pool_status, render_status, StatusReport};
use wgpool_lib::{
    ConnectionManager, ConnectionRegistry, KeyPool, KeyPoolClient, ManagerConfig,
    PoolClientConfig, ProvisionerConfig, SystemCommandRunner, TunnelProvisioner,
};

/// wgpool - Lease tunnel keys and give each worker its own route out
#[derive(Parser, Debug)]
#[command(name = "wgpool")]
#[command(about = "Per-worker tunnels backed by a shared key pool", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Pool server base URL
    #[arg(long, env = "WGPOOL_POOL_URL", global = true)]
    pool_url: Option<String>,

    /// Connection registry document
    #[arg(long, env = "WGPOOL_STATE_FILE", global = true)]
    state_file: Option<PathBuf>,

    /// Directory for tunnel configuration files
    #[arg(long, env = "WGPOOL_TUNNEL_DIR", global = true)]
    tunnel_dir: Option<PathBuf>,

    /// Directory holding config.json (default: ~/.wgpool)
    #[arg(long, env = "WGPOOL_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Run networking commands through `sudo -n`
    #[arg(long, env = "WGPOOL_SUDO", global = true)]
    sudo: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect a worker through a leased tunnel
    Up {
        /// Worker id (1-9999, or a letter plus an optional alphanumeric)
        worker: String,
        /// Lease from a specific pool server
        #[arg(long)]
        server: Option<String>,
        /// Fail if the tunnel cannot reach the probe target
        #[arg(long)]
        require_reachability: bool,
    },
    /// Disconnect a worker and return its key
    Down {
        /// Worker id
        #[arg(required_unless_present = "all")]
        worker: Option<String>,
        /// Disconnect every recorded worker
        #[arg(long, conflicts_with = "worker")]
        all: bool,
    },
    /// Show recorded connections against live interfaces
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Remove records whose interface is gone and return their keys
    Cleanup,
    /// Bring down live tunnel interfaces that nothing records
    Reap,
    /// Query the pool server
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },
    /// Manage global configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PoolCommands {
    /// Show key usage
    Status {
        /// Limit to one pool server
        #[arg(long)]
        server: Option<String>,
    },
    /// List pool servers
    List,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the current configuration
    Show,
    /// Set the default pool server URL
    SetPoolUrl {
        /// Base URL, e.g. http://10.0.0.5:3000/vpn_api
        url: String,
    },
    /// Restore defaults
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config_manager = ConfigManager::new(cli.config_dir.clone())?;
    let file_config = config_manager.load()?;

    let require_reachability = matches!(
        cli.command,
        Commands::Up {
            require_reachability: true,
            ..
        }
    );
    let settings = Settings::resolve(
        Overrides {
            pool_url: cli.pool_url,
            state_file: cli.state_file,
            tunnel_dir: cli.tunnel_dir,
            use_sudo: cli.sudo,
            require_reachability,
        },
        &file_config,
    );
    debug!(?settings, "Resolved settings");

    match cli.command {
        Commands::Up { worker, server, .. } => handle_up(&settings, &worker, server).await,
        Commands::Down { worker, all } => handle_down(&settings, worker, all).await,
        Commands::Status { json } => handle_status(&settings, json).await,
        Commands::Cleanup => handle_cleanup(&settings).await,
        Commands::Reap => handle_reap(&settings).await,
        Commands::Pool { command } => handle_pool_command(&settings, command).await,
        Commands::Config { command } => handle_config_command(&config_manager, command),
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

fn pool_client(settings: &Settings) -> Result<KeyPoolClient> {
    KeyPoolClient::new(PoolClientConfig {
        base_url: settings.pool_url.clone(),
        ..Default::default()
    })
    .context("Failed to create pool client")
}

fn build_manager(settings: &Settings) -> Result<ConnectionManager> {
    let pool = Arc::new(pool_client(settings)?);
    let runner = Arc::new(SystemCommandRunner::new().with_sudo(settings.use_sudo));
    let provisioner = Arc::new(TunnelProvisioner::new(
        runner,
        ProvisionerConfig {
            config_dir: settings.tunnel_dir.clone(),
            ..Default::default()
        },
    ));
    let registry = Arc::new(
        ConnectionRegistry::open(settings.state_file.clone(), provisioner.clone()).context(
            format!("Failed to open connection registry: {:?}", settings.state_file),
        )?,
    );

    Ok(ConnectionManager::new(
        pool,
        provisioner,
        registry,
        ManagerConfig {
            require_reachability: settings.require_reachability,
        },
    ))
}

async fn handle_up(settings: &Settings, worker: &str, server: Option<String>) -> Result<()> {
    let manager = build_manager(settings)?;
    let info = manager
        .connect(worker, server.as_deref())
        .await
        .context(format!("Failed to connect worker {}", worker))?;

    println!("✅ Worker {} connected", info.worker_id);
    println!("   Interface: {}", info.interface_name);
    println!("   Address:   {}", info.internal_address);
    println!("   Endpoint:  {}", info.endpoint_address);
    Ok(())
}

async fn handle_down(settings: &Settings, worker: Option<String>, all: bool) -> Result<()> {
    let manager = build_manager(settings)?;

    if all {
        let failures = manager.disconnect_all().await?;
        if !failures.is_empty() {
            for (worker_id, error) in &failures {
                eprintln!("❌ Worker {}: {}", worker_id, error);
            }
            anyhow::bail!("{} worker(s) failed to disconnect", failures.len());
        }
        println!("✅ All workers disconnected");
        return Ok(());
    }

    let worker = worker.context("Specify a worker or --all")?;
    manager
        .disconnect(&worker)
        .await
        .context(format!("Failed to disconnect worker {}", worker))?;
    println!("✅ Worker {} disconnected", worker);
    Ok(())
}

async fn handle_status(settings: &Settings, json: bool) -> Result<()> {
    let manager = build_manager(settings)?;
    let reconciliation = manager.status().await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&StatusReport::new(&reconciliation))?
        );
    } else {
        print!("{}", render_status(&reconciliation));
    }
    Ok(())
}

async fn handle_cleanup(settings: &Settings) -> Result<()> {
    let manager = build_manager(settings)?;
    let removed = manager.cleanup_orphaned().await?;
    println!("🧹 Removed {} orphaned record(s)", removed);
    Ok(())
}

async fn handle_reap(settings: &Settings) -> Result<()> {
    let manager = build_manager(settings)?;
    let reaped = manager.reap_untracked().await?;

    if reaped.is_empty() {
        println!("No untracked interfaces");
        return Ok(());
    }
    for interface in &reaped {
        println!("🧹 Brought down {}", interface);
    }
    warn!(
        count = reaped.len(),
        "Keys of reaped interfaces are reclaimed by the pool server's expiry"
    );
    Ok(())
}

async fn handle_pool_command(settings: &Settings, command: PoolCommands) -> Result<()> {
    let client = pool_client(settings)?;

    match command {
        PoolCommands::Status { server } => {
            let status = client
                .status(server.as_deref())
                .await
                .context(format!("Failed to query pool status at {}", client.base_url()))?;
            print!("{}", render_pool_status(&status));
        }
        PoolCommands::List => {
            let servers = client
                .list()
                .await
                .context(format!("Failed to list pool servers at {}", client.base_url()))?;
            if servers.is_empty() {
                println!("No pool servers");
            }
            for server in servers {
                println!("{}", server);
            }
        }
    }

    Ok(())
}

fn handle_config_command(config_manager: &ConfigManager, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = config_manager.load()?;
            println!("# {}", config_manager.path().display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::SetPoolUrl { url } => {
            config_manager.set_pool_url(&url)?;
            println!("✅ Pool URL set to {}", url.trim_end_matches('/'));
        }
        ConfigCommands::Reset => {
            config_manager.reset()?;
            println!("✅ Configuration reset");
        }
    }

    Ok(())
}
