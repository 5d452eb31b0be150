use anyhow::{bail, Context, Result};
use clap::Parser;
use peerdoc_core::core_doc::{DocId, MemoryDocFactory, MemoryDocRegistry};
use peerdoc_core::core_host::{MemoryBridge, MemoryStorage, StorageAdapterConfig, SyncHost, SyncHostBuilder};
use peerdoc_core::core_sync::PeerIdentity;
use peerdoc_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use peerdoc_core::Config;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "peerdoc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Configuration file (TOML); PEERDOC_* variables apply on top
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run an in-process hub with spokes and storage, then report convergence
    Demo {
        /// Number of spoke peers
        #[arg(short, long, default_value_t = 3)]
        peers: usize,

        /// Document the peers edit together
        #[arg(short, long, default_value = "demo")]
        doc: String,

        /// Give up waiting for convergence after this many seconds
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Validate a configuration file
    Check {
        /// File to validate
        path: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

struct Peer {
    name: String,
    host: SyncHost,
    registry: Arc<MemoryDocRegistry>,
}

impl Peer {
    fn spawn(name: &str, config: &Config) -> Result<Self> {
        let registry = Arc::new(MemoryDocRegistry::new());
        let (host, _) = SyncHostBuilder::new(PeerIdentity::user(name))
            .with_config(config)
            .with_factory(registry.clone())
            .with_storage_factory(Arc::new(MemoryDocFactory))
            .spawn()
            .with_context(|| format!("starting peer {}", name))?;
        Ok(Peer {
            name: name.to_string(),
            host,
            registry,
        })
    }

    fn keys(&self, doc_id: &DocId) -> usize {
        self.registry
            .doc(doc_id)
            .and_then(|doc| doc.entries().ok())
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

async fn run_demo(config: &Config, peers: usize, doc: String, timeout: Duration) -> Result<()> {
    if peers == 0 {
        bail!("demo needs at least one peer");
    }
    let doc_id = DocId::new(doc);

    let hub = Peer::spawn("hub", config)?;
    let storage = Arc::new(MemoryStorage::new());
    hub.host
        .add_storage(storage.clone(), StorageAdapterConfig::default())
        .await?;

    let mut spokes = Vec::with_capacity(peers);
    for i in 0..peers {
        let spoke = Peer::spawn(&format!("peer-{}", i), config)?;
        MemoryBridge::connect(&spoke.host, &hub.host).await?;
        spokes.push(spoke);
    }

    for spoke in &spokes {
        spoke.host.ensure_doc(doc_id.clone()).await?;
        spoke.host.wait_until_ready(doc_id.clone()).await?;
        let replica = spoke
            .registry
            .doc(&doc_id)
            .context("document was not created")?;
        replica.set(&spoke.name, json!({ "joined": true }))?;
        spoke
            .host
            .set_presence(doc_id.clone(), "status", Some(b"online".to_vec()))
            .await?;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let converged = loop {
        let done = std::iter::once(&hub)
            .chain(spokes.iter())
            .all(|peer| peer.keys(&doc_id) == peers);
        if done || tokio::time::Instant::now() >= deadline {
            break done;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let mut report = Vec::new();
    for peer in std::iter::once(&hub).chain(spokes.iter()) {
        let presence = peer.host.presence(doc_id.clone()).await?;
        report.push(json!({
            "peer": peer.name,
            "keys": peer.keys(&doc_id),
            "presence": presence.len(),
        }));
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "doc": doc_id.to_string(),
            "converged": converged,
            "stored_entries": storage.len().await,
            "peers": report,
        }))?
    );

    for peer in std::iter::once(&hub).chain(spokes.iter()) {
        peer.host.shutdown().await?;
    }

    if !converged {
        warn!(doc = %doc_id, "peers did not converge in time");
        bail!("peers did not converge within {:?}", timeout);
    }
    info!(doc = %doc_id, peers, "all peers converged");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let mut log_config = LogConfig::from_config(&config.logging)?;
    if let Some(level) = &args.log_level {
        let level = LogLevel::parse(level).unwrap_or_else(|| {
            eprintln!("Invalid log level '{}', using 'info'", level);
            LogLevel::Info
        });
        log_config = LogConfig::new(level).with_target(config.logging.with_target);
    }
    init_logging_with_config(log_config.json_format(args.json_logs || config.logging.json_format))?;

    peerdoc_core::metrics::init_metrics();
    info!("peerdoc started");

    match args.command {
        Some(Command::Demo {
            peers,
            doc,
            timeout_secs,
        }) => run_demo(&config, peers, doc, Duration::from_secs(timeout_secs)).await?,
        Some(Command::Config) => print!("{}", config.to_toml()?),
        Some(Command::Check { path }) => {
            Config::from_file(&path).with_context(|| format!("checking {}", path.display()))?;
            println!("{}: ok", path.display());
        }
        None => {
            info!("No command specified. Use --help for usage information.");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_demo_arguments() {
        let args = Args::try_parse_from(["peerdoc", "demo", "--peers", "5"]).unwrap();
        assert!(matches!(
            args.command,
            Some(Command::Demo { peers: 5, timeout_secs: 5, .. })
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerdoc.toml");
        std::fs::write(
            &path,
            "[sync]\nrequest_timeout = \"2s\"\nmax_retries = 1\nbackoff_base = \"100ms\"\nbackoff_max = \"1s\"\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.sync.request_timeout, Duration::from_secs(2));
        assert_eq!(config.sync.max_retries, 1);
        assert_eq!(config.presence, Default::default());
    }

    #[test]
    fn test_load_config_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
