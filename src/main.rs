use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ringkv::KvError;
use ringkv::client::{ClusterClient, ClusterListener, NodePools, PoolOptions, ReconnectBackoff};
use ringkv::common::config::{ClientConfig, MasterConfig, StoreConfig};
use ringkv::master::MasterServer;
use ringkv::protocol::{BootstrapCopyRequest, BootstrapCopyResponse};
use ringkv::server::{MasterService, StoreService};
use ringkv::store::StoreServer;
use ringkv::transport::StoreConnection;
use ringkv::transport::local::LocalCollector;
use ringkv::transport::tcp::{ConnectionOptions, TcpStoreConnection};

/// Command-line arguments for ringkv
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info", global = true)]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a master
    Master {
        /// Master configuration file
        #[clap(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a store
    Store {
        /// Store configuration file
        #[clap(short, long)]
        config: Option<PathBuf>,
    },
    /// Read a key
    Get {
        #[clap(flatten)]
        client: ClientArgs,
        key: String,
    },
    /// Write a key
    Put {
        #[clap(flatten)]
        client: ClientArgs,
        key: String,
        value: String,
        /// Expire the key after this many seconds (0 = never)
        #[clap(long, default_value = "0")]
        ttl: u32,
    },
    /// Delete a key
    Delete {
        #[clap(flatten)]
        client: ClientArgs,
        key: String,
    },
    /// Stream a shard from a store and report the rows and tail position
    Bootstrap {
        /// Store address (host:port)
        #[clap(long)]
        store: String,
        #[clap(short, long)]
        keyspace: String,
        #[clap(long)]
        shard: u32,
        /// Keep only rows owned by this shard in the target cluster
        #[clap(long, default_value = "0")]
        target_shard: u32,
        /// Target cluster size (0 = copy every row)
        #[clap(long, default_value = "0")]
        target_size: u32,
    },
}

#[derive(clap::Args, Debug)]
struct ClientArgs {
    /// Client configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    #[clap(short, long)]
    keyspace: String,

    /// Seconds to wait for the keyspace's ring from the master
    #[clap(long, default_value = "10")]
    wait: u64,
}

impl ClientArgs {
    async fn connect(&self) -> Result<ClusterClient> {
        let config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };
        let pools = Arc::new(NodePools::new(PoolOptions::from(&config)));
        let listener = Arc::new(ClusterListener::new(config.data_center.clone(), pools));
        let client = ClusterClient::new(self.keyspace.clone(), Arc::clone(&listener));

        let options = ConnectionOptions {
            operation_timeout: config.operation_timeout(),
            ..ConnectionOptions::default()
        };
        {
            let listener = Arc::clone(&listener);
            let master_addr = config.master_addr.clone();
            tokio::spawn(async move { listener.run(&master_addr, options, ReconnectBackoff::default()).await });
        }
        listener
            .wait_for_cluster(&self.keyspace, std::time::Duration::from_secs(self.wait))
            .await?;
        Ok(client)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Master { config } => {
            let config = match config {
                Some(path) => MasterConfig::from_file(path)?,
                None => MasterConfig::default(),
            };
            info!("Starting ringkv master v{}", env!("CARGO_PKG_VERSION"));
            let master = Arc::new(MasterServer::from_config(&config)?);
            MasterService::new(master).run(&config.listen_addr).await?;
        }
        Command::Store { config } => {
            let config = match config {
                Some(path) => StoreConfig::from_file(path)?,
                None => StoreConfig::default(),
            };
            info!("Starting ringkv store v{} in {}", env!("CARGO_PKG_VERSION"), config.data_center);
            let store = Arc::new(StoreServer::from_config(&config)?);
            StoreService::new(store).run(&config.listen_addr).await?;
        }
        Command::Get { client, key } => {
            let client = client.connect().await?;
            match client.get(key.into_bytes(), &[]).await {
                Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
                Err(KvError::NotFound) => bail!("not found"),
                Err(e) => return Err(e.into()),
            }
        }
        Command::Put { client, key, value, ttl } => {
            let client = client.connect().await?;
            client.put(key.into_bytes(), value.into_bytes(), ttl).await?;
        }
        Command::Delete { client, key } => {
            let client = client.connect().await?;
            client.delete(key.into_bytes()).await?;
        }
        Command::Bootstrap { store, keyspace, shard, target_shard, target_size } => {
            let mut conn = TcpStoreConnection::connect(&store, ConnectionOptions::default()).await?;
            let mut sink = LocalCollector::new();
            let request = BootstrapCopyRequest {
                keyspace,
                shard_id: shard,
                target_shard_id: target_shard,
                target_cluster_size: target_size,
            };
            conn.bootstrap_copy(request, &mut sink).await?;
            Box::new(conn).close().await?;

            let mut rows = 0;
            for msg in sink.messages {
                match msg {
                    BootstrapCopyResponse::KeyValues(kvs) => rows += kvs.len(),
                    BootstrapCopyResponse::BinlogTailProgress(pos) => {
                        println!("rows: {}, tail: segment {} offset {}", rows, pos.segment, pos.offset)
                    }
                }
            }
        }
    }
    Ok(())
}
