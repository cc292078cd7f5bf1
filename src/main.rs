use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;

use ballot::raft::{KvCommand, RaftConfig};
use ballot::LocalCluster;

#[cfg(feature = "grpc")]
use ballot::Config;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[derive(Parser)]
#[command(name = "ballot")]
#[command(about = "A Raft participant: timed elections, quorum voting and log sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a whole cluster in this process and replicate a few commands
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Number of put commands to submit once a leader is elected
        #[arg(short, long, default_value_t = 5)]
        commands: usize,

        /// Minimum election timeout in milliseconds
        #[arg(long, default_value_t = 150)]
        election_min: u64,

        /// Maximum election timeout in milliseconds
        #[arg(long, default_value_t = 300)]
        election_max: u64,

        /// Heartbeat interval in milliseconds
        #[arg(long, default_value_t = 50)]
        heartbeat: u64,
    },

    /// Start a node behind the gRPC server
    #[cfg(feature = "grpc")]
    Serve {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Address to listen on (overrides the config file)
        #[arg(short, long)]
        address: Option<String>,

        /// Comma-separated list of member addresses
        #[arg(short, long)]
        members: Option<String>,

        /// Directory for the durable log
        #[arg(short, long)]
        data_dir: Option<String>,
    },

    /// Submit a JSON key/value command to a node
    #[cfg(feature = "grpc")]
    Submit {
        /// Address of the node (normally the leader)
        #[arg(short, long)]
        node: String,

        /// Command, e.g. {"op":"put","key":"a","value":"1"}
        #[arg(short, long)]
        command: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            nodes,
            commands,
            election_min,
            election_max,
            heartbeat,
        } => simulate(nodes, commands, election_min, election_max, heartbeat).await?,
        #[cfg(feature = "grpc")]
        Command::Serve {
            config,
            address,
            members,
            data_dir,
        } => serve(config, address, members, data_dir).await?,
        #[cfg(feature = "grpc")]
        Command::Submit { node, command } => {
            let command: KvCommand =
                serde_json::from_str(&command).context("command must be a JSON key/value op")?;
            let response =
                ballot::network::submit(&node, command.encode(), Duration::from_secs(5)).await?;
            println!(
                "committed at index {}: {}",
                response.index,
                String::from_utf8_lossy(&response.result)
            );
        }
    }

    Ok(())
}

async fn simulate(
    nodes: usize,
    commands: usize,
    election_min: u64,
    election_max: u64,
    heartbeat: u64,
) -> anyhow::Result<()> {
    let template = RaftConfig::new("template").with_timing(election_min, election_max, heartbeat);
    let cluster = LocalCluster::start(nodes, &template)?;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .context("no leader elected")?;
    info!("{} leads term {}", leader.address(), leader.status().current_term);

    for i in 0..commands {
        let command = KvCommand::Put {
            key: format!("key-{i}"),
            value: format!("value-{i}"),
        };
        let index = cluster
            .submit(command.encode(), Duration::from_secs(5))
            .await
            .with_context(|| format!("command {i} was not committed"))?;
        info!("committed key-{} at index {}", i, index);
    }

    // Give followers a heartbeat to learn the final commit index.
    tokio::time::sleep(Duration::from_millis(heartbeat * 3)).await;
    for state in cluster.states() {
        println!("{}", serde_json::to_string(&state)?);
    }

    cluster.shutdown().await;
    Ok(())
}

#[cfg(feature = "grpc")]
async fn serve(
    config: Option<String>,
    address: Option<String>,
    members: Option<String>,
    data_dir: Option<String>,
) -> anyhow::Result<()> {
    use std::sync::Arc;

    use ballot::config::StorageConfig;
    use ballot::network::{serve, GrpcEndpoint};
    use ballot::raft::{KvMachine, RaftNode};

    let mut file = match config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(address) = address {
        file.address = address;
    }
    if let Some(members) = members {
        file.members = members.split(',').map(|m| m.trim().to_string()).collect();
    }
    if let Some(data_dir) = data_dir {
        file.storage = StorageConfig::File { data_dir };
    }

    let raft_config = file.raft_config()?;
    let addr = file
        .address
        .parse()
        .with_context(|| format!("cannot listen on {}", file.address))?;
    let endpoint = Arc::new(GrpcEndpoint::new(raft_config.rpc_timeout()));
    info!(
        "Starting node {} with members {:?}",
        raft_config.address, raft_config.members
    );

    let node = RaftNode::spawn(raft_config, file.open_log()?, endpoint, Box::new(KvMachine::new()))?;
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    };
    serve(addr, node.clone(), shutdown).await?;
    node.shutdown().await?;
    Ok(())
}
