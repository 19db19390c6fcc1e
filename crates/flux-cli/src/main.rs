//! FluxShare CLI
//!
//! Peer-to-peer file transfer through a room-based relay:
//! - `flux relay` runs the signaling relay
//! - `flux send` offers one file to a peer in a room
//! - `flux receive` accepts files into a directory, resuming interrupted ones
//! - `flux checkpoints` inspects or clears saved receive progress

mod config;
mod progress;

use clap::{Parser, Subcommand};
use console::style;
use flux_core::{Direction, FluxNode, NodeConfig, NodeEvent, TransferEvent};
use flux_files::{
    CheckpointStore, DeclineAll, DirectoryTarget, JsonCheckpointStore, MemoryCheckpointStore,
    SavedArtifact,
};
use flux_signaling::{RelayServer, SignalingConfig, SignalingEvent};
use flux_transport::TcpTransport;
use indicatif::MultiProgress;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{TransferProgress, format_bytes};

/// FluxShare - peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "flux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path [default: ~/.config/flux/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Listen port (the PORT environment variable takes precedence)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send a file to a peer in a room
    Send {
        /// File to send
        #[arg(required = true)]
        file: PathBuf,

        /// Room code shared with the receiver
        #[arg(short, long)]
        room: String,

        /// Peer ID to send to (default: the first peer that connects)
        #[arg(short, long)]
        to: Option<String>,

        /// Relay URL (overrides the config file)
        #[arg(long)]
        relay: Option<String>,

        /// Name shown to other room members
        #[arg(long)]
        name: Option<String>,

        /// Seconds to wait for a peer
        #[arg(long, default_value = "120")]
        wait: u64,
    },

    /// Receive files from peers in a room
    Receive {
        /// Room code shared with the sender
        #[arg(short, long)]
        room: String,

        /// Output directory (overrides the config file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Relay URL (overrides the config file)
        #[arg(long)]
        relay: Option<String>,

        /// Name shown to other room members
        #[arg(long)]
        name: Option<String>,

        /// Exit after this many completed files
        #[arg(long)]
        count: Option<usize>,
    },

    /// Inspect saved receive progress
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List saved checkpoints
    List,

    /// Delete a checkpoint, or all of them
    Clear {
        /// File ID of the checkpoint to delete
        id: Option<String>,

        /// Delete every checkpoint
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    match cli.command {
        Commands::Relay { port } => run_relay(port, &config).await,
        Commands::Send {
            file,
            room,
            to,
            relay,
            name,
            wait,
        } => {
            let node_config = node_config(&config, relay, room, name);
            send_file(file, to, Duration::from_secs(wait), node_config, &config).await
        }
        Commands::Receive {
            room,
            output,
            relay,
            name,
            count,
        } => {
            let output =
                output.unwrap_or_else(|| PathBuf::from(&config.transfer.download_dir));
            let node_config = node_config(&config, relay, room, name);
            receive_files(output, count, node_config, &config).await
        }
        Commands::Checkpoints { action } => {
            let store = JsonCheckpointStore::open(config.checkpoint_dir()).await?;
            match action {
                CheckpointAction::List => list_checkpoints(&store).await,
                CheckpointAction::Clear { id, all } => clear_checkpoints(&store, id, all).await,
            }
        }
    }
}

fn node_config(
    config: &Config,
    relay: Option<String>,
    room: String,
    name: Option<String>,
) -> NodeConfig {
    let url = relay.unwrap_or_else(|| config.relay.url.clone());
    let mut signaling = SignalingConfig::new(url, room);
    if let Some(name) = name {
        signaling = signaling.with_display_name(name);
    }
    NodeConfig {
        connection: config.connection_config(),
        transfer: config.transfer_config(),
        ..NodeConfig::new(signaling)
    }
}

/// Resolve `path` to an existing regular file.
fn resolve_file(path: &Path) -> anyhow::Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("File not found: {}: {}", path.display(), e))?;
    if !canonical.is_file() {
        anyhow::bail!("Not a regular file: {}", canonical.display());
    }
    tracing::debug!("Canonicalized path: {:?} -> {:?}", path, canonical);
    Ok(canonical)
}

async fn run_relay(port: Option<u16>, config: &Config) -> anyhow::Result<()> {
    let env_port = std::env::var("PORT").ok();
    let port = match (env_port.as_deref(), port) {
        (Some(raw), _) => config.relay_port(Some(raw)),
        (None, Some(port)) => port,
        (None, None) => config.relay_port(None),
    };

    let server = RelayServer::bind(config.relay_server(port)).await?;
    println!(
        "{} relay listening on ws://{}",
        style("FluxShare").bold(),
        server.local_addr()
    );
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("Relay stopped");
        }
    }
    Ok(())
}

/// Wait until a data stream is ready, to `wanted` if given.
async fn wait_for_peer(
    events: &mut UnboundedReceiver<NodeEvent>,
    wanted: Option<&str>,
) -> anyhow::Result<String> {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::PeerReady(peer_id) if wanted.is_none_or(|w| w == peer_id) => {
                return Ok(peer_id);
            }
            NodeEvent::Signaling(SignalingEvent::Open) => {
                println!("Connected to relay; waiting for a peer...");
            }
            NodeEvent::Signaling(SignalingEvent::PeerJoined(peer)) => {
                println!("  {} joined", peer.display_name);
            }
            NodeEvent::Signaling(SignalingEvent::Error(message)) => {
                tracing::warn!("Relay: {}", message);
            }
            _ => {}
        }
    }
    anyhow::bail!("node stopped before a peer connected")
}

async fn send_file(
    file: PathBuf,
    to: Option<String>,
    wait: Duration,
    node_config: NodeConfig,
    config: &Config,
) -> anyhow::Result<()> {
    let file = resolve_file(&file)?;
    let size = std::fs::metadata(&file)?.len();
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    println!("File: {}", file.display());
    println!("Size: {}", format_bytes(size));
    println!("Room: {}", node_config.signaling.room);
    println!();

    let transport = TcpTransport::bind(config.listen_addr()?).await?;
    tracing::info!("Direct connections on {}", transport.local_addr());
    let (node, mut events) = FluxNode::start(
        node_config,
        Arc::new(transport),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(DeclineAll),
    );
    println!("Peer ID: {}", style(node.peer_id()).cyan());

    let peer_id = match tokio::time::timeout(wait, wait_for_peer(&mut events, to.as_deref())).await
    {
        Ok(peer) => peer?,
        Err(_) => {
            node.shutdown().await?;
            anyhow::bail!("no peer connected within {}s", wait.as_secs());
        }
    };
    println!("Sending to {}", style(&peer_id).cyan());

    let transfer_id = node.send_path(&peer_id, &file).await?;
    let progress = TransferProgress::new(size, &filename);
    let outcome = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break Err(anyhow::anyhow!("node stopped"));
                };
                let NodeEvent::Transfer(event) = event else {
                    continue;
                };
                if event.transfer_id() != transfer_id {
                    continue;
                }
                match event {
                    TransferEvent::Progress { bytes_transferred, .. } => {
                        progress.update(bytes_transferred);
                    }
                    TransferEvent::Completed { .. } => {
                        progress.finish_with_message(format!("{filename} sent"));
                        break Ok(());
                    }
                    TransferEvent::Cancelled { reason, .. } => {
                        progress.abandon_with_message("cancelled");
                        break Err(anyhow::anyhow!(
                            "transfer cancelled: {}",
                            reason.unwrap_or_else(|| "no reason given".to_string())
                        ));
                    }
                    TransferEvent::Error { message, .. } => {
                        progress.abandon_with_message("failed");
                        break Err(anyhow::anyhow!("transfer failed: {message}"));
                    }
                    TransferEvent::Started(_) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                node.cancel_transfer(&transfer_id, Some("sender interrupted".to_string())).await;
                progress.abandon_with_message("interrupted");
                break Err(anyhow::anyhow!("interrupted"));
            }
        }
    };

    node.shutdown().await?;
    outcome
}

fn describe_artifact(artifact: &SavedArtifact) -> String {
    match artifact {
        SavedArtifact::Path(path) => format!("saved to {}", path.display()),
        SavedArtifact::Directory(dir) => format!("unpacked into {}", dir.display()),
        SavedArtifact::Bytes { name, data } => {
            format!("{name} held in memory ({})", format_bytes(data.len() as u64))
        }
    }
}

async fn receive_files(
    output: PathBuf,
    count: Option<usize>,
    node_config: NodeConfig,
    config: &Config,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&output).await?;
    let checkpoints = JsonCheckpointStore::open(config.checkpoint_dir()).await?;
    let transport = TcpTransport::bind(config.listen_addr()?).await?;

    println!("Output: {}", output.display());
    println!("Room: {}", node_config.signaling.room);

    let (node, mut events) = FluxNode::start(
        node_config,
        Arc::new(transport),
        Arc::new(checkpoints),
        Arc::new(DirectoryTarget::new(&output)),
    );
    println!("Peer ID: {}", style(node.peer_id()).cyan());
    println!("Press Ctrl+C to stop");
    println!();

    let bars = MultiProgress::new();
    let mut active: HashMap<String, TransferProgress> = HashMap::new();
    let mut received = 0usize;

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        match event {
            NodeEvent::Signaling(SignalingEvent::Open) => println!("Connected to relay"),
            NodeEvent::Signaling(SignalingEvent::Close { will_reconnect }) if will_reconnect => {
                println!("Relay connection lost; reconnecting");
            }
            NodeEvent::Signaling(SignalingEvent::PeerJoined(peer)) => {
                println!("  {} joined", peer.display_name);
            }
            NodeEvent::PeerReady(peer_id) => println!("Connected to {}", style(peer_id).cyan()),
            NodeEvent::PeerRemoved(peer_id) => println!("{peer_id} disconnected"),
            NodeEvent::Transfer(event) if event.context().direction == Direction::Receive => {
                let id = event.transfer_id().to_string();
                match event {
                    TransferEvent::Started(context) => {
                        let manifest = &context.manifest;
                        let bar = TransferProgress::in_group(&bars, manifest.size, &manifest.name);
                        active.insert(id, bar);
                    }
                    TransferEvent::Progress {
                        bytes_transferred, ..
                    } => {
                        if let Some(bar) = active.get(&id) {
                            bar.update(bytes_transferred);
                        }
                    }
                    TransferEvent::Completed { context, artifact } => {
                        let message = artifact
                            .as_ref()
                            .map_or_else(|| "received".to_string(), describe_artifact);
                        match active.remove(&id) {
                            Some(bar) => bar.finish_with_message(message),
                            None => println!("{}: {}", context.manifest.name, message),
                        }
                        received += 1;
                        if count.is_some_and(|count| received >= count) {
                            break;
                        }
                    }
                    TransferEvent::Cancelled { context, reason } => {
                        let message = format!(
                            "cancelled: {}",
                            reason.unwrap_or_else(|| "no reason given".to_string())
                        );
                        match active.remove(&id) {
                            Some(bar) => bar.abandon_with_message(message),
                            None => println!("{}: {}", context.manifest.name, message),
                        }
                    }
                    TransferEvent::Error { context, message } => {
                        let message = format!("failed: {message}");
                        match active.remove(&id) {
                            Some(bar) => bar.abandon_with_message(message),
                            None => println!("{}: {}", context.manifest.name, message),
                        }
                    }
                }
            }
            _ => {}
        }
    }

    println!("Received {received} file(s)");
    node.shutdown().await?;
    Ok(())
}

async fn list_checkpoints(store: &dyn CheckpointStore) -> anyhow::Result<()> {
    let mut checkpoints = store.list().await?;
    if checkpoints.is_empty() {
        println!("No saved checkpoints");
        return Ok(());
    }
    checkpoints.sort_by(|a, b| a.file_id.cmp(&b.file_id));
    println!("{:<24} {:>12} {:>12}", "FILE ID", "NEXT CHUNK", "RECEIVED");
    for checkpoint in checkpoints {
        println!(
            "{:<24} {:>12} {:>12}",
            checkpoint.file_id,
            checkpoint.next_chunk_index,
            format_bytes(checkpoint.received_bytes)
        );
    }
    Ok(())
}

async fn clear_checkpoints(
    store: &dyn CheckpointStore,
    id: Option<String>,
    all: bool,
) -> anyhow::Result<()> {
    match (id, all) {
        (Some(id), _) => {
            store.clear(&id).await?;
            println!("Cleared checkpoint {id}");
        }
        (None, true) => {
            let checkpoints = store.list().await?;
            for checkpoint in &checkpoints {
                store.clear(&checkpoint.file_id).await?;
            }
            println!("Cleared {} checkpoint(s)", checkpoints.len());
        }
        (None, false) => anyhow::bail!("pass a file ID or --all"),
    }
    Ok(())
}
