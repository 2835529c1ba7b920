// peermesh-cli: PeerMesh command-line front end
//
// Runs in-process mesh simulations on the loopback network and manages the
// persisted configuration.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use peermesh_core::{
    Collaborators, DirectorySink, Direction, Event, FileHandle, LoopbackNetwork,
    MediaConstraints, MemoryRelay, MeshEngine, MeshHandle,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Parser)]
#[command(name = "peermesh")]
#[command(about = "PeerMesh — peer-to-peer rooms with chat and file transfer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a room of in-process clients on the loopback network
    Simulate {
        /// Number of clients joining the room
        #[arg(short, long, default_value = "3")]
        peers: usize,
        /// File broadcast by the first client
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Chat message broadcast by the first client
        #[arg(short, long, default_value = "hello mesh")]
        message: String,
        /// Seconds to wait for each phase
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Path,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            peers,
            file,
            message,
            timeout,
        } => cmd_simulate(peers, file, message, Duration::from_secs(timeout)).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = config::Config::load()?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
        ConfigAction::Set { key, value } => {
            let path = config::Config::config_file()?;
            let mut config = config::Config::load_from(&path)?;
            config.set(&key, &value)?;
            config.save_to(&path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
    }
    Ok(())
}

/// A running simulation: every client's events merged into one stream.
struct Simulation {
    names: Vec<String>,
    handles: Vec<MeshHandle>,
    open_channels: Vec<usize>,
    events: mpsc::UnboundedReceiver<(usize, Event)>,
    events_tx: mpsc::UnboundedSender<(usize, Event)>,
    phase_timeout: Duration,
}

impl Simulation {
    fn new(phase_timeout: Duration) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            names: Vec::new(),
            handles: Vec::new(),
            open_channels: Vec::new(),
            events,
            events_tx,
            phase_timeout,
        }
    }

    fn add(&mut self, name: String, handle: MeshHandle) -> usize {
        let index = self.handles.len();
        let mut stream = handle.subscribe();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if tx.send((index, event)).is_err() {
                    break;
                }
            }
        });
        self.names.push(name);
        self.handles.push(handle);
        self.open_channels.push(0);
        index
    }

    /// Next event: printed, counted, and any incoming file accepted.
    async fn next(&mut self, phase: &str, deadline: Instant) -> Result<(usize, Event)> {
        let (index, event) = tokio::time::timeout_at(deadline, self.events.recv())
            .await
            .with_context(|| format!("Timed out while {}", phase))?
            .context("Event stream ended")?;
        print_event(&self.names[index], &event);

        match &event {
            Event::ChannelOpened { .. } => self.open_channels[index] += 1,
            Event::ChannelClosed { .. } => {
                self.open_channels[index] = self.open_channels[index].saturating_sub(1)
            }
            Event::TransferIncoming {
                send_id, peer_id, ..
            } => {
                self.handles[index]
                    .accept_transfer(peer_id.clone(), send_id.clone())
                    .await
                    .context("Failed to accept transfer")?;
            }
            _ => {}
        }
        Ok((index, event))
    }

    async fn until(&mut self, phase: &str, mut done: impl FnMut(usize, &Event) -> bool) -> Result<()> {
        let deadline = Instant::now() + self.phase_timeout;
        loop {
            let (index, event) = self.next(phase, deadline).await?;
            if done(index, &event) {
                return Ok(());
            }
        }
    }

    /// Wait until every client has a channel to every other client.
    async fn until_mesh(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.phase_timeout;
        let want = self.handles.len().saturating_sub(1);
        while self.open_channels.iter().any(|&n| n < want) {
            self.next("opening channels", deadline).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        for handle in &self.handles {
            let _ = handle.shutdown().await;
        }
    }
}

async fn cmd_simulate(
    peers: usize,
    file: Option<PathBuf>,
    message: String,
    phase_timeout: Duration,
) -> Result<()> {
    if peers < 2 {
        anyhow::bail!("A simulation needs at least 2 peers");
    }
    let config = config::Config::load()?;
    let download_dir = config.download_path()?;
    let file = match file {
        Some(path) => Some(
            FileHandle::open(&path)
                .await
                .with_context(|| format!("Cannot open {}", path.display()))?,
        ),
        None => None,
    };

    println!("{}", "PeerMesh — Simulation".bold());
    println!("  Room:      {}", config.room.bright_cyan());
    println!("  Clients:   {}", peers);
    println!("  Downloads: {}", download_dir.display());
    println!();

    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let mut sim = Simulation::new(phase_timeout);

    for n in 1..=peers {
        let name = format!("client-{}", n);
        let sink = DirectorySink::new(download_dir.join(&name));
        let collaborators = Collaborators::loopback(&relay, &network, Arc::new(sink));
        let handle = MeshEngine::new(config.mesh_config(), collaborators).spawn();
        let index = sim.add(name, handle.clone());

        handle.connect(config.relay_address.clone()).await?;
        handle.create_stream(MediaConstraints::audio_video())?;
        sim.until("joining the room", |i, e| {
            i == index && matches!(e, Event::Ready { .. })
        })
        .await?;
    }

    sim.until_mesh().await?;
    println!();
    println!("{} Mesh formed: {} channel(s) per client", "✓".green(), peers - 1);
    println!();

    let reached = sim.handles[0].broadcast_message(message).await?;
    println!("{} Chat sent to {} peer(s)", "✓".green(), reached.len());
    let mut chats = 0;
    sim.until("delivering chat", |_, e| {
        if matches!(e, Event::ChatMessage { .. }) {
            chats += 1;
        }
        chats >= reached.len()
    })
    .await?;

    if let Some(file) = file {
        let meta = file.meta();
        let ids = sim.handles[0].broadcast_file(file).await?;
        println!();
        println!(
            "{} Offered {} ({} bytes) to {} peer(s)",
            "✓".green(),
            meta.name.bright_cyan(),
            meta.size,
            ids.len()
        );
        let mut finished = 0;
        sim.until("transferring the file", |_, e| {
            if matches!(
                e,
                Event::TransferReceived { .. }
                    | Event::TransferReceiveError { .. }
                    | Event::TransferSendError { .. }
            ) {
                finished += 1;
            }
            finished >= ids.len()
        })
        .await?;
    }

    sim.shutdown().await;
    println!();
    println!("{} Simulation complete", "✓".green());
    Ok(())
}

fn print_event(client: &str, event: &Event) {
    let who = format!("[{}]", client).dimmed();
    match event {
        Event::Connected { room } => println!("{} connected to room {}", who, room.bright_cyan()),
        Event::Ready { sessions } => {
            println!("{} {} ({} outbound session(s))", who, "ready".green(), sessions)
        }
        Event::PeerArrived { peer } => {
            println!("{} peer arrived: {}", who, peer.id.to_string().bright_cyan())
        }
        Event::PeerRemoved { peer_id } => {
            println!("{} peer left: {}", who, peer_id.to_string().bright_cyan())
        }
        Event::ChannelOpened { peer_id } => {
            println!("{} channel open to {}", who, peer_id.to_string().bright_cyan())
        }
        Event::ChatMessage {
            peer_id,
            avatar,
            text,
        } => println!(
            "{} {} {} ({}): {}",
            who,
            "←".bright_blue(),
            peer_id.to_string().bright_cyan(),
            avatar,
            text
        ),
        Event::TransferIncoming { peer_id, file, .. } => println!(
            "{} incoming {} ({} bytes) from {}",
            who,
            file.name.bright_cyan(),
            file.size,
            peer_id
        ),
        Event::TransferProgress {
            direction, percent, ..
        } => {
            let arrow = match direction {
                Direction::Outbound => "→".bright_green(),
                Direction::Inbound => "←".bright_blue(),
            };
            println!("{} {} {:.0}%", who, arrow, percent);
        }
        Event::TransferSent { peer_id, file, .. } => {
            println!("{} {} sent {} to {}", who, "✓".green(), file.name, peer_id)
        }
        Event::TransferReceived { file, location, .. } => println!(
            "{} {} received {} at {}",
            who,
            "✓".green(),
            file.name,
            location.bright_cyan()
        ),
        Event::TransferSendError { error, .. }
        | Event::TransferReceiveError { error, .. }
        | Event::NegotiationError { error, .. }
        | Event::ChannelError { error, .. }
        | Event::SignalingError { error }
        | Event::StreamCreateError { error } => {
            println!("{} {} {}", who, "✗".red(), error.to_string().red())
        }
        other => println!("{} {}", who, other.name().dimmed()),
    }
}
