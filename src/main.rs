//! Peer Chess
//!
//! Command line client. `demo` plays a short in-process session over
//! loopback; the other commands inspect and maintain the room directory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use peer_chess::{
    core::clock::{Clock, SystemClock},
    core::hash::short_hex,
    network::ConnectionEvent,
    ClientConfig, Coord, DirectoryBackend, Lobby, MoveOutcome, Session, VERSION,
};

/// Peer-to-peer chess sessions
#[derive(Parser)]
#[command(name = "peer-chess")]
#[command(about = "Room discovery and board sync for two-party chess")]
#[command(version)]
struct Cli {
    /// Directory backend: `memory` or `file:<path>`
    #[arg(long, env = "PEER_CHESS_DIRECTORY")]
    directory: Option<DirectoryBackend>,

    /// Address to accept guests on
    #[arg(long, env = "PEER_CHESS_BIND")]
    bind: Option<SocketAddr>,

    /// Host name advertised to guests
    #[arg(long, env = "PEER_CHESS_ADVERTISE_HOST")]
    advertise_host: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Host and join a room in-process and play a few moves
    Demo,

    /// Print rooms open for joining
    List,

    /// Remove expired rooms once
    Sweep,

    /// Remove every room record
    Clear,

    /// Print rooms this client hosted or joined and has not left
    Recent,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peer_chess=info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(directory) = cli.directory {
        config.directory = directory;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(host) = cli.advertise_host {
        config.advertise_host = host;
    }
    config.validate()?;

    info!("Peer Chess v{}", VERSION);
    info!("Directory: {:?}", config.directory);

    match cli.command.unwrap_or(Commands::Demo) {
        Commands::Demo => demo(config).await,
        Commands::List => list(config).await,
        Commands::Sweep => {
            let removed = Lobby::new(config).registrar().sweep_expired().await?;
            println!("removed {removed} expired room(s)");
            Ok(())
        }
        Commands::Recent => {
            let rooms = Lobby::new(config).recent_rooms().await?;
            if rooms.is_empty() {
                println!("no recent rooms");
            }
            for room in rooms {
                println!("{}  {:<6} {:<24} {}", room.room_code, format!("{:?}", room.role), room.display_name, room.endpoint);
            }
            Ok(())
        }
        Commands::Clear => {
            config.directory.open().clear().await?;
            println!("room directory cleared");
            Ok(())
        }
    }
}

async fn list(config: ClientConfig) -> Result<()> {
    let lobby = Lobby::new(config);
    let rooms = lobby.list_open_rooms().await?;
    if rooms.is_empty() {
        println!("no open rooms");
        return Ok(());
    }
    let now = SystemClock.now_ms();
    for room in rooms {
        println!(
            "{}  {:<24} {:<10} seen {}s ago  {}",
            room.room_code,
            room.display_name,
            room.accent_color,
            now.saturating_sub(room.last_seen) / 1000,
            room.endpoint.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Wait for one connection event and act on it.
async fn pump(session: &mut Session) -> Result<ConnectionEvent> {
    tokio::time::timeout(Duration::from_secs(5), session.handle_next_event())
        .await
        .map_err(|_| anyhow!("timed out waiting for peer"))?
        .ok_or_else(|| anyhow!("connection manager gone"))
}

fn square(name: &str) -> Result<Coord> {
    Coord::from_algebraic(name).ok_or_else(|| anyhow!("bad square {name}"))
}

fn play(session: &mut Session, from: &str, to: &str) -> Result<MoveOutcome> {
    let outcome = session.apply_local_move(square(from)?, square(to)?);
    match outcome {
        MoveOutcome::Accepted(record) => info!("{:?} played {}", session.role(), record),
        MoveOutcome::Rejected(reason) => info!("{:?} tried {}-{}: {}", session.role(), from, to, reason),
    }
    Ok(outcome)
}

/// Demo: run both ends of a session in one process.
async fn demo(config: ClientConfig) -> Result<()> {
    info!("=== Starting Demo Session ===");

    // Both clients must see the same directory
    let directory = config.directory.open();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let host_lobby = Lobby::with_parts(config.clone(), directory.clone(), clock.clone());
    let guest_lobby = Lobby::with_parts(config, directory, clock);

    let mut host = host_lobby.host_room("demo table", "#3366ff").await?;
    let code = host.room_code().clone();
    info!("Room {} advertised at {}", code, host.endpoint());

    let open = guest_lobby.list_open_rooms().await?;
    info!("Guest sees {} open room(s)", open.len());

    let mut guest = guest_lobby.join_room(code.as_str()).await?;
    pump(&mut host).await?; // opened, board resent
    pump(&mut guest).await?; // opened
    pump(&mut guest).await?; // host board

    play(&mut host, "e2", "e4")?;
    pump(&mut guest).await?;
    if play(&mut host, "d2", "d4")?.is_accepted() {
        bail!("host moved twice in a row");
    }

    play(&mut guest, "e7", "e5")?;
    pump(&mut host).await?;

    for line in host.board().history.iter() {
        info!("  {}", line);
    }

    // Drop the link: host reopens the room
    guest.disconnect().await;
    pump(&mut host).await?;
    let reopened = guest_lobby
        .list_open_rooms()
        .await?
        .iter()
        .any(|r| r.room_code == code);
    info!("Room {} listed again after disconnect: {}", code, reopened);

    // Rejoin: host resends its board
    guest.rejoin().await?;
    pump(&mut host).await?;
    pump(&mut guest).await?;
    pump(&mut guest).await?;

    let host_digest = host.synchronizer().digest();
    let guest_digest = guest.synchronizer().digest();
    info!(
        "Host digest {}, guest digest {}",
        short_hex(&host_digest),
        short_hex(&guest_digest)
    );
    if host_digest != guest_digest {
        bail!("boards diverged after rejoin");
    }

    guest.leave().await;
    host.leave().await;
    info!("=== Demo Session Complete ===");
    Ok(())
}
