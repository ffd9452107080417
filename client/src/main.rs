//! Command-line client for watching and driving a shared game-timer session

use clap::Parser;
use client::{ClientEvent, SyncClient};
use shared::session::PlayerProfile;

#[derive(Parser)]
#[command(name = "timer-sync-client")]
#[command(about = "Connects to a timer sync server and logs session events")]
struct Args {
    /// Server WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Participant identifier
    #[arg(long, default_value = "cli-client")]
    id: String,

    /// Display name to register with
    #[arg(long)]
    name: Option<String>,

    /// Create a new game instead of joining one
    #[arg(long, conflicts_with = "join")]
    create: bool,

    /// Six-character code of the game to join
    #[arg(long)]
    join: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let sync = SyncClient::connect(&args.server, &args.id).await?;
    let mut events = sync.subscribe();

    let profile = args.name.map(|name| PlayerProfile {
        name: Some(name),
        color: None,
    });
    if args.create {
        sync.create_game(profile)?;
    } else if let Some(code) = &args.join {
        sync.join_game(code, profile)?;
    }

    loop {
        match events.recv().await {
            Ok(ClientEvent::GameCreated { game_id, .. }) => {
                println!("game created, share this code: {}", game_id);
            }
            Ok(ClientEvent::GameJoined { game_id, state }) => {
                println!("joined {} with {} player(s)", game_id, state.players.len());
            }
            Ok(ClientEvent::StateUpdated { state, updated_by }) => {
                println!(
                    "update from {}: running={} players={}",
                    updated_by,
                    state.running,
                    state.players.len()
                );
            }
            Ok(ClientEvent::PlayerJoined { player_id, .. }) => {
                println!("player joined: {}", player_id);
            }
            Ok(ClientEvent::PlayerLeft { player_id, state, .. }) => {
                println!("player left: {} (host is now {})", player_id, state.host_id);
            }
            Ok(ClientEvent::ErrorReceived { code, message }) => {
                eprintln!("server error {:?}: {}", code, message);
            }
            Ok(ClientEvent::ReconnectFailed) => {
                eprintln!("connection lost for good");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("event stream closed: {}", e);
                return Ok(());
            }
        }
    }
}
