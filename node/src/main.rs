use clap::{Parser, ValueEnum};
use log::info;
use node::game::ResetMode;
use node::node::{NodeConfig, QuizNode};
use node::replicator::{Role, UserIntent};
use node::transport::random_device_id;
use shared::DEFAULT_ROOM_CODE;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    /// Authoritative presentation node
    Tv,
    /// Read-only player replica
    Player,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Which role this device plays
    #[arg(value_enum)]
    role: RoleArg,

    /// Relay WebSocket URL
    #[arg(short = 'r', long, default_value = "ws://127.0.0.1:8081")]
    relay: String,

    /// Room code, also the local broadcast channel name
    #[arg(long, default_value = DEFAULT_ROOM_CODE)]
    room: String,

    /// Player display name (player role only)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Directory for snapshot and identity backups
    #[arg(short = 'd', long)]
    data_dir: Option<PathBuf>,

    /// Reset clears the player roster instead of keeping scores at zero
    #[arg(long)]
    strict_reset: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let role = match args.role {
        RoleArg::Tv => Role::Authoritative,
        RoleArg::Player => Role::Peer,
    };

    let mut config = NodeConfig::new(role);
    config.room_code = args.room.clone();
    config.data_dir = args.data_dir;
    config.transport.relay_url = args.relay.clone();
    config.transport.bus_name = args.room.clone();
    if args.strict_reset {
        config.reset_mode = ResetMode::ClearRoster;
    }

    info!("Starting {:?} node in room {}", role, args.room);
    info!("Relay: {}", args.relay);

    let node = QuizNode::start(config);
    let handle = node.handle();
    let identity = node.identity().clone();
    tokio::spawn(node.run());

    let mut local_player = None;
    if role == Role::Peer {
        let player_id = identity.player_id.unwrap_or_else(random_device_id);
        let name = args
            .name
            .or(identity.player_name)
            .unwrap_or_else(|| format!("Player-{}", &player_id[..4.min(player_id.len())]));
        info!("Joining as {} ({})", name, player_id);
        handle.raise(UserIntent::Join {
            id: player_id.clone(),
            name,
        });
        local_player = Some(player_id);
    }

    let mut snapshots = handle.snapshots();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow().clone();
                info!(
                    "[{:?}] question {} with {} players",
                    snapshot.game_state,
                    snapshot.current_question_index + 1,
                    snapshot.players.len()
                );
                for player in &snapshot.players {
                    info!(
                        "  {} {} pts{}",
                        player.name,
                        player.score,
                        if player.is_connected { "" } else { " (away)" }
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                // Announce the departure so the host does not have to wait
                // for the heartbeat timeout
                if let Some(player_id) = local_player.take() {
                    info!("Leaving room");
                    handle.raise(UserIntent::Leave { player_id });
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                break;
            }
        }
    }

    Ok(())
}
