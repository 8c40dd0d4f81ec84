use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lobby_transport::{JoinOutcome, Lobby, LobbyConfig, WebRtcBackend};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{Duration, interval};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "beach-lobby")]
#[command(about = "Host or join a peer-to-peer session through a rendezvous lobby")]
pub struct Cli {
    /// Lobby address (host:port, ws(s):// or http(s):// URL)
    #[arg(long, env = "BEACH_LOBBY_URL")]
    pub lobby: Option<String>,

    /// Peer slot capacity
    #[arg(long, env = "BEACH_LOBBY_MAX_PEERS")]
    pub max_peers: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a game and relay lines between everyone who joins
    Host {
        /// Display name shown in listings
        #[arg(short, long, default_value = "beach")]
        name: String,

        /// Advertised player capacity (defaults to the slot capacity)
        #[arg(short, long)]
        capacity: Option<u32>,

        /// Require joiners to present this password
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Join a game and chat over stdin/stdout
    Join {
        /// Game id from `list`
        game_id: String,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// Print the games the lobby advertises
    List,
}

fn build_config(cli: &Cli) -> Result<LobbyConfig> {
    let mut config = LobbyConfig::from_env().context("loading lobby config")?;
    if cli.lobby.is_some() || cli.max_peers.is_some() {
        let address = cli
            .lobby
            .clone()
            .unwrap_or_else(|| config.lobby_url.to_string());
        let max_peers = cli.max_peers.unwrap_or(config.max_peers);
        let overridden = LobbyConfig::new(address, max_peers)?;
        config.lobby_url = overridden.lobby_url;
        config.max_peers = overridden.max_peers;
    }
    Ok(config)
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    debug!(url = %config.lobby_url, max_peers = config.max_peers, "lobby config");
    let backend = WebRtcBackend::from_config(&config)?;
    let lobby = Lobby::new(config, Arc::new(backend));

    match cli.command {
        Commands::Host {
            name,
            capacity,
            password,
        } => host(&lobby, &name, capacity, password.as_deref()).await,
        Commands::Join { game_id, password } => join(&lobby, &game_id, password.as_deref()).await,
        Commands::List => list(&lobby).await,
    }
}

async fn host(lobby: &Lobby, name: &str, capacity: Option<u32>, password: Option<&str>) -> Result<()> {
    let slots = lobby.capacity();
    let capacity = capacity.unwrap_or(slots as u32);
    let game_id = lobby
        .create_server(name, capacity, password)
        .await
        .context("creating game")?;
    println!("hosting '{name}' as {game_id} (ctrl-c to stop)");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = interval(POLL_INTERVAL);
    let mut occupied = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        for index in 0..slots {
            if !lobby.has_peer(index) {
                continue;
            }
            loop {
                match lobby.receive(index).await {
                    Ok(Some(message)) => {
                        println!("[{index}] {}", String::from_utf8_lossy(&message));
                        for other in (0..slots).filter(|other| *other != index) {
                            if lobby.has_peer(other) {
                                // Peers still negotiating miss the line.
                                let _ = lobby.send(other, &message).await;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        println!("peer {index} left");
                        break;
                    }
                }
            }
        }

        let now = lobby.occupied_slots();
        if now != occupied {
            occupied = now;
            info!(occupied, "occupancy changed");
            if let Err(err) = lobby.update_server(name, now as u32, capacity, password) {
                warn!(error = %err, "could not update game info");
            }
        }
    }

    lobby.reset().await;
    Ok(())
}

async fn join(lobby: &Lobby, game_id: &str, password: Option<&str>) -> Result<()> {
    let outcome = lobby.connect_to_server(game_id, password).await;
    if outcome != JoinOutcome::Connected {
        bail!("could not join {game_id}: {outcome:?} (code {})", outcome.code());
    }
    println!("connected to {game_id}; type to send, ctrl-d to leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                lobby.send(0, line.as_bytes()).await.context("sending line")?;
            }
            _ = ticker.tick() => {
                loop {
                    match lobby.receive(0).await {
                        Ok(Some(message)) => println!("{}", String::from_utf8_lossy(&message)),
                        Ok(None) => break,
                        Err(_) => {
                            println!("host closed the session");
                            lobby.reset().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    lobby.reset().await;
    Ok(())
}

async fn list(lobby: &Lobby) -> Result<()> {
    let games = lobby.list_servers().await.context("listing games")?;
    if games.is_empty() {
        println!("no games advertised");
    }
    for game in games {
        let lock = if game.requires_password { " (password)" } else { "" };
        println!(
            "{}  {}  {}/{}{}",
            game.game_id, game.server_name, game.player_amount, game.max_players, lock
        );
    }
    lobby.reset().await;
    Ok(())
}
