mod support;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lobby_transport::{
    ChannelError, JoinOutcome, Lobby, LobbyConfig, LobbyError, LobbyMode, LoopbackBackend,
    SignalingError,
};
use serde_json::json;
use support::{StubLobby, StubOptions, eventually, init_tracing, lobby};
use tokio_tungstenite::tungstenite::Message;

async fn next_message(lobby: &Lobby, index: usize) -> Option<Vec<u8>> {
    for _ in 0..500 {
        if let Ok(Some(message)) = lobby.receive(index).await {
            return Some(message.to_vec());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

#[test_timeout::tokio_timeout_test(30)]
async fn joiners_fill_the_game_and_exchange_data() {
    init_tracing();
    let stub = StubLobby::start().await;
    let backend = LoopbackBackend::new();

    let host = lobby(&stub, 2, &backend);
    let game_id = host.create_server("dunes", 2, None).await.expect("create game");
    assert!(host.is_server());
    assert_eq!(host.game_id().as_deref(), Some(game_id.as_str()));

    let first = lobby(&stub, 1, &backend);
    assert_eq!(first.connect_to_server(&game_id, None).await, JoinOutcome::Connected);
    assert!(first.is_connected());
    assert_eq!(first.mode(), LobbyMode::Client);

    let second = lobby(&stub, 1, &backend);
    assert_eq!(second.connect_to_server(&game_id, None).await, JoinOutcome::Connected);

    assert!(eventually(|| host.occupied_slots() == 2).await);

    let third = lobby(&stub, 1, &backend);
    let outcome = third.connect_to_server(&game_id, None).await;
    assert_eq!(outcome, JoinOutcome::Full);
    assert_eq!(outcome.code(), 4);
    assert!(!third.has_peer(0));

    // Both joiners closed their lobby connections once connected; the host
    // keeps their open slots.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(host.has_peer(0));
    assert!(host.has_peer(1));

    first.send(0, b"hello host").await.expect("client send");
    assert_eq!(next_message(&host, 0).await.as_deref(), Some(&b"hello host"[..]));

    host.send(1, b"welcome").await.expect("host send");
    assert_eq!(next_message(&second, 0).await.as_deref(), Some(&b"welcome"[..]));

    first.reset().await;
    assert!(!first.has_peer(0));
    let mut disconnected = false;
    for _ in 0..500 {
        if host.receive(0).await == Err(ChannelError::Disconnected) {
            disconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(disconnected);
    assert!(!host.has_peer(0));
    assert!(host.has_peer(1));
    assert_eq!(host.send(0, b"gone").await, Err(ChannelError::NotReady));
}

#[test_timeout::tokio_timeout_test(30)]
async fn wrong_password_is_reported() {
    init_tracing();
    let stub = StubLobby::start().await;
    let backend = LoopbackBackend::new();

    let host = lobby(&stub, 2, &backend);
    let game_id = host
        .create_server("vault", 2, Some("sesame"))
        .await
        .expect("create game");

    let guest = lobby(&stub, 1, &backend);
    let outcome = guest.connect_to_server(&game_id, Some("nope")).await;
    assert_eq!(outcome, JoinOutcome::WrongPassword);
    assert_eq!(outcome.code(), 5);
    assert_eq!(
        guest.connect_to_server(&game_id, None).await,
        JoinOutcome::WrongPassword
    );
    assert_eq!(host.occupied_slots(), 0);

    assert_eq!(
        guest.connect_to_server(&game_id, Some("sesame")).await,
        JoinOutcome::Connected
    );
}

#[test_timeout::tokio_timeout_test(30)]
async fn capacity_is_checked_before_the_password() {
    init_tracing();
    let stub = StubLobby::start().await;
    let backend = LoopbackBackend::new();

    let host = lobby(&stub, 1, &backend);
    let game_id = host
        .create_server("solo", 1, Some("sesame"))
        .await
        .expect("create game");

    let first = lobby(&stub, 1, &backend);
    assert_eq!(
        first.connect_to_server(&game_id, Some("sesame")).await,
        JoinOutcome::Connected
    );

    let late = lobby(&stub, 1, &backend);
    assert_eq!(
        late.connect_to_server(&game_id, Some("sesame")).await,
        JoinOutcome::Full
    );
    assert_eq!(
        late.connect_to_server(&game_id, Some("nope")).await,
        JoinOutcome::Full
    );
}

#[test_timeout::tokio_timeout_test(30)]
async fn listing_reflects_created_and_updated_games() {
    init_tracing();
    let stub = StubLobby::start().await;
    let backend = LoopbackBackend::new();

    let host = lobby(&stub, 3, &backend);
    let game_id = host
        .create_server("dunes", 3, Some("sesame"))
        .await
        .expect("create game");

    let browser = lobby(&stub, 1, &backend);
    let games = browser.list_servers().await.expect("list games");
    let game = games
        .iter()
        .find(|game| game.game_id == game_id)
        .expect("listed game");
    assert_eq!(game.server_name, "dunes");
    assert_eq!(game.player_amount, 0);
    assert_eq!(game.max_players, 3);
    assert!(game.requires_password);
    assert_eq!(browser.games(), games);

    host.update_server("dunes", 1, 3, None).expect("update game");
    let mut encoded = String::new();
    for _ in 0..100 {
        encoded = browser.list_servers_encoded().await.expect("list games");
        if encoded.ends_with("false") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(encoded, format!("{game_id};dunes;1;3;false"));
}

#[test_timeout::tokio_timeout_test(30)]
async fn update_requires_hosting() {
    let stub = StubLobby::start().await;
    let backend = LoopbackBackend::new();
    let idle = lobby(&stub, 1, &backend);
    assert!(matches!(
        idle.update_server("dunes", 0, 2, None),
        Err(LobbyError::NotHosting)
    ));
}

#[test_timeout::tokio_timeout_test(30)]
async fn unknown_game_fails_the_join() {
    init_tracing();
    let stub = StubLobby::start().await;
    let backend = LoopbackBackend::new();

    let guest = lobby(&stub, 1, &backend);
    let outcome = guest.connect_to_server("missing", None).await;
    assert!(matches!(outcome, JoinOutcome::Failed(_)), "{outcome:?}");
    assert_eq!(outcome.code(), 1);
    assert!(!guest.is_connected());
    assert_eq!(guest.mode(), LobbyMode::None);
}

#[test_timeout::tokio_timeout_test(30)]
async fn reset_during_a_join_leaves_the_lobby_unattached() {
    init_tracing();
    let stub = StubLobby::start().await;
    let backend = LoopbackBackend::new();

    // A host that announces a game and never answers join requests.
    let (mut host_ws, _) = tokio_tungstenite::connect_async(stub.url.as_str())
        .await
        .expect("raw host connection");
    let create = json!({
        "type": "createGame",
        "serverName": "mute",
        "maxPlayers": 2,
        "requiresPassword": false,
    });
    host_ws
        .send(Message::Text(create.to_string()))
        .await
        .expect("send createGame");
    let game_id = loop {
        let Some(Ok(Message::Text(text))) = host_ws.next().await else {
            panic!("lobby closed before gameCreated");
        };
        let reply: serde_json::Value = serde_json::from_str(&text).expect("lobby json");
        if reply["type"] == "gameCreated" {
            break reply["gameId"].as_str().expect("game id").to_string();
        }
    };

    let guest = lobby(&stub, 1, &backend);
    let joiner = guest.clone();
    let join = tokio::spawn(async move { joiner.connect_to_server(&game_id, None).await });

    assert!(eventually(|| guest.mode() == LobbyMode::Client).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    guest.reset().await;

    let outcome = join.await.expect("join task");
    assert!(matches!(outcome, JoinOutcome::Failed(_)), "{outcome:?}");
    assert_eq!(guest.mode(), LobbyMode::None);
    assert!(!guest.has_peer(0));
}

#[test_timeout::tokio_timeout_test(30)]
async fn create_times_out_when_the_lobby_is_silent() {
    init_tracing();
    let stub = StubLobby::start_with(StubOptions {
        ignore_create: true,
    })
    .await;
    let backend = LoopbackBackend::new();
    let config = LobbyConfig::new(&stub.url, 2)
        .expect("lobby config")
        .with_timeouts(Duration::from_millis(200));
    let host = Lobby::new(config, std::sync::Arc::new(backend));

    let err = host
        .create_server("dunes", 2, None)
        .await
        .expect_err("no gameCreated");
    assert!(matches!(
        err,
        LobbyError::Signaling(SignalingError::Timeout(_))
    ));
    assert_eq!(err.code(), 1);
    assert!(!host.is_server());
    assert_eq!(host.game_id(), None);
}

#[test_timeout::tokio_timeout_test(30)]
async fn unreachable_lobby_fails_fast() {
    init_tracing();
    let config = LobbyConfig::new("127.0.0.1:1", 1)
        .expect("lobby config")
        .with_timeouts(Duration::from_secs(2));
    let guest = Lobby::new(config, std::sync::Arc::new(LoopbackBackend::new()));

    assert!(matches!(
        guest.connect_to_lobby().await,
        Err(LobbyError::Signaling(SignalingError::Connection(_)))
    ));
    assert_eq!(guest.connect_to_server("any", None).await.code(), 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn vanished_joiner_frees_its_pending_slot() {
    init_tracing();
    let stub = StubLobby::start().await;
    let backend = LoopbackBackend::new();

    let host = lobby(&stub, 2, &backend);
    let game_id = host.create_server("dunes", 2, None).await.expect("create game");

    // A joiner that accepts but never answers the offer.
    let (mut ws, _) = tokio_tungstenite::connect_async(stub.url.as_str())
        .await
        .expect("raw lobby connection");
    let join = json!({ "type": "joinGame", "gameId": game_id });
    ws.send(Message::Text(join.to_string()))
        .await
        .expect("send joinGame");
    loop {
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("lobby closed before acceptJoin");
        };
        if text.contains("acceptJoin") {
            break;
        }
    }

    assert!(eventually(|| host.has_peer(0)).await);
    ws.close(None).await.expect("close raw connection");
    drop(ws);

    assert!(eventually(|| !host.has_peer(0)).await);
    assert!(host.is_server());
}
