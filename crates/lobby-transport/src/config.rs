use std::env;
use std::time::Duration;

use url::Url;

use crate::error::LobbyError;

pub const DEFAULT_LOBBY_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_MAX_PEERS: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Lobby client configuration.
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Websocket address of the rendezvous lobby.
    pub lobby_url: Url,
    /// Capacity of the peer slot table.
    pub max_peers: usize,
    pub connect_timeout: Duration,
    pub create_timeout: Duration,
    pub join_timeout: Duration,
    pub list_timeout: Duration,
    /// ICE server URLs handed to the WebRTC backend.
    pub ice_servers: Vec<String>,
}

impl LobbyConfig {
    pub fn new(lobby_address: impl AsRef<str>, max_peers: usize) -> Result<Self, LobbyError> {
        if max_peers == 0 {
            return Err(LobbyError::InvalidConfig(
                "max_peers must be at least 1".into(),
            ));
        }
        Ok(Self {
            lobby_url: normalize_lobby_url(lobby_address.as_ref())?,
            max_peers,
            connect_timeout: DEFAULT_TIMEOUT,
            create_timeout: DEFAULT_TIMEOUT,
            join_timeout: DEFAULT_TIMEOUT,
            list_timeout: DEFAULT_TIMEOUT,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        })
    }

    /// Load configuration from `BEACH_LOBBY_*` / `BEACH_WEBRTC_*` variables.
    pub fn from_env() -> Result<Self, LobbyError> {
        let address = env_string("BEACH_LOBBY_URL").unwrap_or_else(|| DEFAULT_LOBBY_URL.into());
        let max_peers = env_parse("BEACH_LOBBY_MAX_PEERS").unwrap_or(DEFAULT_MAX_PEERS);
        let mut config = Self::new(address, max_peers)?;

        if let Some(ms) = env_parse::<u64>("BEACH_LOBBY_TIMEOUT_MS") {
            config = config.with_timeouts(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("BEACH_LOBBY_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("BEACH_LOBBY_JOIN_TIMEOUT_MS") {
            config.join_timeout = Duration::from_millis(ms);
        }

        if let Some(servers) = env_string("BEACH_WEBRTC_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if env_truthy("BEACH_WEBRTC_DISABLE_STUN") {
            config.ice_servers.retain(|server| !server.starts_with("stun:"));
        }
        Ok(config)
    }

    /// Apply one timeout to every flow.
    pub fn with_timeouts(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.create_timeout = timeout;
        self.join_timeout = timeout;
        self.list_timeout = timeout;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }
}

/// Accepts `host:port`, `ws(s)://` and `http(s)://` forms.
pub fn normalize_lobby_url(address: &str) -> Result<Url, LobbyError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(LobbyError::InvalidConfig(
            "lobby address cannot be empty".into(),
        ));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|err| LobbyError::InvalidConfig(format!("invalid lobby url {trimmed}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(LobbyError::InvalidConfig(format!(
                "unsupported lobby scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| LobbyError::InvalidConfig("invalid websocket scheme".into()))?;
    Ok(url)
}

fn env_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env_string(var).and_then(|value| value.parse().ok())
}

fn env_truthy(var: &str) -> bool {
    env_string(var)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
