use std::path::PathBuf;

use rand::Rng;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SERVER_URL: &str = "wss://127.0.0.1:8443";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("either a peer id to call or our own id to be called on is required")]
    MissingIdentity,
    #[error("a peer id and our own id are mutually exclusive")]
    ConflictingIdentity,
    #[error("invalid server url '{url}': {source}")]
    InvalidServerUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("server url must use ws:// or wss://, got '{0}'")]
    UnsupportedScheme(String),
}

/// Which side of the call we are on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// Call this peer once registered.
    Peer(String),
    /// Register under this id and wait to be called.
    SelfId(String),
}

impl PeerIdentity {
    pub fn from_options(
        peer_id: Option<String>,
        our_id: Option<String>,
    ) -> Result<Self, ConfigError> {
        match (peer_id, our_id) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingIdentity),
            (Some(peer), None) => Ok(PeerIdentity::Peer(peer)),
            (None, Some(ours)) => Ok(PeerIdentity::SelfId(ours)),
            (None, None) => Err(ConfigError::MissingIdentity),
        }
    }

    /// The id sent in `HELLO`: our configured id, or a random number when
    /// we are the caller.
    pub fn registration_id(&self) -> String {
        match self {
            PeerIdentity::SelfId(id) => id.clone(),
            PeerIdentity::Peer(_) => rand::thread_rng().gen_range(10..10_000).to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: Url,
    pub verify_tls: bool,
    pub identity: PeerIdentity,
    pub stun_server: String,
    pub video_pattern: Option<PathBuf>,
    pub audio_tone: Option<PathBuf>,
}

impl Config {
    pub fn new(
        server: &str,
        disable_tls_verification: bool,
        identity: PeerIdentity,
    ) -> Result<Self, ConfigError> {
        let server_url = Url::parse(server).map_err(|source| ConfigError::InvalidServerUrl {
            url: server.to_string(),
            source,
        })?;
        match server_url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
        let local = matches!(server_url.host_str(), Some("localhost" | "127.0.0.1"));
        Ok(Self {
            server_url,
            verify_tls: !(disable_tls_verification || local),
            identity,
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            video_pattern: None,
            audio_tone: None,
        })
    }

    pub fn with_stun_server(mut self, stun_server: impl Into<String>) -> Self {
        self.stun_server = stun_server.into();
        self
    }

    pub fn with_video_pattern(mut self, path: Option<PathBuf>) -> Self {
        self.video_pattern = path;
        self
    }

    pub fn with_audio_tone(mut self, path: Option<PathBuf>) -> Self {
        self.audio_tone = path;
        self
    }
}
