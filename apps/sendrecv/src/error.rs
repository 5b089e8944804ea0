use thiserror::Error;

use crate::config::ConfigError;
use crate::media::MediaError;
use crate::peer::PeerError;
use crate::protocol::WireError;
use crate::session::SessionState;
use crate::signaling::SignalingError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {action} while {state}")]
    AppStateViolation {
        action: &'static str,
        state: SessionState,
    },
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
