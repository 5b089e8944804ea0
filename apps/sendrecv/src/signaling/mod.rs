//! Connection to the signaling relay.
//!
//! The session only needs a duplex text pipe: it pushes lines through
//! [`SignalingTransport::send_text`] and receives [`SignalingEvent`]s on its
//! event channel. Closing is asynchronous; the transport posts
//! [`SignalingEvent::Closed`] once the connection is really gone.

mod websocket;

use thiserror::Error;

use crate::protocol::ClientCommand;

pub use websocket::WsSignaling;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("signaling connection closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Text(String),
    /// Binary frames carry nothing in this protocol; only the size is kept.
    Binary(usize),
    Closed { reason: String },
}

pub trait SignalingTransport: Send {
    fn send_text(&self, text: String) -> Result<(), SignalingError>;

    fn is_open(&self) -> bool;

    /// Announces our id to the relay.
    fn register(&self, id: &str) -> Result<(), SignalingError> {
        self.send_text(ClientCommand::Hello(id.to_owned()).to_string())
    }

    /// Asks the relay to pair us with `peer_id`.
    fn request_session(&self, peer_id: &str) -> Result<(), SignalingError> {
        self.send_text(ClientCommand::Session(peer_id.to_owned()).to_string())
    }

    /// Starts a graceful close. Completion is reported as
    /// [`SignalingEvent::Closed`].
    fn close(&mut self);
}
