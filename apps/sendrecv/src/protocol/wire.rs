use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;
use webrtc::sdp::description::session::SessionDescription;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized message: {0}")]
    Unrecognized(String),
    #[error("invalid sdp: {0}")]
    InvalidSdp(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An offer or answer as carried on the wire. The blob is opaque here; use
/// [`SignalingDescription::validate`] before handing it to the peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalingDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SignalingDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn validate(&self) -> Result<(), WireError> {
        let mut reader = Cursor::new(self.sdp.as_bytes());
        SessionDescription::unmarshal(&mut reader)
            .map(|_| ())
            .map_err(|err| WireError::InvalidSdp(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u32,
}

/// JSON messages exchanged with the remote peer through the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeerMessage {
    Sdp(SignalingDescription),
    Ice(IceCandidate),
}

impl PeerMessage {
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, WireError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let known = value
            .as_object()
            .is_some_and(|map| map.contains_key("sdp") || map.contains_key("ice"));
        if !known {
            return Err(WireError::Unrecognized(text.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Plaintext lines the client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Hello(String),
    Session(String),
}

impl fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCommand::Hello(id) => write!(f, "HELLO {id}"),
            ClientCommand::Session(peer) => write!(f, "SESSION {peer}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Hello,
    SessionOk,
    OfferRequest,
    /// Any line starting with `ERROR`, kept verbatim.
    Error(String),
    Peer(PeerMessage),
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, WireError> {
        match text {
            "HELLO" => Ok(ServerMessage::Hello),
            "SESSION_OK" => Ok(ServerMessage::SessionOk),
            "OFFER_REQUEST" => Ok(ServerMessage::OfferRequest),
            other if other.starts_with("ERROR") => Ok(ServerMessage::Error(other.to_string())),
            other => PeerMessage::from_json(other).map(ServerMessage::Peer),
        }
    }
}
