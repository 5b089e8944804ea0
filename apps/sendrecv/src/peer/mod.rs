//! The peer connection collaborator.
//!
//! Requests return immediately. Their results, along with everything the
//! connection reports on its own, arrive on the session's event channel as
//! [`PeerEvent`]s, in the order the requests were issued.

mod pump;
mod rtc;

use bytes::Bytes;
use thiserror::Error;

use crate::datachannel::{ChannelEvent, ChannelRole};
use crate::media::{BranchId, MediaKind, SinkHandle};
use crate::protocol::{IceCandidate, SdpKind, SignalingDescription};
use crate::session::EventSender;

pub use rtc::{RtcPeer, RtcSettings};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer setup failed: {0}")]
    Setup(String),
    #[error("peer pipeline already started")]
    AlreadyStarted,
    #[error("no tokio runtime available")]
    NoRuntime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOperation {
    Start,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SdpKind),
    SetRemoteDescription(SdpKind),
    AddIceCandidate,
    ChannelSend(ChannelRole),
    /// A queued media step; names the branch or sink it acted on.
    Media {
        step: &'static str,
        branch: Option<BranchId>,
        sink: Option<SinkHandle>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    NegotiationNeeded,
    OfferCreated(SignalingDescription),
    AnswerCreated(SignalingDescription),
    LocalDescriptionSet(SignalingDescription),
    RemoteDescriptionSet(SdpKind),
    IceCandidate(IceCandidate),
    IceGatheringState(String),
    ConnectionState(String),
    IncomingStream(MediaKind),
    DataChannel {
        role: ChannelRole,
        event: ChannelEvent,
    },
    Failed {
        op: PeerOperation,
        message: String,
    },
}

pub trait PeerConnection: Send {
    /// Builds the connection, its send data channel and the receive-only
    /// video transceiver.
    fn start(&mut self, events: EventSender) -> Result<(), PeerError>;

    fn signaling_state(&self) -> SignalingState;

    fn create_offer(&self);

    fn create_answer(&self);

    fn set_local_description(&self, description: SignalingDescription);

    fn set_remote_description(&self, description: SignalingDescription);

    fn add_ice_candidate(&self, candidate: IceCandidate);

    fn send_channel_text(&self, role: ChannelRole, text: String);

    fn send_channel_data(&self, role: ChannelRole, data: Bytes);

    fn close(&mut self);
}
