//! Offer/answer handling for the impolite side of perfect negotiation.
//!
//! We only ever track whether an offer of ours is in flight. When a local
//! offer comes back while the connection is no longer `stable`, the remote
//! side won the race and the offer is thrown away. Remote offers that land
//! outside `stable` are ignored rather than rolled back.

use crate::error::SessionError;
use crate::peer::{PeerConnection, SignalingState};
use crate::protocol::{PeerMessage, SdpKind, SignalingDescription};
use crate::session::{Outbound, SessionState, StateMachine};

#[derive(Debug, Default)]
pub struct NegotiationController {
    making_offer: bool,
}

impl NegotiationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn on_negotiation_needed(&mut self, state: &mut StateMachine, peer: &dyn PeerConnection) {
        state.transition(SessionState::PeerNegotiating);
        self.making_offer = true;
        tracing::debug!(target = "sendrecv::negotiation", "creating offer");
        peer.create_offer();
    }

    pub fn on_offer_created(
        &mut self,
        offer: SignalingDescription,
        peer: &dyn PeerConnection,
        out: &Outbound<'_>,
    ) -> Result<(), SessionError> {
        let signaling = peer.signaling_state();
        if signaling != SignalingState::Stable {
            tracing::info!(
                target = "sendrecv::negotiation",
                signaling = ?signaling,
                "glare: remote offer arrived first, dropping our offer"
            );
            self.making_offer = false;
            return Ok(());
        }

        peer.set_local_description(offer.clone());
        let sent = out.send_peer(&PeerMessage::Sdp(offer), "send sdp offer");
        self.making_offer = false;
        sent
    }

    /// Creating the offer failed inside the peer; nothing is in flight now.
    pub fn on_offer_failed(&mut self) {
        self.making_offer = false;
    }

    pub fn on_remote_description(
        &mut self,
        description: SignalingDescription,
        peer: &dyn PeerConnection,
    ) {
        match description.kind {
            SdpKind::Offer => self.on_remote_offer(description, peer),
            SdpKind::Answer => self.on_remote_answer(description, peer),
        }
    }

    fn on_remote_offer(&mut self, offer: SignalingDescription, peer: &dyn PeerConnection) {
        let signaling = peer.signaling_state();
        if signaling != SignalingState::Stable {
            tracing::info!(
                target = "sendrecv::negotiation",
                signaling = ?signaling,
                making_offer = self.making_offer,
                "ignoring remote offer outside stable state"
            );
            return;
        }
        tracing::debug!(target = "sendrecv::negotiation", "applying remote offer");
        peer.set_remote_description(offer);
    }

    fn on_remote_answer(&mut self, answer: SignalingDescription, peer: &dyn PeerConnection) {
        tracing::debug!(target = "sendrecv::negotiation", "applying remote answer");
        peer.set_remote_description(answer);
    }

    pub fn on_remote_description_set(
        &mut self,
        kind: SdpKind,
        state: &mut StateMachine,
        peer: &dyn PeerConnection,
    ) {
        match kind {
            SdpKind::Offer => {
                tracing::debug!(target = "sendrecv::negotiation", "creating answer");
                peer.create_answer();
            }
            SdpKind::Answer => {
                tracing::info!(target = "sendrecv::negotiation", "remote answer applied");
                state.transition(SessionState::PeerCallStarted);
            }
        }
    }

    pub fn on_answer_created(&mut self, answer: SignalingDescription, peer: &dyn PeerConnection) {
        peer.set_local_description(answer);
    }

    /// The answer only goes out once it is our local description.
    pub fn on_local_description_set(
        &mut self,
        description: SignalingDescription,
        state: &mut StateMachine,
        out: &Outbound<'_>,
    ) -> Result<(), SessionError> {
        if description.kind != SdpKind::Answer {
            return Ok(());
        }
        out.send_peer(&PeerMessage::Sdp(description), "send sdp answer")?;
        state.transition(SessionState::PeerCallStarted);
        Ok(())
    }
}
