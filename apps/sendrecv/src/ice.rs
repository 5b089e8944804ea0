use crate::error::SessionError;
use crate::peer::PeerConnection;
use crate::protocol::{IceCandidate, PeerMessage};
use crate::session::Outbound;

/// Trickle ICE in both directions. Candidates are never batched or
/// reordered; remote ones are applied whatever the negotiation phase.
#[derive(Debug, Default)]
pub struct IceRelay {
    sent: u64,
    applied: u64,
}

impl IceRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn on_local_candidate(
        &mut self,
        candidate: IceCandidate,
        out: &Outbound<'_>,
    ) -> Result<(), SessionError> {
        let mline = candidate.sdp_mline_index;
        out.send_peer(&PeerMessage::Ice(candidate), "send ice candidate")?;
        self.sent += 1;
        tracing::trace!(
            target = "sendrecv::ice",
            mline,
            sent = self.sent,
            "local candidate sent"
        );
        Ok(())
    }

    pub fn on_remote_candidate(&mut self, candidate: IceCandidate, peer: &dyn PeerConnection) {
        tracing::trace!(
            target = "sendrecv::ice",
            mline = candidate.sdp_mline_index,
            "applying remote candidate"
        );
        peer.add_ice_candidate(candidate);
        self.applied += 1;
    }
}
