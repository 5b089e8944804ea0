use tokio::sync::mpsc;

use crate::datachannel::ChannelRole;
use crate::peer::PeerEvent;
use crate::signaling::SignalingEvent;

/// Everything the session loop reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Signaling(SignalingEvent),
    Peer(PeerEvent),
    Heartbeat(ChannelRole),
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

impl From<SignalingEvent> for Event {
    fn from(event: SignalingEvent) -> Self {
        Event::Signaling(event)
    }
}

impl From<PeerEvent> for Event {
    fn from(event: PeerEvent) -> Self {
        Event::Peer(event)
    }
}
