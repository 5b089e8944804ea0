pub mod wire;

pub use wire::{
    ClientCommand, IceCandidate, PeerMessage, SdpKind, ServerMessage, SignalingDescription,
    WireError,
};
