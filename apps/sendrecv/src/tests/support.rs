//! In-memory collaborators for driving the session without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::datachannel::ChannelRole;
use crate::media::{
    BranchId, MediaBackend, MediaError, MediaKind, MediaSource, SinkHandle, TransceiverDirection,
};
use crate::peer::{PeerConnection, PeerError, SignalingState};
use crate::protocol::{IceCandidate, SignalingDescription};
use crate::session::{Event, EventSender};
use crate::signaling::{SignalingError, SignalingEvent, SignalingTransport};

pub(crate) const OFFER_SDP: &str =
    "v=0\r\no=- 4215775240449105457 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
pub(crate) const ANSWER_SDP: &str =
    "v=0\r\no=- 7011567347389803928 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

#[derive(Default)]
struct BackendState {
    calls: Vec<String>,
    directions: HashMap<SinkHandle, TransceiverDirection>,
    next_sink: u64,
    failing: Option<&'static str>,
}

/// Records every branch operation as a line such as `link branch#1 sink#1`.
#[derive(Clone, Default)]
pub(crate) struct RecordingBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl RecordingBackend {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().calls.clear();
    }

    pub(crate) fn force_direction(&self, sink: SinkHandle, direction: TransceiverDirection) {
        self.inner.lock().directions.insert(sink, direction);
    }

    /// Makes the named operation fail from now on.
    pub(crate) fn fail_on(&self, operation: &'static str) {
        self.inner.lock().failing = Some(operation);
    }

    fn record(&self, operation: &'static str, detail: String) -> Result<(), MediaError> {
        let mut state = self.inner.lock();
        state.calls.push(format!("{operation} {detail}"));
        if state.failing == Some(operation) {
            return Err(MediaError::Pipeline(format!("{operation} refused")));
        }
        Ok(())
    }
}

impl MediaBackend for RecordingBackend {
    fn build_branch(
        &self,
        branch: BranchId,
        kind: MediaKind,
        source: MediaSource,
    ) -> Result<(), MediaError> {
        self.record(
            "build_branch",
            format!("{branch} {} {}", kind.as_str(), source.as_str()),
        )
    }

    fn set_locked_state(&self, branch: BranchId, locked: bool) -> Result<(), MediaError> {
        self.record("set_locked_state", format!("{branch} {locked}"))
    }

    fn request_sink(&self, kind: MediaKind) -> Result<SinkHandle, MediaError> {
        self.record("request_sink", kind.as_str().to_string())?;
        let mut state = self.inner.lock();
        state.next_sink += 1;
        let sink = SinkHandle(state.next_sink);
        state.directions.insert(sink, TransceiverDirection::Recvonly);
        Ok(sink)
    }

    fn link(&self, branch: BranchId, sink: SinkHandle) -> Result<(), MediaError> {
        self.record("link", format!("{branch} {sink}"))?;
        self.inner
            .lock()
            .directions
            .insert(sink, TransceiverDirection::Sendrecv);
        Ok(())
    }

    fn sync_state_with_parent(&self, branch: BranchId) -> Result<(), MediaError> {
        self.record("sync_state_with_parent", branch.to_string())
    }

    fn send_eos(&self, branch: BranchId) -> Result<(), MediaError> {
        self.record("send_eos", branch.to_string())
    }

    fn transceiver_direction(&self, sink: SinkHandle) -> Result<TransceiverDirection, MediaError> {
        self.record("transceiver_direction", sink.to_string())?;
        self.inner
            .lock()
            .directions
            .get(&sink)
            .copied()
            .ok_or(MediaError::UnknownSink(sink))
    }

    fn set_transceiver_direction(
        &self,
        sink: SinkHandle,
        direction: TransceiverDirection,
    ) -> Result<(), MediaError> {
        self.record("set_transceiver_direction", format!("{sink} {direction:?}"))?;
        self.inner.lock().directions.insert(sink, direction);
        Ok(())
    }

    fn set_null_state(&self, branch: BranchId) -> Result<(), MediaError> {
        self.record("set_null_state", branch.to_string())
    }

    fn unlink(&self, branch: BranchId, sink: SinkHandle) -> Result<(), MediaError> {
        self.record("unlink", format!("{branch} {sink}"))
    }

    fn release_sink(&self, sink: SinkHandle) -> Result<(), MediaError> {
        self.record("release_sink", sink.to_string())?;
        self.inner.lock().directions.remove(&sink);
        Ok(())
    }

    fn remove_branch(&self, branch: BranchId) -> Result<(), MediaError> {
        self.record("remove_branch", branch.to_string())
    }
}

struct PeerState {
    calls: Vec<String>,
    signaling: SignalingState,
    fail_start: bool,
}

/// A peer connection that only records requests. Tests post the
/// completions themselves, which lets them interleave events at will.
#[derive(Clone)]
pub(crate) struct FakePeer {
    inner: Arc<Mutex<PeerState>>,
    pub(crate) media: RecordingBackend,
}

impl Default for FakePeer {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PeerState {
                calls: Vec::new(),
                signaling: SignalingState::Stable,
                fail_start: false,
            })),
            media: RecordingBackend::default(),
        }
    }
}

impl FakePeer {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub(crate) fn set_signaling_state(&self, state: SignalingState) {
        self.inner.lock().signaling = state;
    }

    pub(crate) fn fail_start(&self) {
        self.inner.lock().fail_start = true;
    }

    fn record(&self, call: String) {
        self.inner.lock().calls.push(call);
    }
}

impl PeerConnection for FakePeer {
    fn start(&mut self, _events: EventSender) -> Result<(), PeerError> {
        self.record(String::from("start"));
        if self.inner.lock().fail_start {
            return Err(PeerError::Setup(String::from("no codecs")));
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().signaling
    }

    fn create_offer(&self) {
        self.record(String::from("create_offer"));
    }

    fn create_answer(&self) {
        self.record(String::from("create_answer"));
    }

    fn set_local_description(&self, description: SignalingDescription) {
        self.record(format!("set_local_description {}", description.kind));
    }

    fn set_remote_description(&self, description: SignalingDescription) {
        self.record(format!("set_remote_description {}", description.kind));
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) {
        self.record(format!("add_ice_candidate {}", candidate.sdp_mline_index));
    }

    fn send_channel_text(&self, role: ChannelRole, text: String) {
        self.record(format!("send_channel_text {} {text}", role.as_str()));
    }

    fn send_channel_data(&self, role: ChannelRole, data: Bytes) {
        self.record(format!("send_channel_data {} {}", role.as_str(), data.len()));
    }

    fn close(&mut self) {
        self.record(String::from("close"));
    }
}

impl MediaBackend for FakePeer {
    fn build_branch(
        &self,
        branch: BranchId,
        kind: MediaKind,
        source: MediaSource,
    ) -> Result<(), MediaError> {
        self.media.build_branch(branch, kind, source)
    }

    fn set_locked_state(&self, branch: BranchId, locked: bool) -> Result<(), MediaError> {
        self.media.set_locked_state(branch, locked)
    }

    fn request_sink(&self, kind: MediaKind) -> Result<SinkHandle, MediaError> {
        self.media.request_sink(kind)
    }

    fn link(&self, branch: BranchId, sink: SinkHandle) -> Result<(), MediaError> {
        self.media.link(branch, sink)
    }

    fn sync_state_with_parent(&self, branch: BranchId) -> Result<(), MediaError> {
        self.media.sync_state_with_parent(branch)
    }

    fn send_eos(&self, branch: BranchId) -> Result<(), MediaError> {
        self.media.send_eos(branch)
    }

    fn transceiver_direction(&self, sink: SinkHandle) -> Result<TransceiverDirection, MediaError> {
        self.media.transceiver_direction(sink)
    }

    fn set_transceiver_direction(
        &self,
        sink: SinkHandle,
        direction: TransceiverDirection,
    ) -> Result<(), MediaError> {
        self.media.set_transceiver_direction(sink, direction)
    }

    fn set_null_state(&self, branch: BranchId) -> Result<(), MediaError> {
        self.media.set_null_state(branch)
    }

    fn unlink(&self, branch: BranchId, sink: SinkHandle) -> Result<(), MediaError> {
        self.media.unlink(branch, sink)
    }

    fn release_sink(&self, sink: SinkHandle) -> Result<(), MediaError> {
        self.media.release_sink(sink)
    }

    fn remove_branch(&self, branch: BranchId) -> Result<(), MediaError> {
        self.media.remove_branch(branch)
    }
}

/// Relay connection kept in memory. Clones share state, so a test can
/// hand one to the session and inspect the other.
#[derive(Clone)]
pub(crate) struct MockSignaling {
    sent: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    close_events: Option<EventSender>,
}

impl MockSignaling {
    pub(crate) fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(AtomicBool::new(true)),
            closes: Arc::new(AtomicUsize::new(0)),
            close_events: None,
        }
    }

    /// Acknowledges a close by posting `Closed` on `events`, like a relay
    /// that completes the handshake.
    pub(crate) fn acknowledging(events: EventSender) -> Self {
        Self {
            close_events: Some(events),
            ..Self::new()
        }
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub(crate) fn last_sent(&self) -> Option<String> {
        self.sent.lock().last().cloned()
    }

    pub(crate) fn close_requests(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl SignalingTransport for MockSignaling {
    fn send_text(&self, text: String) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::ChannelClosed);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(events) = &self.close_events {
            let _ = events.send(Event::Signaling(SignalingEvent::Closed {
                reason: String::from("closed by client"),
            }));
        }
    }
}
