use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::pump::{self, BranchRun, IdlePump, IvfPump, LoopbackPump, MediaPump, OggPump};
use super::{PeerConnection, PeerError, PeerEvent, PeerOperation, SignalingState};
use crate::config::Config;
use crate::datachannel::{ChannelEvent, ChannelRole};
use crate::media::{
    BranchId, MediaBackend, MediaError, MediaKind, MediaSource, SinkHandle, TransceiverDirection,
};
use crate::protocol::{IceCandidate, SdpKind, SignalingDescription};
use crate::session::{Event, EventSender};

const SEND_CHANNEL_LABEL: &str = "channel";
const STREAM_ID: &str = "webrtc-sendrecv";

#[derive(Debug, Clone)]
pub struct RtcSettings {
    pub stun_server: String,
    pub video_pattern: Option<PathBuf>,
    pub audio_tone: Option<PathBuf>,
}

impl From<&Config> for RtcSettings {
    fn from(config: &Config) -> Self {
        Self {
            stun_server: config.stun_server.clone(),
            video_pattern: config.video_pattern.clone(),
            audio_tone: config.audio_tone.clone(),
        }
    }
}

#[derive(Debug)]
enum MediaStep {
    Build {
        branch: BranchId,
        kind: MediaKind,
        source: MediaSource,
    },
    Lock {
        branch: BranchId,
        locked: bool,
    },
    RequestSink {
        kind: MediaKind,
        sink: SinkHandle,
    },
    Link {
        branch: BranchId,
        sink: SinkHandle,
    },
    Sync {
        branch: BranchId,
    },
    Eos {
        branch: BranchId,
    },
    Direction {
        sink: SinkHandle,
        direction: TransceiverDirection,
    },
    Null {
        branch: BranchId,
    },
    Unlink {
        sink: SinkHandle,
    },
    Release {
        sink: SinkHandle,
    },
    Remove {
        branch: BranchId,
    },
}

impl MediaStep {
    fn name(&self) -> &'static str {
        match self {
            MediaStep::Build { .. } => "build_branch",
            MediaStep::Lock { .. } => "set_locked_state",
            MediaStep::RequestSink { .. } => "request_sink",
            MediaStep::Link { .. } => "link",
            MediaStep::Sync { .. } => "sync_state_with_parent",
            MediaStep::Eos { .. } => "send_eos",
            MediaStep::Direction { .. } => "set_transceiver_direction",
            MediaStep::Null { .. } => "set_null_state",
            MediaStep::Unlink { .. } => "unlink",
            MediaStep::Release { .. } => "release_sink",
            MediaStep::Remove { .. } => "remove_branch",
        }
    }

    fn operation(&self) -> PeerOperation {
        let (branch, sink) = match *self {
            MediaStep::Build { branch, .. }
            | MediaStep::Lock { branch, .. }
            | MediaStep::Sync { branch }
            | MediaStep::Eos { branch }
            | MediaStep::Null { branch }
            | MediaStep::Remove { branch } => (Some(branch), None),
            MediaStep::Link { branch, sink } => (Some(branch), Some(sink)),
            MediaStep::RequestSink { sink, .. }
            | MediaStep::Direction { sink, .. }
            | MediaStep::Unlink { sink }
            | MediaStep::Release { sink } => (None, Some(sink)),
        };
        PeerOperation::Media {
            step: self.name(),
            branch,
            sink,
        }
    }
}

enum PeerCommand {
    CreateOffer,
    CreateAnswer,
    SetLocal(SignalingDescription),
    SetRemote(SignalingDescription),
    AddIce(IceCandidate),
    SendText(ChannelRole, String),
    SendData(ChannelRole, Bytes),
    AdoptChannel(ChannelRole, Arc<RTCDataChannel>),
    Media(MediaStep),
    Close,
}

/// State the synchronous trait methods read without waiting on the worker.
#[derive(Default)]
struct Shared {
    pc: OnceLock<Arc<RTCPeerConnection>>,
    directions: Mutex<HashMap<SinkHandle, TransceiverDirection>>,
    branches: Mutex<HashSet<BranchId>>,
    remote_video: Arc<Mutex<Option<Arc<TrackRemote>>>>,
}

/// webrtc-rs peer connection driven by one worker task. Every request is
/// queued to the worker and executed in submission order, so completions
/// reach the session in the order they were requested.
pub struct RtcPeer {
    settings: RtcSettings,
    shared: Arc<Shared>,
    commands: Option<mpsc::UnboundedSender<PeerCommand>>,
    worker: Option<JoinHandle<()>>,
    next_sink: AtomicU64,
}

impl RtcPeer {
    pub fn new(settings: RtcSettings) -> Self {
        Self {
            settings,
            shared: Arc::new(Shared::default()),
            commands: None,
            worker: None,
            next_sink: AtomicU64::new(1),
        }
    }

    fn submit(&self, command: PeerCommand) -> bool {
        match &self.commands {
            Some(commands) => commands.send(command).is_ok(),
            None => false,
        }
    }

    fn submit_media(&self, step: MediaStep) -> Result<(), MediaError> {
        if self.submit(PeerCommand::Media(step)) {
            Ok(())
        } else {
            Err(MediaError::NotStarted)
        }
    }

    fn known_branch(&self, branch: BranchId) -> Result<(), MediaError> {
        if self.shared.branches.lock().contains(&branch) {
            Ok(())
        } else {
            Err(MediaError::UnknownBranch(branch))
        }
    }

    fn known_sink(&self, sink: SinkHandle) -> Result<(), MediaError> {
        if self.shared.directions.lock().contains_key(&sink) {
            Ok(())
        } else {
            Err(MediaError::UnknownSink(sink))
        }
    }
}

impl PeerConnection for RtcPeer {
    fn start(&mut self, events: EventSender) -> Result<(), PeerError> {
        if self.commands.is_some() {
            return Err(PeerError::AlreadyStarted);
        }
        let handle = Handle::try_current().map_err(|_| PeerError::NoRuntime)?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            settings: self.settings.clone(),
            shared: Arc::clone(&self.shared),
            events,
            commands: commands.clone(),
            pc: None,
            channels: HashMap::new(),
            branches: HashMap::new(),
            sinks: HashMap::new(),
        };
        self.worker = Some(handle.spawn(worker.run(commands_rx)));
        self.commands = Some(commands);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.shared.pc.get() {
            Some(pc) => from_rtc_signaling_state(pc.signaling_state()),
            None => SignalingState::Stable,
        }
    }

    fn create_offer(&self) {
        self.submit(PeerCommand::CreateOffer);
    }

    fn create_answer(&self) {
        self.submit(PeerCommand::CreateAnswer);
    }

    fn set_local_description(&self, description: SignalingDescription) {
        self.submit(PeerCommand::SetLocal(description));
    }

    fn set_remote_description(&self, description: SignalingDescription) {
        self.submit(PeerCommand::SetRemote(description));
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) {
        self.submit(PeerCommand::AddIce(candidate));
    }

    fn send_channel_text(&self, role: ChannelRole, text: String) {
        self.submit(PeerCommand::SendText(role, text));
    }

    fn send_channel_data(&self, role: ChannelRole, data: Bytes) {
        self.submit(PeerCommand::SendData(role, data));
    }

    fn close(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(PeerCommand::Close);
        }
    }
}

impl MediaBackend for RtcPeer {
    fn build_branch(
        &self,
        branch: BranchId,
        kind: MediaKind,
        source: MediaSource,
    ) -> Result<(), MediaError> {
        self.submit_media(MediaStep::Build {
            branch,
            kind,
            source,
        })?;
        self.shared.branches.lock().insert(branch);
        Ok(())
    }

    fn set_locked_state(&self, branch: BranchId, locked: bool) -> Result<(), MediaError> {
        self.known_branch(branch)?;
        self.submit_media(MediaStep::Lock { branch, locked })
    }

    fn request_sink(&self, kind: MediaKind) -> Result<SinkHandle, MediaError> {
        let sink = SinkHandle(self.next_sink.fetch_add(1, Ordering::Relaxed));
        self.submit_media(MediaStep::RequestSink { kind, sink })?;
        self.shared
            .directions
            .lock()
            .insert(sink, TransceiverDirection::Recvonly);
        Ok(sink)
    }

    fn link(&self, branch: BranchId, sink: SinkHandle) -> Result<(), MediaError> {
        self.known_branch(branch)?;
        self.known_sink(sink)?;
        self.submit_media(MediaStep::Link { branch, sink })?;
        self.shared
            .directions
            .lock()
            .insert(sink, TransceiverDirection::Sendrecv);
        Ok(())
    }

    fn sync_state_with_parent(&self, branch: BranchId) -> Result<(), MediaError> {
        self.known_branch(branch)?;
        self.submit_media(MediaStep::Sync { branch })
    }

    fn send_eos(&self, branch: BranchId) -> Result<(), MediaError> {
        self.known_branch(branch)?;
        self.submit_media(MediaStep::Eos { branch })
    }

    fn transceiver_direction(&self, sink: SinkHandle) -> Result<TransceiverDirection, MediaError> {
        self.shared
            .directions
            .lock()
            .get(&sink)
            .copied()
            .ok_or(MediaError::UnknownSink(sink))
    }

    fn set_transceiver_direction(
        &self,
        sink: SinkHandle,
        direction: TransceiverDirection,
    ) -> Result<(), MediaError> {
        self.known_sink(sink)?;
        self.submit_media(MediaStep::Direction { sink, direction })?;
        self.shared.directions.lock().insert(sink, direction);
        Ok(())
    }

    fn set_null_state(&self, branch: BranchId) -> Result<(), MediaError> {
        self.known_branch(branch)?;
        self.submit_media(MediaStep::Null { branch })
    }

    fn unlink(&self, branch: BranchId, sink: SinkHandle) -> Result<(), MediaError> {
        self.known_branch(branch)?;
        self.known_sink(sink)?;
        self.submit_media(MediaStep::Unlink { sink })
    }

    fn release_sink(&self, sink: SinkHandle) -> Result<(), MediaError> {
        self.known_sink(sink)?;
        self.submit_media(MediaStep::Release { sink })?;
        self.shared.directions.lock().remove(&sink);
        Ok(())
    }

    fn remove_branch(&self, branch: BranchId) -> Result<(), MediaError> {
        self.known_branch(branch)?;
        self.submit_media(MediaStep::Remove { branch })?;
        self.shared.branches.lock().remove(&branch);
        Ok(())
    }
}

impl Drop for RtcPeer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

struct Branch {
    track: Arc<dyn TrackLocal + Send + Sync>,
    gate: watch::Sender<BranchRun>,
    pump: JoinHandle<()>,
    locked: bool,
    feedback: Option<JoinHandle<()>>,
}

impl Drop for Branch {
    fn drop(&mut self) {
        let _ = self.gate.send(BranchRun::Finished);
        self.pump.abort();
        if let Some(feedback) = self.feedback.take() {
            feedback.abort();
        }
    }
}

struct Worker {
    settings: RtcSettings,
    shared: Arc<Shared>,
    events: EventSender,
    commands: mpsc::UnboundedSender<PeerCommand>,
    pc: Option<Arc<RTCPeerConnection>>,
    channels: HashMap<ChannelRole, Arc<RTCDataChannel>>,
    branches: HashMap<BranchId, Branch>,
    sinks: HashMap<SinkHandle, Arc<RTCRtpTransceiver>>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
        match self.setup().await {
            Ok(pc) => {
                let _ = self.shared.pc.set(Arc::clone(&pc));
                self.pc = Some(pc);
            }
            Err(err) => {
                self.fail(PeerOperation::Start, err);
                return;
            }
        }

        while let Some(command) = commands.recv().await {
            if matches!(command, PeerCommand::Close) {
                break;
            }
            self.handle(command).await;
        }

        self.branches.clear();
        self.channels.clear();
        if let Some(pc) = self.pc.take() {
            if let Err(err) = pc.close().await {
                tracing::debug!(target = "sendrecv::peer", "peer connection close: {err}");
            }
        }
        tracing::debug!(target = "sendrecv::peer", "peer worker stopped");
    }

    fn post(&self, event: PeerEvent) {
        let _ = self.events.send(Event::Peer(event));
    }

    fn fail(&self, op: PeerOperation, err: impl Display) {
        let message = err.to_string();
        tracing::warn!(
            target = "sendrecv::peer",
            op = ?op,
            error = %message,
            "peer operation failed"
        );
        self.post(PeerEvent::Failed { op, message });
    }

    async fn setup(&mut self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.settings.stun_server.clone()],
                ..Default::default()
            }],
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(to_setup_error)?);
        self.register_callbacks(&pc);

        let send_channel = pc
            .create_data_channel(SEND_CHANNEL_LABEL, None)
            .await
            .map_err(to_setup_error)?;
        wire_channel(&send_channel, ChannelRole::Send, &self.events);
        self.channels.insert(ChannelRole::Send, send_channel);

        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(to_setup_error)?;

        tracing::info!(
            target = "sendrecv::peer",
            stun = %self.settings.stun_server,
            "peer connection created"
        );
        Ok(pc)
    }

    fn register_callbacks(&self, pc: &Arc<RTCPeerConnection>) {
        let events = self.events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(Event::Peer(PeerEvent::NegotiationNeeded));
            })
        }));

        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: u32::from(init.sdp_mline_index.unwrap_or(0)),
                        };
                        let _ = events.send(Event::Peer(PeerEvent::IceCandidate(candidate)));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "sendrecv::peer",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let events = self.events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(Event::Peer(PeerEvent::IceGatheringState(state.to_string())));
            })
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(Event::Peer(PeerEvent::ConnectionState(state.to_string())));
            })
        }));

        let events = self.events.clone();
        let commands = self.commands.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = events.clone();
            let commands = commands.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "sendrecv::peer",
                    label = channel.label(),
                    "remote data channel announced"
                );
                wire_channel(&channel, ChannelRole::Receive, &events);
                let _ = commands.send(PeerCommand::AdoptChannel(ChannelRole::Receive, channel));
            })
        }));

        let events = self.events.clone();
        let remote_video = Arc::clone(&self.shared.remote_video);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                let remote_video = Arc::clone(&remote_video);
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        _ => MediaKind::Video,
                    };
                    tracing::info!(
                        target = "sendrecv::peer",
                        kind = kind.as_str(),
                        codec = %track.codec().capability.mime_type,
                        ssrc = track.ssrc(),
                        "incoming stream"
                    );
                    if kind == MediaKind::Video {
                        *remote_video.lock() = Some(track);
                    }
                    let _ = events.send(Event::Peer(PeerEvent::IncomingStream(kind)));
                })
            },
        ));
    }

    fn connection(&self) -> Option<&Arc<RTCPeerConnection>> {
        self.pc.as_ref()
    }

    async fn handle(&mut self, command: PeerCommand) {
        let Some(pc) = self.connection().cloned() else {
            return;
        };
        match command {
            PeerCommand::CreateOffer => match pc.create_offer(None).await {
                Ok(offer) => self.post(PeerEvent::OfferCreated(SignalingDescription::offer(
                    offer.sdp,
                ))),
                Err(err) => self.fail(PeerOperation::CreateOffer, err),
            },
            PeerCommand::CreateAnswer => match pc.create_answer(None).await {
                Ok(answer) => self.post(PeerEvent::AnswerCreated(SignalingDescription::answer(
                    answer.sdp,
                ))),
                Err(err) => self.fail(PeerOperation::CreateAnswer, err),
            },
            PeerCommand::SetLocal(description) => {
                let op = PeerOperation::SetLocalDescription(description.kind);
                let result = match to_rtc_description(&description) {
                    Ok(rtc) => pc.set_local_description(rtc).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(()) => self.post(PeerEvent::LocalDescriptionSet(description)),
                    Err(err) => self.fail(op, err),
                }
            }
            PeerCommand::SetRemote(description) => {
                let kind = description.kind;
                let result = match to_rtc_description(&description) {
                    Ok(rtc) => pc.set_remote_description(rtc).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(()) => self.post(PeerEvent::RemoteDescriptionSet(kind)),
                    Err(err) => self.fail(PeerOperation::SetRemoteDescription(kind), err),
                }
            }
            PeerCommand::AddIce(candidate) => {
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mline_index: u16::try_from(candidate.sdp_mline_index).ok(),
                    ..Default::default()
                };
                if let Err(err) = pc.add_ice_candidate(init).await {
                    self.fail(PeerOperation::AddIceCandidate, err);
                }
            }
            PeerCommand::SendText(role, text) => {
                let Some(channel) = self.channels.get(&role).cloned() else {
                    tracing::debug!(
                        target = "sendrecv::peer",
                        channel = role.as_str(),
                        "no channel for text"
                    );
                    return;
                };
                if let Err(err) = channel.send_text(text).await {
                    self.fail(PeerOperation::ChannelSend(role), err);
                }
            }
            PeerCommand::SendData(role, data) => {
                let Some(channel) = self.channels.get(&role).cloned() else {
                    return;
                };
                if let Err(err) = channel.send(&data).await {
                    self.fail(PeerOperation::ChannelSend(role), err);
                }
            }
            PeerCommand::AdoptChannel(role, channel) => {
                self.channels.insert(role, channel);
            }
            PeerCommand::Media(step) => {
                let op = step.operation();
                if let Err(err) = self.media(&pc, step).await {
                    self.fail(op, err);
                }
            }
            PeerCommand::Close => {}
        }
    }

    async fn media(&mut self, pc: &Arc<RTCPeerConnection>, step: MediaStep) -> Result<(), MediaError> {
        match step {
            MediaStep::Build {
                branch,
                kind,
                source,
            } => {
                let (track, pump) = self.build_source(kind, source);
                let (gate, gate_rx) = watch::channel(BranchRun::Paused);
                let pump = tokio::spawn(pump::drive(pump, gate_rx));
                self.branches.insert(
                    branch,
                    Branch {
                        track,
                        gate,
                        pump,
                        locked: false,
                        feedback: None,
                    },
                );
            }
            MediaStep::Lock { branch, locked } => {
                self.branch_mut(branch)?.locked = locked;
            }
            MediaStep::RequestSink { kind, sink } => {
                let transceiver = self.find_or_add_transceiver(pc, kind).await?;
                self.sinks.insert(sink, transceiver);
            }
            MediaStep::Link { branch, sink } => {
                let transceiver = self.sink(sink)?;
                let sender = transceiver.sender().await;
                let track = Arc::clone(&self.branch_mut(branch)?.track);
                sender
                    .replace_track(Some(track))
                    .await
                    .map_err(|err| MediaError::Pipeline(err.to_string()))?;
                transceiver
                    .set_direction(RTCRtpTransceiverDirection::Sendrecv)
                    .await;
                // RTCP has to be read for the interceptors to run.
                let feedback = tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
                self.branch_mut(branch)?.feedback = Some(feedback);
            }
            MediaStep::Sync { branch } => {
                let entry = self.branch_mut(branch)?;
                if entry.locked {
                    tracing::debug!(
                        target = "sendrecv::media",
                        branch = %branch,
                        "branch locked, not following parent state"
                    );
                } else {
                    let _ = entry.gate.send(BranchRun::Playing);
                }
            }
            MediaStep::Eos { branch } | MediaStep::Null { branch } => {
                let entry = self.branch_mut(branch)?;
                let _ = entry.gate.send(BranchRun::Finished);
            }
            MediaStep::Direction { sink, direction } => {
                self.sink(sink)?
                    .set_direction(to_rtc_direction(direction))
                    .await;
            }
            MediaStep::Unlink { sink } => {
                let sender = self.sink(sink)?.sender().await;
                sender
                    .replace_track(None)
                    .await
                    .map_err(|err| MediaError::Pipeline(err.to_string()))?;
            }
            MediaStep::Release { sink } => {
                self.sinks.remove(&sink);
            }
            MediaStep::Remove { branch } => {
                self.branches.remove(&branch);
            }
        }
        Ok(())
    }

    fn branch_mut(&mut self, branch: BranchId) -> Result<&mut Branch, MediaError> {
        self.branches
            .get_mut(&branch)
            .ok_or(MediaError::UnknownBranch(branch))
    }

    fn sink(&self, sink: SinkHandle) -> Result<Arc<RTCRtpTransceiver>, MediaError> {
        self.sinks
            .get(&sink)
            .cloned()
            .ok_or(MediaError::UnknownSink(sink))
    }

    fn build_source(
        &self,
        kind: MediaKind,
        source: MediaSource,
    ) -> (Arc<dyn TrackLocal + Send + Sync>, Box<dyn MediaPump>) {
        match source {
            MediaSource::TestPattern => {
                let track = sample_track(MIME_TYPE_VP8, 90_000, 0, kind);
                let pump: Box<dyn MediaPump> = match &self.settings.video_pattern {
                    Some(path) => Box::new(IvfPump::new(path.clone(), Arc::clone(&track))),
                    None => Box::new(IdlePump::new("test-pattern")),
                };
                (track, pump)
            }
            MediaSource::Tone => {
                let track = sample_track(MIME_TYPE_OPUS, 48_000, 2, kind);
                let pump: Box<dyn MediaPump> = match &self.settings.audio_tone {
                    Some(path) => Box::new(OggPump::new(path.clone(), Arc::clone(&track))),
                    None => Box::new(IdlePump::new("tone")),
                };
                (track, pump)
            }
            MediaSource::Loopback => {
                let capability = self
                    .shared
                    .remote_video
                    .lock()
                    .as_ref()
                    .map(|remote| remote.codec().capability)
                    .unwrap_or_else(|| RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90_000,
                        ..Default::default()
                    });
                let track = Arc::new(TrackLocalStaticRTP::new(
                    capability,
                    format!("{}-loopback", kind.as_str()),
                    STREAM_ID.to_owned(),
                ));
                let pump = Box::new(LoopbackPump::new(
                    Arc::clone(&self.shared.remote_video),
                    Arc::clone(&track),
                ));
                (track, pump)
            }
        }
    }

    /// Reuses an idle transceiver of the right kind so the existing m-line
    /// is kept, otherwise adds a new one.
    async fn find_or_add_transceiver(
        &self,
        pc: &Arc<RTCPeerConnection>,
        kind: MediaKind,
    ) -> Result<Arc<RTCRtpTransceiver>, MediaError> {
        let codec_type = to_codec_type(kind);
        for transceiver in pc.get_transceivers().await {
            if transceiver.kind() != codec_type {
                continue;
            }
            if self
                .sinks
                .values()
                .any(|taken| Arc::ptr_eq(taken, &transceiver))
            {
                continue;
            }
            if transceiver.sender().await.track().await.is_none() {
                return Ok(transceiver);
            }
        }
        pc.add_transceiver_from_kind(
            codec_type,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendrecv,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|err| MediaError::Pipeline(err.to_string()))
    }
}

fn wire_channel(channel: &Arc<RTCDataChannel>, role: ChannelRole, events: &EventSender) {
    let post = {
        let events = events.clone();
        move |event: ChannelEvent| {
            let _ = events.send(Event::Peer(PeerEvent::DataChannel { role, event }));
        }
    };

    let on_open = post.clone();
    channel.on_open(Box::new(move || {
        on_open(ChannelEvent::Open);
        Box::pin(async {})
    }));

    let on_close = post.clone();
    channel.on_close(Box::new(move || {
        on_close(ChannelEvent::Close);
        Box::pin(async {})
    }));

    let on_error = post.clone();
    channel.on_error(Box::new(move |err: webrtc::Error| {
        on_error(ChannelEvent::Error(err.to_string()));
        Box::pin(async {})
    }));

    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let event = if message.is_string {
            ChannelEvent::Text(String::from_utf8_lossy(&message.data).into_owned())
        } else {
            ChannelEvent::Binary(message.data.len())
        };
        post(event);
        Box::pin(async {})
    }));
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn sample_track(
    mime_type: &str,
    clock_rate: u32,
    channels: u16,
    kind: MediaKind,
) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate,
            channels,
            ..Default::default()
        },
        kind.as_str().to_owned(),
        STREAM_ID.to_owned(),
    ))
}

fn to_rtc_description(
    description: &SignalingDescription,
) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
}

fn to_codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Video => RTPCodecType::Video,
        MediaKind::Audio => RTPCodecType::Audio,
    }
}

fn to_rtc_direction(direction: TransceiverDirection) -> RTCRtpTransceiverDirection {
    match direction {
        TransceiverDirection::Sendrecv => RTCRtpTransceiverDirection::Sendrecv,
        TransceiverDirection::Sendonly => RTCRtpTransceiverDirection::Sendonly,
        TransceiverDirection::Recvonly => RTCRtpTransceiverDirection::Recvonly,
        TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}

fn from_rtc_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn to_setup_error(err: impl Display) -> PeerError {
    PeerError::Setup(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_map_one_to_one() {
        assert_eq!(
            to_rtc_direction(TransceiverDirection::Recvonly),
            RTCRtpTransceiverDirection::Recvonly
        );
        assert_eq!(
            to_rtc_direction(TransceiverDirection::Inactive),
            RTCRtpTransceiverDirection::Inactive
        );
        assert_eq!(to_codec_type(MediaKind::Audio), RTPCodecType::Audio);
    }

    #[test]
    fn unset_signaling_state_is_stable() {
        assert_eq!(
            from_rtc_signaling_state(RTCSignalingState::Unspecified),
            SignalingState::Stable
        );
        assert_eq!(
            from_rtc_signaling_state(RTCSignalingState::HaveRemoteOffer),
            SignalingState::HaveRemoteOffer
        );
    }

    #[test]
    fn media_calls_before_start_report_not_started() {
        let peer = RtcPeer::new(RtcSettings {
            stun_server: crate::config::DEFAULT_STUN_SERVER.into(),
            video_pattern: None,
            audio_tone: None,
        });
        assert!(matches!(
            peer.build_branch(BranchId(1), MediaKind::Video, MediaSource::TestPattern),
            Err(MediaError::NotStarted)
        ));
        assert!(matches!(
            peer.transceiver_direction(SinkHandle(7)),
            Err(MediaError::UnknownSink(SinkHandle(7)))
        ));
        assert_eq!(peer.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let (events, _rx) = crate::session::event_channel();
        let mut peer = RtcPeer::new(RtcSettings {
            stun_server: crate::config::DEFAULT_STUN_SERVER.into(),
            video_pattern: None,
            audio_tone: None,
        });
        peer.start(events.clone()).unwrap();
        assert!(matches!(peer.start(events), Err(PeerError::AlreadyStarted)));
        peer.close();
    }

    #[tokio::test]
    async fn sinks_start_receive_only_and_follow_links() {
        let (events, _rx) = crate::session::event_channel();
        let mut peer = RtcPeer::new(RtcSettings {
            stun_server: crate::config::DEFAULT_STUN_SERVER.into(),
            video_pattern: None,
            audio_tone: None,
        });
        peer.start(events).unwrap();
        peer.build_branch(BranchId(1), MediaKind::Audio, MediaSource::Tone)
            .unwrap();
        let sink = peer.request_sink(MediaKind::Audio).unwrap();
        assert_eq!(
            peer.transceiver_direction(sink).unwrap(),
            TransceiverDirection::Recvonly
        );
        peer.link(BranchId(1), sink).unwrap();
        assert_eq!(
            peer.transceiver_direction(sink).unwrap(),
            TransceiverDirection::Sendrecv
        );
        peer.release_sink(sink).unwrap();
        assert!(peer.transceiver_direction(sink).is_err());
        peer.close();
    }
}
