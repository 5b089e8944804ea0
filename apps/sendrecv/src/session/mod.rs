//! The session loop.
//!
//! One task owns every piece of mutable session state and reacts to
//! [`Event`]s in arrival order. Collaborators never call back into the
//! session; they post events. Media commands coming from the data channel
//! are queued and run at the top of the next iteration.

mod event;
mod state;

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use crate::config::PeerIdentity;
use crate::datachannel::{ChannelOutcome, ChannelRole, DataChannelController, PING_PAYLOAD};
use crate::error::SessionError;
use crate::ice::IceRelay;
use crate::media::{MediaAttachmentManager, MediaBackend, MediaCommand};
use crate::negotiation::NegotiationController;
use crate::peer::{PeerConnection, PeerEvent, PeerOperation};
use crate::protocol::{PeerMessage, ServerMessage, SignalingDescription};
use crate::signaling::{SignalingError, SignalingEvent, SignalingTransport};

pub use event::{Event, EventReceiver, EventSender, event_channel};
pub use state::{SessionState, StateMachine};

/// How long a shutdown waits for the relay to acknowledge the close.
pub const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredTask {
    CreateOffer,
    Media(MediaCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopPhase {
    Running,
    Draining { deadline: Instant },
    Stopped,
}

/// What the session sends through the relay to the remote peer. Holds a
/// snapshot of the state so SDP and ICE are refused before negotiation.
pub struct Outbound<'a> {
    state: SessionState,
    transport: Option<&'a dyn SignalingTransport>,
}

impl<'a> Outbound<'a> {
    pub fn new(state: SessionState, transport: Option<&'a dyn SignalingTransport>) -> Self {
        Self { state, transport }
    }

    pub fn send_peer(
        &self,
        message: &PeerMessage,
        action: &'static str,
    ) -> Result<(), SessionError> {
        if !self.state.permits_peer_signaling() {
            return Err(SessionError::AppStateViolation {
                action,
                state: self.state,
            });
        }
        let text = message.to_json()?;
        let transport = self.transport.ok_or(SignalingError::ChannelClosed)?;
        transport.send_text(text)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub state: SessionState,
    pub reason: String,
    pub reached_call: bool,
    pub history: Vec<SessionState>,
}

impl SessionReport {
    /// A call was set up and nothing went wrong on the way out.
    pub fn succeeded(&self) -> bool {
        self.reached_call && !self.state.is_error()
    }

    pub fn exit_code(&self) -> u8 {
        if self.succeeded() { 0 } else { 1 }
    }
}

pub struct Session<P> {
    identity: PeerIdentity,
    state: StateMachine,
    transport: Option<Box<dyn SignalingTransport>>,
    peer: P,
    pipeline_started: bool,
    negotiation: NegotiationController,
    ice: IceRelay,
    channels: DataChannelController,
    media: MediaAttachmentManager,
    deferred: VecDeque<DeferredTask>,
    events: EventSender,
    phase: LoopPhase,
    termination: Option<String>,
    drain_grace: Duration,
}

impl<P> Session<P>
where
    P: PeerConnection + MediaBackend,
{
    pub fn new(identity: PeerIdentity, peer: P, events: EventSender) -> Self {
        Self {
            identity,
            state: StateMachine::new(),
            transport: None,
            peer,
            pipeline_started: false,
            negotiation: NegotiationController::new(),
            ice: IceRelay::new(),
            channels: DataChannelController::new(events.clone()),
            media: MediaAttachmentManager::new(),
            deferred: VecDeque::new(),
            events,
            phase: LoopPhase::Running,
            termination: None,
            drain_grace: DRAIN_GRACE,
        }
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn history(&self) -> &[SessionState] {
        self.state.history()
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    pub fn negotiation(&self) -> &NegotiationController {
        &self.negotiation
    }

    pub fn ice(&self) -> &IceRelay {
        &self.ice
    }

    pub fn channels(&self) -> &DataChannelController {
        &self.channels
    }

    pub fn media(&self) -> &MediaAttachmentManager {
        &self.media
    }

    pub fn deferred(&self) -> &VecDeque<DeferredTask> {
        &self.deferred
    }

    pub fn pipeline_started(&self) -> bool {
        self.pipeline_started
    }

    pub fn is_running(&self) -> bool {
        self.phase == LoopPhase::Running
    }

    pub fn is_draining(&self) -> bool {
        matches!(self.phase, LoopPhase::Draining { .. })
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == LoopPhase::Stopped
    }

    pub fn termination_reason(&self) -> Option<&str> {
        self.termination.as_deref()
    }

    pub fn connecting(&mut self) {
        self.state.transition(SessionState::ServerConnecting);
    }

    pub fn connection_failed(&mut self, err: SignalingError) {
        self.shutdown(
            format!("ERROR: Failed to connect to server: {err}"),
            Some(SessionState::ServerConnectionError),
        );
    }

    /// Takes ownership of a freshly opened transport and registers with it.
    pub fn connected(&mut self, transport: Box<dyn SignalingTransport>) {
        self.transport = Some(transport);
        self.state.transition(SessionState::ServerConnected);
        tracing::info!(target = "sendrecv::session", "connected to signaling server");
        self.register();
    }

    fn register(&mut self) {
        let id = self.identity.registration_id();
        self.state.transition(SessionState::ServerRegistering);
        tracing::info!(target = "sendrecv::session", id = %id, "registering with server");
        let result = match self.transport.as_deref() {
            Some(transport) => transport.register(&id),
            None => Err(SignalingError::ChannelClosed),
        };
        if let Err(err) = result {
            self.shutdown(
                format!("ERROR: Failed to register with server: {err}"),
                Some(SessionState::ServerRegistrationError),
            );
        }
    }

    pub async fn run(&mut self, events: &mut EventReceiver) -> SessionReport {
        loop {
            self.run_pending();
            match self.phase {
                LoopPhase::Stopped => break,
                LoopPhase::Running => {
                    let next = if self.deferred.is_empty() {
                        events.recv().await
                    } else {
                        match events.try_recv() {
                            Ok(event) => Some(event),
                            Err(TryRecvError::Empty) => continue,
                            Err(TryRecvError::Disconnected) => None,
                        }
                    };
                    match next {
                        Some(event) => self.dispatch(event),
                        None => {
                            self.shutdown("event channel closed", Some(SessionState::Error))
                        }
                    }
                }
                LoopPhase::Draining { deadline } => {
                    match tokio::time::timeout_at(deadline, events.recv()).await {
                        Ok(Some(event)) => self.dispatch(event),
                        Ok(None) | Err(_) => {
                            tracing::debug!(
                                target = "sendrecv::session",
                                "no close acknowledgement from server, stopping"
                            );
                            self.transport = None;
                            self.phase = LoopPhase::Stopped;
                        }
                    }
                }
            }
        }
        self.report()
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            state: self.state.current(),
            reason: self
                .termination
                .clone()
                .unwrap_or_else(|| String::from("session still running")),
            reached_call: self.state.reached_call(),
            history: self.state.history().to_vec(),
        }
    }

    /// Runs the tasks queued before this call. Anything they queue waits
    /// for the next iteration.
    pub fn run_pending(&mut self) {
        let batch: Vec<DeferredTask> = self.deferred.drain(..).collect();
        for task in batch {
            if !self.is_running() {
                break;
            }
            self.run_deferred(task);
        }
    }

    fn run_deferred(&mut self, task: DeferredTask) {
        match task {
            DeferredTask::CreateOffer => {
                self.negotiation
                    .on_negotiation_needed(&mut self.state, &self.peer);
            }
            DeferredTask::Media(command) => {
                if !self.pipeline_started {
                    tracing::warn!(
                        target = "sendrecv::session",
                        command = ?command,
                        "media command before pipeline start, ignoring"
                    );
                    return;
                }
                if let Err(err) = self.media.apply(command, &self.peer) {
                    tracing::warn!(
                        target = "sendrecv::session",
                        command = ?command,
                        error = %err,
                        "media command failed"
                    );
                }
            }
        }
    }

    pub fn dispatch(&mut self, event: Event) {
        if !self.is_running() {
            match event {
                Event::Signaling(SignalingEvent::Closed { reason }) => {
                    self.on_transport_closed(reason)
                }
                other => tracing::trace!(
                    target = "sendrecv::session",
                    event = ?other,
                    "dropping event during shutdown"
                ),
            }
            return;
        }

        match event {
            Event::Signaling(SignalingEvent::Text(text)) => self.on_server_text(&text),
            Event::Signaling(SignalingEvent::Binary(len)) => tracing::debug!(
                target = "sendrecv::signaling",
                len,
                "ignoring binary message from server"
            ),
            Event::Signaling(SignalingEvent::Closed { reason }) => {
                self.on_transport_closed(reason)
            }
            Event::Peer(event) => self.on_peer_event(event),
            Event::Heartbeat(role) => self.on_heartbeat(role),
        }
    }

    fn on_server_text(&mut self, text: &str) {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    target = "sendrecv::signaling",
                    error = %err,
                    "dropping server message"
                );
                return;
            }
        };

        match message {
            ServerMessage::Hello => self.on_hello(),
            ServerMessage::SessionOk => self.on_session_ok(),
            ServerMessage::OfferRequest => self.on_offer_request(),
            ServerMessage::Error(text) => {
                let next = self.state.current().classify_server_error();
                self.shutdown(text, Some(next));
            }
            ServerMessage::Peer(PeerMessage::Sdp(description)) => self.on_remote_sdp(description),
            ServerMessage::Peer(PeerMessage::Ice(candidate)) => {
                self.ice.on_remote_candidate(candidate, &self.peer)
            }
        }
    }

    fn on_hello(&mut self) {
        if self.state.current() != SessionState::ServerRegistering {
            self.shutdown(
                "ERROR: Received HELLO when not registering",
                Some(SessionState::Error),
            );
            return;
        }
        self.state.transition(SessionState::ServerRegistered);
        tracing::info!(target = "sendrecv::session", "registered with server");

        match self.identity.clone() {
            PeerIdentity::Peer(peer_id) => {
                self.state.transition(SessionState::PeerConnecting);
                tracing::info!(target = "sendrecv::session", peer = %peer_id, "setting up call");
                let result = match self.transport.as_deref() {
                    Some(transport) => transport.request_session(&peer_id),
                    None => Err(SignalingError::ChannelClosed),
                };
                if let Err(err) = result {
                    self.shutdown(
                        format!("ERROR: Failed to setup call: {err}"),
                        Some(SessionState::PeerCallError),
                    );
                }
            }
            PeerIdentity::SelfId(id) => tracing::info!(
                target = "sendrecv::session",
                id = %id,
                "waiting for a peer to call us"
            ),
        }
    }

    fn on_session_ok(&mut self) {
        if self.state.current() != SessionState::PeerConnecting {
            self.shutdown(
                "ERROR: Received SESSION_OK when not calling",
                Some(SessionState::PeerConnectionError),
            );
            return;
        }
        self.state.transition(SessionState::PeerConnected);
        self.ensure_pipeline();
    }

    fn on_offer_request(&mut self) {
        tracing::info!(target = "sendrecv::session", "peer requested an offer");
        if self.ensure_pipeline() {
            self.deferred.push_back(DeferredTask::CreateOffer);
        }
    }

    fn on_remote_sdp(&mut self, description: SignalingDescription) {
        if let Err(err) = description.validate() {
            tracing::warn!(
                target = "sendrecv::negotiation",
                kind = %description.kind,
                error = %err,
                "dropping unparseable remote description"
            );
            return;
        }
        if !self.ensure_pipeline() {
            return;
        }
        self.state.transition(SessionState::PeerNegotiating);
        self.negotiation
            .on_remote_description(description, &self.peer);
    }

    /// Starts the peer pipeline once. Returns false when that failed and
    /// the session is shutting down.
    fn ensure_pipeline(&mut self) -> bool {
        if self.pipeline_started {
            return true;
        }
        match self.peer.start(self.events.clone()) {
            Ok(()) => {
                self.pipeline_started = true;
                tracing::info!(target = "sendrecv::session", "pipeline started");
                true
            }
            Err(err) => {
                self.shutdown(
                    format!("ERROR: failed to start pipeline: {err}"),
                    Some(SessionState::PeerCallError),
                );
                false
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        let result = match event {
            PeerEvent::NegotiationNeeded => {
                self.negotiation
                    .on_negotiation_needed(&mut self.state, &self.peer);
                Ok(())
            }
            PeerEvent::OfferCreated(offer) => self.negotiation.on_offer_created(
                offer,
                &self.peer,
                &Outbound::new(self.state.current(), self.transport.as_deref()),
            ),
            PeerEvent::AnswerCreated(answer) => {
                self.negotiation.on_answer_created(answer, &self.peer);
                Ok(())
            }
            PeerEvent::LocalDescriptionSet(description) => {
                let out = Outbound::new(self.state.current(), self.transport.as_deref());
                self.negotiation
                    .on_local_description_set(description, &mut self.state, &out)
            }
            PeerEvent::RemoteDescriptionSet(kind) => {
                self.negotiation
                    .on_remote_description_set(kind, &mut self.state, &self.peer);
                Ok(())
            }
            PeerEvent::IceCandidate(candidate) => self.ice.on_local_candidate(
                candidate,
                &Outbound::new(self.state.current(), self.transport.as_deref()),
            ),
            PeerEvent::IceGatheringState(state) => {
                tracing::info!(target = "sendrecv::ice", state = %state, "ice gathering state");
                Ok(())
            }
            PeerEvent::ConnectionState(state) => {
                tracing::info!(
                    target = "sendrecv::session",
                    state = %state,
                    "peer connection state"
                );
                Ok(())
            }
            PeerEvent::IncomingStream(kind) => {
                tracing::info!(
                    target = "sendrecv::media",
                    kind = kind.as_str(),
                    "incoming remote stream"
                );
                Ok(())
            }
            PeerEvent::DataChannel { role, event } => {
                match self.channels.on_event(role, event) {
                    ChannelOutcome::Nothing => {}
                    ChannelOutcome::Schedule(command) => {
                        self.deferred.push_back(DeferredTask::Media(command))
                    }
                    ChannelOutcome::Fatal(reason) => self.shutdown(reason, None),
                }
                Ok(())
            }
            PeerEvent::Failed { op, message } => {
                self.on_peer_failure(op, message);
                Ok(())
            }
        };

        if let Err(err) = result {
            let next = match err {
                SessionError::AppStateViolation { .. } => SessionState::Error,
                _ => self.state.current().classify_server_error(),
            };
            self.shutdown(format!("ERROR: {err}"), Some(next));
        }
    }

    fn on_peer_failure(&mut self, op: PeerOperation, message: String) {
        match op {
            PeerOperation::Start => self.shutdown(
                format!("ERROR: failed to start pipeline: {message}"),
                Some(SessionState::PeerCallError),
            ),
            PeerOperation::CreateOffer => {
                tracing::warn!(
                    target = "sendrecv::negotiation",
                    error = %message,
                    "offer creation failed"
                );
                self.negotiation.on_offer_failed();
            }
            PeerOperation::Media { step, branch, sink } => {
                tracing::warn!(
                    target = "sendrecv::media",
                    step,
                    error = %message,
                    "media step failed"
                );
                if self.pipeline_started {
                    self.media.on_backend_failure(branch, sink, &self.peer);
                }
            }
            other => tracing::warn!(
                target = "sendrecv::session",
                op = ?other,
                error = %message,
                "peer operation failed"
            ),
        }
    }

    fn on_heartbeat(&mut self, role: ChannelRole) {
        let Some(ping) = self.channels.next_ping(role) else {
            return;
        };
        tracing::trace!(target = "sendrecv::datachannel", channel = role.as_str(), ping = %ping);
        self.peer.send_channel_text(role, ping);
        self.peer
            .send_channel_data(role, Bytes::from_static(PING_PAYLOAD));
    }

    fn on_transport_closed(&mut self, reason: String) {
        self.transport = None;
        if self.termination.is_some() {
            tracing::debug!(
                target = "sendrecv::signaling",
                reason = %reason,
                "signaling connection closed"
            );
            self.shutdown(reason, None);
            return;
        }
        let message = if reason.is_empty() {
            String::from("Server connection closed")
        } else {
            format!("Server connection closed: {reason}")
        };
        self.shutdown(message, Some(SessionState::ServerClosed));
    }

    /// Tears the session down. Safe to call any number of times: the first
    /// call records the reason and state and releases the peer, later calls
    /// only advance the transport close.
    pub fn shutdown(&mut self, reason: impl Into<String>, terminal: Option<SessionState>) {
        let reason = reason.into();
        if self.termination.is_none() {
            if let Some(next) = terminal {
                self.state.transition(next);
            }
            let state = self.state.current();
            if state.is_error() {
                tracing::error!(target = "sendrecv::session", state = %state, "{reason}");
            } else {
                tracing::info!(target = "sendrecv::session", state = %state, "{reason}");
            }
            self.termination = Some(reason);
            self.deferred.clear();
            self.channels.close_all();
            if self.pipeline_started {
                self.media.stop_all(&self.peer);
                self.peer.close();
            }
        } else {
            tracing::debug!(
                target = "sendrecv::session",
                reason = %reason,
                "shutdown already in progress"
            );
        }

        match self.transport.as_ref().map(|transport| transport.is_open()) {
            Some(true) => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.close();
                }
                self.phase = LoopPhase::Draining {
                    deadline: Instant::now() + self.drain_grace,
                };
            }
            // Close already requested; waiting for the acknowledgement.
            Some(false) if matches!(self.phase, LoopPhase::Draining { .. }) => {}
            Some(false) => {
                self.transport = None;
                self.phase = LoopPhase::Stopped;
            }
            None => self.phase = LoopPhase::Stopped,
        }
    }
}
