use std::collections::VecDeque;

use tokio::time::Instant;

use super::support::{ANSWER_SDP, FakePeer, MockSignaling, OFFER_SDP};
use crate::config::PeerIdentity;
use crate::datachannel::{ChannelEvent, ChannelRole};
use crate::media::{MediaCommand, MediaKind, MediaSource, SinkHandle};
use crate::peer::{PeerEvent, PeerOperation, SignalingState};
use crate::protocol::{IceCandidate, PeerMessage, SdpKind, SignalingDescription};
use crate::session::{
    DRAIN_GRACE, DeferredTask, Event, EventReceiver, Session, SessionState, event_channel,
};
use crate::signaling::SignalingEvent;

const CALL_PROGRESSION: [SessionState; 8] = [
    SessionState::ServerConnecting,
    SessionState::ServerConnected,
    SessionState::ServerRegistering,
    SessionState::ServerRegistered,
    SessionState::PeerConnecting,
    SessionState::PeerConnected,
    SessionState::PeerNegotiating,
    SessionState::PeerCallStarted,
];

struct Harness {
    session: Session<FakePeer>,
    peer: FakePeer,
    relay: MockSignaling,
    _events: EventReceiver,
}

impl Harness {
    fn with_identity(identity: PeerIdentity) -> Self {
        let (events, rx) = event_channel();
        let peer = FakePeer::default();
        let relay = MockSignaling::new();
        let mut session = Session::new(identity, peer.clone(), events);
        session.connecting();
        session.connected(Box::new(relay.clone()));
        Self {
            session,
            peer,
            relay,
            _events: rx,
        }
    }

    fn caller() -> Self {
        Self::with_identity(PeerIdentity::Peer("42".into()))
    }

    fn callee() -> Self {
        Self::with_identity(PeerIdentity::SelfId("7".into()))
    }

    fn server(&mut self, text: &str) {
        self.session
            .dispatch(Event::Signaling(SignalingEvent::Text(text.into())));
    }

    fn peer_event(&mut self, event: PeerEvent) {
        self.session.dispatch(Event::Peer(event));
    }

    fn channel(&mut self, role: ChannelRole, event: ChannelEvent) {
        self.peer_event(PeerEvent::DataChannel { role, event });
    }

    /// Registered, called and pipeline started.
    fn connected_caller() -> Self {
        let mut harness = Self::caller();
        harness.server("HELLO");
        harness.server("SESSION_OK");
        harness
    }

    /// Offer sent and answer applied.
    fn in_call() -> Self {
        let mut harness = Self::connected_caller();
        harness.peer_event(PeerEvent::NegotiationNeeded);
        harness.peer_event(PeerEvent::OfferCreated(SignalingDescription::offer(OFFER_SDP)));
        harness.server(&sdp(SignalingDescription::answer(ANSWER_SDP)));
        harness.peer_event(PeerEvent::RemoteDescriptionSet(SdpKind::Answer));
        harness
    }

    fn sent_peer_messages(&self) -> Vec<PeerMessage> {
        self.relay
            .sent()
            .iter()
            .filter_map(|text| PeerMessage::from_json(text).ok())
            .collect()
    }
}

fn sdp(description: SignalingDescription) -> String {
    PeerMessage::Sdp(description).to_json().unwrap()
}

fn candidate(mline: u32) -> IceCandidate {
    IceCandidate {
        candidate: "candidate:1 1 UDP 2122252543 192.168.1.2 54321 typ host".into(),
        sdp_mline_index: mline,
    }
}

fn assert_progresses(history: &[SessionState]) {
    let mut floor = 0;
    for state in history {
        let Some(position) = CALL_PROGRESSION.iter().position(|step| step == state) else {
            panic!("{state} is not a call progression state: {history:?}");
        };
        assert!(position >= floor, "went back to {state}: {history:?}");
        floor = position;
    }
}

#[test]
fn caller_reaches_call_started() {
    let mut h = Harness::caller();
    assert_eq!(h.session.state(), SessionState::ServerRegistering);
    let hello = h.relay.last_sent().unwrap();
    let id: u32 = hello.strip_prefix("HELLO ").unwrap().parse().unwrap();
    assert!((10..10000).contains(&id));

    h.server("HELLO");
    assert_eq!(h.session.state(), SessionState::PeerConnecting);
    assert_eq!(h.relay.last_sent().as_deref(), Some("SESSION 42"));

    h.server("SESSION_OK");
    assert_eq!(h.session.state(), SessionState::PeerConnected);
    assert_eq!(h.peer.count("start"), 1);

    h.peer_event(PeerEvent::NegotiationNeeded);
    assert_eq!(h.session.state(), SessionState::PeerNegotiating);
    assert!(h.session.negotiation().making_offer());
    assert_eq!(h.peer.count("create_offer"), 1);

    let offer = SignalingDescription::offer(OFFER_SDP);
    h.peer_event(PeerEvent::OfferCreated(offer.clone()));
    assert_eq!(h.peer.count("set_local_description offer"), 1);
    assert!(!h.session.negotiation().making_offer());
    assert_eq!(h.sent_peer_messages(), vec![PeerMessage::Sdp(offer.clone())]);

    h.peer_event(PeerEvent::IceCandidate(candidate(0)));
    assert_eq!(
        h.sent_peer_messages(),
        vec![PeerMessage::Sdp(offer), PeerMessage::Ice(candidate(0))]
    );
    assert_eq!(h.session.ice().sent(), 1);

    h.server(&sdp(SignalingDescription::answer(ANSWER_SDP)));
    assert_eq!(h.peer.count("set_remote_description answer"), 1);
    assert_eq!(h.session.state(), SessionState::PeerNegotiating);

    h.peer_event(PeerEvent::RemoteDescriptionSet(SdpKind::Answer));
    assert_eq!(h.session.state(), SessionState::PeerCallStarted);
    assert!(h.session.is_running());
    assert_progresses(h.session.history());
    assert!(h.session.report().reached_call);
}

#[test]
fn glare_drops_our_offer() {
    let mut h = Harness::connected_caller();
    h.peer_event(PeerEvent::NegotiationNeeded);
    h.peer.set_signaling_state(SignalingState::HaveRemoteOffer);
    h.peer_event(PeerEvent::OfferCreated(SignalingDescription::offer(OFFER_SDP)));

    assert_eq!(h.peer.count("set_local_description"), 0);
    assert!(h.sent_peer_messages().is_empty());
    assert!(!h.session.negotiation().making_offer());
    assert!(h.session.is_running());
}

#[test]
fn remote_offer_outside_stable_is_ignored() {
    let mut h = Harness::connected_caller();
    h.peer_event(PeerEvent::NegotiationNeeded);
    h.peer.set_signaling_state(SignalingState::HaveLocalOffer);
    h.server(&sdp(SignalingDescription::offer(OFFER_SDP)));

    assert_eq!(h.peer.count("set_remote_description"), 0);
    assert_eq!(h.peer.count("create_answer"), 0);
    assert!(h.sent_peer_messages().is_empty());
    assert!(h.session.is_running());
}

#[test]
fn answer_waits_for_local_description() {
    let mut h = Harness::connected_caller();
    h.server(&sdp(SignalingDescription::offer(OFFER_SDP)));
    assert_eq!(h.session.state(), SessionState::PeerNegotiating);
    assert_eq!(h.peer.count("set_remote_description offer"), 1);

    h.peer_event(PeerEvent::RemoteDescriptionSet(SdpKind::Offer));
    assert_eq!(h.peer.count("create_answer"), 1);

    let answer = SignalingDescription::answer(ANSWER_SDP);
    h.peer_event(PeerEvent::AnswerCreated(answer.clone()));
    assert_eq!(h.peer.count("set_local_description answer"), 1);
    assert!(h.sent_peer_messages().is_empty());

    h.peer_event(PeerEvent::LocalDescriptionSet(answer.clone()));
    assert_eq!(h.sent_peer_messages(), vec![PeerMessage::Sdp(answer)]);
    assert_eq!(h.session.state(), SessionState::PeerCallStarted);
}

#[test]
fn local_offer_applied_is_not_resent() {
    let mut h = Harness::connected_caller();
    h.peer_event(PeerEvent::NegotiationNeeded);
    let offer = SignalingDescription::offer(OFFER_SDP);
    h.peer_event(PeerEvent::OfferCreated(offer.clone()));
    h.peer_event(PeerEvent::LocalDescriptionSet(offer));
    assert_eq!(h.sent_peer_messages().len(), 1);
}

#[test]
fn local_candidate_before_negotiation_is_a_state_violation() {
    let mut h = Harness::connected_caller();
    h.peer_event(PeerEvent::IceCandidate(candidate(0)));

    assert_eq!(h.session.state(), SessionState::Error);
    assert!(h.session.termination_reason().unwrap().contains("send ice candidate"));
    assert!(h.sent_peer_messages().is_empty());
    assert_eq!(h.relay.close_requests(), 1);
    assert!(h.session.is_draining());
    assert_eq!(h.peer.count("close"), 1);
}

#[test]
fn remote_candidates_apply_in_any_state() {
    let mut h = Harness::connected_caller();
    h.server(&PeerMessage::Ice(candidate(1)).to_json().unwrap());
    assert_eq!(h.peer.count("add_ice_candidate 1"), 1);
    assert_eq!(h.session.ice().applied(), 1);
    assert_eq!(h.session.state(), SessionState::PeerConnected);
}

#[test]
fn server_errors_land_in_the_phase_sink() {
    let mut h = Harness::caller();
    h.server("ERROR registration refused");
    assert_eq!(h.session.state(), SessionState::ServerRegistrationError);

    let mut h = Harness::caller();
    h.server("HELLO");
    h.server("ERROR peer '42' not found");
    assert_eq!(h.session.state(), SessionState::PeerConnectionError);
    assert_eq!(
        h.session.termination_reason(),
        Some("ERROR peer '42' not found")
    );

    let mut h = Harness::connected_caller();
    h.peer_event(PeerEvent::NegotiationNeeded);
    h.server("ERROR peer went away");
    assert_eq!(h.session.state(), SessionState::PeerCallError);
    assert!(!h.session.report().succeeded());
}

#[test]
fn hello_out_of_turn_is_fatal() {
    let mut h = Harness::caller();
    h.server("HELLO");
    h.server("HELLO");
    assert_eq!(h.session.state(), SessionState::Error);
    assert_eq!(
        h.session.termination_reason(),
        Some("ERROR: Received HELLO when not registering")
    );
}

#[test]
fn session_ok_without_a_call_is_fatal() {
    let mut h = Harness::callee();
    h.server("HELLO");
    h.server("SESSION_OK");
    assert_eq!(h.session.state(), SessionState::PeerConnectionError);
    assert_eq!(h.peer.count("start"), 0);
}

#[test]
fn callee_registers_and_waits() {
    let mut h = Harness::callee();
    assert_eq!(h.relay.sent(), vec!["HELLO 7".to_string()]);
    h.server("HELLO");
    assert_eq!(h.session.state(), SessionState::ServerRegistered);
    assert_eq!(h.relay.sent().len(), 1);
    assert!(!h.session.pipeline_started());
}

#[test]
fn offer_request_defers_offer_creation() {
    let mut h = Harness::callee();
    h.server("HELLO");
    h.server("OFFER_REQUEST");

    assert!(h.session.pipeline_started());
    assert_eq!(
        h.session.deferred(),
        &VecDeque::from([DeferredTask::CreateOffer])
    );
    assert_eq!(h.peer.count("create_offer"), 0);

    h.session.run_pending();
    assert_eq!(h.peer.count("create_offer"), 1);
    assert_eq!(h.session.state(), SessionState::PeerNegotiating);
    assert!(h.session.deferred().is_empty());
}

#[test]
fn callee_starts_pipeline_on_first_offer() {
    let mut h = Harness::callee();
    h.server("HELLO");
    h.server(&sdp(SignalingDescription::offer(OFFER_SDP)));
    assert_eq!(h.peer.count("start"), 1);
    assert_eq!(h.peer.count("set_remote_description offer"), 1);
    assert_eq!(h.session.state(), SessionState::PeerNegotiating);
}

#[test]
fn channel_commands_run_on_the_next_iteration() {
    let mut h = Harness::in_call();
    h.channel(
        ChannelRole::Receive,
        ChannelEvent::Text("RECV VIDEO START TESTPATTERN".into()),
    );
    assert_eq!(
        h.session.deferred(),
        &VecDeque::from([DeferredTask::Media(MediaCommand::Start(
            MediaKind::Video,
            MediaSource::TestPattern
        ))])
    );
    assert_eq!(h.peer.media.count("build_branch"), 0);

    h.session.run_pending();
    assert_eq!(h.peer.media.count("build_branch branch#1 video test-pattern"), 1);
    assert!(h.session.media().attached(MediaKind::Video).is_some());

    h.channel(ChannelRole::Receive, ChannelEvent::Text("RECV VIDEO STOP".into()));
    h.session.run_pending();
    assert_eq!(h.peer.media.count("remove_branch branch#1"), 1);
    assert!(h.session.media().attached(MediaKind::Video).is_none());

    h.channel(ChannelRole::Receive, ChannelEvent::Text("RECV AUDIO START".into()));
    h.session.run_pending();
    assert!(h.session.media().attached(MediaKind::Audio).is_some());

    h.channel(ChannelRole::Receive, ChannelEvent::Text("RECV AUDIO STOP".into()));
    assert_eq!(
        h.session.deferred(),
        &VecDeque::from([DeferredTask::Media(MediaCommand::Stop(MediaKind::Audio))])
    );
    h.session.run_pending();
    assert!(h.session.deferred().is_empty());
    assert_eq!(h.peer.media.count("remove_branch branch#2"), 1);
    assert!(h.session.media().attached(MediaKind::Audio).is_none());

    h.channel(ChannelRole::Receive, ChannelEvent::Text("RECV FOO".into()));
    assert!(h.session.deferred().is_empty());
}

#[test]
fn failed_media_command_keeps_the_session() {
    let mut h = Harness::in_call();
    h.peer.media.fail_on("link");
    h.channel(ChannelRole::Send, ChannelEvent::Text("RECV AUDIO START".into()));
    h.session.run_pending();
    assert!(h.session.is_running());
    assert!(h.session.media().attached(MediaKind::Audio).is_none());
}

#[test]
fn backend_media_failure_frees_the_kind() {
    let mut h = Harness::in_call();
    h.channel(ChannelRole::Send, ChannelEvent::Text("RECV AUDIO START".into()));
    h.session.run_pending();
    assert!(h.session.media().attached(MediaKind::Audio).is_some());

    h.peer_event(PeerEvent::Failed {
        op: PeerOperation::Media {
            step: "request_sink",
            branch: None,
            sink: Some(SinkHandle(1)),
        },
        message: "no transceiver available".into(),
    });
    assert!(h.session.is_running());
    assert!(h.session.media().attached(MediaKind::Audio).is_none());
    assert_eq!(h.peer.media.count("release_sink sink#1"), 1);
    assert_eq!(h.peer.media.count("remove_branch branch#1"), 1);

    h.channel(ChannelRole::Send, ChannelEvent::Text("RECV AUDIO START".into()));
    h.session.run_pending();
    assert_eq!(h.peer.media.count("build_branch"), 2);
    assert!(h.session.media().attached(MediaKind::Audio).is_some());
}

#[test]
fn unusable_server_messages_are_dropped() {
    let mut h = Harness::connected_caller();
    h.server("{not json");
    h.server(r#"{"foo": 1}"#);
    h.server(r#"{"sdp": {"sdp": "v=0"}}"#);
    h.server(r#"{"sdp": {"type": "offer", "sdp": "garbage"}}"#);
    h.server("SESSION_DENIED");

    assert!(h.session.is_running());
    assert_eq!(h.session.state(), SessionState::PeerConnected);
    assert_eq!(h.peer.count("set_remote_description"), 0);
}

#[test]
fn binary_frames_are_ignored() {
    let mut h = Harness::caller();
    h.session
        .dispatch(Event::Signaling(SignalingEvent::Binary(16)));
    assert!(h.session.is_running());
    assert_eq!(h.session.state(), SessionState::ServerRegistering);
}

#[test]
fn shutdown_is_idempotent() {
    let mut h = Harness::connected_caller();
    h.session.shutdown("first", Some(SessionState::PeerCallError));
    assert!(h.session.is_draining());
    assert_eq!(h.relay.close_requests(), 1);
    assert_eq!(h.peer.count("close"), 1);

    h.session.shutdown("second", Some(SessionState::Error));
    assert_eq!(h.session.state(), SessionState::PeerCallError);
    assert_eq!(h.session.termination_reason(), Some("first"));
    assert_eq!(h.relay.close_requests(), 1);
    assert_eq!(h.peer.count("close"), 1);

    h.server("HELLO");
    assert_eq!(h.session.state(), SessionState::PeerCallError);

    h.session.dispatch(Event::Signaling(SignalingEvent::Closed {
        reason: "closed by client".into(),
    }));
    assert!(h.session.is_stopped());
    assert_eq!(h.session.state(), SessionState::PeerCallError);
    assert_eq!(h.session.report().reason, "first");
}

#[test]
fn unexpected_close_is_server_closed() {
    let mut h = Harness::caller();
    h.server("HELLO");
    h.session.dispatch(Event::Signaling(SignalingEvent::Closed {
        reason: "closed by server (1001)".into(),
    }));
    assert!(h.session.is_stopped());
    assert_eq!(h.session.state(), SessionState::ServerClosed);
    assert_eq!(
        h.session.termination_reason(),
        Some("Server connection closed: closed by server (1001)")
    );
    assert_eq!(h.relay.close_requests(), 0);
}

#[test]
fn data_channel_close_ends_a_good_call() {
    let mut h = Harness::in_call();
    h.channel(ChannelRole::Send, ChannelEvent::Close);
    assert_eq!(h.session.termination_reason(), Some("Data channel closed"));
    assert_eq!(h.session.state(), SessionState::PeerCallStarted);
    h.session.dispatch(Event::Signaling(SignalingEvent::Closed {
        reason: String::new(),
    }));
    let report = h.session.report();
    assert!(report.succeeded());
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn pipeline_start_failure_is_fatal() {
    let mut h = Harness::caller();
    h.peer.fail_start();
    h.server("HELLO");
    h.server("SESSION_OK");
    assert_eq!(h.session.state(), SessionState::PeerCallError);
    assert!(
        h.session
            .termination_reason()
            .unwrap()
            .starts_with("ERROR: failed to start pipeline")
    );
    assert_eq!(h.peer.count("close"), 0);
}

#[test]
fn failed_offer_clears_making_offer() {
    let mut h = Harness::connected_caller();
    h.peer_event(PeerEvent::NegotiationNeeded);
    h.peer_event(PeerEvent::Failed {
        op: PeerOperation::CreateOffer,
        message: "no transceivers".into(),
    });
    assert!(!h.session.negotiation().making_offer());
    assert!(h.session.is_running());
}

#[tokio::test]
async fn heartbeat_sends_ping_text_and_payload() {
    let mut h = Harness::in_call();
    h.channel(ChannelRole::Send, ChannelEvent::Open);
    h.session.dispatch(Event::Heartbeat(ChannelRole::Send));
    h.session.dispatch(Event::Heartbeat(ChannelRole::Send));

    let pings: Vec<String> = h
        .peer
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("send_channel"))
        .collect();
    assert_eq!(
        pings,
        [
            "send_channel_text send PING 0",
            "send_channel_data send 4",
            "send_channel_text send PING 1",
            "send_channel_data send 4",
        ]
    );
    h.session.dispatch(Event::Heartbeat(ChannelRole::Receive));
    assert_eq!(h.peer.count("send_channel_text receive"), 0);
}

#[test_timeout::tokio_timeout_test(10)]
async fn run_stops_after_close_acknowledgement() {
    let (events, mut rx) = event_channel();
    let peer = FakePeer::default();
    let relay = MockSignaling::acknowledging(events.clone());
    let mut session = Session::new(PeerIdentity::Peer("42".into()), peer.clone(), events.clone());
    session.connecting();
    session.connected(Box::new(relay.clone()));

    for text in ["HELLO", "SESSION_OK", "ERROR peer hung up"] {
        events
            .send(Event::Signaling(SignalingEvent::Text(text.into())))
            .unwrap();
    }
    let report = session.run(&mut rx).await;

    assert!(session.is_stopped());
    assert_eq!(report.state, SessionState::PeerCallError);
    assert_eq!(report.reason, "ERROR peer hung up");
    assert_eq!(report.exit_code(), 1);
    assert_eq!(relay.close_requests(), 1);
    assert_eq!(peer.count("close"), 1);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn run_gives_up_waiting_for_close() {
    let (events, mut rx) = event_channel();
    let relay = MockSignaling::new();
    let mut session = Session::new(
        PeerIdentity::Peer("42".into()),
        FakePeer::default(),
        events.clone(),
    );
    session.connecting();
    session.connected(Box::new(relay.clone()));
    events
        .send(Event::Signaling(SignalingEvent::Text("ERROR nope".into())))
        .unwrap();

    let started = Instant::now();
    let report = session.run(&mut rx).await;
    assert!(started.elapsed() >= DRAIN_GRACE);
    assert_eq!(report.state, SessionState::ServerRegistrationError);
    assert!(session.is_stopped());
}

#[test_timeout::tokio_timeout_test(10)]
async fn run_executes_queued_commands_between_events() {
    let (events, mut rx) = event_channel();
    let peer = FakePeer::default();
    let relay = MockSignaling::acknowledging(events.clone());
    let mut session = Session::new(PeerIdentity::Peer("42".into()), peer.clone(), events.clone());
    session.connecting();
    session.connected(Box::new(relay));

    let script = [
        Event::Signaling(SignalingEvent::Text("HELLO".into())),
        Event::Signaling(SignalingEvent::Text("SESSION_OK".into())),
        Event::Peer(PeerEvent::NegotiationNeeded),
        Event::Peer(PeerEvent::OfferCreated(SignalingDescription::offer(OFFER_SDP))),
        Event::Signaling(SignalingEvent::Text(sdp(SignalingDescription::answer(
            ANSWER_SDP,
        )))),
        Event::Peer(PeerEvent::RemoteDescriptionSet(SdpKind::Answer)),
        Event::Peer(PeerEvent::DataChannel {
            role: ChannelRole::Receive,
            event: ChannelEvent::Text("RECV AUDIO START".into()),
        }),
        Event::Peer(PeerEvent::DataChannel {
            role: ChannelRole::Receive,
            event: ChannelEvent::Close,
        }),
    ];
    for event in script {
        events.send(event).unwrap();
    }
    let report = session.run(&mut rx).await;

    assert!(report.succeeded());
    assert_eq!(report.reason, "Data channel closed");
    assert_eq!(peer.media.count("build_branch branch#1 audio tone"), 1);
    // Torn down again on the way out.
    assert_eq!(peer.media.count("remove_branch branch#1"), 1);
    assert_progresses(&report.history);
}
