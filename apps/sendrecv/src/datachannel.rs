use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::media::{MediaCommand, MediaKind, MediaSource};
use crate::session::{Event, EventSender};

pub const PING_INTERVAL: Duration = Duration::from_secs(2);
/// Sent as a binary message after every `PING <n>` text.
pub const PING_PAYLOAD: &[u8] = b"data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Created locally when the pipeline starts.
    Send,
    /// Announced by the remote peer.
    Receive,
}

impl ChannelRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelRole::Send => "send",
            ChannelRole::Receive => "receive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Error(String),
    Text(String),
    Binary(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChannelOutcome {
    Nothing,
    Schedule(MediaCommand),
    Fatal(String),
}

/// Maps a control string from the peer onto a media command. Matching is
/// exact and case-sensitive.
pub fn parse_command(text: &str) -> Option<MediaCommand> {
    match text {
        "RECV VIDEO START TESTPATTERN" | "RECV VIDEO START" => Some(MediaCommand::Start(
            MediaKind::Video,
            MediaSource::TestPattern,
        )),
        "RECV VIDEO START LOOPBACK" => {
            Some(MediaCommand::Start(MediaKind::Video, MediaSource::Loopback))
        }
        "RECV VIDEO STOP" => Some(MediaCommand::Stop(MediaKind::Video)),
        "RECV AUDIO START" => Some(MediaCommand::Start(MediaKind::Audio, MediaSource::Tone)),
        "RECV AUDIO STOP" => Some(MediaCommand::Stop(MediaKind::Audio)),
        _ => None,
    }
}

#[derive(Debug)]
struct ChannelSlot {
    phase: ChannelPhase,
    opened_once: bool,
    ping_count: u64,
    heartbeat: Option<JoinHandle<()>>,
}

impl ChannelSlot {
    fn new() -> Self {
        Self {
            phase: ChannelPhase::Opening,
            opened_once: false,
            ping_count: 0,
            heartbeat: None,
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

pub struct DataChannelController {
    send: ChannelSlot,
    receive: ChannelSlot,
    interval: Duration,
    events: EventSender,
}

impl DataChannelController {
    pub fn new(events: EventSender) -> Self {
        Self::with_interval(events, PING_INTERVAL)
    }

    pub fn with_interval(events: EventSender, interval: Duration) -> Self {
        Self {
            send: ChannelSlot::new(),
            receive: ChannelSlot::new(),
            interval,
            events,
        }
    }

    fn slot(&self, role: ChannelRole) -> &ChannelSlot {
        match role {
            ChannelRole::Send => &self.send,
            ChannelRole::Receive => &self.receive,
        }
    }

    fn slot_mut(&mut self, role: ChannelRole) -> &mut ChannelSlot {
        match role {
            ChannelRole::Send => &mut self.send,
            ChannelRole::Receive => &mut self.receive,
        }
    }

    pub fn phase(&self, role: ChannelRole) -> ChannelPhase {
        self.slot(role).phase
    }

    pub fn ping_count(&self, role: ChannelRole) -> u64 {
        self.slot(role).ping_count
    }

    pub fn heartbeat_running(&self, role: ChannelRole) -> bool {
        self.slot(role)
            .heartbeat
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn on_event(&mut self, role: ChannelRole, event: ChannelEvent) -> ChannelOutcome {
        match event {
            ChannelEvent::Open => {
                self.on_open(role);
                ChannelOutcome::Nothing
            }
            ChannelEvent::Close => {
                let slot = self.slot_mut(role);
                slot.phase = ChannelPhase::Closed;
                slot.stop_heartbeat();
                ChannelOutcome::Fatal(String::from("Data channel closed"))
            }
            ChannelEvent::Error(message) => {
                let slot = self.slot_mut(role);
                slot.phase = ChannelPhase::Closed;
                slot.stop_heartbeat();
                ChannelOutcome::Fatal(format!("Data channel error: {message}"))
            }
            ChannelEvent::Text(text) => match parse_command(&text) {
                Some(command) => {
                    tracing::info!(
                        target = "sendrecv::datachannel",
                        channel = role.as_str(),
                        command = %text,
                        "scheduling media command"
                    );
                    ChannelOutcome::Schedule(command)
                }
                None => {
                    tracing::debug!(
                        target = "sendrecv::datachannel",
                        channel = role.as_str(),
                        text = %text,
                        "ignoring data channel text"
                    );
                    ChannelOutcome::Nothing
                }
            },
            ChannelEvent::Binary(len) => {
                tracing::trace!(
                    target = "sendrecv::datachannel",
                    channel = role.as_str(),
                    len,
                    "data channel binary message"
                );
                ChannelOutcome::Nothing
            }
        }
    }

    fn on_open(&mut self, role: ChannelRole) {
        let interval = self.interval;
        let events = self.events.clone();
        let slot = self.slot_mut(role);
        slot.phase = ChannelPhase::Open;
        if slot.opened_once {
            tracing::debug!(
                target = "sendrecv::datachannel",
                channel = role.as_str(),
                "channel reopened, heartbeat already started"
            );
            return;
        }
        slot.opened_once = true;
        slot.ping_count = 0;
        slot.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events.send(Event::Heartbeat(role)).is_err() {
                    break;
                }
            }
        }));
        tracing::info!(
            target = "sendrecv::datachannel",
            channel = role.as_str(),
            "data channel open, heartbeat started"
        );
    }

    /// Produces the next ping text for a heartbeat tick, or `None` when the
    /// channel is no longer open.
    pub fn next_ping(&mut self, role: ChannelRole) -> Option<String> {
        let slot = self.slot_mut(role);
        if slot.phase != ChannelPhase::Open {
            return None;
        }
        let text = format!("PING {}", slot.ping_count);
        slot.ping_count += 1;
        Some(text)
    }

    /// Stops both heartbeats during shutdown.
    pub fn close_all(&mut self) {
        for slot in [&mut self.send, &mut self.receive] {
            slot.stop_heartbeat();
            if slot.phase == ChannelPhase::Open {
                slot.phase = ChannelPhase::Closing;
            }
        }
    }
}

impl Drop for DataChannelController {
    fn drop(&mut self) {
        self.send.stop_heartbeat();
        self.receive.stop_heartbeat();
    }
}
