//! Outbound media branches.
//!
//! A branch is a source bound to one send-capable transceiver. At most one
//! branch per [`MediaKind`] is attached at a time. Attach and detach walk
//! the collaborator through a fixed sequence so the transceiver (and its
//! m-line) survives a stop and can be reused by the next start.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("peer pipeline not started")]
    NotStarted,
    #[error("unknown branch {0}")]
    UnknownBranch(BranchId),
    #[error("unknown sink {0}")]
    UnknownSink(SinkHandle),
    #[error("media source failed: {0}")]
    Source(String),
    #[error("media pipeline error: {0}")]
    Pipeline(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaSource {
    TestPattern,
    Loopback,
    Tone,
}

impl MediaSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaSource::TestPattern => "test-pattern",
            MediaSource::Loopback => "loopback",
            MediaSource::Tone => "tone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaCommand {
    Start(MediaKind, MediaSource),
    Stop(MediaKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub u64);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch#{}", self.0)
    }
}

/// Opaque reference to the send endpoint (transceiver) a branch feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkHandle(pub u64);

impl fmt::Display for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    Sendrecv,
    Sendonly,
    Recvonly,
    Inactive,
}

/// The part of the peer pipeline a branch is wired into. Calls return
/// once the step is issued; none of them may call back into the session.
pub trait MediaBackend {
    fn build_branch(
        &self,
        branch: BranchId,
        kind: MediaKind,
        source: MediaSource,
    ) -> Result<(), MediaError>;

    /// A locked branch ignores state changes of its parent pipeline.
    fn set_locked_state(&self, branch: BranchId, locked: bool) -> Result<(), MediaError>;

    fn request_sink(&self, kind: MediaKind) -> Result<SinkHandle, MediaError>;

    fn link(&self, branch: BranchId, sink: SinkHandle) -> Result<(), MediaError>;

    fn sync_state_with_parent(&self, branch: BranchId) -> Result<(), MediaError>;

    fn send_eos(&self, branch: BranchId) -> Result<(), MediaError>;

    fn transceiver_direction(&self, sink: SinkHandle) -> Result<TransceiverDirection, MediaError>;

    fn set_transceiver_direction(
        &self,
        sink: SinkHandle,
        direction: TransceiverDirection,
    ) -> Result<(), MediaError>;

    fn set_null_state(&self, branch: BranchId) -> Result<(), MediaError>;

    fn unlink(&self, branch: BranchId, sink: SinkHandle) -> Result<(), MediaError>;

    fn release_sink(&self, sink: SinkHandle) -> Result<(), MediaError>;

    fn remove_branch(&self, branch: BranchId) -> Result<(), MediaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedBranch {
    pub id: BranchId,
    pub source: MediaSource,
    pub sink: SinkHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPhase {
    Detached,
    Attaching,
    Attached(AttachedBranch),
    Detaching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Attached(AttachedBranch),
    /// A branch of this kind is already attached; the request is ignored.
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Detached(AttachedBranch),
    NotAttached,
}

#[derive(Debug)]
pub struct MediaAttachmentManager {
    video: BranchPhase,
    audio: BranchPhase,
    next_branch: u64,
}

impl Default for MediaAttachmentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaAttachmentManager {
    pub fn new() -> Self {
        Self {
            video: BranchPhase::Detached,
            audio: BranchPhase::Detached,
            next_branch: 1,
        }
    }

    pub fn phase(&self, kind: MediaKind) -> BranchPhase {
        match kind {
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
        }
    }

    fn phase_mut(&mut self, kind: MediaKind) -> &mut BranchPhase {
        match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        }
    }

    pub fn attached(&self, kind: MediaKind) -> Option<AttachedBranch> {
        match self.phase(kind) {
            BranchPhase::Attached(branch) => Some(branch),
            _ => None,
        }
    }

    pub fn apply(
        &mut self,
        command: MediaCommand,
        backend: &dyn MediaBackend,
    ) -> Result<(), MediaError> {
        match command {
            MediaCommand::Start(kind, source) => self.start(kind, source, backend).map(|_| ()),
            MediaCommand::Stop(kind) => self.stop(kind, backend).map(|_| ()),
        }
    }

    pub fn start(
        &mut self,
        kind: MediaKind,
        source: MediaSource,
        backend: &dyn MediaBackend,
    ) -> Result<StartOutcome, MediaError> {
        if matches!(
            self.phase(kind),
            BranchPhase::Attached(_) | BranchPhase::Attaching
        ) {
            tracing::info!(
                target = "sendrecv::media",
                kind = kind.as_str(),
                source = source.as_str(),
                "branch already active, ignoring start"
            );
            return Ok(StartOutcome::AlreadyActive);
        }

        let id = BranchId(self.next_branch);
        self.next_branch += 1;
        *self.phase_mut(kind) = BranchPhase::Attaching;

        match attach(id, kind, source, backend) {
            Ok(sink) => {
                let branch = AttachedBranch { id, source, sink };
                *self.phase_mut(kind) = BranchPhase::Attached(branch);
                tracing::info!(
                    target = "sendrecv::media",
                    kind = kind.as_str(),
                    source = source.as_str(),
                    branch = %id,
                    sink = %sink,
                    "branch attached"
                );
                Ok(StartOutcome::Attached(branch))
            }
            Err(err) => {
                *self.phase_mut(kind) = BranchPhase::Detached;
                Err(err)
            }
        }
    }

    pub fn stop(
        &mut self,
        kind: MediaKind,
        backend: &dyn MediaBackend,
    ) -> Result<StopOutcome, MediaError> {
        let BranchPhase::Attached(branch) = self.phase(kind) else {
            tracing::debug!(
                target = "sendrecv::media",
                kind = kind.as_str(),
                "no branch attached, ignoring stop"
            );
            return Ok(StopOutcome::NotAttached);
        };

        *self.phase_mut(kind) = BranchPhase::Detaching;
        let result = detach(&branch, backend);
        // Handles are gone or unusable either way; a failed teardown is not
        // retried against them.
        *self.phase_mut(kind) = BranchPhase::Detached;
        result?;
        tracing::info!(
            target = "sendrecv::media",
            kind = kind.as_str(),
            branch = %branch.id,
            "branch detached"
        );
        Ok(StopOutcome::Detached(branch))
    }

    /// Tears down the branch a failed backend step belonged to and frees
    /// its kind. Returns the freed kind, or `None` when the step matches no
    /// attached branch (it belonged to one already torn down).
    pub fn on_backend_failure(
        &mut self,
        branch: Option<BranchId>,
        sink: Option<SinkHandle>,
        backend: &dyn MediaBackend,
    ) -> Option<MediaKind> {
        let (kind, attached) = [MediaKind::Video, MediaKind::Audio]
            .into_iter()
            .find_map(|kind| match self.phase(kind) {
                BranchPhase::Attached(attached)
                    if branch == Some(attached.id) || sink == Some(attached.sink) =>
                {
                    Some((kind, attached))
                }
                _ => None,
            })?;

        *self.phase_mut(kind) = BranchPhase::Detaching;
        if let Err(err) = detach(&attached, backend) {
            tracing::warn!(
                target = "sendrecv::media",
                kind = kind.as_str(),
                branch = %attached.id,
                error = %err,
                "teardown after backend failure incomplete"
            );
        }
        *self.phase_mut(kind) = BranchPhase::Detached;
        tracing::warn!(
            target = "sendrecv::media",
            kind = kind.as_str(),
            branch = %attached.id,
            "branch rolled back after backend failure"
        );
        Some(kind)
    }

    /// Detaches everything, logging failures instead of returning them.
    pub fn stop_all(&mut self, backend: &dyn MediaBackend) {
        for kind in [MediaKind::Video, MediaKind::Audio] {
            if let Err(err) = self.stop(kind, backend) {
                tracing::warn!(
                    target = "sendrecv::media",
                    kind = kind.as_str(),
                    error = %err,
                    "branch teardown failed"
                );
            }
        }
    }
}

fn attach(
    id: BranchId,
    kind: MediaKind,
    source: MediaSource,
    backend: &dyn MediaBackend,
) -> Result<SinkHandle, MediaError> {
    backend.build_branch(id, kind, source)?;
    if let Err(err) = backend.set_locked_state(id, true) {
        rollback(id, "remove_branch", backend.remove_branch(id));
        return Err(err);
    }
    let sink = match backend.request_sink(kind) {
        Ok(sink) => sink,
        Err(err) => {
            rollback(id, "remove_branch", backend.remove_branch(id));
            return Err(err);
        }
    };
    let linked = backend
        .link(id, sink)
        .and_then(|()| backend.set_locked_state(id, false))
        .and_then(|()| backend.sync_state_with_parent(id));
    if let Err(err) = linked {
        rollback(id, "unlink", backend.unlink(id, sink));
        rollback(id, "release_sink", backend.release_sink(sink));
        rollback(id, "remove_branch", backend.remove_branch(id));
        return Err(err);
    }
    Ok(sink)
}

fn rollback(branch: BranchId, step: &'static str, result: Result<(), MediaError>) {
    if let Err(err) = result {
        tracing::warn!(
            target = "sendrecv::media",
            branch = %branch,
            step,
            error = %err,
            "rollback step failed"
        );
    }
}

/// Issues every teardown step even when an earlier one fails, so the sink
/// and branch are always released. Returns the first failure.
fn detach(branch: &AttachedBranch, backend: &dyn MediaBackend) -> Result<(), MediaError> {
    let mut first = None;
    keep_first(&mut first, branch, "send_eos", backend.send_eos(branch.id));
    let demoted = match backend.transceiver_direction(branch.sink) {
        Ok(TransceiverDirection::Sendrecv) => TransceiverDirection::Recvonly,
        Ok(_) => TransceiverDirection::Inactive,
        Err(err) => {
            keep_first(&mut first, branch, "transceiver_direction", Err(err));
            TransceiverDirection::Inactive
        }
    };
    keep_first(
        &mut first,
        branch,
        "set_transceiver_direction",
        backend.set_transceiver_direction(branch.sink, demoted),
    );
    keep_first(
        &mut first,
        branch,
        "set_locked_state",
        backend.set_locked_state(branch.id, true),
    );
    keep_first(
        &mut first,
        branch,
        "set_null_state",
        backend.set_null_state(branch.id),
    );
    keep_first(
        &mut first,
        branch,
        "unlink",
        backend.unlink(branch.id, branch.sink),
    );
    keep_first(
        &mut first,
        branch,
        "release_sink",
        backend.release_sink(branch.sink),
    );
    keep_first(
        &mut first,
        branch,
        "remove_branch",
        backend.remove_branch(branch.id),
    );
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn keep_first(
    first: &mut Option<MediaError>,
    branch: &AttachedBranch,
    step: &'static str,
    result: Result<(), MediaError>,
) {
    let Err(err) = result else {
        return;
    };
    tracing::debug!(
        target = "sendrecv::media",
        branch = %branch.id,
        step,
        error = %err,
        "teardown step failed"
    );
    if first.is_none() {
        *first = Some(err);
    }
}
