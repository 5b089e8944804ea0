use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use webrtc::media::Sample;
use webrtc::media::io::ivf_reader::IVFReader;
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::media::MediaError;

const OPUS_CLOCK_RATE: u64 = 48_000;
const DEFAULT_OPUS_PAGE: Duration = Duration::from_millis(20);
const DEFAULT_FRAME: Duration = Duration::from_millis(33);
const LOOPBACK_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchRun {
    Paused,
    Playing,
    Finished,
}

/// One outbound media source. `step` pushes a single frame or packet and
/// returns how long to wait before the next one.
#[async_trait]
pub(crate) trait MediaPump: Send {
    fn label(&self) -> &'static str;

    async fn step(&mut self) -> Result<Duration, MediaError>;
}

/// Runs a pump while its gate says `Playing`, until the gate reports
/// `Finished` or its sender goes away.
pub(crate) async fn drive(mut pump: Box<dyn MediaPump>, mut gate: watch::Receiver<BranchRun>) {
    let label = pump.label();
    loop {
        let run = *gate.borrow_and_update();
        match run {
            BranchRun::Finished => break,
            BranchRun::Paused => {
                if gate.changed().await.is_err() {
                    break;
                }
                continue;
            }
            BranchRun::Playing => {}
        }

        let delay = tokio::select! {
            changed = gate.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            result = pump.step() => match result {
                Ok(delay) => delay,
                Err(err) => {
                    tracing::warn!(
                        target = "sendrecv::media",
                        source = label,
                        error = %err,
                        "media source stopped"
                    );
                    break;
                }
            },
        };

        if delay.is_zero() {
            continue;
        }
        tokio::select! {
            changed = gate.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::debug!(target = "sendrecv::media", source = label, "media pump finished");
}

fn frame_duration(numerator: u32, denominator: u32) -> Duration {
    if numerator == 0 || denominator == 0 {
        return DEFAULT_FRAME;
    }
    Duration::from_micros(1_000_000 * u64::from(numerator) / u64::from(denominator))
}

/// Reads the file on the first pass and replays it from memory afterwards.
async fn replay(cache: &mut Option<Bytes>, path: &Path) -> Result<Cursor<Bytes>, MediaError> {
    if cache.is_none() {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|err| MediaError::Source(format!("{}: {err}", path.display())))?;
        *cache = Some(Bytes::from(contents));
    }
    Ok(Cursor::new(cache.clone().unwrap_or_default()))
}

/// Loops a VP8 IVF file onto a sample track.
pub(crate) struct IvfPump {
    path: PathBuf,
    track: Arc<TrackLocalStaticSample>,
    contents: Option<Bytes>,
    reader: Option<IVFReader<Cursor<Bytes>>>,
    frame: Duration,
    frames_this_pass: u64,
}

impl IvfPump {
    pub(crate) fn new(path: PathBuf, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            path,
            track,
            contents: None,
            reader: None,
            frame: DEFAULT_FRAME,
            frames_this_pass: 0,
        }
    }
}

#[async_trait]
impl MediaPump for IvfPump {
    fn label(&self) -> &'static str {
        "test-pattern"
    }

    async fn step(&mut self) -> Result<Duration, MediaError> {
        if self.reader.is_none() {
            let (reader, header) = IVFReader::new(replay(&mut self.contents, &self.path).await?)
                .map_err(|err| MediaError::Source(err.to_string()))?;
            self.frame = frame_duration(header.timebase_numerator, header.timebase_denominator);
            self.frames_this_pass = 0;
            self.reader = Some(reader);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Duration::ZERO);
        };

        let frame = match reader.parse_next_frame() {
            Ok((frame, _)) => frame,
            Err(err) if self.frames_this_pass > 0 => {
                tracing::trace!(
                    target = "sendrecv::media",
                    frames = self.frames_this_pass,
                    "test pattern rewinding: {err}"
                );
                self.reader = None;
                return Ok(Duration::ZERO);
            }
            Err(err) => return Err(MediaError::Source(err.to_string())),
        };
        self.frames_this_pass += 1;

        self.track
            .write_sample(&Sample {
                data: frame.freeze(),
                duration: self.frame,
                ..Default::default()
            })
            .await
            .map_err(|err| MediaError::Pipeline(err.to_string()))?;
        Ok(self.frame)
    }
}

/// Loops an Ogg/Opus file onto a sample track, paced by granule positions.
pub(crate) struct OggPump {
    path: PathBuf,
    track: Arc<TrackLocalStaticSample>,
    contents: Option<Bytes>,
    reader: Option<OggReader<Cursor<Bytes>>>,
    last_granule: u64,
    pages_this_pass: u64,
}

impl OggPump {
    pub(crate) fn new(path: PathBuf, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            path,
            track,
            contents: None,
            reader: None,
            last_granule: 0,
            pages_this_pass: 0,
        }
    }
}

#[async_trait]
impl MediaPump for OggPump {
    fn label(&self) -> &'static str {
        "tone"
    }

    async fn step(&mut self) -> Result<Duration, MediaError> {
        if self.reader.is_none() {
            let (reader, _) = OggReader::new(replay(&mut self.contents, &self.path).await?, true)
                .map_err(|err| MediaError::Source(err.to_string()))?;
            self.last_granule = 0;
            self.pages_this_pass = 0;
            self.reader = Some(reader);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Duration::ZERO);
        };

        let (page, header) = match reader.parse_next_page() {
            Ok(page) => page,
            Err(_) if self.pages_this_pass > 0 => {
                self.reader = None;
                return Ok(Duration::ZERO);
            }
            Err(err) => return Err(MediaError::Source(err.to_string())),
        };
        self.pages_this_pass += 1;

        let samples = header.granule_position.saturating_sub(self.last_granule);
        self.last_granule = header.granule_position;
        let duration = if samples == 0 {
            DEFAULT_OPUS_PAGE
        } else {
            Duration::from_micros(samples * 1_000_000 / OPUS_CLOCK_RATE)
        };

        self.track
            .write_sample(&Sample {
                data: page.freeze(),
                duration,
                ..Default::default()
            })
            .await
            .map_err(|err| MediaError::Pipeline(err.to_string()))?;
        Ok(duration)
    }
}

/// Forwards RTP from the most recent remote video track.
pub(crate) struct LoopbackPump {
    remote: Arc<Mutex<Option<Arc<TrackRemote>>>>,
    track: Arc<TrackLocalStaticRTP>,
}

impl LoopbackPump {
    pub(crate) fn new(
        remote: Arc<Mutex<Option<Arc<TrackRemote>>>>,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Self {
        Self { remote, track }
    }
}

#[async_trait]
impl MediaPump for LoopbackPump {
    fn label(&self) -> &'static str {
        "loopback"
    }

    async fn step(&mut self) -> Result<Duration, MediaError> {
        let remote = self.remote.lock().clone();
        let Some(remote) = remote else {
            return Ok(LOOPBACK_WAIT);
        };
        let (packet, _) = remote
            .read_rtp()
            .await
            .map_err(|err| MediaError::Source(err.to_string()))?;
        self.track
            .write_rtp(&packet)
            .await
            .map_err(|err| MediaError::Pipeline(err.to_string()))?;
        Ok(Duration::ZERO)
    }
}

/// Stands in for a source whose input file is not configured. The branch
/// still negotiates; it just never sends.
pub(crate) struct IdlePump {
    label: &'static str,
    warned: bool,
}

impl IdlePump {
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            label,
            warned: false,
        }
    }
}

#[async_trait]
impl MediaPump for IdlePump {
    fn label(&self) -> &'static str {
        self.label
    }

    async fn step(&mut self) -> Result<Duration, MediaError> {
        if !self.warned {
            self.warned = true;
            tracing::warn!(
                target = "sendrecv::media",
                source = self.label,
                "no input file configured for this source; sending nothing"
            );
        }
        Ok(Duration::from_secs(3600))
    }
}
