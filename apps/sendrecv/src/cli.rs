use clap::{Args, Parser};
use std::path::PathBuf;

use crate::config::{Config, ConfigError, DEFAULT_SERVER_URL, DEFAULT_STUN_SERVER, PeerIdentity};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "webrtc-sendrecv",
    about = "Call a browser peer through a signaling relay and stream media on request",
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("SENDRECV_BUILD_STAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        env = "SENDRECV_SERVER",
        default_value = DEFAULT_SERVER_URL,
        help = "Signaling server to connect to"
    )]
    pub server: String,

    #[arg(
        long = "disable-ssl",
        env = "SENDRECV_DISABLE_SSL",
        help = "Skip TLS certificate verification (always skipped for localhost)"
    )]
    pub disable_ssl: bool,

    #[arg(
        long = "peer-id",
        env = "SENDRECV_PEER_ID",
        value_name = "ID",
        conflicts_with = "our_id",
        help = "Peer to call once registered"
    )]
    pub peer_id: Option<String>,

    #[arg(
        long = "our-id",
        env = "SENDRECV_OUR_ID",
        value_name = "ID",
        help = "Register under this id and wait for the peer to call"
    )]
    pub our_id: Option<String>,

    #[arg(
        long = "stun-server",
        env = "SENDRECV_STUN_SERVER",
        default_value = DEFAULT_STUN_SERVER,
        help = "STUN server handed to the peer connection"
    )]
    pub stun_server: String,

    #[arg(
        long = "video-pattern",
        env = "SENDRECV_VIDEO_PATTERN",
        value_name = "IVF",
        help = "VP8 IVF file looped for RECV VIDEO START TESTPATTERN"
    )]
    pub video_pattern: Option<PathBuf>,

    #[arg(
        long = "audio-tone",
        env = "SENDRECV_AUDIO_TONE",
        value_name = "OGG",
        help = "Opus Ogg file looped for RECV AUDIO START"
    )]
    pub audio_tone: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl Cli {
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        let identity = PeerIdentity::from_options(self.peer_id.clone(), self.our_id.clone())?;
        Ok(Config::new(&self.server, self.disable_ssl, identity)?
            .with_stun_server(self.stun_server.clone())
            .with_video_pattern(self.video_pattern.clone())
            .with_audio_tone(self.audio_tone.clone()))
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "SENDRECV_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "SENDRECV_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
