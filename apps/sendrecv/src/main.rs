use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use sendrecv::cli::Cli;
use sendrecv::peer::RtcPeer;
use sendrecv::session::{Session, SessionReport, event_channel};
use sendrecv::signaling::WsSignaling;
use sendrecv::telemetry::logging;
use tracing::debug;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(report) => {
            eprintln!("{} [{}]", report.reason, report.state);
            ExitCode::from(report.exit_code())
        }
        Err(err) => {
            eprintln!("❌ {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<SessionReport> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("initialising logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = cli.to_config().context("invalid configuration")?;
    let (events, mut events_rx) = event_channel();
    let peer = RtcPeer::new((&config).into());
    let mut session = Session::new(config.identity.clone(), peer, events.clone());

    session.connecting();
    debug!(server = %config.server_url, verify_tls = config.verify_tls, "connecting");
    match WsSignaling::connect(&config.server_url, config.verify_tls, events).await {
        Ok(transport) => session.connected(Box::new(transport)),
        Err(err) => session.connection_failed(err),
    }

    Ok(session.run(&mut events_rx).await)
}
