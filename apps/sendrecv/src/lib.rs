pub mod cli;
pub mod config;
pub mod datachannel;
pub mod error;
pub mod ice;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod telemetry;

#[cfg(test)]
mod tests;
