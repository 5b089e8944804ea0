use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use url::Url;

use super::{SignalingError, SignalingEvent, SignalingTransport};
use crate::session::{Event, EventSender};

enum Outgoing {
    Text(String),
    Close,
}

/// Websocket transport to the relay. A writer task drains queued frames and
/// a reader task forwards inbound frames to the session loop.
pub struct WsSignaling {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsSignaling {
    pub async fn connect(
        url: &Url,
        verify_tls: bool,
        events: EventSender,
    ) -> Result<Self, SignalingError> {
        let connector = tls_connector(verify_tls)?;
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
                .await
                .map_err(|err| SignalingError::Connect(err.to_string()))?;
        tracing::debug!(
            target = "sendrecv::signaling",
            url = %url,
            verify_tls,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        let open = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                match frame {
                    Outgoing::Text(text) => {
                        tracing::trace!(
                            target = "sendrecv::signaling",
                            event = "ws_out",
                            len = text.len()
                        );
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        if let Err(err) = ws_write.send(Message::Close(Some(frame))).await {
                            tracing::debug!(
                                target = "sendrecv::signaling",
                                "close frame not sent: {err}"
                            );
                        }
                        break;
                    }
                }
            }
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            let mut reason = String::from("connection ended");
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(
                            target = "sendrecv::signaling",
                            event = "ws_in",
                            kind = "text",
                            len = text.len()
                        );
                        if events.send(Event::Signaling(SignalingEvent::Text(text))).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        let _ = events.send(Event::Signaling(SignalingEvent::Binary(data.len())));
                    }
                    Ok(Message::Close(frame)) => {
                        reason = match frame {
                            Some(frame) => format!("closed by server ({})", u16::from(frame.code)),
                            None => String::from("closed by server"),
                        };
                    }
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "sendrecv::signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "sendrecv::signaling",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        reason = err.to_string();
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = events.send(Event::Signaling(SignalingEvent::Closed { reason }));
        });

        Ok(Self {
            outgoing,
            open,
            reader,
            writer,
        })
    }
}

impl SignalingTransport for WsSignaling {
    fn send_text(&self, text: String) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::ChannelClosed);
        }
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| SignalingError::ChannelClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outgoing.send(Outgoing::Close);
        }
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn tls_connector(verify_tls: bool) -> Result<Option<Connector>, SignalingError> {
    if verify_tls {
        return Ok(None);
    }
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|err| SignalingError::Tls(err.to_string()))?;
    Ok(Some(Connector::NativeTls(tls)))
}
