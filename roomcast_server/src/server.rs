//! WebSocket transport for the signaling protocol
//!
//! Every accepted connection becomes one peer. Text frames are parsed as
//! [`Request`]s and handled one at a time; outbound messages are queued on the
//! peer's outbox and written by a separate task so broadcasts from other peers
//! never wait on this connection's reader.

use crate::config::ServerConfig;
use crate::error::ClientRequestError;
use crate::handler::Signaling;
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::{ErrorCode, PeerId, Request, ServerMessage};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as Handshake, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{Instrument, debug, info, info_span, warn};

/// Accept connections until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    signaling: Signaling,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    let config = Arc::new(config);
    info!(
        addr = %listener.local_addr()?,
        namespace = %config.namespace,
        "Signaling server listening"
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Signaling server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let config = Arc::clone(&config);
                let signaling = signaling.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, config, signaling).await {
                        debug!(%addr, "Connection ended with error: {}", e);
                    }
                });
            }
        }
    }
}

/// Parse one inbound frame
fn parse_request(message: Message) -> Result<Option<Request>, ClientRequestError> {
    match message {
        Message::Text(text) => Ok(Some(text.as_str().parse()?)),
        Message::Binary(_) => Err(ClientRequestError::UnsupportedType),
        Message::Close(_) => Err(ClientRequestError::Close),
        // Pings are answered by tungstenite itself
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(None),
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<ServerConfig>,
    signaling: Signaling,
) -> Result<(), ClientRequestError> {
    let ws_stream = accept_hdr_async(stream, |request: &Handshake, response: Response| {
        if config.accepts_path(request.uri().path()) {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    })
    .await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let peer_id = signaling.connect(tx).await;
    info!(peer = %peer_id, %addr, "WebSocket connection opened");

    // Task to forward messages from the outbox to the WebSocket
    let forward_task = tokio::spawn(
        async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(message.to_string().into())).await {
                    debug!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        }
        .instrument(info_span!("outbox", peer = %peer_id)),
    );

    let result = receive_loop(&mut ws_rx, peer_id, &signaling)
        .instrument(info_span!("peer", peer = %peer_id))
        .await;

    signaling.disconnect(peer_id).await;
    forward_task.abort();
    info!(peer = %peer_id, %addr, "WebSocket connection closed");
    result
}

async fn receive_loop<S>(
    ws_rx: &mut S,
    peer_id: PeerId,
    signaling: &Signaling,
) -> Result<(), ClientRequestError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(message) = ws_rx.next().await {
        match parse_request(message?) {
            Ok(Some(request)) => signaling.handle_request(peer_id, request).await,
            Ok(None) => {}
            Err(ClientRequestError::Close) => return Ok(()),
            Err(e) => {
                warn!("Rejected frame: {}", e);
                let _ = signaling
                    .state()
                    .send(
                        peer_id,
                        ServerMessage::Error {
                            ack: None,
                            code: ErrorCode::InvalidMessage,
                            message: e.to_string(),
                        },
                    )
                    .await;
            }
        }
    }
    Ok(())
}
