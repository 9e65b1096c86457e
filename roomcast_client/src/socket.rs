//! WebSocket connection to the signaling server

use crate::controller::NegotiationController;
use crate::device::Device;
use crate::error::ClientError;
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::{Request, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// A connected signaling session
///
/// Requests queued on [`sender`](Self::sender) are written in order by a
/// background task; server messages are parsed by another and read with
/// [`recv`](Self::recv). Dropping the socket closes the connection.
pub struct SignalingSocket {
    outbound: mpsc::UnboundedSender<Request>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    shutdown: Option<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
}

impl SignalingSocket {
    /// Connect to `url`, e.g. `ws://127.0.0.1:8888/streaming`
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut outgoing_rx) = mpsc::unbounded_channel::<Request>();
        let (incoming_tx, inbound) = mpsc::unbounded_channel();
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        // Handle outgoing messages
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = outgoing_rx.recv() => {
                        let Some(request) = request else { break };
                        if let Err(e) = write.send(Message::Text(request.to_string().into())).await {
                            debug!("Failed to send request: {}", e);
                            return;
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        let reader = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Signaling connection failed: {}", e);
                        break;
                    }
                };
                match text.as_str().parse::<ServerMessage>() {
                    Ok(message) => {
                        if incoming_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed server message: {}", e),
                }
            }
        });

        Ok(Self {
            outbound,
            inbound,
            shutdown: Some(shutdown),
            reader,
        })
    }

    /// A handle for queueing requests, typically given to a [`NegotiationController`]
    pub fn sender(&self) -> mpsc::UnboundedSender<Request> {
        self.outbound.clone()
    }

    /// Next server message, `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    /// Feed server messages to `controller` until `done` holds
    pub async fn drive_until<D, F>(
        &mut self,
        controller: &mut NegotiationController<D>,
        mut done: F,
    ) -> Result<(), ClientError>
    where
        D: Device,
        F: FnMut(&NegotiationController<D>) -> bool,
    {
        while !done(controller) {
            let message = self.recv().await.ok_or(ClientError::Closed)?;
            controller.handle(message).await?;
        }
        Ok(())
    }

    /// Feed every server message to `controller` until the connection closes
    pub async fn run<D: Device>(
        &mut self,
        controller: &mut NegotiationController<D>,
    ) -> Result<(), ClientError> {
        while let Some(message) = self.recv().await {
            controller.handle(message).await?;
        }
        Ok(())
    }
}

impl Drop for SignalingSocket {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.reader.abort();
    }
}
