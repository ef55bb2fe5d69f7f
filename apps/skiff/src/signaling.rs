use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use skiff_protocol::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

/// Client end of the pier's signalling socket: a writer task drains
/// outbound frames, a reader task parses inbound ones and drops
/// anything malformed, exactly as the server does.
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    inbound: mpsc::UnboundedReceiver<ServerFrame>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SignalingChannel {
    pub async fn connect(ws_url: &Url) -> Result<Self> {
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .context("connect signalling websocket")?;
        debug!(url = %ws_url, "signalling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerFrame>();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(err) => debug!("dropping unparseable signalling frame: {err}"),
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "signalling websocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("signalling websocket error: {err}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound,
            inbound,
            tasks: vec![writer, reader],
        })
    }

    /// Clonable sender for engine callbacks.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientFrame> {
        self.outbound.clone()
    }

    /// Next server frame; `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.inbound.recv().await
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
