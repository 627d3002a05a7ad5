//! WebSocket event channel.
//!
//! One JSON-encoded [`ServerEvent`] or [`ClientRequest`] per text frame. The
//! connector spawns a reader and a writer task per connection and exposes
//! them as a [`ChannelHandle`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(ServerEvent),
    Closed { reason: String },
}

/// Both directions of one live connection.
pub struct ChannelHandle {
    pub outbound: mpsc::UnboundedSender<ClientRequest>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientRequest>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Stops the connection's background tasks.
    pub fn close(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> Result<ChannelHandle>;
}

/// Derives the websocket endpoint from the server's http(s) base URL.
pub fn websocket_url(server_url: &str, ws_path: &str) -> Result<Url> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        server_url.to_string()
    } else {
        return Err(anyhow!(
            "server_url must start with http://, https://, ws:// or wss://"
        ));
    };
    let path = ws_path.trim_start_matches('/');
    let joined = format!("{}/{path}", ws_base.trim_end_matches('/'));
    Url::parse(&joined).with_context(|| format!("invalid websocket url: {joined}"))
}

pub struct WebSocketConnector {
    url: Url,
    token: String,
}

impl WebSocketConnector {
    pub fn new(url: Url, token: impl Into<String>) -> Self {
        Self {
            url,
            token: token.into(),
        }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self) -> Result<ChannelHandle> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid websocket request for {}", self.url))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .context("session token is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        info!(url = %self.url, "transport: websocket connected");
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(kind = request.kind(), "transport: failed to encode request: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("transport: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            debug!(kind = event.kind(), "transport: event received");
                            if inbound_tx.send(TransportEvent::Frame(event)).is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!("transport: invalid server event: {err}"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|frame| frame.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("websocket receive failed: {err}"),
                    None => break "websocket stream ended".to_string(),
                }
            };
            info!(%reason, "transport: websocket closed");
            let _ = inbound_tx.send(TransportEvent::Closed { reason });
        });

        Ok(ChannelHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![writer, reader],
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
