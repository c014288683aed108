//! WebSocket adapters for the edge's signaling and metadata channels

use anyhow::{Context, Result};
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::metadata::MetadataSource;
use crate::signaling::{SignalingChannel, SignalingConnector};
use crate::{SignalMessage, PATH_METADATA_WS, PATH_SIGNALING_WS};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket URL for `path` on the edge at `base_url` (`http(s)://` or `ws(s)://`)
pub fn ws_url(base_url: &str, path: &str) -> Result<String> {
    let base = base_url.trim().trim_end_matches('/');
    let rest = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        anyhow::bail!("Unsupported edge URL scheme: {base_url}");
    };
    Ok(format!("{rest}{path}"))
}

async fn connect(url: &str) -> Result<WsStream> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;
    debug!(url, "WebSocket connected");
    Ok(stream)
}

/// Text payload of a data frame. Control frames yield `None`.
fn text_of(message: Message) -> Option<Result<String>> {
    match message {
        Message::Text(text) => Some(Ok(text.as_str().to_owned())),
        Message::Binary(data) => Some(
            String::from_utf8(data.to_vec()).context("Binary frame is not UTF-8"),
        ),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
    }
}

/// Opens the edge's signaling WebSocket
pub struct WsSignalingConnector {
    url: String,
}

impl WsSignalingConnector {
    pub fn new(edge_url: &str) -> Result<Self> {
        Ok(Self {
            url: ws_url(edge_url, PATH_SIGNALING_WS)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl SignalingConnector for WsSignalingConnector {
    async fn open(&self) -> Result<Box<dyn SignalingChannel>> {
        let stream = connect(&self.url).await?;
        info!(url = %self.url, "Signaling channel open");
        Ok(Box::new(WsSignalingChannel { stream }))
    }
}

pub struct WsSignalingChannel {
    stream: WsStream,
}

#[async_trait::async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send(&mut self, msg: &SignalMessage) -> Result<()> {
        let text = msg.encode().context("Failed to encode signaling message")?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .with_context(|| format!("Failed to send {}", msg.kind()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Signaling channel closed by edge");
                    return None;
                }
                Ok(message) => {
                    if let Some(text) = text_of(message) {
                        return Some(text);
                    }
                }
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(e).context("Signaling channel error")),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e).context("Failed to close signaling channel"),
        }
    }
}

/// The edge's metadata push WebSocket
pub struct WsMetadataSource {
    url: String,
}

impl WsMetadataSource {
    pub fn new(edge_url: &str) -> Result<Self> {
        Ok(Self {
            url: ws_url(edge_url, PATH_METADATA_WS)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl MetadataSource for WsMetadataSource {
    async fn open(&self) -> Result<BoxStream<'static, Result<String>>> {
        let stream = connect(&self.url).await?;
        let messages = stream.filter_map(|message| async move {
            match message {
                Ok(message) => text_of(message),
                Err(tungstenite::Error::ConnectionClosed) => None,
                Err(e) => Some(Err(e).context("Metadata channel error")),
            }
        });
        Ok(messages.boxed())
    }
}
