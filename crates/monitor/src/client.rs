//! WebSocket client for the backend push channel.
//!
//! [`PushClient`] holds the endpoint configuration. Call
//! [`PushClient::connect`] to establish a live [`PushConnection`].

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// The raw WebSocket stream type used by the push channel.
pub type PushStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for the push endpoint.
#[derive(Debug, Clone)]
pub struct PushClient {
    ws_url: String,
}

/// A live WebSocket connection to the backend.
pub struct PushConnection {
    /// Unique client ID sent during the WebSocket handshake.
    pub client_id: String,
    pub ws_stream: PushStream,
}

impl PushClient {
    /// `ws_url` is the full push endpoint, e.g. `ws://host:5000/ws`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the push endpoint.
    ///
    /// Generates a unique `client_id` (UUID v4) and appends it as a
    /// `clientId` query parameter so server logs can tell reconnects of the
    /// same console apart.
    pub async fn connect(&self) -> Result<PushConnection, PushClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = handshake_url(&self.ws_url, &client_id);

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            PushClientError::Connection(format!(
                "Failed to connect to push channel at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to push channel at {}", self.ws_url);

        Ok(PushConnection {
            client_id,
            ws_stream,
        })
    }
}

fn handshake_url(ws_url: &str, client_id: &str) -> String {
    let separator = if ws_url.contains('?') { '&' } else { '?' };
    format!("{ws_url}{separator}clientId={client_id}")
}

/// Errors that can occur when working with the push client.
#[derive(Debug, thiserror::Error)]
pub enum PushClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
