//! WebSocket request/reply transport
//!
//! Server: one task per connection, one request in flight per connection.
//! Client: one short-lived connection per request, bounded by a timeout.

use crate::{
    error::BusError,
    message::{Reply, Request},
    transport::{RequestChannel, RequestHandler},
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

/// Serves a [`RequestHandler`] over WebSocket
pub struct RequestServer {
    handler: Arc<dyn RequestHandler>,
}

impl RequestServer {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self { handler }
    }

    /// Bind `addr` and serve until the task is aborted
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Request server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            tracing::debug!("Request connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<dyn RequestHandler>) -> Result<(), BusError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    while let Some(msg) = ws_receiver.next().await {
        let reply = match msg? {
            Message::Text(text) => decode_and_handle(text.as_bytes(), handler.as_ref()).await,
            Message::Binary(data) => decode_and_handle(&data, handler.as_ref()).await,
            Message::Close(_) => break,
            _ => continue,
        };

        let encoded = serde_json::to_string(&reply)?;
        ws_sender.send(Message::Text(encoded)).await?;
    }

    Ok(())
}

async fn decode_and_handle(bytes: &[u8], handler: &dyn RequestHandler) -> Reply {
    match serde_json::from_slice::<Request>(bytes) {
        Ok(request) => handler.handle(request).await,
        Err(e) => {
            tracing::warn!("Undecodable request: {}", e);
            Reply::error("error", format!("could not decode request: {}", e))
        }
    }
}

/// Request/reply client over WebSocket
#[derive(Debug, Clone, Default)]
pub struct WsRequestChannel;

impl WsRequestChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestChannel for WsRequestChannel {
    async fn request(&self, addr: &str, request: Request, timeout: Duration) -> Result<Reply, BusError> {
        match tokio::time::timeout(timeout, exchange(addr, &request)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(addr.to_string(), timeout)),
        }
    }
}

async fn exchange(addr: &str, request: &Request) -> Result<Reply, BusError> {
    let url = format!("ws://{}", addr);
    let (mut ws_stream, _) = connect_async(&url).await?;

    ws_stream.send(Message::Text(serde_json::to_string(request)?)).await?;

    while let Some(msg) = ws_stream.next().await {
        match msg? {
            Message::Text(text) => {
                let reply = serde_json::from_str(&text)?;
                let _ = ws_stream.close(None).await;
                return Ok(reply);
            }
            Message::Binary(data) => {
                let reply = serde_json::from_slice(&data)?;
                let _ = ws_stream.close(None).await;
                return Ok(reply);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Err(BusError::Closed)
}
