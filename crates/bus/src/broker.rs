//! Fan-out broker and its client
//!
//! The broker accepts WebSocket connections. Each connection may publish
//! messages and may subscribe to topics; every published message is forwarded
//! to all connections whose filter matches its topic. Delivery is best effort:
//! subscribers that fall behind lose messages.

use crate::{
    error::BusError,
    message::{BrokerFrame, FanOutMessage},
    transport::FanOut,
};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, Mutex},
};
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

/// Initial reconnect backoff for broker subscribers
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum reconnect backoff for broker subscribers
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Per-connection topic filter
#[derive(Debug, Default)]
struct TopicFilter {
    all: bool,
    topics: HashSet<String>,
}

impl TopicFilter {
    fn matches(&self, topic: &str) -> bool {
        self.all || self.topics.contains(topic)
    }

    fn add(&mut self, topics: Vec<String>) {
        if topics.is_empty() {
            self.all = true;
        }
        self.topics.extend(topics);
    }
}

/// Fan-out broker (the proxy every node and client connects to)
pub struct Broker {
    tx: broadcast::Sender<FanOutMessage>,
}

impl Broker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self { tx }
    }

    /// Bind `addr` and forward messages until the task is aborted
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Fan-out broker listening on {}", addr);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("Broker connection from {}", peer_addr);
                    let tx = self.tx.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_broker_connection(stream, tx).await {
                            tracing::debug!("Broker connection from {} ended: {}", peer_addr, e);
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

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_broker_connection(
    stream: TcpStream,
    tx: broadcast::Sender<FanOutMessage>,
) -> Result<(), BusError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let filter = Arc::new(RwLock::new(TopicFilter::default()));
    let mut rx = tx.subscribe();

    // Forward matching broadcasts to this connection
    let send_filter = filter.clone();
    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    if !send_filter.read().matches(&message.topic) {
                        continue;
                    }
                    let encoded = match serde_json::to_string(&message) {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            tracing::warn!("Dropping unencodable message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(encoded)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Broker subscriber lagged {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let frame: BrokerFrame = match msg {
            Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Ignoring malformed broker frame: {}", e);
                    continue;
                }
            },
            Ok(Message::Binary(data)) => match serde_json::from_slice(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Ignoring malformed broker frame: {}", e);
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("Broker websocket error: {}", e);
                break;
            }
        };

        match frame {
            BrokerFrame::Subscribe { topics } => {
                tracing::debug!("Subscribe {:?}", topics);
                filter.write().add(topics);
            }
            BrokerFrame::Publish { topic, payload } => {
                tracing::debug!("Forwarding message on topic {}", topic);
                // No receivers is fine
                let _ = tx.send(FanOutMessage::new(topic, payload));
            }
        }
    }

    send_task.abort();
    Ok(())
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// [`FanOut`] implementation backed by a remote [`Broker`]
pub struct BrokerBus {
    addr: String,
    publisher: Mutex<Option<WsSink>>,
    connect_timeout: Duration,
}

impl BrokerBus {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            publisher: Mutex::new(None),
            connect_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, BusError> {
        let url = format!("ws://{}", self.addr);
        match tokio::time::timeout(self.connect_timeout, connect_async(&url)).await {
            Ok(result) => Ok(result?.0),
            Err(_) => Err(BusError::Timeout(self.addr.clone(), self.connect_timeout)),
        }
    }
}

#[async_trait]
impl FanOut for BrokerBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        let frame = BrokerFrame::Publish {
            topic: topic.to_string(),
            payload,
        };
        let encoded = serde_json::to_string(&frame)?;

        let mut publisher = self.publisher.lock().await;
        if publisher.is_none() {
            let (sink, _) = self.connect().await?.split();
            tracing::debug!("Publisher connected to broker at {}", self.addr);
            *publisher = Some(sink);
        }

        if let Some(sink) = publisher.as_mut() {
            if let Err(e) = sink.send(Message::Text(encoded)).await {
                // Reconnect on the next publish
                *publisher = None;
                return Err(e.into());
            }
        }

        Ok(())
    }

    fn subscribe(&self, topics: Vec<String>) -> mpsc::Receiver<FanOutMessage> {
        let (tx, rx) = mpsc::channel(1024);
        let addr = self.addr.clone();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let bus = BrokerBus::new(addr).with_connect_timeout(connect_timeout);
            let mut backoff = INITIAL_BACKOFF;

            while !tx.is_closed() {
                match bus.run_subscription(&topics, &tx).await {
                    Ok(()) => backoff = INITIAL_BACKOFF,
                    Err(e) => {
                        tracing::warn!("Broker subscription to {} failed: {}", bus.addr, e);
                    }
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        });

        rx
    }
}

impl BrokerBus {
    /// Connect, register the filter and forward messages until the connection drops
    async fn run_subscription(
        &self,
        topics: &[String],
        tx: &mpsc::Sender<FanOutMessage>,
    ) -> Result<(), BusError> {
        let mut ws_stream = self.connect().await?;
        let frame = BrokerFrame::Subscribe {
            topics: topics.to_vec(),
        };
        ws_stream.send(Message::Text(serde_json::to_string(&frame)?)).await?;
        tracing::info!("Subscribed to {:?} on broker {}", topics, self.addr);

        while let Some(msg) = ws_stream.next().await {
            let message: FanOutMessage = match msg? {
                Message::Text(text) => serde_json::from_str(&text)?,
                Message::Binary(data) => serde_json::from_slice(&data)?,
                Message::Close(_) => break,
                _ => continue,
            };
            if tx.send(message).await.is_err() {
                // Receiver dropped
                break;
            }
        }

        Ok(())
    }
}
