//! WebSocket server for subscribers.
//!
//! Each connection gets a writer task draining its outbound queue, while
//! the accepting task reads frames and handles them one at a time. A
//! slow write on one connection never stalls another.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use plcbridge_common::{ClientCommand, ProtocolError, ServerMessage, parse_command, parse_tag};
use plcbridge_framework::{BridgeError, Result};

use crate::bridge::Bridge;
use crate::hub::{Subscriber, SubscriberId};

/// Accepts subscriber connections.
pub struct Server {
    listener: TcpListener,
    bridge: Bridge,
    connections: Arc<Semaphore>,
}

impl Server {
    /// Bind the listen address.
    pub async fn bind(addr: &str, bridge: Bridge, max_connections: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::bind(addr, e))?;

        Ok(Self {
            listener,
            bridge,
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever.
    pub async fn run(self) {
        let mut next_id: SubscriberId = 0;

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let Ok(permit) = self.connections.clone().try_acquire_owned() else {
                        warn!(peer = %peer, "Max connections reached, rejecting");
                        drop(stream);
                        continue;
                    };

                    next_id += 1;
                    let id = next_id;
                    let bridge = self.bridge.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_connection(stream, peer, id, bridge).await {
                            debug!(subscriber = id, peer = %peer, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: SubscriberId,
    bridge: Bridge,
) -> std::result::Result<(), WsError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    info!(subscriber = id, peer = %peer, "Subscriber connected");

    let (mut sink, mut frames) = ws.split();
    let (subscriber, mut outbound) = Subscriber::channel(id, bridge.subscriber_buffer());

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(subscriber = id, error = %e, "Failed to encode message");
                    continue;
                }
            };

            if let Err(e) = sink.send(Message::text(text)).await {
                debug!(subscriber = id, error = %e, "Send failed");
                break;
            }
        }
    });

    let result = read_frames(&mut frames, &subscriber, &bridge).await;

    bridge.hub().unsubscribe_all(id);
    writer.abort();

    info!(subscriber = id, peer = %peer, "Subscriber disconnected");
    result
}

async fn read_frames<S>(
    frames: &mut S,
    subscriber: &Subscriber,
    bridge: &Bridge,
) -> std::result::Result<(), WsError>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = frames.next().await {
        match frame? {
            Message::Text(text) => handle_text(text.as_str(), subscriber, bridge).await,
            Message::Binary(_) => {
                subscriber
                    .reply(ServerMessage::error(ProtocolError::InvalidJson))
                    .await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    Ok(())
}

/// Handle one text frame from a subscriber.
pub async fn handle_text(text: &str, subscriber: &Subscriber, bridge: &Bridge) {
    let command = match parse_command(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(subscriber = subscriber.id(), error = %e, "Bad frame");
            subscriber.reply(ServerMessage::error(e)).await;
            return;
        }
    };

    match command {
        ClientCommand::Subscribe { tag } => {
            let Some(tag) = ClientCommand::subscribe_tag(&tag) else {
                debug!(subscriber = subscriber.id(), "Ignoring subscribe without tag");
                return;
            };

            let known = parse_tag(tag).is_some_and(|t| bridge.registry().contains(t.controller));
            if !known {
                debug!(subscriber = subscriber.id(), tag, "Tag names no configured controller");
            }

            bridge.hub().subscribe(subscriber.clone(), tag);
        }
        ClientCommand::Write(request) => {
            bridge.relay().handle_write(subscriber, &request).await;
        }
        ClientCommand::Sequence(request) => {
            bridge.relay().handle_sequence(subscriber, &request).await;
        }
        ClientCommand::Health => {
            subscriber.reply(bridge.health_report()).await;
        }
    }
}
