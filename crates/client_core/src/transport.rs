use std::{pin::pin, time::Duration};

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::json;
use shared::protocol::{ClientCommand, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{ClientSettings, MESSAGING_NAMESPACE},
    error::ClientError,
    socketio::{EnginePacket, OpenHandshake, SocketPacket},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// One established connection. Dropping `commands` closes it; `events`
/// ends when the remote side goes away.
pub struct Link {
    pub commands: mpsc::UnboundedSender<ClientCommand>,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

/// The far end of an in-memory [`Link`].
pub struct LinkPeer {
    pub commands: mpsc::UnboundedReceiver<ClientCommand>,
    pub events: mpsc::UnboundedSender<ServerEvent>,
}

impl Link {
    pub fn pair() -> (Link, LinkPeer) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Link {
                commands: command_tx,
                events: event_rx,
            },
            LinkPeer {
                commands: command_rx,
                events: event_tx,
            },
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credential: &str) -> Result<Link, ClientError>;
}

pub struct SocketIoConnector {
    endpoint: Url,
    namespace: String,
    handshake_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            namespace: MESSAGING_NAMESPACE.to_string(),
            handshake_timeout: Duration::from_secs(20),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: settings.websocket_url()?,
            namespace: MESSAGING_NAMESPACE.to_string(),
            handshake_timeout: settings.connect_timeout,
        })
    }

    async fn handshake(&self, credential: &str) -> Result<Link, ClientError> {
        let (ws_stream, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|err| {
                ClientError::Transport(format!(
                    "failed to connect websocket {}: {err}",
                    self.endpoint
                ))
            })?;
        let (mut writer, mut reader) = ws_stream.split();

        let open = loop {
            match next_packet(&mut reader).await? {
                EnginePacket::Open(open) => break open,
                EnginePacket::Ping => send_packet(&mut writer, &EnginePacket::Pong).await?,
                other => debug!(?other, "socket: ignoring frame before open"),
            }
        };

        let connect = EnginePacket::Message(SocketPacket::Connect {
            nsp: self.namespace.clone(),
            data: Some(json!({ "token": credential })),
        });
        send_packet(&mut writer, &connect).await?;

        loop {
            match next_packet(&mut reader).await? {
                EnginePacket::Message(SocketPacket::Connect { nsp, .. })
                    if nsp == self.namespace =>
                {
                    break
                }
                EnginePacket::Message(SocketPacket::ConnectError { nsp, message })
                    if nsp == self.namespace =>
                {
                    return Err(ClientError::Handshake(message));
                }
                EnginePacket::Ping => send_packet(&mut writer, &EnginePacket::Pong).await?,
                EnginePacket::Close => {
                    return Err(ClientError::Handshake(
                        "server closed during namespace connect".into(),
                    ))
                }
                other => debug!(?other, "socket: ignoring frame before namespace ack"),
            }
        }

        info!(sid = %open.sid, namespace = %self.namespace, "socket: connected");
        let (link, peer) = Link::pair();
        tokio::spawn(pump(
            writer,
            reader,
            self.namespace.clone(),
            heartbeat_window(&open),
            peer,
        ));
        Ok(link)
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn connect(&self, credential: &str) -> Result<Link, ClientError> {
        timeout(self.handshake_timeout, self.handshake(credential))
            .await
            .map_err(|_| ClientError::Handshake("timed out waiting for handshake".into()))?
    }
}

fn heartbeat_window(open: &OpenHandshake) -> Option<Duration> {
    if open.ping_interval == 0 {
        return None;
    }
    Some(Duration::from_millis(open.ping_interval + open.ping_timeout))
}

async fn next_packet(reader: &mut WsReader) -> Result<EnginePacket, ClientError> {
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                return EnginePacket::decode(&text)
                    .map_err(|err| ClientError::Handshake(format!("invalid frame: {err}")));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::Transport("websocket closed".into()));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                return Err(ClientError::Transport(format!(
                    "websocket receive failed: {err}"
                )))
            }
        }
    }
}

async fn send_packet(writer: &mut WsWriter, packet: &EnginePacket) -> Result<(), ClientError> {
    writer
        .send(Message::Text(packet.encode()))
        .await
        .map_err(|err| ClientError::Transport(format!("websocket send failed: {err}")))
}

async fn pump(
    mut writer: WsWriter,
    mut reader: WsReader,
    namespace: String,
    heartbeat: Option<Duration>,
    peer: LinkPeer,
) {
    let LinkPeer {
        mut commands,
        events,
    } = peer;
    let far_future = Duration::from_secs(60 * 60 * 24 * 365);
    let mut deadline = pin!(sleep(heartbeat.unwrap_or(far_future)));

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => match EnginePacket::decode(&text) {
                    Ok(EnginePacket::Ping) => {
                        if let Some(window) = heartbeat {
                            deadline.as_mut().reset(Instant::now() + window);
                        }
                        if send_packet(&mut writer, &EnginePacket::Pong).await.is_err() {
                            break;
                        }
                    }
                    Ok(EnginePacket::Close) => break,
                    Ok(EnginePacket::Message(SocketPacket::Event { nsp, name, data, .. }))
                        if nsp == namespace =>
                    {
                        match ServerEvent::from_named(&name, data) {
                            Ok(Some(event)) => {
                                if events.send(event).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => debug!(event = %name, "socket: ignoring unhandled event"),
                            Err(err) => warn!(event = %name, "socket: dropping malformed event: {err}"),
                        }
                    }
                    Ok(EnginePacket::Message(SocketPacket::Disconnect { nsp })) if nsp == namespace => {
                        info!(namespace = %nsp, "socket: server closed namespace");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => warn!("socket: undecodable frame: {err}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("socket: receive failed: {err}");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(command) => match command.into_named() {
                    Ok((name, data)) => {
                        let packet = EnginePacket::Message(SocketPacket::event(&namespace, name, data));
                        if send_packet(&mut writer, &packet).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("socket: failed to encode command: {err}"),
                },
                None => {
                    let bye = EnginePacket::Message(SocketPacket::Disconnect { nsp: namespace.clone() });
                    let _ = send_packet(&mut writer, &bye).await;
                    let _ = writer.close().await;
                    break;
                }
            },
            _ = &mut deadline => {
                warn!("socket: heartbeat timed out");
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
