mod messages;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{Message, handshake::server::Request},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::BridgeConfig,
    service::{NarrationService, ServiceError},
};

pub use messages::{ClientMessage, DaemonMessage};

/// Outbound frames queued per connection. Audio blocks count against this,
/// so a slow client backs up into the stream producer.
const OUTGOING_BUFFER: usize = 64;

/// WebSocket front door. Each connection handles its requests in order; a
/// request's binary frames always follow its own control message.
pub struct Bridge {
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl Bridge {
    pub async fn bind(config: &BridgeConfig, service: Arc<NarrationService>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        let local_addr = listener.local_addr()?;
        info!("Bridge listening on {local_addr}");

        let acceptor = BridgeAcceptor {
            listener,
            service,
            max_clients: config.max_clients,
        };

        let acceptor = tokio::spawn(async move {
            if let Err(err) = acceptor.run().await {
                error!(?err, "bridge acceptor exited");
            }
        });

        Ok(Self {
            local_addr,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves when the acceptor stops, which only happens on a listener error.
    pub async fn closed(&mut self) -> Result<()> {
        (&mut self.acceptor)
            .await
            .map_err(|err| anyhow!("bridge acceptor panicked: {err}"))
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

struct BridgeAcceptor {
    listener: TcpListener,
    service: Arc<NarrationService>,
    max_clients: usize,
}

impl BridgeAcceptor {
    async fn run(self) -> Result<()> {
        let active = Arc::new(AtomicUsize::new(0));

        loop {
            let (stream, addr) = self.listener.accept().await?;
            let current = active.load(Ordering::SeqCst);
            if current >= self.max_clients {
                warn!("Rejecting {addr}, max clients reached ({current})");
                continue;
            }

            let service = self.service.clone();
            let active_count = active.clone();

            active_count.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, addr, service).await {
                    warn!(?err, "Bridge client error");
                }
                active_count.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

enum Outbound {
    Control(DaemonMessage),
    Audio(Bytes),
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    service: Arc<NarrationService>,
) -> Result<()> {
    let callback =
        |req: &Request, response: tokio_tungstenite::tungstenite::handshake::server::Response| {
            debug!("Bridge connection from {addr}: {req:?}");
            Ok(response)
        };
    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (mut writer, mut reader) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTGOING_BUFFER);

    let writer_task = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            let frame = match outbound {
                Outbound::Control(msg) => Message::Text(serde_json::to_string(&msg)?),
                Outbound::Audio(bytes) => Message::Binary(bytes.to_vec()),
            };
            writer.send(frame).await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    let hello = DaemonMessage::Hello {
        version: env!("CARGO_PKG_VERSION").into(),
        capabilities: vec!["synthesize".into(), "stream".into(), "captions".into()],
        engines: service.registry().engines(),
        recommended_engine: service.recommended_engine(),
    };
    let mut outcome = send(&out_tx, Outbound::Control(hello)).await;

    while outcome.is_ok() {
        let Some(message) = reader.next().await else {
            break;
        };
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(parsed) => outcome = dispatch(&service, parsed, &out_tx).await,
                Err(err) => {
                    warn!(?err, "Invalid client payload {text}");
                    let reply = DaemonMessage::Error {
                        request_id: None,
                        status: 400,
                        message: format!("invalid message: {err}"),
                    };
                    outcome = send(&out_tx, Outbound::Control(reply)).await;
                }
            },
            Ok(Message::Binary(_)) => {
                warn!("Binary payloads are not supported");
            }
            Ok(Message::Close(frame)) => {
                info!("Client {addr} closed: {frame:?}");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(?err, "Bridge read error");
                break;
            }
        }
    }

    drop(out_tx);
    match writer_task.await {
        Ok(Err(err)) => debug!(?err, "Bridge writer stopped"),
        Err(err) => warn!(?err, "Bridge writer panicked"),
        Ok(Ok(())) => {}
    }
    info!("Client {addr} disconnected");
    Ok(())
}

async fn send(out: &mpsc::Sender<Outbound>, outbound: Outbound) -> Result<()> {
    out.send(outbound)
        .await
        .map_err(|_| anyhow!("client writer closed"))
}

fn failure(request_id: &str, err: &ServiceError) -> Outbound {
    if err.is_client_error() {
        warn!(request_id, %err, "Request rejected");
    } else {
        error!(request_id, ?err, "Request failed");
    }
    Outbound::Control(DaemonMessage::Error {
        request_id: Some(request_id.to_string()),
        status: err.status(),
        message: err.client_message(),
    })
}

/// Errors only when the client can no longer be written to.
async fn dispatch(
    service: &NarrationService,
    message: ClientMessage,
    out: &mpsc::Sender<Outbound>,
) -> Result<()> {
    match message {
        ClientMessage::Ping { nonce } => {
            send(out, Outbound::Control(DaemonMessage::Pong { nonce })).await
        }
        ClientMessage::Health => {
            send(out, Outbound::Control(DaemonMessage::Health(service.health()))).await
        }
        ClientMessage::Voices => {
            send(out, Outbound::Control(DaemonMessage::Voices(service.voices()))).await
        }
        ClientMessage::RecommendedEngine => {
            let reply = DaemonMessage::RecommendedEngine {
                recommended_engine: service.recommended_engine(),
            };
            send(out, Outbound::Control(reply)).await
        }
        ClientMessage::Synthesize {
            request_id,
            request,
        } => match service.package(&request).await {
            Ok(package) => {
                let header = DaemonMessage::Package {
                    request_id,
                    file_name: package.file_name().into(),
                    content_type: package.content_type().into(),
                    size: package.bytes.len(),
                    cached: package.cached,
                };
                send(out, Outbound::Control(header)).await?;
                send(out, Outbound::Audio(package.bytes)).await
            }
            Err(err) => send(out, failure(&request_id, &err)).await,
        },
        ClientMessage::Stream {
            request_id,
            request,
        } => {
            let mut live = match service.stream(&request).await {
                Ok(live) => live,
                Err(err) => return send(out, failure(&request_id, &err)).await,
            };
            let start = DaemonMessage::StreamStart {
                request_id: request_id.clone(),
                content_type: live.encoding.content_type().into(),
                sample_rate: live.sample_rate,
                headers: live.headers.iter().cloned().collect(),
            };
            send(out, Outbound::Control(start)).await?;

            let mut bytes = 0u64;
            while let Some(block) = live.body.next().await {
                bytes += block.len() as u64;
                send(out, Outbound::Audio(block)).await?;
            }
            let error = live.status.failure();
            if let Some(reason) = &error {
                warn!(request_id = %request_id, %reason, "Live stream ended early");
            }
            let end = DaemonMessage::StreamEnd {
                request_id,
                bytes,
                error,
            };
            send(out, Outbound::Control(end)).await
        }
    }
}
