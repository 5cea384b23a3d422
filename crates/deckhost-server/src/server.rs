//! WebSocket transport for clients.
//!
//! One task accepts connections; each connection gets its own task that
//! pumps frames between the socket and the [`MessageRouter`]. App messages
//! are only queued here, so a slow app never stalls a socket. Stopping the
//! server cancels every task and closes every socket.

use std::net::SocketAddr;
use std::sync::Arc;

use deckhost_core::HostSettings;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_util::sync::CancellationToken;

use crate::router::{MessageRouter, Outgoing};

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct RouterServer {
    router: Arc<MessageRouter>,
    bind_addr: Mutex<String>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl RouterServer {
    pub fn new(router: Arc<MessageRouter>, bind_addr: impl Into<String>) -> Self {
        Self {
            router,
            bind_addr: Mutex::new(bind_addr.into()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind and start accepting. Returns the bound address.
    ///
    /// Starting a running server is a no-op.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.local_addr);
        }

        let bind_addr = self.bind_addr.lock().clone();
        let listener = TcpListener::bind(&bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening for clients on ws://{}", local_addr);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, self.router.clone(), cancel.clone()));
        *running = Some(Running {
            cancel,
            task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Close every connection and stop accepting.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::warn!("Accept loop ended abnormally: {}", e);
        }
        self.router.close_all();
        tracing::info!("Client server stopped");
    }

    /// Stop, take the address from `settings`, and start again.
    pub async fn restart(&self, settings: &HostSettings) -> std::io::Result<SocketAddr> {
        self.stop().await;
        *self.bind_addr.lock() = settings.bind_addr();
        self.start().await
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }
}

async fn accept_loop(listener: TcpListener, router: Arc<MessageRouter>, cancel: CancellationToken) {
    let connections = tokio_util::task::TaskTracker::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    connections.spawn(serve_connection(
                        stream,
                        addr,
                        router.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => tracing::warn!("Failed to accept connection: {}", e),
            },
        }
    }
    connections.close();
    connections.wait().await;
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<MessageRouter>,
    cancel: CancellationToken,
) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::debug!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();
    let (tx, mut outgoing) = mpsc::unbounded_channel();
    router.connect(addr, tx).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Frame::Close(None)).await;
                break;
            }
            frame = outgoing.recv() => match frame {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = sink.send(Frame::Text(text)).await {
                        tracing::debug!("Send to {} failed: {}", addr, e);
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Frame::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Frame::Text(text))) => router.handle_text(addr, &text).await,
                Some(Ok(Frame::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => router.handle_text(addr, text).await,
                    Err(_) => tracing::debug!("Dropped non-UTF-8 frame from {}", addr),
                },
                Some(Ok(Frame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Connection {} failed: {}", addr, e);
                    break;
                }
            },
        }
    }

    router.disconnect(addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use deckhost_core::{Message, MissingTargetPolicy};
    use tokio_tungstenite::connect_async;

    async fn next_message<S>(stream: &mut S) -> Message
    where
        S: futures::Stream<Item = Result<Frame, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match stream.next().await.unwrap().unwrap() {
                Frame::Text(text) => return Message::parse(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_client_round_trip_and_restart() {
        let f = Fixture::new(MissingTargetPolicy::Broadcast).await;
        let server = RouterServer::new(f.router.clone(), "127.0.0.1:0");
        let addr = server.start().await.unwrap();
        assert_eq!(server.start().await.unwrap(), addr);

        let (mut socket, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let kinds = [
            next_message(&mut socket).await.kind,
            next_message(&mut socket).await.kind,
            next_message(&mut socket).await.kind,
        ];
        assert_eq!(kinds, ["config", "button_mappings", "get"]);

        socket
            .send(Frame::Text(r#"{"app":"server","type":"heartbeat"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_message(&mut socket).await.kind, "heartbeat");
        assert_eq!(f.router.clients().len(), 1);

        server.stop().await;
        assert!(server.local_addr().await.is_none());
        assert!(f.router.clients().is_empty());

        let settings = HostSettings {
            address: "127.0.0.1".to_string(),
            port: 0,
            ..HostSettings::default()
        };
        let addr = server.restart(&settings).await.unwrap();
        let (mut socket, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        assert_eq!(next_message(&mut socket).await.kind, "config");
        server.stop().await;
    }
}
