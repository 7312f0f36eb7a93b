//! Encrypted transport: two pumps over a framed socket. The inbound pump
//! decrypts and forwards; the outbound pump encrypts and writes. Peer
//! disconnection is signalled exclusively through `remote_closed`.

use std::future::Future;
use std::sync::Arc;

use baselink_core::noise::CipherState;
use baselink_core::wire::MAX_FRAME_LEN;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Ciphertext bound for one incoming frame: plaintext cap plus AEAD tag and
/// slack. Anything larger is a misbehaving peer and kills the connection.
const MAX_WIRE_FRAME: usize = MAX_FRAME_LEN as usize + 64;

const CHANNEL_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket closed")]
    Closed,
    #[error("socket error: {0}")]
    Socket(String),
}

/// Write half of a message-oriented socket. `close` must be safe to call
/// more than once.
pub trait FrameSender: Send + 'static {
    fn send(&mut self, frame: Vec<u8>)
        -> impl Future<Output = Result<(), TransportError>> + Send + '_;
    fn close(&mut self) -> impl Future<Output = ()> + Send + '_;
}

/// Read half of a message-oriented socket. `Ok(None)` means the peer closed
/// cleanly.
pub trait FrameReceiver: Send + 'static {
    fn recv(&mut self)
        -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send + '_;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket options for dialing: the read bound must hold at the websocket
/// layer too, or a peer could make tungstenite buffer an arbitrarily large
/// message before the pump ever sees it.
pub(crate) fn websocket_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_WIRE_FRAME))
        .max_frame_size(Some(MAX_WIRE_FRAME))
}

pub struct WsSender {
    sink: SplitSink<WsStream, WsMessage>,
    closed: bool,
}

pub struct WsReceiver {
    stream: SplitStream<WsStream>,
}

/// Split a connected websocket into framed halves.
pub fn split_websocket(ws: WsStream) -> (WsSender, WsReceiver) {
    let (sink, stream) = ws.split();
    (
        WsSender {
            sink,
            closed: false,
        },
        WsReceiver { stream },
    )
}

impl FrameSender for WsSender {
    fn send(
        &mut self,
        frame: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + '_ {
        async move {
            self.sink
                .send(WsMessage::binary(frame))
                .await
                .map_err(|err| TransportError::Socket(err.to_string()))
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            if self.closed {
                return;
            }
            self.closed = true;
            let _ = self.sink.send(WsMessage::Close(None)).await;
            let _ = self.sink.close().await;
        }
    }
}

impl FrameReceiver for WsReceiver {
    fn recv(
        &mut self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send + '_ {
        async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data.to_vec())),
                    Some(Ok(WsMessage::Text(data))) => return Ok(Some(data.as_bytes().to_vec())),
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                    // Control frames; tungstenite answers pings itself.
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(TransportError::Socket(err.to_string())),
                }
            }
        }
    }
}

/// Caller-initiated close. Signalling it makes the outbound pump write a
/// close frame and shut the socket down. Cloneable so every cleanup path
/// can reach it; signalling more than once is a no-op.
#[derive(Clone)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles to a running pair of pumps.
pub struct Transport {
    /// Plaintext out. Dropping every sender also ends the connection with a
    /// close frame.
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Plaintext in, in wire order.
    pub inbound: mpsc::Receiver<Vec<u8>>,
    /// Flips to true exactly when the peer is gone (clean close, read error,
    /// oversized frame, or undecryptable frame).
    pub remote_closed: watch::Receiver<bool>,
    /// Local close signal.
    pub shutdown: ShutdownToken,
}

/// Start the inbound and outbound pumps over an authenticated socket.
pub fn spawn_pumps<TX, RX>(
    mut tx: TX,
    mut rx: RX,
    mut send_cipher: CipherState,
    mut recv_cipher: CipherState,
) -> Transport
where
    TX: FrameSender,
    RX: FrameReceiver,
{
    let (inbound_tx, inbound) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let (remote_closed_tx, remote_closed) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Some(frame)) => {
                    if frame.len() > MAX_WIRE_FRAME {
                        tracing::warn!(len = frame.len(), "oversized frame from base");
                        break;
                    }
                    match recv_cipher.decrypt(&frame) {
                        Ok(plain) => {
                            if inbound_tx.send(plain).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            // Cipher state is strictly sequential; there is
                            // no resynchronizing after this.
                            tracing::error!("could not decrypt incoming frame");
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("socket read failed: {err}");
                    break;
                }
            }
        }
        let _ = remote_closed_tx.send(true);
    });

    let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let shutdown = ShutdownToken::new();
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => match maybe {
                    Some(plain) => {
                        let frame = match send_cipher.encrypt(&plain) {
                            Ok(frame) => frame,
                            Err(_) => {
                                tracing::error!("could not encrypt outgoing frame");
                                break;
                            }
                        };
                        if let Err(err) = tx.send(frame).await {
                            tracing::warn!("socket write failed: {err}");
                            break;
                        }
                    }
                    None => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tx.close().await;
        tracing::debug!("outbound pump stopped");
    });

    Transport {
        outbound,
        inbound,
        remote_closed,
        shutdown,
    }
}

/// In-memory framed socket for tests: two mpsc channels crossed over.
#[cfg(test)]
pub(crate) mod mem {
    use super::*;

    pub struct MemSender {
        tx: Option<mpsc::Sender<Vec<u8>>>,
    }

    pub struct MemReceiver {
        rx: mpsc::Receiver<Vec<u8>>,
    }

    /// Two connected endpoints, each a (sender, receiver) pair.
    pub fn pair() -> ((MemSender, MemReceiver), (MemSender, MemReceiver)) {
        let (a_tx, b_rx) = mpsc::channel(64);
        let (b_tx, a_rx) = mpsc::channel(64);
        (
            (MemSender { tx: Some(a_tx) }, MemReceiver { rx: a_rx }),
            (MemSender { tx: Some(b_tx) }, MemReceiver { rx: b_rx }),
        )
    }

    impl FrameSender for MemSender {
        fn send(
            &mut self,
            frame: Vec<u8>,
        ) -> impl Future<Output = Result<(), TransportError>> + Send + '_ {
            async move {
                match &self.tx {
                    Some(tx) => tx.send(frame).await.map_err(|_| TransportError::Closed),
                    None => Err(TransportError::Closed),
                }
            }
        }

        fn close(&mut self) -> impl Future<Output = ()> + Send + '_ {
            async move {
                // Dropping the sender is the close frame; twice is a no-op.
                self.tx = None;
            }
        }
    }

    impl FrameReceiver for MemReceiver {
        fn recv(
            &mut self,
        ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send + '_ {
            async move { Ok(self.rx.recv().await) }
        }
    }
}
