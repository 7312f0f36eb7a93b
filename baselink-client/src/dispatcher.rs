//! Request/response multiplexing over one encrypted transport. A single loop
//! is the only reader of decrypted frames: replies complete the matching
//! pending request, events update the status snapshot and go to the sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use baselink_core::protocol::{BaseStatus, Message, RequestTag};
use baselink_core::wire::{decode_frame, encode_frame};
use tokio::sync::{oneshot, watch};

use crate::events::{status_topic, Event, EventSink};
use crate::transport::{ShutdownToken, Transport};

/// Invoked once when the base drops the connection, with the base's address.
/// Never invoked on a locally initiated close.
pub type FailureCallback = Box<dyn FnOnce(String) + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("message encoding failed: {0}")]
    Encode(#[from] baselink_core::wire::FrameEncodeError),
    /// A request with the same tag is already waiting for its reply.
    #[error("request {0} already in flight")]
    RequestInFlight(&'static str),
    /// The connection is gone; the session must be re-dialed.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Pending reply slots plus the terminal flag, under one lock: a request
/// either registers its slot before teardown clears the table, or it sees
/// `closed` and fails fast. No interleaving can strand a slot.
struct PendingTable {
    slots: HashMap<RequestTag, oneshot::Sender<Message>>,
    closed: bool,
}

type Pending = Arc<Mutex<PendingTable>>;

pub struct Dispatcher {
    outbound: tokio::sync::mpsc::Sender<Vec<u8>>,
    pending: Pending,
    status: Arc<Mutex<Option<BaseStatus>>>,
    closed: watch::Receiver<bool>,
    shutdown: ShutdownToken,
}

impl Dispatcher {
    /// Take over the transport and start the consumer loop. `on_failure`
    /// fires exactly once if the base disconnects while the loop runs.
    pub fn spawn(
        transport: Transport,
        sink: Arc<dyn EventSink>,
        base_id: String,
        address: String,
        on_failure: FailureCallback,
    ) -> Self {
        let Transport {
            outbound,
            mut inbound,
            mut remote_closed,
            shutdown,
        } = transport;
        let pending: Pending = Arc::new(Mutex::new(PendingTable {
            slots: HashMap::new(),
            closed: false,
        }));
        let status = Arc::new(Mutex::new(None));
        let (closed_tx, closed) = watch::channel(false);

        let mut local_close = shutdown.subscribe();
        let loop_shutdown = shutdown.clone();
        let loop_pending = Arc::clone(&pending);
        let loop_status = Arc::clone(&status);

        tokio::spawn(async move {
            let remote_failure = loop {
                tokio::select! {
                    maybe = inbound.recv() => match maybe {
                        Some(plain) => handle_frame(
                            &plain,
                            &loop_pending,
                            &loop_status,
                            sink.as_ref(),
                            &base_id,
                        ),
                        None => break !*local_close.borrow(),
                    },
                    changed = remote_closed.changed() => {
                        if changed.is_err() || *remote_closed.borrow() {
                            break !*local_close.borrow();
                        }
                    }
                    changed = local_close.changed() => {
                        if changed.is_ok() && *local_close.borrow() {
                            break false;
                        }
                    }
                }
            };
            // Mark the table terminal and drop the slots in one critical
            // section; every waiter resolves to ConnectionClosed and no
            // late request can register against the dead loop.
            {
                let mut table = loop_pending.lock().expect("pending request lock poisoned");
                table.closed = true;
                table.slots.clear();
            }
            // The socket must not outlive the loop, whichever pump died.
            loop_shutdown.signal();
            let _ = closed_tx.send(true);
            if remote_failure {
                tracing::warn!(%address, "base disconnected");
                on_failure(address);
            } else {
                tracing::debug!(%address, "dispatcher stopped after local close");
            }
        });

        Self {
            outbound,
            pending,
            status,
            closed,
            shutdown,
        }
    }

    /// Send `request` and wait for the reply carrying `tag`. Only one request
    /// per tag may be outstanding; the caller enforces single-flight.
    pub async fn request(&self, tag: RequestTag, request: Message) -> Result<Message, DispatchError> {
        let rx = {
            let mut table = self.pending.lock().expect("pending request lock poisoned");
            if table.closed {
                return Err(DispatchError::ConnectionClosed);
            }
            if table.slots.contains_key(&tag) {
                return Err(DispatchError::RequestInFlight(tag.as_str()));
            }
            let (tx, rx) = oneshot::channel();
            table.slots.insert(tag, tx);
            rx
        };

        let frame = encode_frame(&request)?;
        if self.outbound.send(frame).await.is_err() {
            self.pending
                .lock()
                .expect("pending request lock poisoned")
                .slots
                .remove(&tag);
            return Err(DispatchError::ConnectionClosed);
        }

        rx.await.map_err(|_| DispatchError::ConnectionClosed)
    }

    /// Last status snapshot observed from the base.
    pub fn status(&self) -> Option<BaseStatus> {
        self.status
            .lock()
            .expect("status snapshot lock poisoned")
            .clone()
    }

    /// Initiate a local close. Idempotent; the loop terminates without
    /// invoking the failure callback.
    pub fn close(&self) {
        self.shutdown.signal();
    }

    /// Flips to true when the loop has terminated for any reason.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }
}

fn handle_frame(
    plain: &[u8],
    pending: &Pending,
    status: &Arc<Mutex<Option<BaseStatus>>>,
    sink: &dyn EventSink,
    base_id: &str,
) {
    let message = match decode_frame(plain) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!("dropping undecodable frame: {err}");
            return;
        }
    };
    if let Some(tag) = message.reply_tag() {
        let slot = pending
            .lock()
            .expect("pending request lock poisoned")
            .slots
            .remove(&tag);
        match slot {
            // The requester may have given up; that is not an error here.
            Some(slot) => drop(slot.send(message)),
            None => tracing::warn!(tag = tag.as_str(), "reply with no pending request"),
        }
        return;
    }
    match message {
        Message::StatusEvent(snapshot) => {
            *status.lock().expect("status snapshot lock poisoned") = Some(snapshot.clone());
            sink.publish(&status_topic(base_id), Event::Status(snapshot));
        }
        other => tracing::warn!(?other, "unexpected message from base"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baselink_core::identity::Keypair;
    use baselink_core::noise::{CipherState, HandshakeState, Role, PROTOCOL_NAME};
    use baselink_core::protocol::SystemEnv;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::events::testsink::RecordingSink;
    use crate::transport::mem::{self, MemReceiver, MemSender};
    use crate::transport::{spawn_pumps, FrameReceiver, FrameSender};

    struct BaseEnd {
        tx: MemSender,
        rx: MemReceiver,
        send: CipherState,
        recv: CipherState,
    }

    impl BaseEnd {
        async fn recv_message(&mut self) -> Option<Message> {
            let frame = self.rx.recv().await.unwrap()?;
            let plain = self.recv.decrypt(&frame).unwrap();
            Some(decode_frame(&plain).unwrap())
        }

        async fn send_message(&mut self, message: &Message) {
            let plain = encode_frame(message).unwrap();
            let frame = self.send.encrypt(&plain).unwrap();
            self.tx.send(frame).await.unwrap();
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        base: BaseEnd,
        sink: Arc<RecordingSink>,
        failures: Arc<Mutex<Vec<String>>>,
        failure_count: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let ((app_tx, app_rx), (base_tx, base_rx)) = mem::pair();
        let mut app = HandshakeState::new(Role::Initiator, Keypair::generate(), PROTOCOL_NAME);
        let mut base = HandshakeState::new(Role::Responder, Keypair::generate(), PROTOCOL_NAME);
        let m1 = app.write_message().unwrap();
        base.read_message(&m1).unwrap();
        let m2 = base.write_message().unwrap();
        app.read_message(&m2).unwrap();
        let m3 = app.write_message().unwrap();
        base.read_message(&m3).unwrap();
        let (a_send, a_recv) = app.split().unwrap();
        let (b_send, b_recv) = base.split().unwrap();

        let transport = spawn_pumps(app_tx, app_rx, a_send, a_recv);
        let sink = Arc::new(RecordingSink::default());
        let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let failure_count = Arc::new(AtomicUsize::new(0));
        let cb_failures = Arc::clone(&failures);
        let cb_count = Arc::clone(&failure_count);
        let dispatcher = Dispatcher::spawn(
            transport,
            sink.clone() as Arc<dyn EventSink>,
            "base-1".into(),
            "192.168.1.7:8845".into(),
            Box::new(move |address| {
                cb_count.fetch_add(1, Ordering::SeqCst);
                cb_failures.lock().unwrap().push(address);
            }),
        );
        Fixture {
            dispatcher,
            base: BaseEnd {
                tx: base_tx,
                rx: base_rx,
                send: b_send,
                recv: b_recv,
            },
            sink,
            failures,
            failure_count,
        }
    }

    async fn wait_true(mut rx: watch::Receiver<bool>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !*rx.borrow() {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("watch never flipped");
    }

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let mut f = fixture();
        let base = tokio::spawn(async move {
            let request = f.base.recv_message().await.unwrap();
            assert!(matches!(request, Message::SystemEnvRequest));
            let env = SystemEnv {
                electrs_rpc_port: "51002".into(),
                network: "mainnet".into(),
            };
            f.base.send_message(&Message::SystemEnvResponse(env)).await;
            f.base
        });

        let reply = f
            .dispatcher
            .request(RequestTag::SystemEnv, Message::SystemEnvRequest)
            .await
            .unwrap();
        match reply {
            Message::SystemEnvResponse(env) => assert_eq!(env.network, "mainnet"),
            other => panic!("unexpected reply {other:?}"),
        }
        drop(base.await.unwrap());
    }

    #[tokio::test]
    async fn inbound_frames_are_processed_in_wire_order() {
        let mut f = fixture();
        for blocks in [100i64, 101, 102] {
            f.base
                .send_message(&Message::StatusEvent(BaseStatus {
                    blocks,
                    difficulty: 1.0,
                    lightning_alias: "ln".into(),
                }))
                .await;
        }
        // Pong after the events; its delivery proves the events are done.
        let pong = tokio::spawn(async move {
            f.base.recv_message().await.unwrap();
            f.base.send_message(&Message::Pong).await;
            f.base
        });
        f.dispatcher
            .request(RequestTag::Ping, Message::Ping)
            .await
            .unwrap();

        let events = f.sink.events.lock().unwrap();
        let blocks: Vec<i64> = events
            .iter()
            .map(|(topic, event)| {
                assert_eq!(topic, "/devices/base-1/status");
                match event {
                    Event::Status(status) => status.blocks,
                    other => panic!("unexpected event {other:?}"),
                }
            })
            .collect();
        assert_eq!(blocks, vec![100, 101, 102]);
        drop(events);
        assert_eq!(f.dispatcher.status().unwrap().blocks, 102);
        drop(pong.await.unwrap());
    }

    #[tokio::test]
    async fn unmatched_reply_is_dropped_not_fatal() {
        let mut f = fixture();
        f.base.send_message(&Message::Pong).await;

        // The loop survives; a real request still works afterwards.
        let base = tokio::spawn(async move {
            f.base.recv_message().await.unwrap();
            f.base.send_message(&Message::Pong).await;
            f.base
        });
        f.dispatcher
            .request(RequestTag::Ping, Message::Ping)
            .await
            .unwrap();
        drop(base.await.unwrap());
    }

    #[tokio::test]
    async fn second_request_on_same_tag_is_rejected() {
        let f = fixture();
        let dispatcher = Arc::new(f.dispatcher);
        let first = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .request(RequestTag::Ping, Message::Ping)
                    .await
            })
        };
        // Wait until the first request has registered its slot.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !dispatcher.pending.lock().unwrap().slots.contains_key(&RequestTag::Ping) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let err = dispatcher
            .request(RequestTag::Ping, Message::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RequestInFlight("ping")));

        let mut base = f.base;
        base.recv_message().await.unwrap();
        base.send_message(&Message::Pong).await;
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn remote_close_fails_waiters_and_fires_callback_once() {
        let mut f = fixture();
        let dispatcher = Arc::new(f.dispatcher);
        let waiter = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .request(RequestTag::SystemEnv, Message::SystemEnvRequest)
                    .await
            })
        };
        // Base reads the request, then disconnects without answering.
        f.base.recv_message().await.unwrap();
        drop(f.base);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::ConnectionClosed));
        wait_true(dispatcher.closed()).await;
        assert_eq!(f.failure_count.load(Ordering::SeqCst), 1);
        assert_eq!(*f.failures.lock().unwrap(), vec!["192.168.1.7:8845"]);

        // Terminal: new requests fail immediately.
        let err = dispatcher
            .request(RequestTag::Ping, Message::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ConnectionClosed));
    }

    #[tokio::test]
    async fn requests_racing_disconnect_never_hang() {
        let mut f = fixture();
        let dispatcher = Arc::new(f.dispatcher);
        // Base answers a few pings, then vanishes without a close frame.
        let base = tokio::spawn(async move {
            for _ in 0..3 {
                let request = f.base.recv_message().await.unwrap();
                assert!(matches!(request, Message::Ping));
                f.base.send_message(&Message::Pong).await;
            }
        });

        let pinger = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                loop {
                    match dispatcher.request(RequestTag::Ping, Message::Ping).await {
                        Ok(_) => continue,
                        Err(DispatchError::ConnectionClosed) => break,
                        Err(other) => panic!("unexpected error {other}"),
                    }
                }
            })
        };
        // Every in-flight or late-registered request must resolve; a slot
        // stranded across the teardown would hang here.
        tokio::time::timeout(Duration::from_secs(2), pinger)
            .await
            .expect("request hung across disconnect")
            .unwrap();
        base.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_failure_closes_the_socket() {
        let mut f = fixture();
        // Garbage the receive cipher cannot authenticate kills the pump.
        f.base.tx.send(vec![0u8; 48]).await.unwrap();
        wait_true(f.dispatcher.closed()).await;
        // The base must observe end-of-stream, not a half-open socket.
        let got = tokio::time::timeout(Duration::from_secs(2), f.base.rx.recv())
            .await
            .expect("socket never closed")
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn local_close_does_not_fire_failure_callback() {
        let f = fixture();
        f.dispatcher.close();
        wait_true(f.dispatcher.closed()).await;
        assert_eq!(f.failure_count.load(Ordering::SeqCst), 0);

        let err = f
            .dispatcher
            .request(RequestTag::Ping, Message::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ConnectionClosed));
        // Closing again is a no-op.
        f.dispatcher.close();
    }
}
