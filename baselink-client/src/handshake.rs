//! Drives the Noise XX handshake over a framed socket, including the
//! pre-handshake opcode exchange and the human pairing verification.

use baselink_core::identity::{Keypair, PublicKey};
use baselink_core::noise::{CipherState, HandshakeState, Role, PROTOCOL_NAME};
use baselink_core::pairing::{format_pairing_code, PairingStore};

use crate::events::{pairing_code_topic, Event, EventSink};
use crate::transport::{FrameReceiver, FrameSender, TransportError};

/// Single-byte opcodes sent before the channel is encrypted.
pub const OP_HANDSHAKE: u8 = 0x68; // 'h'
pub const OP_PAIRING_VERIFY: u8 = 0x76; // 'v'
pub const RESPONSE_SUCCESS: u8 = 0x00;
pub const RESPONSE_NEEDS_PAIRING: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The base did not ACK the handshake request.
    #[error("base rejected the handshake request")]
    HandshakeRejected,
    /// Cryptographic or protocol failure; the connection must be discarded.
    #[error("handshake failed: {0}")]
    HandshakeFailed(#[from] baselink_core::noise::HandshakeError),
    /// Transport failure during the handshake; same remedy.
    #[error("handshake transport failed: {0}")]
    Transport(#[from] TransportError),
    /// The user declined the pairing code on either end.
    #[error("pairing rejected")]
    PairingRejected,
}

/// Everything the transport needs after mutual authentication.
pub struct AuthenticatedChannel {
    pub send_cipher: CipherState,
    pub recv_cipher: CipherState,
    pub remote_static: PublicKey,
    /// Whether this connection went through human verification.
    pub verified_now: bool,
}

// Manual impl: the cipher states carry key material and stay out of logs.
impl std::fmt::Debug for AuthenticatedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedChannel")
            .field("remote_static", &self.remote_static)
            .field("verified_now", &self.verified_now)
            .finish_non_exhaustive()
    }
}

/// Run the full authentication flow as initiator.
///
/// `on_pairing_pending` fires after the code has been published and before
/// blocking on the user's confirmation, so the session can expose the
/// intermediate state.
pub async fn authenticate<TX, RX>(
    tx: &mut TX,
    rx: &mut RX,
    keypair: Keypair,
    store: &dyn PairingStore,
    sink: &dyn EventSink,
    base_id: &str,
    mut on_pairing_pending: impl FnMut(),
) -> Result<AuthenticatedChannel, AuthError>
where
    TX: FrameSender,
    RX: FrameReceiver,
{
    tx.send(vec![OP_HANDSHAKE]).await?;
    let ack = recv_frame(rx).await?;
    if ack.as_slice() != [RESPONSE_SUCCESS] {
        return Err(AuthError::HandshakeRejected);
    }

    let mut handshake = HandshakeState::new(Role::Initiator, keypair, PROTOCOL_NAME);
    let m1 = handshake.write_message()?;
    tx.send(m1).await?;
    let m2 = recv_frame(rx).await?;
    handshake.read_message(&m2)?;
    let m3 = handshake.write_message()?;
    tx.send(m3).await?;

    // One more frame: does the base itself want pairing verification?
    let pairing_byte = recv_frame(rx).await?;
    let base_requests_pairing = pairing_byte.as_slice() == [RESPONSE_NEEDS_PAIRING];

    let remote_static = handshake
        .remote_static()
        .cloned()
        .ok_or(baselink_core::noise::HandshakeError::Incomplete)?;
    let verification_required = base_requests_pairing || !store.contains(&remote_static);

    let channel_binding = handshake.channel_binding()?;
    let (send_cipher, recv_cipher) = handshake.split()?;

    if !verification_required {
        return Ok(AuthenticatedChannel {
            send_cipher,
            recv_cipher,
            remote_static,
            verified_now: false,
        });
    }

    let code = format_pairing_code(&channel_binding);
    let topic = pairing_code_topic(base_id);
    sink.publish(&topic, Event::PairingCode(code));
    on_pairing_pending();

    tx.send(vec![OP_PAIRING_VERIFY]).await?;
    let confirmation = recv_frame(rx).await?;
    if confirmation.as_slice() != [RESPONSE_SUCCESS] {
        // Connection is unusable; clear the code and drop the ciphers.
        sink.publish(&topic, Event::PairingCode(String::new()));
        return Err(AuthError::PairingRejected);
    }

    if let Err(err) = store.add(&remote_static) {
        // Non-fatal: the live channel is fine, the user just re-verifies
        // after the next restart.
        tracing::error!("pairing succeeded but storing the base key failed: {err}");
    }
    sink.publish(&topic, Event::PairingCode(String::new()));

    Ok(AuthenticatedChannel {
        send_cipher,
        recv_cipher,
        remote_static,
        verified_now: true,
    })
}

async fn recv_frame<RX: FrameReceiver>(rx: &mut RX) -> Result<Vec<u8>, AuthError> {
    match rx.recv().await? {
        Some(frame) => Ok(frame),
        None => Err(AuthError::Transport(TransportError::Closed)),
    }
}

/// Simulated base used by tests across this crate: answers the opcode
/// exchange, runs the responder side of the handshake, and then serves
/// requests over the encrypted channel.
#[cfg(test)]
pub(crate) mod testbase {
    use super::*;
    use baselink_core::protocol::{Message, SystemEnv};
    use baselink_core::wire::{decode_frame, encode_frame};
    use tokio::sync::mpsc;

    use crate::transport::mem::{MemReceiver, MemSender};

    pub struct BaseBehavior {
        /// Base-side flag: it has not seen this app before.
        pub needs_pairing: bool,
        /// Whether the (simulated) user confirms the code on the base.
        pub accept_pairing: bool,
        /// Expect the app to ask for verification (pairing byte or unknown
        /// key on the app side).
        pub expect_verification: bool,
        pub env: SystemEnv,
        /// When set, the base waits for this gate before answering the
        /// verification opcode, keeping the app in its pairing wait.
        pub verify_gate: Option<tokio::sync::oneshot::Receiver<()>>,
        /// Unsolicited messages to push after authentication; `None` keeps
        /// the channel open with no events.
        pub events: Option<mpsc::Receiver<Message>>,
        /// Leave requests unanswered when false (for timeout/failure tests).
        pub answer_requests: bool,
    }

    impl Default for BaseBehavior {
        fn default() -> Self {
            Self {
                needs_pairing: false,
                accept_pairing: true,
                expect_verification: false,
                verify_gate: None,
                env: SystemEnv {
                    electrs_rpc_port: "51002".into(),
                    network: "testnet".into(),
                },
                events: None,
                answer_requests: true,
            }
        }
    }

    /// Drive one full base-side connection until the app disconnects.
    pub async fn run(
        mut tx: MemSender,
        mut rx: MemReceiver,
        keypair: Keypair,
        behavior: BaseBehavior,
    ) {
        let opcode = rx.recv().await.unwrap().unwrap();
        assert_eq!(opcode, vec![OP_HANDSHAKE]);
        tx.send(vec![RESPONSE_SUCCESS]).await.unwrap();

        let mut handshake = HandshakeState::new(Role::Responder, keypair, PROTOCOL_NAME);
        let m1 = rx.recv().await.unwrap().unwrap();
        handshake.read_message(&m1).unwrap();
        let m2 = handshake.write_message().unwrap();
        tx.send(m2).await.unwrap();
        let m3 = rx.recv().await.unwrap().unwrap();
        handshake.read_message(&m3).unwrap();

        let byte = if behavior.needs_pairing {
            RESPONSE_NEEDS_PAIRING
        } else {
            RESPONSE_SUCCESS
        };
        tx.send(vec![byte]).await.unwrap();

        if behavior.expect_verification {
            let opcode = rx.recv().await.unwrap().unwrap();
            assert_eq!(opcode, vec![OP_PAIRING_VERIFY]);
            if let Some(gate) = behavior.verify_gate {
                let _ = gate.await;
            }
            let byte = if behavior.accept_pairing {
                RESPONSE_SUCCESS
            } else {
                RESPONSE_NEEDS_PAIRING
            };
            tx.send(vec![byte]).await.unwrap();
            if !behavior.accept_pairing {
                return;
            }
        }

        let (mut send_cipher, mut recv_cipher) = handshake.split().unwrap();
        let mut events = behavior.events;
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let frame = match maybe.unwrap() {
                        Some(frame) => frame,
                        None => return,
                    };
                    let plain = recv_cipher.decrypt(&frame).unwrap();
                    let msg = decode_frame(&plain).unwrap();
                    if !behavior.answer_requests {
                        continue;
                    }
                    let reply = match msg {
                        Message::SystemEnvRequest => {
                            Some(Message::SystemEnvResponse(behavior.env.clone()))
                        }
                        Message::Ping => Some(Message::Pong),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        let plain = encode_frame(&reply).unwrap();
                        let frame = send_cipher.encrypt(&plain).unwrap();
                        tx.send(frame).await.unwrap();
                    }
                }
                maybe = recv_event(&mut events) => {
                    match maybe {
                        Some(msg) => {
                            let plain = encode_frame(&msg).unwrap();
                            let frame = send_cipher.encrypt(&plain).unwrap();
                            tx.send(frame).await.unwrap();
                        }
                        None => {
                            events = None;
                        }
                    }
                }
            }
        }
    }

    async fn recv_event(events: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
        match events {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}
