//! Base pairing protocol reference implementation.
//! No I/O here: the client crate drives the handshake and pumps bytes.

pub mod identity;
pub mod noise;
pub mod pairing;
pub mod protocol;
pub mod sync;
pub mod wire;

pub use identity::{Keypair, PublicKey};
pub use noise::{CipherState, HandshakeError, HandshakeState, Role};
pub use pairing::{format_pairing_code, PairingStore};
pub use protocol::{BaseStatus, Message, RequestTag, SystemEnv};
pub use sync::{SyncToken, Synchronizer};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
