//! Noise XX handshake and transport ciphers over X25519 / ChaCha20-Poly1305 /
//! SHA-256. Host-driven: callers move the three handshake messages over their
//! own channel, then `split()` into a pair of directional cipher states.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::identity::{Keypair, PublicKey};

/// Protocol name; exactly 32 bytes, so it seeds the transcript hash directly.
pub const PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_ChaChaPoly_SHA256";

const DH_LEN: usize = 32;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake message out of order")]
    OutOfOrder,
    #[error("malformed handshake message")]
    BadMessage,
    #[error("handshake authentication failed")]
    Crypto,
    #[error("handshake not complete")]
    Incomplete,
}

/// Which side of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// One direction of the post-handshake channel: key plus a strictly
/// sequential nonce counter. Never reused across connections.
pub struct CipherState {
    key: [u8; 32],
    nonce: u64,
}

impl CipherState {
    fn new(key: [u8; 32]) -> Self {
        Self { key, nonce: 0 }
    }

    /// Encrypt with empty associated data (transport messages).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.encrypt_with_ad(&[], plaintext)
    }

    /// Decrypt with empty associated data (transport messages).
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.decrypt_with_ad(&[], ciphertext)
    }

    fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| HandshakeError::Crypto)?;
        let nonce_bytes = nonce_bytes(self.nonce);
        let nonce = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&nonce_bytes);
        let out = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: ad })
            .map_err(|_| HandshakeError::Crypto)?;
        self.nonce += 1;
        Ok(out)
    }

    fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| HandshakeError::Crypto)?;
        let nonce_bytes = nonce_bytes(self.nonce);
        let nonce = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&nonce_bytes);
        let out = cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad: ad })
            .map_err(|_| HandshakeError::Crypto)?;
        self.nonce += 1;
        Ok(out)
    }
}

/// 96-bit nonce: 4 zero bytes then the counter as 64-bit little-endian.
fn nonce_bytes(n: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..12].copy_from_slice(&n.to_le_bytes());
    out
}

/// Transcript hash, chaining key, and the optional handshake cipher.
struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
    cipher: Option<CipherState>,
}

impl SymmetricState {
    fn new(prologue: &[u8]) -> Self {
        let mut state = Self {
            ck: *PROTOCOL_NAME,
            h: *PROTOCOL_NAME,
            cipher: None,
        };
        state.mix_hash(prologue);
        state
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, ikm: &[u8]) {
        let (ck, k) = hkdf2(&self.ck, ikm);
        self.ck = ck;
        self.cipher = Some(CipherState::new(k));
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let h = self.h;
        let out = match &mut self.cipher {
            Some(cipher) => cipher.encrypt_with_ad(&h, plaintext)?,
            None => plaintext.to_vec(),
        };
        self.mix_hash(&out);
        Ok(out)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let h = self.h;
        let out = match &mut self.cipher {
            Some(cipher) => cipher.decrypt_with_ad(&h, ciphertext)?,
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(out)
    }

    fn split(&self) -> (CipherState, CipherState) {
        let (k1, k2) = hkdf2(&self.ck, &[]);
        (CipherState::new(k1), CipherState::new(k2))
    }
}

/// Noise HKDF with two outputs: RFC 5869 extract (salt = ck) then expand.
fn hkdf2(ck: &[u8; 32], ikm: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(ck), ikm);
    let mut okm = [0u8; 64];
    // 64 bytes is well under the HKDF-SHA256 output limit.
    hk.expand(&[], &mut okm)
        .expect("hkdf expand of 64 bytes cannot fail");
    let mut out1 = [0u8; 32];
    let mut out2 = [0u8; 32];
    out1.copy_from_slice(&okm[..32]);
    out2.copy_from_slice(&okm[32..]);
    (out1, out2)
}

/// XX handshake state machine. Three messages:
/// 1. initiator -> responder: e
/// 2. responder -> initiator: e, ee, s, es
/// 3. initiator -> responder: s, se
pub struct HandshakeState {
    role: Role,
    symmetric: SymmetricState,
    local_static: Keypair,
    local_ephemeral: Option<StaticSecret>,
    remote_ephemeral: Option<PublicKey>,
    remote_static: Option<PublicKey>,
    message_index: u8,
}

impl HandshakeState {
    pub fn new(role: Role, local_static: Keypair, prologue: &[u8]) -> Self {
        Self {
            role,
            symmetric: SymmetricState::new(prologue),
            local_static,
            local_ephemeral: None,
            remote_ephemeral: None,
            remote_static: None,
            message_index: 0,
        }
    }

    /// True once all three messages have been processed.
    pub fn is_finished(&self) -> bool {
        self.message_index >= 3
    }

    /// The remote's authenticated static key; present after the message that
    /// carried it has been read.
    pub fn remote_static(&self) -> Option<&PublicKey> {
        self.remote_static.as_ref()
    }

    /// The channel-binding value (final transcript hash). Identical on both
    /// ends only if nobody tampered with the exchange.
    pub fn channel_binding(&self) -> Result<[u8; 32], HandshakeError> {
        if !self.is_finished() {
            return Err(HandshakeError::Incomplete);
        }
        Ok(self.symmetric.h)
    }

    /// Produce `(send, recv)` cipher states oriented for this role.
    pub fn split(self) -> Result<(CipherState, CipherState), HandshakeError> {
        if !self.is_finished() {
            return Err(HandshakeError::Incomplete);
        }
        let (c1, c2) = self.symmetric.split();
        match self.role {
            Role::Initiator => Ok((c1, c2)),
            Role::Responder => Ok((c2, c1)),
        }
    }

    fn our_turn_to_write(&self) -> bool {
        match self.role {
            Role::Initiator => self.message_index % 2 == 0,
            Role::Responder => self.message_index % 2 == 1,
        }
    }

    /// Write the next handshake message. Payloads are always empty in this
    /// protocol but the transcript still covers them.
    pub fn write_message(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.message_index >= 3 || !self.our_turn_to_write() {
            return Err(HandshakeError::OutOfOrder);
        }
        let mut out = Vec::new();
        match self.message_index {
            // -> e
            0 => {
                let e_pub = self.generate_ephemeral();
                self.symmetric.mix_hash(&e_pub);
                out.extend_from_slice(&e_pub);
                let payload = self.symmetric.encrypt_and_hash(&[])?;
                out.extend_from_slice(&payload);
            }
            // <- e, ee, s, es
            1 => {
                let e_pub = self.generate_ephemeral();
                self.symmetric.mix_hash(&e_pub);
                out.extend_from_slice(&e_pub);
                let ee = self.dh_ephemeral_to_remote_ephemeral()?;
                self.symmetric.mix_key(&ee);
                let s_pub = *self.local_static.public_key().as_bytes();
                let enc_s = self.symmetric.encrypt_and_hash(&s_pub)?;
                out.extend_from_slice(&enc_s);
                let es = self.dh_static_to_remote_ephemeral()?;
                self.symmetric.mix_key(&es);
                let payload = self.symmetric.encrypt_and_hash(&[])?;
                out.extend_from_slice(&payload);
            }
            // -> s, se
            2 => {
                let s_pub = *self.local_static.public_key().as_bytes();
                let enc_s = self.symmetric.encrypt_and_hash(&s_pub)?;
                out.extend_from_slice(&enc_s);
                let se = self.dh_static_to_remote_ephemeral()?;
                self.symmetric.mix_key(&se);
                let payload = self.symmetric.encrypt_and_hash(&[])?;
                out.extend_from_slice(&payload);
            }
            _ => unreachable!(),
        }
        self.message_index += 1;
        Ok(out)
    }

    /// Read the next handshake message from the peer.
    pub fn read_message(&mut self, message: &[u8]) -> Result<(), HandshakeError> {
        if self.message_index >= 3 || self.our_turn_to_write() {
            return Err(HandshakeError::OutOfOrder);
        }
        match self.message_index {
            // -> e (read by responder)
            0 => {
                let (e_bytes, rest) = take_dh(message)?;
                self.symmetric.mix_hash(&e_bytes);
                self.remote_ephemeral = Some(PublicKey::from_bytes(e_bytes));
                self.symmetric.decrypt_and_hash(rest)?;
            }
            // <- e, ee, s, es (read by initiator)
            1 => {
                let (e_bytes, rest) = take_dh(message)?;
                self.symmetric.mix_hash(&e_bytes);
                self.remote_ephemeral = Some(PublicKey::from_bytes(e_bytes));
                let ee = self.dh_ephemeral_to_remote_ephemeral()?;
                self.symmetric.mix_key(&ee);
                let (enc_s, rest) = take_encrypted_static(rest)?;
                let s_bytes = self.symmetric.decrypt_and_hash(enc_s)?;
                self.set_remote_static(&s_bytes)?;
                let es = self.dh_ephemeral_to_remote_static()?;
                self.symmetric.mix_key(&es);
                self.symmetric.decrypt_and_hash(rest)?;
            }
            // -> s, se (read by responder)
            2 => {
                let (enc_s, rest) = take_encrypted_static(message)?;
                let s_bytes = self.symmetric.decrypt_and_hash(enc_s)?;
                self.set_remote_static(&s_bytes)?;
                let se = self.dh_ephemeral_to_remote_static()?;
                self.symmetric.mix_key(&se);
                self.symmetric.decrypt_and_hash(rest)?;
            }
            _ => unreachable!(),
        }
        self.message_index += 1;
        Ok(())
    }

    fn generate_ephemeral(&mut self) -> [u8; 32] {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        self.local_ephemeral = Some(secret);
        public
    }

    fn set_remote_static(&mut self, bytes: &[u8]) -> Result<(), HandshakeError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| HandshakeError::BadMessage)?;
        self.remote_static = Some(PublicKey::from_bytes(arr));
        Ok(())
    }

    fn dh_ephemeral_to_remote_ephemeral(&self) -> Result<[u8; 32], HandshakeError> {
        let e = self.local_ephemeral.as_ref().ok_or(HandshakeError::OutOfOrder)?;
        let re = self.remote_ephemeral.as_ref().ok_or(HandshakeError::OutOfOrder)?;
        Ok(e.diffie_hellman(&X25519PublicKey::from(*re.as_bytes())).to_bytes())
    }

    fn dh_ephemeral_to_remote_static(&self) -> Result<[u8; 32], HandshakeError> {
        let e = self.local_ephemeral.as_ref().ok_or(HandshakeError::OutOfOrder)?;
        let rs = self.remote_static.as_ref().ok_or(HandshakeError::OutOfOrder)?;
        Ok(e.diffie_hellman(&X25519PublicKey::from(*rs.as_bytes())).to_bytes())
    }

    fn dh_static_to_remote_ephemeral(&self) -> Result<[u8; 32], HandshakeError> {
        let re = self.remote_ephemeral.as_ref().ok_or(HandshakeError::OutOfOrder)?;
        Ok(self.local_static.shared_secret(re))
    }
}

fn take_dh(message: &[u8]) -> Result<([u8; 32], &[u8]), HandshakeError> {
    if message.len() < DH_LEN {
        return Err(HandshakeError::BadMessage);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&message[..DH_LEN]);
    Ok((out, &message[DH_LEN..]))
}

fn take_encrypted_static(message: &[u8]) -> Result<(&[u8], &[u8]), HandshakeError> {
    let len = DH_LEN + TAG_LEN;
    if message.len() < len {
        return Err(HandshakeError::BadMessage);
    }
    Ok((&message[..len], &message[len..]))
}
