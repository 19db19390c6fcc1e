//! Session encryption for direct streams.
//!
//! Each side generates an ephemeral X25519 key pair and publishes the public
//! half in its session description. Both sides derive one ChaCha20-Poly1305
//! key per direction with BLAKE3 `derive_key` over the shared secret, the
//! handshake token and both public keys. Nonces are a per-direction counter,
//! so frames must be opened in the order they were sealed.

use crate::transport::{TransportError, TransportResult};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const OFFERER_TO_ANSWERER: &str = "fluxshare 2024-06 direct stream offerer to answerer";
const ANSWERER_TO_OFFERER: &str = "fluxshare 2024-06 direct stream answerer to offerer";

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Which side of the offer/answer exchange this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the offer
    Offerer,
    /// Answered the offer
    Answerer,
}

/// Ephemeral X25519 key pair for one handshake.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes to publish in a description.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Derive the session keys for a handshake with `remote_public`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Handshake` if the remote key is a low-order
    /// point (the shared secret would be predictable).
    pub fn session(
        &self,
        remote_public: [u8; 32],
        token: &[u8],
        role: Role,
    ) -> TransportResult<SessionKeys> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(remote_public));
        if !shared.was_contributory() {
            return Err(TransportError::Handshake(
                "remote public key is not contributory".to_string(),
            ));
        }

        let (offerer_pub, answerer_pub) = match role {
            Role::Offerer => (self.public_bytes(), remote_public),
            Role::Answerer => (remote_public, self.public_bytes()),
        };
        let mut material = Zeroizing::new(Vec::with_capacity(32 + token.len() + 64));
        material.extend_from_slice(shared.as_bytes());
        material.extend_from_slice(token);
        material.extend_from_slice(&offerer_pub);
        material.extend_from_slice(&answerer_pub);

        let o2a = Zeroizing::new(blake3::derive_key(OFFERER_TO_ANSWERER, &material));
        let a2o = Zeroizing::new(blake3::derive_key(ANSWERER_TO_OFFERER, &material));
        let (send, recv) = match role {
            Role::Offerer => (&o2a, &a2o),
            Role::Answerer => (&a2o, &o2a),
        };
        Ok(SessionKeys {
            send: SendCipher(CipherState::new(send)),
            recv: RecvCipher(CipherState::new(recv)),
        })
    }
}

struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> TransportResult<[u8; 12]> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| TransportError::Handshake("nonce space exhausted".to_string()))?;
        Ok(nonce)
    }
}

/// Outgoing direction of a session.
pub struct SendCipher(CipherState);

impl SendCipher {
    /// Encrypt the next outgoing frame.
    ///
    /// # Errors
    ///
    /// Fails only if the nonce counter is exhausted.
    pub fn seal(&mut self, plaintext: &[u8]) -> TransportResult<Vec<u8>> {
        let nonce = self.0.next_nonce()?;
        self.0
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| TransportError::Handshake("encryption failed".to_string()))
    }
}

/// Incoming direction of a session.
pub struct RecvCipher(CipherState);

impl RecvCipher {
    /// Decrypt the next incoming frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Handshake` if authentication fails (tampering,
    /// reordering or mismatched keys).
    pub fn open(&mut self, ciphertext: &[u8]) -> TransportResult<Vec<u8>> {
        let nonce = self.0.next_nonce()?;
        self.0
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| TransportError::Handshake("frame authentication failed".to_string()))
    }
}

/// Per-direction ciphers for an established session.
pub struct SessionKeys {
    send: SendCipher,
    recv: RecvCipher,
}

impl SessionKeys {
    /// Encrypt the next outgoing frame.
    ///
    /// # Errors
    ///
    /// Fails only if the nonce counter is exhausted.
    pub fn seal(&mut self, plaintext: &[u8]) -> TransportResult<Vec<u8>> {
        self.send.seal(plaintext)
    }

    /// Decrypt the next incoming frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Handshake` if authentication fails.
    pub fn open(&mut self, ciphertext: &[u8]) -> TransportResult<Vec<u8>> {
        self.recv.open(ciphertext)
    }

    pub(crate) fn send_half(&mut self) -> &mut SendCipher {
        &mut self.send
    }

    pub(crate) fn recv_half(&mut self) -> &mut RecvCipher {
        &mut self.recv
    }

    /// Split into independently owned directions.
    pub fn split(self) -> (SendCipher, RecvCipher) {
        (self.send, self.recv)
    }
}
