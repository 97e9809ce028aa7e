use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};


pub const PUBLIC_KEY_LEN: usize = 32;
pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const AUTH_TAG_LEN: usize = 16;

/// A node's long-lived asymmetric keypair. The public key doubles as the node's identity
///  towards its peers (hex encoded where a textual form is needed, e.g. in lobby metadata).
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

impl Identity {
    pub fn generate() -> Identity {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Identity { secret, public }
    }

    /// Deterministic keypair from a fixed seed - for tests and reproducible setups. The
    ///  underlying curve implementation applies the usual clamping to the seed.
    pub fn from_seed(seed: [u8; 32]) -> Identity {
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        Identity { secret, public }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }
}

/// Per-peer-pair key agreement and authenticated symmetric encryption.
///
/// Each connection direction has its own random session key: the outgoing key is generated
///  locally and sealed for the peer (asymmetrically, under the Diffie-Hellman shared secret of
///  the two identities), the incoming key arrives sealed from the peer. Both slots are one-shot:
///  setting a key twice is a protocol invariant violation and panics. Authentication failures on
///  the other hand are an expected consequence of packet corruption or adversarial input and are
///  reported non-fatally.
pub struct SessionCrypto {
    secret: StaticSecret,
    peer_public: PublicKey,
    outgoing: Option<ChaCha20Poly1305>,
    incoming: Option<ChaCha20Poly1305>,
}

impl SessionCrypto {
    pub fn new(identity: &Identity, peer_public: [u8; PUBLIC_KEY_LEN]) -> SessionCrypto {
        SessionCrypto {
            secret: identity.secret.clone(),
            peer_public: PublicKey::from(peer_public),
            outgoing: None,
            incoming: None,
        }
    }

    pub fn peer_public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.peer_public.to_bytes()
    }

    /// Generates a fresh random session key for the outgoing direction and returns it sealed for
    ///  the peer: a fresh random nonce, followed by the AEAD-encrypted key material.
    ///
    /// Panics if called twice - the session key is established exactly once per connection.
    pub fn generate_outgoing_session_key(&mut self) -> Vec<u8> {
        if self.outgoing.is_some() {
            panic!("outgoing session key generated twice - this is a bug in the caller");
        }

        let mut session_key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut session_key);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let wrap_cipher = ChaCha20Poly1305::new(Key::from_slice(&self.wrap_key()));
        let sealed_key = wrap_cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), session_key.as_slice())
            .expect("AEAD encryption of an in-memory buffer cannot fail");

        self.outgoing = Some(ChaCha20Poly1305::new(Key::from_slice(&session_key)));

        let mut result = Vec::with_capacity(NONCE_LEN + sealed_key.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&sealed_key);
        result
    }

    /// Unseals a session key received from the peer and installs it for the incoming direction.
    ///  Returns false (corrupt or forged blob - recoverable, the packet is simply dropped by the
    ///  caller) if authentication fails or the blob is undersized.
    ///
    /// Panics if an incoming key is already installed.
    pub fn receive_incoming_session_key(&mut self, sealed: &[u8]) -> bool {
        if self.incoming.is_some() {
            panic!("incoming session key installed twice - this is a bug in the caller");
        }

        if sealed.len() < NONCE_LEN + SESSION_KEY_LEN + AUTH_TAG_LEN {
            warn!("sealed session key blob is too short ({} bytes) - rejecting", sealed.len());
            return false;
        }

        let (nonce_bytes, sealed_key) = sealed.split_at(NONCE_LEN);
        let wrap_cipher = ChaCha20Poly1305::new(Key::from_slice(&self.wrap_key()));

        match wrap_cipher.decrypt(Nonce::from_slice(nonce_bytes), sealed_key) {
            Ok(session_key) if session_key.len() == SESSION_KEY_LEN => {
                self.incoming = Some(ChaCha20Poly1305::new(Key::from_slice(&session_key)));
                true
            }
            Ok(_) => {
                warn!("sealed session key blob authenticated but has wrong key length - rejecting");
                false
            }
            Err(_) => {
                warn!("sealed session key blob failed authentication - rejecting");
                false
            }
        }
    }

    /// Encrypts an outgoing payload under the session key, with a fresh random nonce prefixed to
    ///  the ciphertext. Panics if no outgoing session key exists yet - callers gate on readiness.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = self.outgoing.as_ref()
            .expect("encrypt called before the outgoing session key was generated");
        Self::seal(cipher, plaintext)
    }

    /// Decrypts an incoming payload. None means authentication failure or undersized input -
    ///  adversarial or corrupt data, never a reason to crash. Panics if no incoming session key
    ///  exists yet.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let cipher = self.incoming.as_ref()
            .expect("decrypt called before the incoming session key was installed");
        Self::open(cipher, ciphertext)
    }

    /// Encrypts a handshake confirmation under the *incoming* session key - the key the peer's
    ///  handshake request just delivered. Authenticating under that key is what proves to the
    ///  requester that its sealed key arrived intact, before any regular traffic flows. Panics
    ///  if no incoming key is installed yet.
    pub fn encrypt_confirmation(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = self.incoming.as_ref()
            .expect("confirmation encrypt before the incoming session key was installed");
        Self::seal(cipher, plaintext)
    }

    /// Requester-side counterpart of [SessionCrypto::encrypt_confirmation]: opens a handshake
    ///  confirmation with the *outgoing* session key. None on authentication failure. Panics if
    ///  no outgoing key was generated yet.
    pub fn decrypt_confirmation(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let cipher = self.outgoing.as_ref()
            .expect("confirmation decrypt before the outgoing session key was generated");
        Self::open(cipher, ciphertext)
    }

    fn seal(cipher: &ChaCha20Poly1305, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .expect("AEAD encryption of an in-memory buffer cannot fail");

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        result
    }

    fn open(cipher: &ChaCha20Poly1305, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + AUTH_TAG_LEN {
            return None;
        }

        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        cipher.decrypt(Nonce::from_slice(nonce_bytes), body).ok()
    }

    pub fn has_outgoing_key(&self) -> bool {
        self.outgoing.is_some()
    }

    pub fn has_incoming_key(&self) -> bool {
        self.incoming.is_some()
    }

    pub fn is_fully_keyed(&self) -> bool {
        self.outgoing.is_some() && self.incoming.is_some()
    }

    /// The symmetric key that seals session keys in transit, derived from the Diffie-Hellman
    ///  shared secret of the two identities. Both peers arrive at the same key.
    fn wrap_key(&self) -> [u8; 32] {
        let shared_secret = self.secret.diffie_hellman(&self.peer_public);

        let mut hasher = Sha256::new();
        hasher.update(b"peerlink session key wrap v1");
        hasher.update(shared_secret.as_bytes());
        hasher.finalize().into()
    }
}
