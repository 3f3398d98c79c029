//! The seal/open and sign/verify collaborator.
//!
//! The relay treats sealed payloads and signatures as opaque bytes. Two
//! implementations ship with the crate:
//!
//! - [`SharedKeyCrypto`]: sign-then-encrypt under a pre-shared mesh key
//!   (BLAKE3 keyed hash for signatures, ChaCha20-Poly1305 for sealing).
//! - [`PassthroughCrypto`]: no encryption at all, for tests and local demos.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::model::MessageMeta;

const NONCE_LEN: usize = 12;
const SEAL_CONTEXT: &str = "safelink mesh 2024 payload seal";
const SIGN_CONTEXT: &str = "safelink mesh 2024 payload sign";

/// Output of [`MeshCrypto::seal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// The plaintext that gets signed and sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPayload {
    pub content: String,
    pub meta: MessageMeta,
}

pub trait MeshCrypto: Send + Sync {
    /// Sign the content and metadata, then seal the signed payload.
    fn seal(&self, content: &str, meta: &MessageMeta) -> Result<Sealed, CryptoError>;

    /// Recover the signed payload bytes, or `None` if they cannot be opened.
    fn open(&self, sealed: &[u8]) -> Option<Vec<u8>>;

    fn sign(&self, payload: &[u8]) -> Vec<u8>;

    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool;

    /// Open a sealed payload and extract its text content.
    fn open_content(&self, sealed: &[u8]) -> Option<String> {
        let bytes = self.open(sealed)?;
        serde_json::from_slice::<SignedPayload>(&bytes)
            .ok()
            .map(|p| p.content)
    }
}

fn encode_payload(content: &str, meta: &MessageMeta) -> Result<Vec<u8>, CryptoError> {
    let payload = SignedPayload {
        content: content.to_string(),
        meta: meta.clone(),
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Pre-shared-key crypto for a closed mesh.
#[derive(Clone)]
pub struct SharedKeyCrypto {
    seal_key: [u8; 32],
    sign_key: [u8; 32],
}

impl std::fmt::Debug for SharedKeyCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeyCrypto").finish_non_exhaustive()
    }
}

impl SharedKeyCrypto {
    /// Derive independent sealing and signing keys from one mesh secret.
    pub fn new(mesh_key: &[u8; 32]) -> Self {
        Self {
            seal_key: blake3::derive_key(SEAL_CONTEXT, mesh_key),
            sign_key: blake3::derive_key(SIGN_CONTEXT, mesh_key),
        }
    }

    /// Parse a 64-character hex mesh key.
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(key_hex.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(Self::new(&key))
    }

    /// A fresh random mesh key. Nodes using different keys cannot read each other.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(&key)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.seal_key))
    }
}

impl MeshCrypto for SharedKeyCrypto {
    fn seal(&self, content: &str, meta: &MessageMeta) -> Result<Sealed, CryptoError> {
        let plaintext = encode_payload(content, meta)?;
        let signature = self.sign(&plaintext);

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);

        Ok(Sealed { payload, signature })
    }

    fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        blake3::keyed_hash(&self.sign_key, payload)
            .as_bytes()
            .to_vec()
    }

    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = <[u8; 32]>::try_from(signature) else {
            return false;
        };
        // blake3::Hash equality is constant time.
        blake3::Hash::from(sig) == blake3::keyed_hash(&self.sign_key, payload)
    }
}

/// No-op crypto: the "sealed" payload is the signed JSON itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCrypto;

impl MeshCrypto for PassthroughCrypto {
    fn seal(&self, content: &str, meta: &MessageMeta) -> Result<Sealed, CryptoError> {
        let payload = encode_payload(content, meta)?;
        let signature = self.sign(&payload);
        Ok(Sealed { payload, signature })
    }

    fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        Some(sealed.to_vec())
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        blake3::hash(payload).as_bytes().to_vec()
    }

    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        self.sign(payload) == signature
    }
}
