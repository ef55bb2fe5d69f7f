use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use getrandom::getrandom;
use skiff_protocol::CHUNK_BYTES;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// How much plaintext fits in one chunk so the framed result stays
/// within the channel's frame budget.
pub fn plaintext_chunk_len(encrypted: bool) -> usize {
    if encrypted {
        CHUNK_BYTES - NONCE_LEN - TAG_LEN
    } else {
        CHUNK_BYTES
    }
}

/// Per-chunk AES-256-GCM framing: `nonce(12) || ciphertext || tag(16)`
/// with a session-constant key and a fresh random nonce per chunk.
pub struct FrameCipher {
    cipher: Aes256Gcm,
}

impl FrameCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("invalid key length, need 32 bytes"))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom(&mut nonce_bytes).map_err(|err| anyhow!("nonce generation failed: {err}"))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plain)
            .map_err(|err| anyhow!("chunk encryption failed: {err}"))?;
        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < NONCE_LEN + TAG_LEN {
            return Err(anyhow!("encrypted frame too short: {} bytes", frame.len()));
        }
        let (nonce_bytes, ciphertext) = frame.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow!("chunk decryption failed"))
    }
}

pub fn generate_key() -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    getrandom(&mut key).map_err(|err| anyhow!("key generation failed: {err}"))?;
    Ok(key)
}

pub fn encode_key(key: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

pub fn decode_key(value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|err| anyhow!("invalid base64url key: {err}"))
}
