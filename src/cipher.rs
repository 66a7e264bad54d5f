//! Per-direction symmetric keystream cipher.
//!
//! The contract is opaque by design: four 128-byte key-exchange blocks seed
//! `init()`, after which `encrypt`/`decrypt` act in place and are each
//! other's inverse. This module supplies one concrete, testable
//! implementation on top of a standard crypto stack (`sha2` key derivation,
//! `chacha20poly1305` keystream generation).
use chacha20poly1305::{aead::Aead, KeyInit, XChaCha20Poly1305};
use sha2::{Digest, Sha256};

use crate::error::ProxyError;

pub const KEY_BLOCK_LEN: usize = 128;

/// The cipher contract a `Connection` drives through the handshake.
pub trait Cipher {
    fn set_client_key(&mut self, index: usize, key: [u8; KEY_BLOCK_LEN]);
    fn set_server_key(&mut self, index: usize, key: [u8; KEY_BLOCK_LEN]);
    /// Callable once all four keys are set. Calling it earlier is a
    /// programmer error — the `Connection` state machine is structured so
    /// this can never happen in practice.
    fn init(&mut self) -> Result<(), ProxyError>;
    fn encrypt(&mut self, buf: &mut [u8]);
    fn decrypt(&mut self, buf: &mut [u8]);
}

/// A stream cipher built from a single derived key: `encrypt` and `decrypt`
/// are the same XOR-with-keystream operation, advancing a shared byte
/// position every time either is called — mirroring the real wire
/// protocol's "one rolling keystream object per session" design, where
/// direction is irrelevant to the cipher itself.
#[derive(Default)]
pub struct XChaChaKeystreamCipher {
    client_keys: [Option<[u8; KEY_BLOCK_LEN]>; 2],
    server_keys: [Option<[u8; KEY_BLOCK_LEN]>; 2],
    derived: Option<DerivedStream>,
}

struct DerivedStream {
    cipher: XChaCha20Poly1305,
    nonce_base: [u8; 24],
    position: u64,
}

const KEYSTREAM_BLOCK: usize = 64;

impl XChaChaKeystreamCipher {
    pub fn new() -> Self {
        Self::default()
    }

    fn keystream_block(stream: &XChaCha20Poly1305, nonce_base: &[u8; 24], block_index: u64) -> [u8; KEYSTREAM_BLOCK] {
        let mut nonce = *nonce_base;
        nonce[16..24].copy_from_slice(&block_index.to_le_bytes());
        let zeros = [0u8; KEYSTREAM_BLOCK];
        // Encrypting an all-zero plaintext under a unique (key, nonce) pair
        // yields a deterministic pseudorandom block; the appended auth tag
        // is discarded since we only want the keystream, not authentication.
        let ct = stream
            .encrypt(&nonce.into(), zeros.as_ref())
            .expect("chacha20poly1305 encryption over a fixed-size buffer cannot fail");
        let mut out = [0u8; KEYSTREAM_BLOCK];
        out.copy_from_slice(&ct[..KEYSTREAM_BLOCK]);
        out
    }

    fn squeeze(&mut self, len: usize) -> Vec<u8> {
        let stream = self.derived.as_mut().expect("init() not yet called");
        let mut out = Vec::with_capacity(len);
        let mut pos = stream.position;
        while out.len() < len {
            let block_index = pos / KEYSTREAM_BLOCK as u64;
            let offset = (pos % KEYSTREAM_BLOCK as u64) as usize;
            let block = Self::keystream_block(&stream.cipher, &stream.nonce_base, block_index);
            let take = (KEYSTREAM_BLOCK - offset).min(len - out.len());
            out.extend_from_slice(&block[offset..offset + take]);
            pos += take as u64;
        }
        stream.position = pos;
        out
    }

    fn xor_in_place(&mut self, buf: &mut [u8]) {
        let keystream = self.squeeze(buf.len());
        for (b, k) in buf.iter_mut().zip(keystream.iter()) {
            *b ^= k;
        }
    }
}

impl Cipher for XChaChaKeystreamCipher {
    fn set_client_key(&mut self, index: usize, key: [u8; KEY_BLOCK_LEN]) {
        self.client_keys[index] = Some(key);
    }

    fn set_server_key(&mut self, index: usize, key: [u8; KEY_BLOCK_LEN]) {
        self.server_keys[index] = Some(key);
    }

    fn init(&mut self) -> Result<(), ProxyError> {
        let (c0, c1, s0, s1) = match (
            self.client_keys[0],
            self.client_keys[1],
            self.server_keys[0],
            self.server_keys[1],
        ) {
            (Some(c0), Some(c1), Some(s0), Some(s1)) => (c0, c1, s0, s1),
            _ => {
                return Err(ProxyError::Crypto(
                    "init() called before all four key-exchange blocks were set".to_string(),
                ))
            }
        };
        let mut hasher = Sha256::new();
        hasher.update(c0);
        hasher.update(c1);
        hasher.update(s0);
        hasher.update(s1);
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest[..32]);

        let mut nonce_hasher = Sha256::new();
        nonce_hasher.update(b"hookrelay-nonce");
        nonce_hasher.update(digest);
        let nonce_digest = nonce_hasher.finalize();
        let mut nonce_base = [0u8; 24];
        nonce_base.copy_from_slice(&nonce_digest[..24]);

        self.derived = Some(DerivedStream {
            cipher: XChaCha20Poly1305::new((&key).into()),
            nonce_base,
            position: 0,
        });
        Ok(())
    }

    fn encrypt(&mut self, buf: &mut [u8]) {
        self.xor_in_place(buf)
    }

    fn decrypt(&mut self, buf: &mut [u8]) {
        self.xor_in_place(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn keyed(seed: u8) -> XChaChaKeystreamCipher {
        let mut c = XChaChaKeystreamCipher::new();
        c.set_client_key(0, [seed; KEY_BLOCK_LEN]);
        c.set_client_key(1, [seed.wrapping_add(1); KEY_BLOCK_LEN]);
        c.set_server_key(0, [seed.wrapping_add(2); KEY_BLOCK_LEN]);
        c.set_server_key(1, [seed.wrapping_add(3); KEY_BLOCK_LEN]);
        c.init().unwrap();
        c
    }

    #[test]
    fn init_before_all_keys_set_is_an_error() {
        let mut c = XChaChaKeystreamCipher::new();
        c.set_client_key(0, [1; KEY_BLOCK_LEN]);
        assert!(c.init().is_err());
    }

    #[test]
    fn mirrored_instances_round_trip() {
        // Two independently-initialized ciphers sharing key material stay
        // in lockstep: what one encrypts, the other decrypts.
        let mut sender = keyed(7);
        let mut receiver = keyed(7);
        let plaintext = b"S_LOGIN payload bytes".to_vec();
        let mut buf = plaintext.clone();
        sender.encrypt(&mut buf);
        assert_ne!(buf, plaintext);
        receiver.decrypt(&mut buf);
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn sequential_calls_advance_the_keystream() {
        let mut sender = keyed(3);
        let mut receiver = keyed(3);
        for chunk in [&b"first"[..], &b"second-message"[..], &b"3"[..]] {
            let mut buf = chunk.to_vec();
            sender.encrypt(&mut buf);
            receiver.decrypt(&mut buf);
            assert_eq!(buf, chunk);
        }
    }

    #[test]
    fn different_keys_do_not_round_trip() {
        let mut sender = keyed(1);
        let mut receiver = keyed(2);
        let plaintext = b"mismatched keys".to_vec();
        let mut buf = plaintext.clone();
        sender.encrypt(&mut buf);
        receiver.decrypt(&mut buf);
        assert_ne!(buf, plaintext);
    }
}
