//! Sealing of discovery payloads between two identity keys.

use std::fmt::Debug;

use anyhow::{anyhow, ensure, Result};

pub(crate) const NONCE_LEN: usize = 24;

pub(super) fn public_ed_box(key: &ed25519_dalek::VerifyingKey) -> crypto_box::PublicKey {
    crypto_box::PublicKey::from(key.to_montgomery())
}

pub(super) fn secret_ed_box(key: &ed25519_dalek::SigningKey) -> crypto_box::SecretKey {
    crypto_box::SecretKey::from(key.to_scalar())
}

/// The precomputed key for one pair of identity keys.
///
/// Payloads are sealed with ChaCha20-Poly1305 under a random 24 byte nonce,
/// which is prepended to the ciphertext.
pub struct SharedSecret(crypto_box::ChaChaBox);

impl Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret(..)")
    }
}

impl SharedSecret {
    fn new(this: &crypto_box::SecretKey, other: &crypto_box::PublicKey) -> Self {
        SharedSecret(crypto_box::ChaChaBox::new(other, this))
    }

    /// Seals the provided cleartext.
    pub fn seal(&self, cleartext: &[u8]) -> Vec<u8> {
        use crypto_box::aead::{Aead, AeadCore, OsRng};

        let nonce = crypto_box::ChaChaBox::generate_nonce(&mut OsRng);
        let ciphertext = self.0.encrypt(&nonce, cleartext).expect("encryption failed");

        let mut res = nonce.to_vec();
        res.extend(ciphertext);
        res
    }

    /// Opens a sealed box created by [`Self::seal`], returning the cleartext.
    pub fn open(&self, seal: &[u8]) -> Result<Vec<u8>> {
        use crypto_box::aead::Aead;
        ensure!(seal.len() > NONCE_LEN, "too short");

        let (nonce, ciphertext) = seal.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().expect("checked above");
        let plaintext = self
            .0
            .decrypt(&nonce.into(), ciphertext)
            .map_err(|e| anyhow!("decryption failed: {:?}", e))?;

        Ok(plaintext)
    }
}

impl crate::key::SecretKey {
    /// Returns the shared key for communication between this key and `other`.
    pub fn shared(&self, other: &crate::key::PublicKey) -> SharedSecret {
        let secret_key = self.secret_crypto_box();
        let public_key = other.crypto_box();

        SharedSecret::new(secret_key, &public_key)
    }
}

#[cfg(test)]
mod tests {
    use crate::key::SecretKey;

    #[test]
    fn test_seal_open_roundtrip() {
        let key_a = SecretKey::generate();
        let key_b = SecretKey::generate();

        seal_open_roundtrip(&key_a, &key_b);
        seal_open_roundtrip(&key_b, &key_a);
        seal_open_roundtrip(&key_a, &key_a);
    }

    fn seal_open_roundtrip(key_a: &SecretKey, key_b: &SecretKey) {
        let msg = b"super secret message!!!!";
        let shared_a = key_a.shared(&key_b.public());
        let sealed_message = shared_a.seal(msg);
        let shared_b = key_b.shared(&key_a.public());
        let decrypted_message = shared_b.open(&sealed_message).unwrap();
        assert_eq!(&msg[..], &decrypted_message);
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let key_a = SecretKey::generate();
        let key_b = SecretKey::generate();
        let key_c = SecretKey::generate();

        let sealed = key_a.shared(&key_b.public()).seal(b"hi there");
        assert!(key_c.shared(&key_a.public()).open(&sealed).is_err());
    }
}
