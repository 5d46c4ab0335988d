//! Cryptographic primitives: the long-lived service signing key and the
//! hybrid scheme that seals ballots to a poll key.
//!
//! A sealed ballot is `ephemeral-pub(32) || nonce(12) || ciphertext-and-tag`.
//! The AES-256-GCM key is derived with HKDF-SHA256 over the ephemeral public
//! key concatenated with the X25519 shared secret.

use aes_gcm::aead::{generic_array::GenericArray, Aead, NewAead};
use aes_gcm::Aes256Gcm;
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek as x25519;

pub const POLL_KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

type AesKey = [u8; 32];

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext is too short")]
    TooShort,

    #[error("failed to decrypt ballot")]
    Decrypt,

    #[error("invalid signing key material")]
    InvalidKey,
}

/// Long-lived Ed25519 key of the service. It signs poll public keys on start
/// and the decrypted-ballots artifact on stop.
pub struct MainKey {
    keypair: Keypair,
}

impl MainKey {
    pub fn generate() -> MainKey {
        let mut csprng = OsRng {};
        MainKey {
            keypair: Keypair::generate(&mut csprng),
        }
    }

    /// Construct the key from its 32 secret bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<MainKey, CryptoError> {
        let secret = SecretKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidKey)?;
        let public = PublicKey::from(&secret);
        Ok(MainKey {
            keypair: Keypair { secret, public },
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.keypair.sign(data)
    }
}

/// Mint a fresh private poll key.
pub fn create_poll_key() -> [u8; POLL_KEY_LENGTH] {
    let mut key = [0u8; POLL_KEY_LENGTH];
    OsRng.fill_bytes(&mut key);
    key
}

/// The curve25519 public half of a poll key.
pub fn poll_public_key(key: &[u8; POLL_KEY_LENGTH]) -> [u8; POLL_KEY_LENGTH] {
    let secret = x25519::StaticSecret::from(*key);
    x25519::PublicKey::from(&secret).to_bytes()
}

/// Seal a ballot to a poll public key. Only the holder of the matching
/// private poll key can open it.
pub fn seal(receiver_pub: &[u8; POLL_KEY_LENGTH], msg: &[u8]) -> Vec<u8> {
    let mut ephemeral = [0u8; POLL_KEY_LENGTH];
    OsRng.fill_bytes(&mut ephemeral);
    let ephemeral_secret = x25519::StaticSecret::from(ephemeral);
    let ephemeral_pub = x25519::PublicKey::from(&ephemeral_secret).to_bytes();

    let shared = ephemeral_secret.diffie_hellman(&x25519::PublicKey::from(*receiver_pub));
    let aes_key = derive_key(&ephemeral_pub, shared.as_bytes());

    let (nonce, encrypted) = aes_encrypt(&aes_key, msg);

    let mut cipher_text = Vec::with_capacity(POLL_KEY_LENGTH + NONCE_LENGTH + encrypted.len());
    cipher_text.extend(ephemeral_pub.iter());
    cipher_text.extend(nonce.iter());
    cipher_text.extend(encrypted);
    cipher_text
}

/// Open a sealed ballot with the private poll key.
pub fn open(key: &[u8; POLL_KEY_LENGTH], cipher_text: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if cipher_text.len() < POLL_KEY_LENGTH + NONCE_LENGTH + TAG_LENGTH {
        return Err(CryptoError::TooShort);
    }

    let mut ephemeral_pub = [0u8; POLL_KEY_LENGTH];
    ephemeral_pub.copy_from_slice(&cipher_text[..POLL_KEY_LENGTH]);

    let secret = x25519::StaticSecret::from(*key);
    let shared = secret.diffie_hellman(&x25519::PublicKey::from(ephemeral_pub));
    let aes_key = derive_key(&ephemeral_pub, shared.as_bytes());

    aes_decrypt(&aes_key, &cipher_text[POLL_KEY_LENGTH..])
}

fn derive_key(ephemeral_pub: &[u8; POLL_KEY_LENGTH], shared: &[u8; 32]) -> AesKey {
    let mut master = Vec::with_capacity(POLL_KEY_LENGTH + 32);
    master.extend(ephemeral_pub.iter());
    master.extend(shared.iter());

    let h = Hkdf::<Sha256>::new(None, &master);
    let mut out = [0u8; 32];
    h.expand(&[], &mut out).unwrap();
    out
}

fn aes_encrypt(key: &AesKey, msg: &[u8]) -> ([u8; NONCE_LENGTH], Vec<u8>) {
    let aead = Aes256Gcm::new(GenericArray::from_slice(key));

    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);

    let cipher_text = aead
        .encrypt(GenericArray::from_slice(&nonce), msg)
        .expect("aes-gcm encryption failure");
    (nonce, cipher_text)
}

fn aes_decrypt(key: &AesKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let aead = Aes256Gcm::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(&data[..NONCE_LENGTH]);
    aead.decrypt(nonce, &data[NONCE_LENGTH..])
        .map_err(|_| CryptoError::Decrypt)
}
