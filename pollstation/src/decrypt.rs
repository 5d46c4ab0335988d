//! The decrypt engine: poll-scoped keys on start, the signed
//! decrypted-ballots artifact on stop.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::{self, MainKey, POLL_KEY_LENGTH};
use crate::keystore::{KeyStore, KeyStoreError};

const DECRYPT_ERROR: &str = r#"{"error":"decrypt"}"#;

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("unknown poll")]
    NotExist,

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Internal(String),
}

/// Boundary the vote collector uses to reach the decrypt engine.
///
/// The in-process [`Decrypt`] engine implements it directly; a separately
/// deployed engine is reached through a transport client implementing the
/// same three calls.
#[async_trait]
pub trait Decrypter: Send + Sync {
    /// Returns the poll's public key and its signature under the service
    /// signing key. Idempotent: repeated calls reuse the stored poll key.
    async fn start(&self, poll_id: &str) -> Result<(Vec<u8>, Vec<u8>), DecryptError>;

    /// Decrypts the given ciphertexts, breaks their submission order and
    /// returns the signed artifact as `(content, signature)`.
    async fn stop(
        &self,
        poll_id: &str,
        vote_list: Vec<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>), DecryptError>;

    /// Removes the poll's key material. Safe on unknown polls.
    async fn clear(&self, poll_id: &str) -> Result<(), DecryptError>;
}

/// The in-process decrypt engine.
#[derive(Clone)]
pub struct Decrypt {
    inner: Arc<Inner>,
}

struct Inner {
    main_key: MainKey,
    store: Box<dyn KeyStore>,
    workers: usize,
    max_votes: usize,
}

impl Decrypt {
    pub fn new(main_key: MainKey, store: Box<dyn KeyStore>) -> Decrypt {
        Decrypt::with_options(main_key, store, None, None)
    }

    /// Like [`Decrypt::new`] with explicit worker count and vote cap.
    /// `workers` defaults to the number of cpu cores, `max_votes` to
    /// unlimited.
    pub fn with_options(
        main_key: MainKey,
        store: Box<dyn KeyStore>,
        workers: Option<usize>,
        max_votes: Option<usize>,
    ) -> Decrypt {
        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Decrypt {
            inner: Arc::new(Inner {
                main_key,
                store,
                workers: workers.unwrap_or(default_workers),
                max_votes: max_votes.unwrap_or(usize::MAX),
            }),
        }
    }

    fn start_blocking(&self, poll_id: &str) -> Result<(Vec<u8>, Vec<u8>), DecryptError> {
        let key = match self.load_key(poll_id)? {
            Some(key) => key,
            None => {
                let key = crypto::create_poll_key();
                self.inner
                    .store
                    .save_key(poll_id, &key)
                    .map_err(|err| DecryptError::Internal(format!("saving poll key: {}", err)))?;
                key
            }
        };

        let pub_key = crypto::poll_public_key(&key);
        let pub_key_sig = self.inner.main_key.sign(&pub_key);
        Ok((pub_key.to_vec(), pub_key_sig.to_bytes().to_vec()))
    }

    fn stop_blocking(
        &self,
        poll_id: &str,
        mut vote_list: Vec<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>), DecryptError> {
        let key = self.load_key(poll_id)?.ok_or(DecryptError::NotExist)?;

        if vote_list.len() > self.inner.max_votes {
            return Err(DecryptError::Invalid(format!(
                "received {} votes, only {} votes supported",
                vote_list.len(),
                self.inner.max_votes
            )));
        }

        // The shuffle stream is keyed on the private key and the ballot set:
        // unpredictable without the key, but reproducible for a repeated stop
        // with identical ballots, which must re-create the signed artifact
        // byte for byte.
        let mut rng = ChaCha20Rng::from_seed(shuffle_seed(&key, &vote_list));
        vote_list.shuffle(&mut rng);

        let decrypted = self.decrypt_votes(&key, &vote_list)?;

        let content = Artifact {
            id: poll_id,
            votes: &decrypted,
        };
        let decrypted_content = serde_json::to_vec(&content)
            .map_err(|err| DecryptError::Internal(format!("marshal decrypted content: {}", err)))?;

        let signature = self.inner.main_key.sign(&decrypted_content).to_bytes();

        match self.inner.store.validate_signature(poll_id, &signature) {
            Ok(()) => Ok((decrypted_content, signature.to_vec())),
            Err(KeyStoreError::SignatureMismatch) => Err(DecryptError::Internal(
                "ballots differ from an earlier stop of the poll".to_string(),
            )),
            Err(err) => Err(DecryptError::Internal(format!(
                "validate signature: {}",
                err
            ))),
        }
    }

    fn decrypt_votes(
        &self,
        key: &[u8; POLL_KEY_LENGTH],
        vote_list: &[Vec<u8>],
    ) -> Result<Vec<Box<RawValue>>, DecryptError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.inner.workers)
            .build()
            .map_err(|err| DecryptError::Internal(format!("building worker pool: {}", err)))?;

        Ok(pool.install(|| {
            vote_list
                .par_iter()
                .map(|vote| decrypt_vote(key, vote))
                .collect()
        }))
    }

    fn load_key(&self, poll_id: &str) -> Result<Option<[u8; POLL_KEY_LENGTH]>, DecryptError> {
        let key = match self
            .inner
            .store
            .load_key(poll_id)
            .map_err(|err| DecryptError::Internal(format!("loading poll key: {}", err)))?
        {
            Some(key) => key,
            None => return Ok(None),
        };

        key.as_slice()
            .try_into()
            .map(Some)
            .map_err(|_| DecryptError::Internal("stored poll key has a wrong length".to_string()))
    }
}

#[derive(Serialize)]
struct Artifact<'a> {
    id: &'a str,
    votes: &'a [Box<RawValue>],
}

/// A single ballot that cannot be decrypted or does not carry JSON must not
/// kill the whole poll; its slot reports the failure instead.
fn decrypt_vote(key: &[u8; POLL_KEY_LENGTH], vote: &[u8]) -> Box<RawValue> {
    let decrypted = match crypto::open(key, vote) {
        Ok(plain) => plain,
        Err(_) => return decrypt_error(),
    };
    String::from_utf8(decrypted)
        .ok()
        .and_then(|plain| RawValue::from_string(plain).ok())
        .unwrap_or_else(decrypt_error)
}

fn decrypt_error() -> Box<RawValue> {
    RawValue::from_string(DECRYPT_ERROR.to_string()).unwrap()
}

fn shuffle_seed(key: &[u8; POLL_KEY_LENGTH], vote_list: &[Vec<u8>]) -> [u8; 32] {
    let mut digests: Vec<[u8; 32]> = vote_list
        .iter()
        .map(|vote| Sha256::digest(vote).into())
        .collect();
    digests.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(key);
    for digest in &digests {
        hasher.update(digest);
    }
    hasher.finalize().into()
}

#[async_trait]
impl Decrypter for Decrypt {
    async fn start(&self, poll_id: &str) -> Result<(Vec<u8>, Vec<u8>), DecryptError> {
        let engine = self.clone();
        let poll_id = poll_id.to_string();
        tokio::task::spawn_blocking(move || engine.start_blocking(&poll_id))
            .await
            .map_err(|err| DecryptError::Internal(err.to_string()))?
    }

    async fn stop(
        &self,
        poll_id: &str,
        vote_list: Vec<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>), DecryptError> {
        let engine = self.clone();
        let poll_id = poll_id.to_string();
        tokio::task::spawn_blocking(move || engine.stop_blocking(&poll_id, vote_list))
            .await
            .map_err(|err| DecryptError::Internal(err.to_string()))?
    }

    async fn clear(&self, poll_id: &str) -> Result<(), DecryptError> {
        self.inner
            .store
            .clear_poll(poll_id)
            .map_err(|err| DecryptError::Internal(format!("clearing poll from store: {}", err)))
    }
}
