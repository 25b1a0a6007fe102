//! Double-ratchet session state and its persistent record.
//!
//! A [`SessionRecord`] holds the current [`SessionState`] for one remote
//! device plus a bounded list of archived states, which are kept so that
//! ciphertext already in flight when a session was replaced still decrypts.

use std::collections::VecDeque;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::IdentityKey;
use crate::signal::message::SignalMessage;
use crate::signal::x3dh::AgreementSecrets;

type HmacSha256 = Hmac<Sha256>;

const RATCHET_INFO: &[u8] = b"ParleyRatchet";
const MESSAGE_KEYS_INFO: &[u8] = b"ParleyMessageKeys";

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

/// Archived states kept per record.
pub const MAX_ARCHIVED_STATES: usize = 40;
/// Receiver chains kept per state; older chains are dropped with their keys.
const MAX_RECEIVER_CHAINS: usize = 5;
/// Cached keys for out-of-order messages, per chain.
pub const MAX_SKIPPED_KEYS: usize = 2000;
/// Largest gap between the chain position and an incoming counter.
pub const MAX_FORWARD_JUMPS: u32 = 2000;

/// Per-message key material expanded from a chain step.
#[derive(Zeroize, ZeroizeOnDrop)]
struct MessageKeys {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
    nonce: [u8; 12],
}

impl MessageKeys {
    fn derive(seed: &[u8; 32]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, seed);
        let mut okm = zeroize::Zeroizing::new([0u8; 76]);
        hk.expand(MESSAGE_KEYS_INFO, &mut okm[..])
            .map_err(|e| CryptoError::KeyGeneration(format!("HKDF: {e}")))?;

        let mut keys = Self {
            cipher_key: [0u8; 32],
            mac_key: [0u8; 32],
            nonce: [0u8; 12],
        };
        keys.cipher_key.copy_from_slice(&okm[..32]);
        keys.mac_key.copy_from_slice(&okm[32..64]);
        keys.nonce.copy_from_slice(&okm[64..76]);
        Ok(keys)
    }
}

/// One symmetric ratchet step: returns `(next_chain_key, message_key_seed)`.
fn chain_step(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hmac = |seed: u8| -> Result<[u8; 32], CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key)
            .map_err(|e| CryptoError::KeyGeneration(format!("chain key: {e}")))?;
        mac.update(&[seed]);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    };
    Ok((hmac(CHAIN_KEY_SEED)?, hmac(MESSAGE_KEY_SEED)?))
}

/// DH ratchet step: mix a fresh DH output into the root key.
///
/// Returns `(next_root_key, chain_key)`.
fn root_step(
    root_key: &[u8; 32],
    their_ratchet: &X25519Public,
    our_ratchet: &StaticSecret,
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let shared = our_ratchet.diffie_hellman(their_ratchet);
    let hk = Hkdf::<Sha256>::new(Some(root_key), shared.as_bytes());
    let mut okm = zeroize::Zeroizing::new([0u8; 64]);
    hk.expand(RATCHET_INFO, &mut okm[..])
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF: {e}")))?;

    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    Ok((root, chain))
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SenderChain {
    ratchet_public: [u8; 32],
    ratchet_private: [u8; 32],
    chain_key: [u8; 32],
    index: u32,
}

impl SenderChain {
    fn generate(chain_key: [u8; 32], ratchet: &StaticSecret) -> Self {
        Self {
            ratchet_public: X25519Public::from(ratchet).to_bytes(),
            ratchet_private: ratchet.to_bytes(),
            chain_key,
            index: 0,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SkippedKey {
    index: u32,
    seed: [u8; 32],
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ReceiverChain {
    ratchet_public: [u8; 32],
    chain_key: [u8; 32],
    index: u32,
    skipped: Vec<SkippedKey>,
}

/// Handshake parameters the initiator repeats on every message until the
/// responder has proven it built the session by replying.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct PendingPreKey {
    pub prekey_id: Option<u32>,
    pub signed_prekey_id: u32,
    pub base_key: [u8; 32],
}

/// Ratchet state for one session with one remote device.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct SessionState {
    local_identity: [u8; 32],
    remote_identity: [u8; 32],
    local_registration_id: u32,
    remote_registration_id: u32,
    root_key: [u8; 32],
    sender_chain: SenderChain,
    receiver_chains: VecDeque<ReceiverChain>,
    previous_counter: u32,
    pending_prekey: Option<PendingPreKey>,
    /// Base key of the handshake that created this state.
    base_key: [u8; 32],
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

/// Inputs shared by both initialization paths.
pub(crate) struct StateParameters<'a> {
    pub secrets: &'a AgreementSecrets,
    pub local_identity: &'a IdentityKey,
    pub remote_identity: &'a IdentityKey,
    pub local_registration_id: u32,
    pub remote_registration_id: u32,
    pub base_key: [u8; 32],
}

impl SessionState {
    /// Initiator state: the peer's signed prekey acts as its first ratchet key.
    pub(crate) fn initialize_initiator(
        params: &StateParameters<'_>,
        their_signed_prekey: &X25519Public,
        pending: PendingPreKey,
    ) -> Result<Self, CryptoError> {
        let sending_ratchet = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let (root_key, sending_chain_key) =
            root_step(&params.secrets.root_key, their_signed_prekey, &sending_ratchet)?;

        let mut receiver_chains = VecDeque::new();
        receiver_chains.push_back(ReceiverChain {
            ratchet_public: their_signed_prekey.to_bytes(),
            chain_key: params.secrets.chain_key,
            index: 0,
            skipped: Vec::new(),
        });

        Ok(Self {
            local_identity: *params.local_identity.as_bytes(),
            remote_identity: *params.remote_identity.as_bytes(),
            local_registration_id: params.local_registration_id,
            remote_registration_id: params.remote_registration_id,
            root_key,
            sender_chain: SenderChain::generate(sending_chain_key, &sending_ratchet),
            receiver_chains,
            previous_counter: 0,
            pending_prekey: Some(pending),
            base_key: params.base_key,
        })
    }

    /// Responder state: our signed prekey is the first sending ratchet key.
    pub(crate) fn initialize_responder(
        params: &StateParameters<'_>,
        our_signed_prekey: &StaticSecret,
    ) -> Self {
        Self {
            local_identity: *params.local_identity.as_bytes(),
            remote_identity: *params.remote_identity.as_bytes(),
            local_registration_id: params.local_registration_id,
            remote_registration_id: params.remote_registration_id,
            root_key: params.secrets.root_key,
            sender_chain: SenderChain::generate(params.secrets.chain_key, our_signed_prekey),
            receiver_chains: VecDeque::new(),
            previous_counter: 0,
            pending_prekey: None,
            base_key: params.base_key,
        }
    }

    pub(crate) fn local_identity(&self) -> Result<IdentityKey, CryptoError> {
        IdentityKey::from_bytes(&self.local_identity)
    }

    pub(crate) fn remote_identity(&self) -> Result<IdentityKey, CryptoError> {
        IdentityKey::from_bytes(&self.remote_identity)
    }

    pub(crate) fn local_registration_id(&self) -> u32 {
        self.local_registration_id
    }

    pub(crate) fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    pub(crate) fn pending_prekey(&self) -> Option<&PendingPreKey> {
        self.pending_prekey.as_ref()
    }

    pub(crate) fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    /// Encrypt one message on the sending chain and advance it.
    pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> Result<SignalMessage, CryptoError> {
        let (next_chain_key, seed) = chain_step(&self.sender_chain.chain_key)?;
        let keys = MessageKeys::derive(&seed)?;

        let cipher = Aes256Gcm::new_from_slice(&keys.cipher_key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&keys.nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let message = SignalMessage::new(
            &keys.mac_key,
            self.sender_chain.ratchet_public,
            self.sender_chain.index,
            self.previous_counter,
            ciphertext,
            &self.local_identity()?,
            &self.remote_identity()?,
        )?;

        self.sender_chain.chain_key = next_chain_key;
        self.sender_chain.index += 1;
        Ok(message)
    }

    /// Decrypt a message addressed to this state.
    ///
    /// Mutates the ratchet even when decryption later fails, so callers run
    /// it against a clone and only keep the result on success.
    pub(crate) fn decrypt(
        &mut self,
        message: &SignalMessage,
        address: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let their_ratchet = X25519Public::from(*message.sender_ratchet_key());
        let chain_pos = self.receiver_chain_for(&their_ratchet)?;
        let seed = self.message_key_seed(chain_pos, message.counter(), address)?;
        let keys = MessageKeys::derive(&seed)?;

        if !message.verify_mac(&keys.mac_key, &self.remote_identity()?, &self.local_identity()?)? {
            return Err(CryptoError::InvalidMessage("bad MAC".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&keys.cipher_key)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&keys.nonce), message.ciphertext())
            .map_err(|_| CryptoError::InvalidMessage("ciphertext failed authentication".into()))?;

        // The peer replied, so it holds the session; stop resending the handshake.
        self.pending_prekey = None;
        Ok(plaintext)
    }

    /// Locate the receiver chain for `their_ratchet`, running a DH ratchet
    /// step when the peer has moved to a new ratchet key.
    fn receiver_chain_for(&mut self, their_ratchet: &X25519Public) -> Result<usize, CryptoError> {
        if let Some(pos) = self
            .receiver_chains
            .iter()
            .position(|c| c.ratchet_public == *their_ratchet.as_bytes())
        {
            return Ok(pos);
        }

        let our_ratchet = StaticSecret::from(self.sender_chain.ratchet_private);
        let (root_key, receiving_chain_key) = root_step(&self.root_key, their_ratchet, &our_ratchet)?;

        let next_ratchet = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let (root_key, sending_chain_key) = root_step(&root_key, their_ratchet, &next_ratchet)?;

        self.root_key = root_key;
        self.previous_counter = self.sender_chain.index;
        self.sender_chain = SenderChain::generate(sending_chain_key, &next_ratchet);

        self.receiver_chains.push_back(ReceiverChain {
            ratchet_public: their_ratchet.to_bytes(),
            chain_key: receiving_chain_key,
            index: 0,
            skipped: Vec::new(),
        });
        while self.receiver_chains.len() > MAX_RECEIVER_CHAINS {
            self.receiver_chains.pop_front();
        }
        Ok(self.receiver_chains.len() - 1)
    }

    /// Produce the key seed for `counter`, caching any skipped seeds.
    fn message_key_seed(
        &mut self,
        chain_pos: usize,
        counter: u32,
        address: &str,
    ) -> Result<[u8; 32], CryptoError> {
        let chain = self
            .receiver_chains
            .get_mut(chain_pos)
            .ok_or_else(|| CryptoError::InvalidMessage("receiver chain vanished".into()))?;

        if counter < chain.index {
            let cached = chain.skipped.iter().position(|k| k.index == counter);
            return match cached {
                Some(pos) => Ok(chain.skipped.remove(pos).seed),
                None => Err(CryptoError::DuplicateMessage {
                    address: address.to_string(),
                    counter,
                }),
            };
        }

        if counter - chain.index > MAX_FORWARD_JUMPS {
            return Err(CryptoError::InvalidMessage(format!(
                "message counter {counter} is too far ahead of chain position {}",
                chain.index
            )));
        }

        let mut chain_key = chain.chain_key;
        while chain.index < counter {
            let (next, seed) = chain_step(&chain_key)?;
            chain.skipped.push(SkippedKey {
                index: chain.index,
                seed,
            });
            if chain.skipped.len() > MAX_SKIPPED_KEYS {
                chain.skipped.remove(0);
            }
            chain_key = next;
            chain.index += 1;
        }

        let (next, seed) = chain_step(&chain_key)?;
        chain.chain_key = next;
        chain.index += 1;
        Ok(seed)
    }
}

/// Persistent per-address session record.
///
/// A record with no current state is "fresh": callers treat it as the empty
/// starting point and must run a handshake before encrypting.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    /// An empty record, as returned for addresses with no stored session.
    pub fn new_fresh() -> Self {
        Self::default()
    }

    /// True when the record has never completed a handshake (or its state
    /// was archived) and cannot encrypt.
    pub fn is_fresh(&self) -> bool {
        self.current.is_none()
    }

    /// True when neither a current nor an archived state exists.
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.previous.is_empty()
    }

    pub fn archived_state_count(&self) -> usize {
        self.previous.len()
    }

    /// Identity key of the remote device bound to the current state.
    pub fn remote_identity(&self) -> Option<IdentityKey> {
        self.current.as_ref().and_then(|s| s.remote_identity().ok())
    }

    pub fn remote_registration_id(&self) -> Option<u32> {
        self.current.as_ref().map(SessionState::remote_registration_id)
    }

    /// True if the next encrypt will still embed the handshake.
    pub fn has_unacknowledged_prekey(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| s.pending_prekey().is_some())
    }

    /// Retire the current state, keeping it to decrypt in-flight messages.
    pub fn archive_current_state(&mut self) {
        if let Some(state) = self.current.take() {
            self.previous.push_front(state);
            self.previous.truncate(MAX_ARCHIVED_STATES);
        }
    }

    pub(crate) fn current_state(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub(crate) fn current_state_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    /// Install `state` as current, archiving whatever was there.
    pub(crate) fn promote_state(&mut self, state: SessionState) {
        self.archive_current_state();
        self.current = Some(state);
    }

    /// Whether any state (current or archived) came from the handshake with
    /// this base key.
    pub(crate) fn has_state_with_base_key(&self, base_key: &[u8; 32]) -> bool {
        self.current
            .iter()
            .chain(self.previous.iter())
            .any(|s| s.base_key() == base_key)
    }

    /// Decrypt against the current state, then the archived ones.
    ///
    /// On success the winning state is advanced in place; an archived state
    /// never becomes current again. On failure the record is unchanged; a
    /// replay anywhere wins over other errors so callers can treat it as
    /// benign.
    pub(crate) fn decrypt(
        &mut self,
        message: &SignalMessage,
        address: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut first_error = None;

        if let Some(current) = &self.current {
            let mut candidate = current.clone();
            match candidate.decrypt(message, address) {
                Ok(plaintext) => {
                    self.current = Some(candidate);
                    return Ok(plaintext);
                }
                Err(e) if e.is_duplicate() => return Err(e),
                Err(e) => first_error = Some(e),
            }
        }

        for idx in 0..self.previous.len() {
            let mut candidate = self.previous[idx].clone();
            match candidate.decrypt(message, address) {
                Ok(plaintext) => {
                    self.previous[idx] = candidate;
                    return Ok(plaintext);
                }
                Err(e) if e.is_duplicate() => return Err(e),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or_else(|| CryptoError::NoSession(address.to_string())))
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self)
            .map_err(|e| CryptoError::StorageError(format!("encode session: {e}")))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(bytes)
            .map_err(|e| CryptoError::StorageError(format!("corrupt session record: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_step_is_deterministic_and_advances() {
        let (next1, seed1) = chain_step(&[5u8; 32]).unwrap();
        let (next2, seed2) = chain_step(&[5u8; 32]).unwrap();
        assert_eq!(next1, next2);
        assert_eq!(seed1, seed2);

        let (next3, seed3) = chain_step(&next1).unwrap();
        assert_ne!(next1, next3);
        assert_ne!(seed1, seed3);
        assert_ne!(next1, seed1);
    }

    #[test]
    fn root_step_is_symmetric() {
        let a = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let root = [3u8; 32];

        let from_a = root_step(&root, &X25519Public::from(&b), &a).unwrap();
        let from_b = root_step(&root, &X25519Public::from(&a), &b).unwrap();
        assert_eq!(from_a, from_b);
    }

    #[test]
    fn message_keys_split_cleanly() {
        let keys = MessageKeys::derive(&[1u8; 32]).unwrap();
        assert_ne!(keys.cipher_key, keys.mac_key);
        assert_ne!(keys.nonce, [0u8; 12]);
    }

    #[test]
    fn fresh_record_roundtrips_and_stays_fresh() {
        let record = SessionRecord::new_fresh();
        let bytes = record.serialize().unwrap();
        let restored = SessionRecord::deserialize(&bytes).unwrap();
        assert!(restored.is_fresh());
        assert!(restored.is_empty());
        assert_eq!(restored.serialize().unwrap(), bytes);
    }

    #[test]
    fn garbage_record_is_rejected() {
        assert!(SessionRecord::deserialize(&[0xFF; 7]).is_err());
    }
}
