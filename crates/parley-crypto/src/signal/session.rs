use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;
use crate::identity::IdentityKey;
use crate::signal::address::ProtocolAddress;
use crate::signal::message::{
    CiphertextMessage, PreKeySignalMessage, SignalMessage,
};
use crate::signal::prekeys::DeviceKeyBundle;
use crate::signal::ratchet::{PendingPreKey, SessionState, StateParameters};
use crate::signal::store::ProtocolStore;
use crate::signal::x3dh::{initiator_agreement, responder_agreement};

/// How a changed identity key for an already pinned address is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Pin on first sight; later mismatches fail with `UntrustedIdentity`
    /// until the caller re-verifies through [`SessionCipher::trust_identity`].
    #[default]
    TrustOnFirstUse,
    /// Accept every key. Mismatches are logged and re-pinned.
    AlwaysTrust,
}

/// Builds sessions and runs the ratchet for every remote address.
///
/// Each call is a single load-mutate-store against the store. Callers that
/// can dispatch concurrently must serialize calls per address.
pub struct SessionCipher {
    store: Arc<dyn ProtocolStore>,
    trust_policy: TrustPolicy,
}

impl SessionCipher {
    pub fn new(store: Arc<dyn ProtocolStore>, trust_policy: TrustPolicy) -> Self {
        Self {
            store,
            trust_policy,
        }
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        self.trust_policy
    }

    /// Initiator handshake against a fetched bundle.
    ///
    /// Always builds a new state; any existing one is archived. Callers that
    /// want to keep an established session check `contains_session` first.
    pub fn process_prekey_bundle(
        &self,
        address: &ProtocolAddress,
        bundle: &DeviceKeyBundle,
    ) -> Result<(), CryptoError> {
        let their_identity = IdentityKey::from_bytes(&bundle.identity_key)?;
        self.check_trust(address, &their_identity)?;

        their_identity
            .verify(&bundle.signed_prekey_public, &bundle.signed_prekey_signature)
            .map_err(|_| {
                CryptoError::InvalidSignature(format!("signed prekey of {address}"))
            })?;
        let their_signed_prekey = x25519_public(&bundle.signed_prekey_public, "signed prekey")?;
        let their_one_time_prekey = bundle
            .prekey
            .as_ref()
            .map(|p| x25519_public(&p.public_key, "one-time prekey"))
            .transpose()?;

        let our_identity = self.store.get_identity_key_pair()?;
        let our_registration_id = self.store.get_local_registration_id()?;

        let base_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let base_key = X25519Public::from(&base_secret).to_bytes();

        let secrets = initiator_agreement(
            &our_identity,
            &base_secret,
            &their_identity,
            &their_signed_prekey,
            their_one_time_prekey.as_ref(),
        )?;
        let state = SessionState::initialize_initiator(
            &StateParameters {
                secrets: &secrets,
                local_identity: &our_identity.identity_key(),
                remote_identity: &their_identity,
                local_registration_id: our_registration_id,
                remote_registration_id: bundle.registration_id,
                base_key,
            },
            &their_signed_prekey,
            PendingPreKey {
                prekey_id: bundle.prekey.as_ref().map(|p| p.id),
                signed_prekey_id: bundle.signed_prekey_id,
                base_key,
            },
        )?;

        let mut record = self.store.load_session(address)?;
        record.promote_state(state);
        self.log_repin(address, &their_identity)?;
        self.store
            .commit_handshake(address, &their_identity, &record, None)?;

        info!(
            %address,
            one_time_prekey = ?bundle.prekey.as_ref().map(|p| p.id),
            signed_prekey_id = bundle.signed_prekey_id,
            "session built from bundle"
        );
        Ok(())
    }

    /// Encrypt for `address`. Until the peer has replied, every message
    /// carries the handshake.
    pub fn encrypt(
        &self,
        address: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<CiphertextMessage, CryptoError> {
        let mut record = self.store.load_session(address)?;
        let state = record
            .current_state_mut()
            .ok_or_else(|| CryptoError::NoSession(address.to_string()))?;

        self.check_trust(address, &state.remote_identity()?)?;

        let message = state.encrypt(plaintext)?;
        let ciphertext = match state.pending_prekey() {
            Some(pending) => CiphertextMessage::PreKey(PreKeySignalMessage::new(
                state.local_registration_id(),
                pending.prekey_id,
                pending.signed_prekey_id,
                pending.base_key,
                state.local_identity()?,
                message,
            )),
            None => CiphertextMessage::Whisper(message),
        };

        self.store.store_session(address, &record)?;
        Ok(ciphertext)
    }

    pub fn decrypt(
        &self,
        address: &ProtocolAddress,
        message: &CiphertextMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let result = match message {
            CiphertextMessage::Whisper(m) => self.decrypt_whisper(address, m),
            CiphertextMessage::PreKey(m) => self.decrypt_prekey(address, m),
        };
        if let Err(e) = &result {
            if e.is_duplicate() {
                debug!(%address, error = %e, "dropping replayed message");
            }
        }
        result
    }

    fn decrypt_whisper(
        &self,
        address: &ProtocolAddress,
        message: &SignalMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut record = self.store.load_session(address)?;
        if record.is_empty() {
            return Err(CryptoError::NoSession(address.to_string()));
        }

        let plaintext = record.decrypt(message, &address.to_string())?;
        if let Some(identity) = record.remote_identity() {
            self.check_trust(address, &identity)?;
        }
        self.store.store_session(address, &record)?;
        Ok(plaintext)
    }

    /// Responder handshake. Retransmissions of a handshake we already
    /// processed are routed to the existing state.
    fn decrypt_prekey(
        &self,
        address: &ProtocolAddress,
        message: &PreKeySignalMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let their_identity = *message.identity_key();
        self.check_trust(address, &their_identity)?;

        let addr = address.to_string();
        let mut record = self.store.load_session(address)?;

        if record.has_state_with_base_key(message.base_key()) {
            let plaintext = record.decrypt(message.message(), &addr)?;
            self.store.store_session(address, &record)?;
            return Ok(plaintext);
        }

        let our_identity = self.store.get_identity_key_pair()?;
        let our_registration_id = self.store.get_local_registration_id()?;

        let signed_prekey = self
            .store
            .load_signed_prekey(message.signed_prekey_id())
            .map_err(|e| unknown_key_id(e, "signed prekey", message.signed_prekey_id()))?;
        let one_time_prekey = message
            .prekey_id()
            .map(|id| {
                self.store
                    .load_prekey(id)
                    .map_err(|e| unknown_key_id(e, "prekey", id))
            })
            .transpose()?;

        let their_base_key = X25519Public::from(*message.base_key());
        let signed_secret = signed_prekey.secret();
        let one_time_secret = one_time_prekey.as_ref().map(|p| p.secret());

        let secrets = responder_agreement(
            &our_identity,
            &signed_secret,
            one_time_secret.as_ref(),
            &their_identity,
            &their_base_key,
        )?;
        let mut state = SessionState::initialize_responder(
            &StateParameters {
                secrets: &secrets,
                local_identity: &our_identity.identity_key(),
                remote_identity: &their_identity,
                local_registration_id: our_registration_id,
                remote_registration_id: message.registration_id(),
                base_key: *message.base_key(),
            },
            &signed_secret,
        );
        let plaintext = state.decrypt(message.message(), &addr)?;

        record.promote_state(state);
        self.log_repin(address, &their_identity)?;
        if !self.store.commit_handshake(
            address,
            &their_identity,
            &record,
            message.prekey_id(),
        )? {
            warn!(%address, prekey_id = ?message.prekey_id(), "one-time prekey consumed concurrently");
            return Err(CryptoError::InvalidKeyId(format!(
                "prekey {:?} was already consumed",
                message.prekey_id()
            )));
        }

        info!(
            %address,
            prekey_id = ?message.prekey_id(),
            signed_prekey_id = message.signed_prekey_id(),
            "session built from incoming handshake"
        );
        Ok(plaintext)
    }

    /// Explicitly accept `identity` for `address` after out-of-band
    /// verification. A replaced key archives the session built on the old
    /// one. Returns whether a different key was replaced.
    pub fn trust_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, CryptoError> {
        let replaced = self.store.save_identity(address, identity)?;
        if replaced {
            self.store.archive_session(address)?;
            info!(%address, fingerprint = %identity.fingerprint(), "identity re-verified");
        }
        Ok(replaced)
    }

    fn check_trust(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<(), CryptoError> {
        let Some(pinned) = self.store.get_identity(address)? else {
            return Ok(());
        };
        if pinned == *identity {
            return Ok(());
        }

        match self.trust_policy {
            TrustPolicy::TrustOnFirstUse => {
                warn!(
                    %address,
                    pinned = %pinned.fingerprint(),
                    presented = %identity.fingerprint(),
                    "identity key changed"
                );
                Err(CryptoError::UntrustedIdentity(address.to_string()))
            }
            TrustPolicy::AlwaysTrust => {
                warn!(%address, "identity key changed; accepting");
                Ok(())
            }
        }
    }

    fn log_repin(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<(), CryptoError> {
        if self
            .store
            .get_identity(address)?
            .is_some_and(|pinned| pinned != *identity)
        {
            warn!(%address, fingerprint = %identity.fingerprint(), "re-pinning identity key");
        }
        Ok(())
    }
}

fn x25519_public(bytes: &[u8], what: &str) -> Result<X25519Public, CryptoError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{what} must be 32 bytes, got {}", bytes.len())))?;
    Ok(X25519Public::from(raw))
}

fn unknown_key_id(err: CryptoError, what: &str, id: u32) -> CryptoError {
    match err {
        CryptoError::KeyNotFound(_) => CryptoError::InvalidKeyId(format!("{what} {id}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyPair;
    use crate::signal::key_manager::{KeyManager, PreKeyPolicy};
    use crate::signal::memory_stores::MemoryProtocolStore;
    use crate::signal::message::CiphertextMessageType;
    use crate::signal::store::{IdentityKeyStore, PreKeyStore, SessionStore};

    struct Device {
        store: Arc<MemoryProtocolStore>,
        keys: KeyManager,
        cipher: SessionCipher,
    }

    fn device() -> Device {
        device_with_policy(TrustPolicy::TrustOnFirstUse)
    }

    fn device_with_policy(policy: TrustPolicy) -> Device {
        let store = Arc::new(MemoryProtocolStore::new());
        let keys = KeyManager::new(store.clone(), PreKeyPolicy::default());
        keys.ensure_identity_keys().unwrap();
        keys.generate_signed_prekey().unwrap();
        keys.generate_one_time_prekeys(5, None).unwrap();
        let cipher = SessionCipher::new(store.clone(), policy);
        Device {
            store,
            keys,
            cipher,
        }
    }

    fn alice_addr() -> ProtocolAddress {
        ProtocolAddress::new("alice", 1)
    }

    fn bob_addr() -> ProtocolAddress {
        ProtocolAddress::new("bob", 1)
    }

    /// Alice builds from Bob's bundle; returns (alice, bob).
    fn pair() -> (Device, Device) {
        let alice = device();
        let bob = device();
        let bundle = bob.keys.create_device_key_bundle(1).unwrap();
        alice.cipher.process_prekey_bundle(&bob_addr(), &bundle).unwrap();
        (alice, bob)
    }

    #[test]
    fn first_exchange_upgrades_to_whisper() {
        let (alice, bob) = pair();

        let first = alice.cipher.encrypt(&bob_addr(), b"hello").unwrap();
        assert_eq!(first.message_type(), CiphertextMessageType::PreKey);
        assert_eq!(bob.cipher.decrypt(&alice_addr(), &first).unwrap(), b"hello");

        let reply = bob.cipher.encrypt(&alice_addr(), b"hi back").unwrap();
        assert_eq!(reply.message_type(), CiphertextMessageType::Whisper);
        assert_eq!(alice.cipher.decrypt(&bob_addr(), &reply).unwrap(), b"hi back");

        let next = alice.cipher.encrypt(&bob_addr(), b"how are you").unwrap();
        assert_eq!(next.message_type(), CiphertextMessageType::Whisper);
        assert_eq!(bob.cipher.decrypt(&alice_addr(), &next).unwrap(), b"how are you");
    }

    #[test]
    fn handshake_consumes_the_one_time_prekey() {
        let (alice, bob) = pair();
        let before = bob.store.prekey_count().unwrap();

        let first = alice.cipher.encrypt(&bob_addr(), b"x").unwrap();
        let CiphertextMessage::PreKey(ref handshake) = first else {
            panic!("expected handshake message");
        };
        let used = handshake.prekey_id().unwrap();
        bob.cipher.decrypt(&alice_addr(), &first).unwrap();

        assert_eq!(bob.store.prekey_count().unwrap(), before - 1);
        assert!(!bob.store.contains_prekey(used).unwrap());
    }

    #[test]
    fn empty_and_large_plaintexts_roundtrip() {
        let (alice, bob) = pair();
        let large = vec![0xA5u8; 64 * 1024];

        for plaintext in [Vec::new(), b"x".to_vec(), large] {
            let ct = alice.cipher.encrypt(&bob_addr(), &plaintext).unwrap();
            let wire = CiphertextMessage::parse(ct.message_type(), ct.serialize()).unwrap();
            assert_eq!(bob.cipher.decrypt(&alice_addr(), &wire).unwrap(), plaintext);
        }
    }

    #[test]
    fn out_of_order_delivery_within_a_chain() {
        let (alice, bob) = pair();
        let m0 = alice.cipher.encrypt(&bob_addr(), b"zero").unwrap();
        let m1 = alice.cipher.encrypt(&bob_addr(), b"one").unwrap();
        let m2 = alice.cipher.encrypt(&bob_addr(), b"two").unwrap();

        assert_eq!(bob.cipher.decrypt(&alice_addr(), &m2).unwrap(), b"two");
        assert_eq!(bob.cipher.decrypt(&alice_addr(), &m0).unwrap(), b"zero");
        assert_eq!(bob.cipher.decrypt(&alice_addr(), &m1).unwrap(), b"one");
    }

    #[test]
    fn out_of_order_across_ratchet_steps() {
        let (alice, bob) = pair();
        let hello = alice.cipher.encrypt(&bob_addr(), b"hello").unwrap();
        bob.cipher.decrypt(&alice_addr(), &hello).unwrap();

        let late = bob.cipher.encrypt(&alice_addr(), b"late").unwrap();
        let early = bob.cipher.encrypt(&alice_addr(), b"early").unwrap();
        assert_eq!(alice.cipher.decrypt(&bob_addr(), &early).unwrap(), b"early");

        let a2 = alice.cipher.encrypt(&bob_addr(), b"a2").unwrap();
        assert_eq!(bob.cipher.decrypt(&alice_addr(), &a2).unwrap(), b"a2");
        let b3 = bob.cipher.encrypt(&alice_addr(), b"b3").unwrap();
        assert_eq!(alice.cipher.decrypt(&bob_addr(), &b3).unwrap(), b"b3");

        assert_eq!(alice.cipher.decrypt(&bob_addr(), &late).unwrap(), b"late");
    }

    #[test]
    fn replay_is_a_duplicate() {
        let (alice, bob) = pair();
        let first = alice.cipher.encrypt(&bob_addr(), b"once").unwrap();
        bob.cipher.decrypt(&alice_addr(), &first).unwrap();

        let err = bob.cipher.decrypt(&alice_addr(), &first).unwrap_err();
        assert!(err.is_duplicate(), "{err}");

        let reply = bob.cipher.encrypt(&alice_addr(), b"r").unwrap();
        alice.cipher.decrypt(&bob_addr(), &reply).unwrap();
        let err = alice.cipher.decrypt(&bob_addr(), &reply).unwrap_err();
        assert!(matches!(err, CryptoError::DuplicateMessage { counter: 0, .. }));
    }

    #[test]
    fn encrypt_without_session_fails() {
        let alice = device();
        for device_id in [1, 2, 99] {
            let addr = ProtocolAddress::new("nobody", device_id);
            assert!(matches!(
                alice.cipher.encrypt(&addr, b"x"),
                Err(CryptoError::NoSession(_))
            ));
        }
    }

    #[test]
    fn whisper_without_session_fails() {
        let (alice, bob) = pair();
        let first = alice.cipher.encrypt(&bob_addr(), b"hello").unwrap();
        bob.cipher.decrypt(&alice_addr(), &first).unwrap();
        let reply = bob.cipher.encrypt(&alice_addr(), b"r").unwrap();

        let stranger = device();
        assert!(matches!(
            stranger.cipher.decrypt(&bob_addr(), &reply),
            Err(CryptoError::NoSession(_))
        ));
    }

    #[test]
    fn changed_identity_is_rejected_under_tofu() {
        let alice = device();
        let bob = device();
        let impostor = IdentityKeyPair::generate().identity_key();
        alice.store.save_identity(&bob_addr(), &impostor).unwrap();

        let bundle = bob.keys.create_device_key_bundle(1).unwrap();
        assert!(matches!(
            alice.cipher.process_prekey_bundle(&bob_addr(), &bundle),
            Err(CryptoError::UntrustedIdentity(_))
        ));
        assert!(!alice.store.contains_session(&bob_addr()).unwrap());
    }

    #[test]
    fn always_trust_repins_changed_identity() {
        let alice = device_with_policy(TrustPolicy::AlwaysTrust);
        let bob = device();
        let stale = IdentityKeyPair::generate().identity_key();
        alice.store.save_identity(&bob_addr(), &stale).unwrap();

        let bundle = bob.keys.create_device_key_bundle(1).unwrap();
        alice.cipher.process_prekey_bundle(&bob_addr(), &bundle).unwrap();
        assert_eq!(
            alice.store.get_identity(&bob_addr()).unwrap(),
            Some(bob.store.get_identity_key_pair().unwrap().identity_key())
        );
    }

    #[test]
    fn trust_identity_archives_and_allows_rebuild() {
        let (alice, bob) = pair();
        let first = alice.cipher.encrypt(&bob_addr(), b"hello").unwrap();
        bob.cipher.decrypt(&alice_addr(), &first).unwrap();

        // Alice reinstalls: new identity, new bundle.
        let alice2 = device();
        let bundle = alice2.keys.create_device_key_bundle(1).unwrap();
        assert!(matches!(
            bob.cipher.process_prekey_bundle(&alice_addr(), &bundle),
            Err(CryptoError::UntrustedIdentity(_))
        ));

        let new_identity = IdentityKey::from_bytes(&bundle.identity_key).unwrap();
        assert!(bob.cipher.trust_identity(&alice_addr(), &new_identity).unwrap());
        assert!(!bob.store.contains_session(&alice_addr()).unwrap());

        bob.cipher.process_prekey_bundle(&alice_addr(), &bundle).unwrap();
        let msg = bob.cipher.encrypt(&alice_addr(), b"welcome back").unwrap();
        assert_eq!(alice2.cipher.decrypt(&bob_addr(), &msg).unwrap(), b"welcome back");
    }

    #[test]
    fn bad_bundle_signature_is_rejected() {
        let alice = device();
        let bob = device();
        let mut bundle = bob.keys.create_device_key_bundle(1).unwrap();
        bundle.signed_prekey_signature[0] ^= 0xFF;

        assert!(matches!(
            alice.cipher.process_prekey_bundle(&bob_addr(), &bundle),
            Err(CryptoError::InvalidSignature(_))
        ));
    }

    #[test]
    fn malformed_bundle_key_is_rejected() {
        let alice = device();
        let bob = device();
        let mut bundle = bob.keys.create_device_key_bundle(1).unwrap();
        bundle.identity_key.truncate(10);

        assert!(matches!(
            alice.cipher.process_prekey_bundle(&bob_addr(), &bundle),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn reused_one_time_prekey_is_an_unknown_key_id() {
        let alice = device();
        let carol = device();
        let bob = device();
        let bundle = bob.keys.create_device_key_bundle(1).unwrap();

        alice.cipher.process_prekey_bundle(&bob_addr(), &bundle).unwrap();
        carol.cipher.process_prekey_bundle(&bob_addr(), &bundle).unwrap();

        let from_alice = alice.cipher.encrypt(&bob_addr(), b"a").unwrap();
        bob.cipher.decrypt(&alice_addr(), &from_alice).unwrap();

        let carol_addr = ProtocolAddress::new("carol", 1);
        let from_carol = carol.cipher.encrypt(&bob_addr(), b"c").unwrap();
        assert!(matches!(
            bob.cipher.decrypt(&carol_addr, &from_carol),
            Err(CryptoError::InvalidKeyId(_))
        ));
        assert!(!bob.store.contains_session(&carol_addr).unwrap());
    }

    #[test]
    fn failed_handshake_write_keeps_the_prekey() {
        let (alice, bob) = pair();
        let first = alice.cipher.encrypt(&bob_addr(), b"hello").unwrap();
        let CiphertextMessage::PreKey(ref handshake) = first else {
            panic!("expected handshake message");
        };
        let used = handshake.prekey_id().unwrap();

        bob.store.fail_session_writes(true);
        assert!(matches!(
            bob.cipher.decrypt(&alice_addr(), &first),
            Err(CryptoError::StorageError(_))
        ));
        assert!(bob.store.contains_prekey(used).unwrap());
        assert!(!bob.store.contains_session(&alice_addr()).unwrap());
        assert_eq!(bob.store.get_identity(&alice_addr()).unwrap(), None);

        // The sender's retry completes the handshake.
        bob.store.fail_session_writes(false);
        assert_eq!(bob.cipher.decrypt(&alice_addr(), &first).unwrap(), b"hello");
        assert!(!bob.store.contains_prekey(used).unwrap());
    }

    #[test]
    fn failed_bundle_write_pins_nothing() {
        let alice = device();
        let bob = device();
        let bundle = bob.keys.create_device_key_bundle(1).unwrap();

        alice.store.fail_session_writes(true);
        assert!(alice.cipher.process_prekey_bundle(&bob_addr(), &bundle).is_err());
        assert_eq!(alice.store.get_identity(&bob_addr()).unwrap(), None);
        assert!(!alice.store.contains_session(&bob_addr()).unwrap());
    }

    #[test]
    fn tampered_ciphertext_is_invalid() {
        let (alice, bob) = pair();
        let first = alice.cipher.encrypt(&bob_addr(), b"hello").unwrap();
        bob.cipher.decrypt(&alice_addr(), &first).unwrap();

        let reply = bob.cipher.encrypt(&alice_addr(), b"secret").unwrap();
        let mut bytes = reply.serialize().to_vec();
        let inside_body = bytes.len() - 12;
        bytes[inside_body] ^= 0x01;
        let tampered = CiphertextMessage::parse(CiphertextMessageType::Whisper, &bytes).unwrap();

        assert!(matches!(
            alice.cipher.decrypt(&bob_addr(), &tampered),
            Err(CryptoError::InvalidMessage(_))
        ));
        // Failed decrypt leaves the session usable.
        assert_eq!(alice.cipher.decrypt(&bob_addr(), &reply).unwrap(), b"secret");
    }

    #[test]
    fn archived_state_still_decrypts_in_flight_messages() {
        let (alice, bob) = pair();
        let first = alice.cipher.encrypt(&bob_addr(), b"hello").unwrap();
        bob.cipher.decrypt(&alice_addr(), &first).unwrap();
        let in_flight = bob.cipher.encrypt(&alice_addr(), b"in flight").unwrap();

        alice.store.archive_session(&bob_addr()).unwrap();
        assert!(matches!(
            alice.cipher.encrypt(&bob_addr(), b"x"),
            Err(CryptoError::NoSession(_))
        ));

        assert_eq!(alice.cipher.decrypt(&bob_addr(), &in_flight).unwrap(), b"in flight");
        // The retired state stays retired for sends.
        assert!(!alice.store.contains_session(&bob_addr()).unwrap());
        assert!(matches!(
            alice.cipher.encrypt(&bob_addr(), b"y"),
            Err(CryptoError::NoSession(_))
        ));
        let err = alice.cipher.decrypt(&bob_addr(), &in_flight).unwrap_err();
        assert!(err.is_duplicate(), "{err}");
    }

    #[test]
    fn rebuilding_archives_previous_state() {
        let (alice, bob) = pair();
        let bundle = bob.keys.create_device_key_bundle(1).unwrap();
        alice.cipher.process_prekey_bundle(&bob_addr(), &bundle).unwrap();

        let record = alice.store.load_session(&bob_addr()).unwrap();
        assert_eq!(record.archived_state_count(), 1);
        assert!(record.has_unacknowledged_prekey());
    }

    #[test]
    fn session_survives_serialization() {
        let (alice, bob) = pair();
        let first = alice.cipher.encrypt(&bob_addr(), b"hello").unwrap();
        bob.cipher.decrypt(&alice_addr(), &first).unwrap();

        let bytes = alice.store.load_session(&bob_addr()).unwrap().serialize().unwrap();
        let restored_store = Arc::new(MemoryProtocolStore::with_identity(
            &alice.store.get_identity_key_pair().unwrap(),
            alice.store.get_local_registration_id().unwrap(),
        ));
        restored_store
            .store_session(
                &bob_addr(),
                &crate::signal::ratchet::SessionRecord::deserialize(&bytes).unwrap(),
            )
            .unwrap();
        let restored = SessionCipher::new(restored_store, TrustPolicy::default());

        let next = restored.encrypt(&bob_addr(), b"after restart").unwrap();
        assert_eq!(bob.cipher.decrypt(&alice_addr(), &next).unwrap(), b"after restart");
    }
}
