//! X3DH key agreement for both sides of a session handshake.
//!
//! Initiator (has the peer's bundle):
//!   DH1 = DH(IK_a, SPK_b), DH2 = DH(EK_a, IK_b), DH3 = DH(EK_a, SPK_b),
//!   DH4 = DH(EK_a, OPK_b) when a one-time prekey was bundled.
//! The responder mirrors each term with its own private halves.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::identity::{IdentityKey, IdentityKeyPair};

const X3DH_INFO: &[u8] = b"ParleyX3DH";

/// Prepended to the DH concatenation so the KDF input never starts with a
/// value an attacker could make collide with a valid curve point.
const DISCONTINUITY: [u8; 32] = [0xFF; 32];

/// Root and initial chain key shared by both parties after X3DH.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct AgreementSecrets {
    pub root_key: [u8; 32],
    pub chain_key: [u8; 32],
}

/// Initiator side: we fetched the peer's bundle and generated `base_key`.
pub(crate) fn initiator_agreement(
    our_identity: &IdentityKeyPair,
    our_base_key: &StaticSecret,
    their_identity: &IdentityKey,
    their_signed_prekey: &X25519Public,
    their_one_time_prekey: Option<&X25519Public>,
) -> Result<AgreementSecrets, CryptoError> {
    let their_identity_x25519 = their_identity.to_x25519()?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
    ikm.extend_from_slice(&DISCONTINUITY);
    ikm.extend_from_slice(
        our_identity
            .to_x25519_secret()
            .diffie_hellman(their_signed_prekey)
            .as_bytes(),
    );
    ikm.extend_from_slice(our_base_key.diffie_hellman(&their_identity_x25519).as_bytes());
    ikm.extend_from_slice(our_base_key.diffie_hellman(their_signed_prekey).as_bytes());
    if let Some(otpk) = their_one_time_prekey {
        ikm.extend_from_slice(our_base_key.diffie_hellman(otpk).as_bytes());
    }

    derive_secrets(&ikm)
}

/// Responder side: a handshake message arrived carrying the initiator's
/// identity and base key.
pub(crate) fn responder_agreement(
    our_identity: &IdentityKeyPair,
    our_signed_prekey: &StaticSecret,
    our_one_time_prekey: Option<&StaticSecret>,
    their_identity: &IdentityKey,
    their_base_key: &X25519Public,
) -> Result<AgreementSecrets, CryptoError> {
    let their_identity_x25519 = their_identity.to_x25519()?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
    ikm.extend_from_slice(&DISCONTINUITY);
    ikm.extend_from_slice(our_signed_prekey.diffie_hellman(&their_identity_x25519).as_bytes());
    ikm.extend_from_slice(
        our_identity
            .to_x25519_secret()
            .diffie_hellman(their_base_key)
            .as_bytes(),
    );
    ikm.extend_from_slice(our_signed_prekey.diffie_hellman(their_base_key).as_bytes());
    if let Some(otpk) = our_one_time_prekey {
        ikm.extend_from_slice(otpk.diffie_hellman(their_base_key).as_bytes());
    }

    derive_secrets(&ikm)
}

fn derive_secrets(ikm: &[u8]) -> Result<AgreementSecrets, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(X3DH_INFO, &mut okm[..])
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expand failed: {e}")))?;

    let mut secrets = AgreementSecrets {
        root_key: [0u8; 32],
        chain_key: [0u8; 32],
    };
    secrets.root_key.copy_from_slice(&okm[..32]);
    secrets.chain_key.copy_from_slice(&okm[32..]);
    Ok(secrets)
}
