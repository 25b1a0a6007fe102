//! Ciphertext framing for regular and handshake-embedding messages.
//!
//! Every message starts with a version byte `(message_version << 4) | 3`.
//!
//! Regular (`Whisper`, type 2):
//!   version(1) || ratchet_key(32) || counter(4 BE) || previous_counter(4 BE)
//!   || aead_ciphertext(..) || mac(8)
//!
//! Handshake (`PreKey`, type 3):
//!   version(1) || registration_id(4 BE) || has_prekey(1) || [prekey_id(4 BE)]
//!   || signed_prekey_id(4 BE) || base_key(32) || identity_key(32)
//!   || whisper_message(..)

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;
use crate::identity::{IdentityKey, IDENTITY_KEY_LEN};

type HmacSha256 = Hmac<Sha256>;

pub const CURRENT_VERSION: u8 = 3;
pub const MAC_LEN: usize = 8;

const KEY_LEN: usize = 32;
const WHISPER_HEADER_LEN: usize = 1 + KEY_LEN + 4 + 4;

/// Wire discriminator carried next to the ciphertext bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CiphertextMessageType {
    Whisper = 2,
    PreKey = 3,
}

impl TryFrom<u8> for CiphertextMessageType {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Whisper),
            3 => Ok(Self::PreKey),
            other => Err(CryptoError::InvalidMessage(format!(
                "unknown ciphertext type {other}"
            ))),
        }
    }
}

/// An encrypted message, either a regular ratchet message or one that also
/// carries the handshake the receiver needs to build its session.
#[derive(Debug, Clone)]
pub enum CiphertextMessage {
    Whisper(SignalMessage),
    PreKey(PreKeySignalMessage),
}

impl CiphertextMessage {
    pub fn message_type(&self) -> CiphertextMessageType {
        match self {
            Self::Whisper(_) => CiphertextMessageType::Whisper,
            Self::PreKey(_) => CiphertextMessageType::PreKey,
        }
    }

    pub fn serialize(&self) -> &[u8] {
        match self {
            Self::Whisper(m) => m.serialized(),
            Self::PreKey(m) => m.serialized(),
        }
    }

    /// Parse wire bytes according to their discriminator.
    pub fn parse(message_type: CiphertextMessageType, bytes: &[u8]) -> Result<Self, CryptoError> {
        match message_type {
            CiphertextMessageType::Whisper => SignalMessage::try_from(bytes).map(Self::Whisper),
            CiphertextMessageType::PreKey => PreKeySignalMessage::try_from(bytes).map(Self::PreKey),
        }
    }
}

fn check_version(byte: u8) -> Result<u8, CryptoError> {
    let version = byte >> 4;
    if version < CURRENT_VERSION {
        return Err(CryptoError::LegacyMessage(version));
    }
    if version > CURRENT_VERSION {
        return Err(CryptoError::InvalidMessage(format!(
            "unrecognized message version {version}"
        )));
    }
    Ok(version)
}

fn version_byte(version: u8) -> u8 {
    (version << 4) | CURRENT_VERSION
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32, CryptoError> {
    let raw: [u8; 4] = data
        .get(pos..pos + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| CryptoError::InvalidMessage("message truncated".into()))?;
    Ok(u32::from_be_bytes(raw))
}

fn read_key(data: &[u8], pos: usize) -> Result<[u8; KEY_LEN], CryptoError> {
    data.get(pos..pos + KEY_LEN)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| CryptoError::InvalidMessage("message truncated".into()))
}

/// A regular double-ratchet message.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    message_version: u8,
    sender_ratchet_key: [u8; KEY_LEN],
    counter: u32,
    previous_counter: u32,
    ciphertext: Vec<u8>,
    serialized: Vec<u8>,
}

impl SignalMessage {
    pub(crate) fn new(
        mac_key: &[u8; 32],
        sender_ratchet_key: [u8; KEY_LEN],
        counter: u32,
        previous_counter: u32,
        ciphertext: Vec<u8>,
        sender_identity: &IdentityKey,
        receiver_identity: &IdentityKey,
    ) -> Result<Self, CryptoError> {
        let mut serialized =
            Vec::with_capacity(WHISPER_HEADER_LEN + ciphertext.len() + MAC_LEN);
        serialized.push(version_byte(CURRENT_VERSION));
        serialized.extend_from_slice(&sender_ratchet_key);
        serialized.extend_from_slice(&counter.to_be_bytes());
        serialized.extend_from_slice(&previous_counter.to_be_bytes());
        serialized.extend_from_slice(&ciphertext);

        let mac = keyed_mac(mac_key, sender_identity, receiver_identity, &serialized)?
            .finalize()
            .into_bytes();
        serialized.extend_from_slice(&mac[..MAC_LEN]);

        Ok(Self {
            message_version: CURRENT_VERSION,
            sender_ratchet_key,
            counter,
            previous_counter,
            ciphertext,
            serialized,
        })
    }

    pub fn message_version(&self) -> u8 {
        self.message_version
    }

    pub fn sender_ratchet_key(&self) -> &[u8; KEY_LEN] {
        &self.sender_ratchet_key
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    pub(crate) fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    /// Constant-time check of the truncated MAC.
    pub(crate) fn verify_mac(
        &self,
        mac_key: &[u8; 32],
        sender_identity: &IdentityKey,
        receiver_identity: &IdentityKey,
    ) -> Result<bool, CryptoError> {
        let (body, their_mac) = self.serialized.split_at(self.serialized.len() - MAC_LEN);
        let mac = keyed_mac(mac_key, sender_identity, receiver_identity, body)?;
        Ok(mac.verify_truncated_left(their_mac).is_ok())
    }
}

impl TryFrom<&[u8]> for SignalMessage {
    type Error = CryptoError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let first = *data
            .first()
            .ok_or_else(|| CryptoError::InvalidMessage("empty message".into()))?;
        let message_version = check_version(first)?;

        if data.len() < WHISPER_HEADER_LEN + MAC_LEN {
            return Err(CryptoError::InvalidMessage(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }

        let sender_ratchet_key = read_key(data, 1)?;
        let counter = read_u32(data, 1 + KEY_LEN)?;
        let previous_counter = read_u32(data, 1 + KEY_LEN + 4)?;
        let ciphertext = data[WHISPER_HEADER_LEN..data.len() - MAC_LEN].to_vec();

        Ok(Self {
            message_version,
            sender_ratchet_key,
            counter,
            previous_counter,
            ciphertext,
            serialized: data.to_vec(),
        })
    }
}

fn keyed_mac(
    mac_key: &[u8; 32],
    sender_identity: &IdentityKey,
    receiver_identity: &IdentityKey,
    body: &[u8],
) -> Result<HmacSha256, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| CryptoError::InvalidKey(format!("mac key: {e}")))?;
    mac.update(sender_identity.as_bytes());
    mac.update(receiver_identity.as_bytes());
    mac.update(body);
    Ok(mac)
}

/// A first message: the handshake parameters plus the embedded ciphertext.
#[derive(Debug, Clone)]
pub struct PreKeySignalMessage {
    message_version: u8,
    registration_id: u32,
    prekey_id: Option<u32>,
    signed_prekey_id: u32,
    base_key: [u8; KEY_LEN],
    identity_key: IdentityKey,
    message: SignalMessage,
    serialized: Vec<u8>,
}

impl PreKeySignalMessage {
    pub(crate) fn new(
        registration_id: u32,
        prekey_id: Option<u32>,
        signed_prekey_id: u32,
        base_key: [u8; KEY_LEN],
        identity_key: IdentityKey,
        message: SignalMessage,
    ) -> Self {
        let mut serialized = Vec::with_capacity(1 + 4 + 5 + 4 + 2 * KEY_LEN + message.serialized().len());
        serialized.push(version_byte(CURRENT_VERSION));
        serialized.extend_from_slice(&registration_id.to_be_bytes());
        match prekey_id {
            Some(id) => {
                serialized.push(1);
                serialized.extend_from_slice(&id.to_be_bytes());
            }
            None => serialized.push(0),
        }
        serialized.extend_from_slice(&signed_prekey_id.to_be_bytes());
        serialized.extend_from_slice(&base_key);
        serialized.extend_from_slice(identity_key.as_bytes());
        serialized.extend_from_slice(message.serialized());

        Self {
            message_version: CURRENT_VERSION,
            registration_id,
            prekey_id,
            signed_prekey_id,
            base_key,
            identity_key,
            message,
            serialized,
        }
    }

    pub fn message_version(&self) -> u8 {
        self.message_version
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn prekey_id(&self) -> Option<u32> {
        self.prekey_id
    }

    pub fn signed_prekey_id(&self) -> u32 {
        self.signed_prekey_id
    }

    pub fn base_key(&self) -> &[u8; KEY_LEN] {
        &self.base_key
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    pub fn message(&self) -> &SignalMessage {
        &self.message
    }

    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }
}

impl TryFrom<&[u8]> for PreKeySignalMessage {
    type Error = CryptoError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let first = *data
            .first()
            .ok_or_else(|| CryptoError::InvalidMessage("empty message".into()))?;
        let message_version = check_version(first)?;

        let registration_id = read_u32(data, 1)?;
        let mut pos = 5;
        let prekey_id = match data.get(pos) {
            Some(0) => {
                pos += 1;
                None
            }
            Some(1) => {
                let id = read_u32(data, pos + 1)?;
                pos += 5;
                Some(id)
            }
            Some(flag) => {
                return Err(CryptoError::InvalidMessage(format!(
                    "invalid prekey flag {flag}"
                )))
            }
            None => return Err(CryptoError::InvalidMessage("message truncated".into())),
        };
        let signed_prekey_id = read_u32(data, pos)?;
        pos += 4;
        let base_key = read_key(data, pos)?;
        pos += KEY_LEN;
        let identity_raw = data
            .get(pos..pos + IDENTITY_KEY_LEN)
            .ok_or_else(|| CryptoError::InvalidMessage("message truncated".into()))?;
        let identity_key = IdentityKey::from_bytes(identity_raw)
            .map_err(|e| CryptoError::InvalidMessage(format!("sender identity: {e}")))?;
        pos += IDENTITY_KEY_LEN;

        let message = SignalMessage::try_from(&data[pos..])?;

        Ok(Self {
            message_version,
            registration_id,
            prekey_id,
            signed_prekey_id,
            base_key,
            identity_key,
            message,
            serialized: data.to_vec(),
        })
    }
}
