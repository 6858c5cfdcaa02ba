//! The two live signature-scheme slots and their wire descriptor.
//!
//! Every block header carries a 33-byte [`EncryptionConfig`] for each slot:
//! the scheme name NUL-padded to 20 bytes, public/secret/signature lengths
//! as little-endian `i32`, and a paused flag. A paused slot accepts no new
//! signatures; a replaced slot swaps in a different scheme.

use std::sync::RwLock;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SignKeyChoice;
use crate::crypto::keys::{KeyError, SchemeKind};

const NAME_LEN: usize = 20;

/// Encoded size of an [`EncryptionConfig`].
pub const ENCRYPTION_CONFIG_LEN: usize = NAME_LEN + 4 + 4 + 4 + 1;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchemeError {
    #[error("encryption config too short: {0} bytes")]
    TooShort(usize),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("declared lengths do not match {0}")]
    LengthMismatch(SchemeKind),
    #[error("{0} slot is paused")]
    Paused(Slot),
    #[error("signature rejected by {0}")]
    BadSignature(SchemeKind),
}

/// Which of the two live slots a key or signature belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    Primary,
    Secondary,
}

impl Slot {
    pub const BOTH: [Slot; 2] = [Slot::Primary, Slot::Secondary];

    pub fn index(self) -> usize {
        match self {
            Slot::Primary => 0,
            Slot::Secondary => 1,
        }
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::Primary => Slot::Secondary,
            Slot::Secondary => Slot::Primary,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Primary => f.write_str("primary"),
            Slot::Secondary => f.write_str("secondary"),
        }
    }
}

/// Descriptor of a scheme as carried in block headers and votes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub name: String,
    pub public_key_len: i32,
    pub secret_key_len: i32,
    pub signature_len: i32,
    pub paused: bool,
}

impl EncryptionConfig {
    pub fn for_scheme(kind: SchemeKind, paused: bool) -> Self {
        EncryptionConfig {
            name: kind.name().to_string(),
            public_key_len: kind.public_key_len() as i32,
            secret_key_len: kind.secret_key_len() as i32,
            signature_len: kind.signature_len() as i32,
            paused,
        }
    }

    pub fn kind(&self) -> Result<SchemeKind, KeyError> {
        SchemeKind::from_name(&self.name)
    }

    /// Check the name is known and the declared lengths match it.
    pub fn validate(&self) -> Result<SchemeKind, SchemeError> {
        let kind = self.kind()?;
        let expected = EncryptionConfig::for_scheme(kind, self.paused);
        if expected.public_key_len != self.public_key_len
            || expected.secret_key_len != self.secret_key_len
            || expected.signature_len != self.signature_len
        {
            return Err(SchemeError::LengthMismatch(kind));
        }
        Ok(kind)
    }

    /// Same scheme, ignoring the paused flag.
    pub fn same_scheme(&self, other: &EncryptionConfig) -> bool {
        self.name == other.name
            && self.public_key_len == other.public_key_len
            && self.secret_key_len == other.secret_key_len
            && self.signature_len == other.signature_len
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCRYPTION_CONFIG_LEN);
        let mut name = [0u8; NAME_LEN];
        let n = self.name.len().min(NAME_LEN);
        name[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        out.extend_from_slice(&name);
        out.extend_from_slice(&self.public_key_len.to_le_bytes());
        out.extend_from_slice(&self.secret_key_len.to_le_bytes());
        out.extend_from_slice(&self.signature_len.to_le_bytes());
        out.push(self.paused as u8);
        out
    }

    /// Decode and validate. Trailing bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SchemeError> {
        if bytes.len() < ENCRYPTION_CONFIG_LEN {
            return Err(SchemeError::TooShort(bytes.len()));
        }
        let name_end = bytes[..NAME_LEN]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&bytes[..name_end]).into_owned();
        let int_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            i32::from_le_bytes(buf)
        };
        let config = EncryptionConfig {
            name,
            public_key_len: int_at(NAME_LEN),
            secret_key_len: int_at(NAME_LEN + 4),
            signature_len: int_at(NAME_LEN + 8),
            paused: bytes[NAME_LEN + 12] != 0,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig::for_scheme(SchemeKind::Falcon512, false)
    }
}

/// The schemes currently accepted by this node, shared across tasks.
#[derive(Debug)]
pub struct LiveSchemes {
    slots: RwLock<[EncryptionConfig; 2]>,
}

impl Default for LiveSchemes {
    fn default() -> Self {
        LiveSchemes::new(
            EncryptionConfig::for_scheme(SchemeKind::Falcon512, false),
            EncryptionConfig::for_scheme(SchemeKind::Dilithium5, false),
        )
    }
}

impl LiveSchemes {
    pub fn new(primary: EncryptionConfig, secondary: EncryptionConfig) -> Self {
        LiveSchemes {
            slots: RwLock::new([primary, secondary]),
        }
    }

    pub fn get(&self, slot: Slot) -> EncryptionConfig {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots[slot.index()].clone()
    }

    pub fn both(&self) -> [EncryptionConfig; 2] {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, slot: Slot, config: EncryptionConfig) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        tracing::info!(slot = %slot, scheme = %config.name, paused = config.paused, "Encryption slot updated");
        slots[slot.index()] = config;
    }

    pub fn is_paused(&self, slot: Slot) -> bool {
        self.get(slot).paused
    }

    pub fn kind(&self, slot: Slot) -> Result<SchemeKind, KeyError> {
        self.get(slot).kind()
    }

    /// Verify a signature made with the key of `slot`. Paused slots reject.
    pub fn verify(
        &self,
        slot: Slot,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), SchemeError> {
        let config = self.get(slot);
        if config.paused {
            return Err(SchemeError::Paused(slot));
        }
        let kind = config.kind()?;
        if public_key.len() != kind.public_key_len() {
            return Err(SchemeError::BadSignature(kind));
        }
        if !kind.verify(public_key, message, signature) {
            return Err(SchemeError::BadSignature(kind));
        }
        Ok(())
    }

    /// Pick the slot to sign with at `height`.
    ///
    /// Genesis is always primary. With both slots active the configured
    /// choice decides; otherwise the active slot signs. With both paused the
    /// primary is returned and its signatures will be rejected.
    pub fn choose_signing_slot(&self, height: u64, choice: SignKeyChoice) -> Slot {
        if height == 0 {
            return Slot::Primary;
        }
        let [primary, secondary] = self.both();
        match (primary.paused, secondary.paused) {
            (false, false) => match choice {
                SignKeyChoice::Random => {
                    if rand::rng().random_bool(0.5) {
                        Slot::Primary
                    } else {
                        Slot::Secondary
                    }
                }
                SignKeyChoice::PreferPrimary => Slot::Primary,
                SignKeyChoice::PreferSecondary => Slot::Secondary,
            },
            (true, false) => Slot::Secondary,
            _ => Slot::Primary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SigningKeypair;

    #[test]
    fn descriptor_is_33_bytes() {
        let config = EncryptionConfig::for_scheme(SchemeKind::Falcon512, true);
        let bytes = config.to_bytes();
        assert_eq!(bytes.len(), ENCRYPTION_CONFIG_LEN);
        assert_eq!(ENCRYPTION_CONFIG_LEN, 33);
        assert_eq!(&bytes[..10], b"Falcon-512");
        assert!(bytes[10..20].iter().all(|b| *b == 0));
        assert_eq!(bytes[32], 1);
        assert_eq!(EncryptionConfig::from_bytes(&bytes).unwrap(), config);
    }

    #[test]
    fn descriptor_rejects_bad_lengths_and_names() {
        let mut config = EncryptionConfig::for_scheme(SchemeKind::Dilithium2, false);
        config.signature_len += 1;
        assert!(matches!(
            EncryptionConfig::from_bytes(&config.to_bytes()),
            Err(SchemeError::LengthMismatch(SchemeKind::Dilithium2))
        ));

        let mut unknown = EncryptionConfig::default();
        unknown.name = "MAYO-5".into();
        assert!(matches!(
            EncryptionConfig::from_bytes(&unknown.to_bytes()),
            Err(SchemeError::Key(KeyError::UnknownScheme(_)))
        ));
        assert_eq!(
            EncryptionConfig::from_bytes(&[0u8; 12]).unwrap_err(),
            SchemeError::TooShort(12)
        );
    }

    #[test]
    fn paused_slot_rejects_signatures() {
        let schemes = LiveSchemes::default();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let sig = kp.sign(b"hello").unwrap();
        assert!(schemes.verify(Slot::Primary, &kp.public, b"hello", &sig).is_ok());

        schemes.set(Slot::Primary, EncryptionConfig::for_scheme(SchemeKind::Falcon512, true));
        assert_eq!(
            schemes.verify(Slot::Primary, &kp.public, b"hello", &sig),
            Err(SchemeError::Paused(Slot::Primary))
        );
    }

    #[test]
    fn wrong_slot_key_fails() {
        let schemes = LiveSchemes::default();
        let kp = SigningKeypair::generate(SchemeKind::Falcon512);
        let sig = kp.sign(b"hello").unwrap();
        assert!(schemes.verify(Slot::Secondary, &kp.public, b"hello", &sig).is_err());
    }

    #[test]
    fn signing_slot_selection() {
        let schemes = LiveSchemes::default();
        assert_eq!(schemes.choose_signing_slot(0, SignKeyChoice::PreferSecondary), Slot::Primary);
        assert_eq!(schemes.choose_signing_slot(5, SignKeyChoice::PreferSecondary), Slot::Secondary);
        assert_eq!(schemes.choose_signing_slot(5, SignKeyChoice::PreferPrimary), Slot::Primary);

        schemes.set(Slot::Primary, EncryptionConfig::for_scheme(SchemeKind::Falcon512, true));
        assert_eq!(schemes.choose_signing_slot(5, SignKeyChoice::PreferPrimary), Slot::Secondary);
        assert_eq!(schemes.choose_signing_slot(5, SignKeyChoice::Random), Slot::Secondary);

        schemes.set(Slot::Secondary, EncryptionConfig::for_scheme(SchemeKind::Dilithium5, true));
        assert_eq!(schemes.choose_signing_slot(5, SignKeyChoice::Random), Slot::Primary);
    }
}
