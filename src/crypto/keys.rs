//! Post-quantum signing over a small registry of named schemes.
//!
//! Falcon (NIST round-3 lattice signatures, compact) and CRYSTALS-Dilithium
//! are offered at several security levels. Which two schemes are live at any
//! height is decided by the rotation protocol, see [`crate::crypto::scheme`].

use pqcrypto_dilithium::{dilithium2, dilithium3, dilithium5};
use pqcrypto_falcon::{falcon1024, falcon512};
use pqcrypto_traits::sign::{
    DetachedSignature as SigTrait, PublicKey as SignPkTrait, SecretKey as SignSkTrait,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors from key handling.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unknown signature scheme {0:?}")]
    UnknownScheme(String),
    #[error("malformed {0} key")]
    MalformedKey(&'static str),
}

/// A signature scheme known to this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemeKind {
    Falcon512,
    Falcon1024,
    Dilithium2,
    Dilithium3,
    Dilithium5,
}

macro_rules! dispatch {
    ($kind:expr, $m:ident => $body:expr) => {
        match $kind {
            SchemeKind::Falcon512 => {
                use falcon512 as $m;
                $body
            }
            SchemeKind::Falcon1024 => {
                use falcon1024 as $m;
                $body
            }
            SchemeKind::Dilithium2 => {
                use dilithium2 as $m;
                $body
            }
            SchemeKind::Dilithium3 => {
                use dilithium3 as $m;
                $body
            }
            SchemeKind::Dilithium5 => {
                use dilithium5 as $m;
                $body
            }
        }
    };
}

impl SchemeKind {
    pub const ALL: [SchemeKind; 5] = [
        SchemeKind::Falcon512,
        SchemeKind::Falcon1024,
        SchemeKind::Dilithium2,
        SchemeKind::Dilithium3,
        SchemeKind::Dilithium5,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SchemeKind::Falcon512 => "Falcon-512",
            SchemeKind::Falcon1024 => "Falcon-1024",
            SchemeKind::Dilithium2 => "Dilithium2",
            SchemeKind::Dilithium3 => "Dilithium3",
            SchemeKind::Dilithium5 => "Dilithium5",
        }
    }

    pub fn from_name(name: &str) -> Result<SchemeKind, KeyError> {
        SchemeKind::ALL
            .into_iter()
            .find(|k| k.name() == name)
            .ok_or_else(|| KeyError::UnknownScheme(name.to_string()))
    }

    pub fn public_key_len(self) -> usize {
        dispatch!(self, m => m::public_key_bytes())
    }

    pub fn secret_key_len(self) -> usize {
        dispatch!(self, m => m::secret_key_bytes())
    }

    /// Upper bound on signature length (Falcon signatures are variable).
    pub fn signature_len(self) -> usize {
        dispatch!(self, m => m::signature_bytes())
    }

    /// Verify a detached signature. Malformed keys or signatures fail.
    pub fn verify(self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        if signature.is_empty() || signature.len() > self.signature_len() {
            return false;
        }
        dispatch!(self, m => {
            let Ok(pk) = m::PublicKey::from_bytes(public_key) else {
                return false;
            };
            let Ok(sig) = m::DetachedSignature::from_bytes(signature) else {
                return false;
            };
            m::verify_detached_signature(&sig, message, &pk).is_ok()
        })
    }
}

impl std::fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Secret key bytes, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecretKey(pub(crate) Vec<u8>);

impl std::fmt::Debug for SigningSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningSecretKey(REDACTED)")
    }
}

/// A keypair for one scheme.
#[derive(Clone, Debug)]
pub struct SigningKeypair {
    pub scheme: SchemeKind,
    pub public: Vec<u8>,
    pub secret: SigningSecretKey,
}

impl SigningKeypair {
    pub fn generate(scheme: SchemeKind) -> Self {
        let (public, secret) = dispatch!(scheme, m => {
            let (pk, sk) = m::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        });
        SigningKeypair {
            scheme,
            public,
            secret: SigningSecretKey(secret),
        }
    }

    /// Rebuild a keypair from stored bytes, validating both halves.
    pub fn from_bytes(scheme: SchemeKind, public: Vec<u8>, secret: Vec<u8>) -> Result<Self, KeyError> {
        dispatch!(scheme, m => {
            m::PublicKey::from_bytes(&public).map_err(|_| KeyError::MalformedKey("public"))?;
            m::SecretKey::from_bytes(&secret).map_err(|_| KeyError::MalformedKey("secret"))?;
        });
        Ok(SigningKeypair {
            scheme,
            public,
            secret: SigningSecretKey(secret),
        })
    }

    /// Detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        dispatch!(self.scheme, m => {
            let sk = m::SecretKey::from_bytes(&self.secret.0)
                .map_err(|_| KeyError::MalformedKey("secret"))?;
            Ok(m::detached_sign(message, &sk).as_bytes().to_vec())
        })
    }
}
