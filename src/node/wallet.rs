//! The node wallet: one signing key per encryption slot.
//!
//! Keys live in `wallet_primary.key` and `wallet_secondary.key` inside the
//! data directory. Format: `[name_len: u8][scheme name][pk_len: u32 LE][pk][sk]`.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::chain::transaction::Address;
use crate::crypto::keys::{KeyError, SchemeKind, SigningKeypair};
use crate::crypto::scheme::{LiveSchemes, Slot};

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid key file {path}: {reason}")]
    InvalidKeyFile { path: PathBuf, reason: &'static str },
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Per-slot signing keys of this node.
pub struct NodeWallet {
    dir: Option<PathBuf>,
    keys: RwLock<[SigningKeypair; 2]>,
}

fn key_file(dir: &Path, slot: Slot) -> PathBuf {
    match slot {
        Slot::Primary => dir.join("wallet_primary.key"),
        Slot::Secondary => dir.join("wallet_secondary.key"),
    }
}

fn encode_key(keypair: &SigningKeypair) -> Vec<u8> {
    let name = keypair.scheme.name().as_bytes();
    let mut bytes = Vec::with_capacity(1 + name.len() + 4 + keypair.public.len() + keypair.secret.0.len());
    bytes.push(name.len() as u8);
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(&(keypair.public.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&keypair.public);
    bytes.extend_from_slice(&keypair.secret.0);
    bytes
}

fn decode_key(path: &Path, bytes: &[u8]) -> Result<SigningKeypair, WalletError> {
    let invalid = |reason| WalletError::InvalidKeyFile {
        path: path.to_path_buf(),
        reason,
    };
    let (&name_len, rest) = bytes.split_first().ok_or_else(|| invalid("empty"))?;
    let name_len = name_len as usize;
    if rest.len() < name_len + 4 {
        return Err(invalid("truncated header"));
    }
    let name = std::str::from_utf8(&rest[..name_len]).map_err(|_| invalid("scheme name"))?;
    let kind = SchemeKind::from_name(name)?;
    let rest = &rest[name_len..];
    let mut len = [0u8; 4];
    len.copy_from_slice(&rest[..4]);
    let pk_len = u32::from_le_bytes(len) as usize;
    let rest = &rest[4..];
    if rest.len() < pk_len {
        return Err(invalid("truncated public key"));
    }
    let keypair = SigningKeypair::from_bytes(kind, rest[..pk_len].to_vec(), rest[pk_len..].to_vec())?;
    Ok(keypair)
}

fn write_key(path: &Path, keypair: &SigningKeypair) -> Result<(), WalletError> {
    std::fs::write(path, encode_key(keypair))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

impl NodeWallet {
    /// Load both slot keys from `dir`, generating any that are missing or
    /// whose scheme no longer matches the live config.
    pub fn load_or_generate(dir: &Path, schemes: &LiveSchemes) -> Result<Self, WalletError> {
        std::fs::create_dir_all(dir)?;
        let mut loaded = Vec::with_capacity(2);
        for slot in Slot::BOTH {
            let want = schemes.kind(slot)?;
            let path = key_file(dir, slot);
            let existing = if path.exists() {
                Some(decode_key(&path, &std::fs::read(&path)?)?)
            } else {
                None
            };
            let keypair = match existing {
                Some(kp) if kp.scheme == want => {
                    tracing::info!(slot = %slot, scheme = %want, address = %Address::from_public_key(&kp.public), "Loaded wallet key");
                    kp
                }
                _ => {
                    let kp = SigningKeypair::generate(want);
                    write_key(&path, &kp)?;
                    tracing::info!(slot = %slot, scheme = %want, address = %Address::from_public_key(&kp.public), "Generated wallet key");
                    kp
                }
            };
            loaded.push(keypair);
        }
        let secondary = loaded.pop().ok_or(KeyError::MalformedKey("wallet"))?;
        let primary = loaded.pop().ok_or(KeyError::MalformedKey("wallet"))?;
        Ok(NodeWallet {
            dir: Some(dir.to_path_buf()),
            keys: RwLock::new([primary, secondary]),
        })
    }

    /// A wallet that is never written to disk.
    pub fn ephemeral(schemes: &LiveSchemes) -> Result<Self, WalletError> {
        Ok(NodeWallet {
            dir: None,
            keys: RwLock::new([
                SigningKeypair::generate(schemes.kind(Slot::Primary)?),
                SigningKeypair::generate(schemes.kind(Slot::Secondary)?),
            ]),
        })
    }

    pub fn keypair(&self, slot: Slot) -> SigningKeypair {
        self.keys.read().unwrap_or_else(|e| e.into_inner())[slot.index()].clone()
    }

    pub fn address(&self, slot: Slot) -> Address {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        Address::from_public_key(&keys[slot.index()].public)
    }

    /// Replace the key of `slot` with a fresh one for `kind`. A no-op when
    /// the slot already holds a key of that scheme.
    pub fn rotate(&self, slot: Slot, kind: SchemeKind) -> Result<bool, WalletError> {
        if self.keypair(slot).scheme == kind {
            return Ok(false);
        }
        let keypair = SigningKeypair::generate(kind);
        if let Some(dir) = &self.dir {
            write_key(&key_file(dir, slot), &keypair)?;
        }
        tracing::warn!(slot = %slot, scheme = %kind, address = %Address::from_public_key(&keypair.public), "Rotated wallet key");
        self.keys.write().unwrap_or_else(|e| e.into_inner())[slot.index()] = keypair;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::scheme::EncryptionConfig;

    #[test]
    fn keys_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let schemes = LiveSchemes::default();
        let first = NodeWallet::load_or_generate(dir.path(), &schemes).unwrap();
        let second = NodeWallet::load_or_generate(dir.path(), &schemes).unwrap();
        for slot in Slot::BOTH {
            assert_eq!(first.keypair(slot).public, second.keypair(slot).public);
            assert_eq!(first.keypair(slot).scheme, schemes.kind(slot).unwrap());
        }
        assert_ne!(first.address(Slot::Primary), first.address(Slot::Secondary));
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        NodeWallet::load_or_generate(dir.path(), &LiveSchemes::default()).unwrap();
        let mode = std::fs::metadata(key_file(dir.path(), Slot::Primary))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn scheme_change_regenerates_key() {
        let dir = tempfile::tempdir().unwrap();
        let schemes = LiveSchemes::default();
        let before = NodeWallet::load_or_generate(dir.path(), &schemes).unwrap();
        schemes.set(Slot::Primary, EncryptionConfig::for_scheme(SchemeKind::Dilithium2, false));
        let after = NodeWallet::load_or_generate(dir.path(), &schemes).unwrap();
        assert_eq!(after.keypair(Slot::Primary).scheme, SchemeKind::Dilithium2);
        assert_eq!(
            after.keypair(Slot::Secondary).public,
            before.keypair(Slot::Secondary).public
        );
    }

    #[test]
    fn rotate_replaces_only_on_scheme_change() {
        let wallet = NodeWallet::ephemeral(&LiveSchemes::default()).unwrap();
        let old = wallet.address(Slot::Secondary);
        assert!(!wallet.rotate(Slot::Secondary, SchemeKind::Dilithium5).unwrap());
        assert!(wallet.rotate(Slot::Secondary, SchemeKind::Dilithium3).unwrap());
        assert_ne!(wallet.address(Slot::Secondary), old);
    }

    #[test]
    fn corrupt_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(key_file(dir.path(), Slot::Primary), [5u8, b'F']).unwrap();
        assert!(matches!(
            NodeWallet::load_or_generate(dir.path(), &LiveSchemes::default()),
            Err(WalletError::InvalidKeyFile { .. })
        ));
    }
}
