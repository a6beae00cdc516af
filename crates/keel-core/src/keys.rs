//! Writer identity: a single Ed25519 keypair per chain.
//!
//! The private key lives in `agent.key` (mode 0600) and the public key in
//! `agent.pub`, both as lowercase hex. The keypair is generated by `init`
//! and loaded on every open; every journal append is signed with it.

use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::ChainError;

pub struct WriterKey {
    signing_key: SigningKey,
}

impl WriterKey {
    /// Generate a new random writer keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Sign a canonical encoding, returning the 64-byte signature as hex.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Persist the keypair. The private key file is chmod 0600.
    pub fn save(&self, key_path: &Path, pub_path: &Path) -> Result<(), ChainError> {
        fs::write(key_path, hex::encode(self.signing_key.to_bytes()))?;
        restrict_permissions(key_path)?;
        fs::write(pub_path, hex::encode(self.signing_key.verifying_key().to_bytes()))?;
        Ok(())
    }

    pub fn load(key_path: &Path) -> Result<Self, ChainError> {
        let raw = fs::read_to_string(key_path)?;
        let bytes: [u8; 32] = hex::decode(raw.trim())
            .map_err(|e| ChainError::Corrupt(format!("writer key is not hex: {e}")))?
            .try_into()
            .map_err(|_| ChainError::Corrupt("writer key must be 32 bytes".to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }
}

pub fn load_public(pub_path: &Path) -> Result<VerifyingKey, ChainError> {
    let raw = fs::read_to_string(pub_path)?;
    let bytes: [u8; 32] = hex::decode(raw.trim())
        .map_err(|e| ChainError::Corrupt(format!("public key is not hex: {e}")))?
        .try_into()
        .map_err(|_| ChainError::Corrupt("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| ChainError::Corrupt(format!("invalid public key: {e}")))
}

/// Check a hex signature over a message. Malformed hex counts as invalid.
pub fn verify_signature(public: &VerifyingKey, message: &[u8], signature_hex: &str) -> bool {
    let Ok(bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    public.verify(message, &signature).is_ok()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
