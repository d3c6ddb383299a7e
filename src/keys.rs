//! Long-lived identity keys, session-key generation, KDF and RSA-OAEP
//! wrap/unwrap (spec §4.3, C3).

use std::fs;
use std::path::Path;

use hkdf::Hkdf;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::CryptoError;

const RSA_KEY_BITS: usize = 4096;
const SESSION_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const HKDF_INFO: &[u8] = b"ghostline-signal-session";

/// Holds this device's long-lived RSA identity key pair.
pub struct KeyManager {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyManager {
    /// Load PEM-encoded keys from `private_path`/`public_path` if both exist,
    /// otherwise generate a fresh RSA-4096 pair and persist it there.
    pub fn load_or_generate(
        private_path: &Path,
        public_path: &Path,
    ) -> Result<Self, CryptoError> {
        if private_path.exists() && public_path.exists() {
            Self::load(private_path, public_path)
        } else {
            let manager = Self::generate()?;
            manager.persist(private_path, public_path)?;
            Ok(manager)
        }
    }

    fn generate() -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(KeyManager {
            private_key,
            public_key,
        })
    }

    fn load(private_path: &Path, public_path: &Path) -> Result<Self, CryptoError> {
        let private_pem =
            fs::read_to_string(private_path).map_err(|e| CryptoError::Pem(e.to_string()))?;
        let public_pem =
            fs::read_to_string(public_path).map_err(|e| CryptoError::Pem(e.to_string()))?;

        let private_key = RsaPrivateKey::from_pkcs8_pem(&private_pem)
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        let public_key = RsaPublicKey::from_public_key_pem(&public_pem)
            .map_err(|e| CryptoError::Pem(e.to_string()))?;

        Ok(KeyManager {
            private_key,
            public_key,
        })
    }

    fn persist(&self, private_path: &Path, public_path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = private_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CryptoError::Pem(e.to_string()))?;
        }

        let private_pem = self
            .private_key
            .to_pkcs8_pem(Default::default())
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        fs::write(private_path, private_pem.as_bytes())
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        set_owner_only(private_path);

        let public_pem = self
            .public_key
            .to_public_key_pem(Default::default())
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        fs::write(public_path, public_pem).map_err(|e| CryptoError::Pem(e.to_string()))?;

        Ok(())
    }

    /// This device's public key as PEM/SPKI bytes, for sharing with peers.
    pub fn export_public(&self) -> Result<Vec<u8>, CryptoError> {
        let pem = self
            .public_key
            .to_public_key_pem(Default::default())
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        Ok(pem.into_bytes())
    }

    /// Parse a peer's PEM-encoded SPKI public key.
    pub fn load_peer_public(pem: &[u8]) -> Result<RsaPublicKey, CryptoError> {
        let text = std::str::from_utf8(pem).map_err(|e| CryptoError::Pem(e.to_string()))?;
        RsaPublicKey::from_public_key_pem(text).map_err(|e| CryptoError::Pem(e.to_string()))
    }

    /// 32 fresh random bytes, suitable as an AES-256-GCM key.
    pub fn new_session_key(&self) -> [u8; SESSION_KEY_LEN] {
        let mut key = [0u8; SESSION_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// HKDF-SHA256 over `shared_secret`, 32 bytes out, fixed info string.
    /// A random 16-byte salt is drawn if `salt` is `None`.
    pub fn derive(
        &self,
        shared_secret: &[u8],
        salt: Option<&[u8]>,
    ) -> ([u8; SESSION_KEY_LEN], [u8; SALT_LEN]) {
        let mut salt_bytes = [0u8; SALT_LEN];
        match salt {
            Some(s) if s.len() == SALT_LEN => salt_bytes.copy_from_slice(s),
            _ => rand::thread_rng().fill_bytes(&mut salt_bytes),
        }

        let hk = Hkdf::<Sha256>::new(Some(&salt_bytes), shared_secret);
        let mut out = [0u8; SESSION_KEY_LEN];
        hk.expand(HKDF_INFO, &mut out)
            .expect("32 is a valid SHA-256 HKDF output length");
        (out, salt_bytes)
    }

    /// RSA-OAEP(SHA-256, MGF1-SHA-256, label=∅) wrap of a session key under
    /// `peer_pub`.
    pub fn wrap(&self, session_key: &[u8], peer_pub: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
        let mut rng = rand::thread_rng();
        peer_pub
            .encrypt(&mut rng, Oaep::new::<Sha256>(), session_key)
            .map_err(|e| CryptoError::WrapFailed(e.to_string()))
    }

    /// Inverse of [`wrap`], decrypted under this device's own private key.
    pub fn unwrap(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| CryptoError::KeyUnwrapFailed)
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generate_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let priv_path = dir.path().join("priv.pem");
        let pub_path = dir.path().join("pub.pem");

        let first = KeyManager::load_or_generate(&priv_path, &pub_path).unwrap();
        let exported = first.export_public().unwrap();

        let second = KeyManager::load_or_generate(&priv_path, &pub_path).unwrap();
        assert_eq!(exported, second.export_public().unwrap());
    }

    #[test]
    fn wrap_unwrap_round_trips() {
        let dir = tempdir().unwrap();
        let alice = KeyManager::load_or_generate(
            &dir.path().join("a_priv.pem"),
            &dir.path().join("a_pub.pem"),
        )
        .unwrap();
        let bob = KeyManager::load_or_generate(
            &dir.path().join("b_priv.pem"),
            &dir.path().join("b_pub.pem"),
        )
        .unwrap();

        let bob_pub = KeyManager::load_peer_public(&bob.export_public().unwrap()).unwrap();
        let session_key = alice.new_session_key();
        let wrapped = alice.wrap(&session_key, &bob_pub).unwrap();
        let unwrapped = bob.unwrap(&wrapped).unwrap();

        assert_eq!(unwrapped, session_key);
    }

    #[test]
    fn derive_is_deterministic_given_salt() {
        let dir = tempdir().unwrap();
        let km = KeyManager::load_or_generate(
            &dir.path().join("priv.pem"),
            &dir.path().join("pub.pem"),
        )
        .unwrap();

        let secret = b"shared-secret-material";
        let salt = [0x11u8; SALT_LEN];
        let (key1, _) = km.derive(secret, Some(&salt));
        let (key2, _) = km.derive(secret, Some(&salt));
        assert_eq!(key1, key2);
    }

    #[test]
    fn unwrap_with_wrong_key_fails() {
        let dir = tempdir().unwrap();
        let alice = KeyManager::load_or_generate(
            &dir.path().join("a_priv.pem"),
            &dir.path().join("a_pub.pem"),
        )
        .unwrap();
        let bob = KeyManager::load_or_generate(
            &dir.path().join("b_priv.pem"),
            &dir.path().join("b_pub.pem"),
        )
        .unwrap();
        let mallory = KeyManager::load_or_generate(
            &dir.path().join("m_priv.pem"),
            &dir.path().join("m_pub.pem"),
        )
        .unwrap();

        let bob_pub = KeyManager::load_peer_public(&bob.export_public().unwrap()).unwrap();
        let wrapped = alice.wrap(&alice.new_session_key(), &bob_pub).unwrap();
        assert!(mallory.unwrap(&wrapped).is_err());
    }
}
