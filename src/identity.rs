//! Device identity: a stable UUID, human-readable name and SHA-256
//! fingerprint, persisted once and loaded thereafter (spec §4.10, C10).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::IdentityError;

/// Persisted device identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    #[serde(rename = "device_fingerprint")]
    pub fingerprint: String,
}

impl DeviceIdentity {
    /// Load the identity at `path` if present, otherwise create, persist
    /// and return a fresh one.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let identity: DeviceIdentity = serde_json::from_str(&raw)?;
            Ok(identity)
        } else {
            let identity = Self::create();
            identity.save(path)?;
            Ok(identity)
        }
    }

    fn create() -> Self {
        let device_id = Uuid::new_v4().to_string();
        let device_name = format!("Ghostline-{}", local_hostname());
        let fingerprint = fingerprint_of(&device_id);

        DeviceIdentity {
            device_id,
            device_name,
            fingerprint,
        }
    }

    fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        set_owner_only(path);
        Ok(())
    }

    /// Rename the device and persist the change. The id and fingerprint
    /// are immutable.
    pub fn rename(&mut self, path: &Path, new_name: String) -> Result<(), IdentityError> {
        self.device_name = new_name;
        self.save(path)
    }
}

/// First 16 hex digits (uppercase) of SHA-256(device_id).
fn fingerprint_of(device_id: &str) -> String {
    let digest = Sha256::digest(device_id.as_bytes());
    hex::encode_upper(digest)[..16].to_string()
}

/// Format a 16-char fingerprint as `XXXX-XXXX-XXXX-XXXX` for display.
pub fn format_fingerprint(fingerprint: &str) -> String {
    if fingerprint.len() != 16 {
        return fingerprint.to_string();
    }
    fingerprint
        .as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).unwrap())
        .collect::<Vec<_>>()
        .join("-")
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
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
    fn create_then_load_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = DeviceIdentity::load_or_create(&path).unwrap();
        let second = DeviceIdentity::load_or_create(&path).unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn fingerprint_is_sixteen_hex_chars() {
        let dir = tempdir().unwrap();
        let identity = DeviceIdentity::load_or_create(&dir.path().join("identity.json")).unwrap();
        assert_eq!(identity.fingerprint.len(), 16);
        assert!(identity.fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn format_fingerprint_groups_in_fours() {
        assert_eq!(format_fingerprint("0123456789ABCDEF"), "0123-4567-89AB-CDEF");
    }

    #[test]
    fn rename_persists_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let mut identity = DeviceIdentity::load_or_create(&path).unwrap();
        identity.rename(&path, "My Laptop".to_string()).unwrap();

        let reloaded = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(reloaded.device_name, "My Laptop");
    }
}
