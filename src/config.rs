//! Runtime knobs left as defaults by spec.md, resolved the way the teacher
//! resolves its data directory: an environment override falling back to
//! the OS local-data directory.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the environment variable that, if set, overrides the resolved
/// data directory (mirrors the teacher's `PINGO_INSTANCE`-based override).
pub const DATA_DIR_ENV: &str = "GHOSTLINE_DATA_DIR";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the identity file, key PEMs and the message database.
    pub data_dir: PathBuf,
    /// Listener bind host for the peer transport.
    pub listen_host: String,
    /// Listener bind port; 0 asks the OS to assign one.
    pub listen_port: u16,
    /// Base URL of the rendezvous server, e.g. "http://127.0.0.1:8080".
    pub rendezvous_url: Option<String>,
    /// Default session-key lifetime (spec §3: 24h).
    pub session_lifetime: Duration,
    /// Dial timeout used by the transport dialer and broker (spec §4.5: 5s).
    pub dial_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 0,
            rendezvous_url: None,
            session_lifetime: Duration::from_secs(24 * 3600),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.data_dir.join("device_private.pem")
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.data_dir.join("device_public.pem")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("ghostline.db")
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Ghostline")
}

/// Rendezvous registry tunables (spec §3/§4.6).
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub device_expiry: Duration,
    pub request_expiry: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            device_expiry: Duration::from_secs(300),
            request_expiry: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
