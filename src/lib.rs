//! Ghostline Signal core: a peer-to-peer end-to-end-encrypted messenger.
//!
//! The crate is organized leaf-first, mirroring the dependency order of its
//! components: obfuscation and cipher primitives at the bottom, session
//! management and the connection broker built on top of them.

pub mod broker;
pub mod cipher;
pub mod config;
pub mod error;
pub mod identity;
pub mod keys;
pub mod obfuscation;
pub mod registry;
pub mod rendezvous_client;
pub mod session;
pub mod store;
pub mod stun;
pub mod transport;

use std::sync::Arc;

use config::Config;

/// Everything a running node needs: identity, keys, storage, transport,
/// session state and the broker that ties discovery to live connections.
pub struct Node {
    pub config: Config,
    pub identity: identity::DeviceIdentity,
    pub keys: Arc<keys::KeyManager>,
    pub store: Arc<store::Store>,
    pub transport: Arc<transport::Transport>,
    pub sessions: Arc<session::SessionManager>,
    pub broker: Arc<broker::ConnectionBroker>,
}

impl Node {
    /// Load or create the identity/keys/database under `config.data_dir`,
    /// bind the transport, and construct the connection broker. Does not
    /// start listening or register with a rendezvous server — call
    /// [`Node::start`] for that.
    pub fn load(config: Config) -> Result<Self, error::NodeError> {
        let identity = identity::DeviceIdentity::load_or_create(&config.identity_path())?;

        let keys = keys::KeyManager::load_or_generate(
            &config.private_key_path(),
            &config.public_key_path(),
        )?;

        let store = store::Store::open(&config.database_path())?;

        let transport = transport::Transport::new();
        let sessions = session::SessionManager::new(
            identity.device_id.clone(),
            config.session_lifetime,
        );

        let rendezvous_url = config
            .rendezvous_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let transport = Arc::new(transport);
        let broker = broker::ConnectionBroker::new(
            transport.clone(),
            identity.device_id.clone(),
            &rendezvous_url,
        );

        Ok(Node {
            config,
            identity,
            keys: Arc::new(keys),
            store: Arc::new(store),
            transport,
            sessions: Arc::new(sessions),
            broker: Arc::new(broker),
        })
    }

    /// Bind the listener and initialize the connection broker (STUN probe,
    /// rendezvous registration, incoming-request poller).
    pub fn start(&self) -> Result<u16, error::TransportError> {
        let port = self
            .transport
            .start(&self.config.listen_host, self.config.listen_port)?;
        self.broker.initialize();
        Ok(port)
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
        self.transport.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InboundOutcome, SessionManager};
    use crate::store::Store;
    use crate::transport::{Transport, TransportEvent};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    /// End-to-end round trip over loopback sockets (spec §8, scenario 1),
    /// wired directly through transport + session manager rather than the
    /// broker, since discovery is out of scope for this test: both peers
    /// already know each other's address.
    #[test]
    fn round_trip_over_loopback_matches_scenario_one() {
        let dir = tempdir().unwrap();
        let keys_a = keys::KeyManager::load_or_generate(
            &dir.path().join("a_priv.pem"),
            &dir.path().join("a_pub.pem"),
        )
        .unwrap();

        let store_a = Arc::new(Store::open_in_memory().unwrap());
        let store_b = Arc::new(Store::open_in_memory().unwrap());
        let sessions_a = SessionManager::new("device-a".to_string(), Duration::from_secs(3600));
        let sessions_b = SessionManager::new("device-b".to_string(), Duration::from_secs(3600));

        let transport_a = Arc::new(Transport::new());
        let transport_b = Arc::new(Transport::new());
        transport_a.start("127.0.0.1", 0).unwrap();
        let port_b = transport_b.start("127.0.0.1", 0).unwrap();

        let events_a = transport_a.events();
        let events_b = transport_b.events();

        let peer_id_a_side = transport_a
            .dial("127.0.0.1", port_b, Duration::from_secs(2))
            .unwrap();

        assert!(matches!(
            events_a.recv_timeout(Duration::from_secs(2)).unwrap(),
            TransportEvent::Connected { .. }
        ));
        let peer_id_b_side = match events_b.recv_timeout(Duration::from_secs(2)).unwrap() {
            TransportEvent::Connected { peer_id } => peer_id,
            other => panic!("expected Connected, got {other:?}"),
        };

        // Seed matching session keys on both sides out-of-band (wrap/unwrap
        // is exercised independently by keys.rs; here we're proving the
        // transport+session data path).
        let envelope = sessions_a
            .encode_outbound(&peer_id_a_side, b"hello", &keys_a, &store_a)
            .unwrap();
        let (_, session_key) = {
            // peer the session was actually created against, read back via the
            // same lookup path encode_outbound used.
            let rec = store_a.get_session_for_peer(&peer_id_a_side).unwrap().unwrap();
            (rec.session_id, rec.key)
        };
        sessions_b
            .adopt_unwrapped_session_key(&peer_id_b_side, session_key, &store_b)
            .unwrap();

        transport_a.send(&peer_id_a_side, &envelope).unwrap();

        let received = match events_b.recv_timeout(Duration::from_secs(2)).unwrap() {
            TransportEvent::Message { peer_id, data } => {
                assert_eq!(peer_id, peer_id_b_side);
                data
            }
            other => panic!("expected Message, got {other:?}"),
        };

        match sessions_b
            .decode_inbound(&peer_id_b_side, &received, &store_b)
            .unwrap()
        {
            InboundOutcome::Message { plaintext } => assert_eq!(plaintext, b"hello"),
            InboundOutcome::Undecryptable => panic!("expected a decryptable message"),
        }

        assert_eq!(transport_a.connected_peers().len(), 1);
        assert_eq!(transport_b.connected_peers().len(), 1);

        transport_a.stop();
        transport_b.stop();
    }

    /// A corrupted ciphertext drops only the one message; the session and
    /// connection survive and a later correct message still decrypts
    /// (spec §8, scenario 3).
    #[test]
    fn decrypt_failure_is_local_to_one_message() {
        let dir = tempdir().unwrap();
        let keys_a = keys::KeyManager::load_or_generate(
            &dir.path().join("a_priv.pem"),
            &dir.path().join("a_pub.pem"),
        )
        .unwrap();
        let store_a = Arc::new(Store::open_in_memory().unwrap());
        let store_b = Arc::new(Store::open_in_memory().unwrap());
        let sessions_a = SessionManager::new("device-a".to_string(), Duration::from_secs(3600));
        let sessions_b = SessionManager::new("device-b".to_string(), Duration::from_secs(3600));

        let good_envelope = sessions_a
            .encode_outbound("peer-b", b"first", &keys_a, &store_a)
            .unwrap();
        let session_key = store_a
            .get_session_for_peer("peer-b")
            .unwrap()
            .unwrap()
            .key;
        sessions_b
            .adopt_unwrapped_session_key("peer-a", session_key, &store_b)
            .unwrap();

        // Corrupt a copy of the ciphertext's hex `data` field before decoding.
        let mut tampered: serde_json::Value = serde_json::from_slice(&good_envelope).unwrap();
        let mut data_bytes = hex::decode(tampered["data"].as_str().unwrap()).unwrap();
        let last = data_bytes.len() - 1;
        data_bytes[last] ^= 0x01;
        tampered["data"] = serde_json::Value::String(hex::encode(&data_bytes));
        let tampered_bytes = serde_json::to_vec(&tampered).unwrap();

        let outcome = sessions_b
            .decode_inbound("peer-a", &tampered_bytes, &store_b)
            .unwrap();
        assert!(matches!(outcome, InboundOutcome::Undecryptable));

        // The session key survives; a subsequent correct message still decrypts.
        let second_envelope = sessions_a
            .encode_outbound("peer-b", b"second", &keys_a, &store_a)
            .unwrap();
        match sessions_b
            .decode_inbound("peer-a", &second_envelope, &store_b)
            .unwrap()
        {
            InboundOutcome::Message { plaintext } => assert_eq!(plaintext, b"second"),
            InboundOutcome::Undecryptable => panic!("expected the second message to decrypt"),
        }
    }
}
