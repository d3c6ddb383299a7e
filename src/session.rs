//! Binds a peer to a live session key, and encodes/decodes the message
//! envelope exchanged over the transport (spec §4.9, C9).

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cipher;
use crate::error::SessionError;
use crate::keys::KeyManager;
use crate::store::{Direction, SessionRecord, Store};

#[derive(Debug, Serialize, Deserialize)]
struct MessageEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    session_id: String,
    from: String,
    data: String,
}

#[derive(Debug, Clone)]
pub enum InboundOutcome {
    Message { plaintext: Vec<u8> },
    Undecryptable,
}

/// Authoritative in-memory session keys, mirrored durably in the message store.
pub struct SessionManager {
    keys: RwLock<HashMap<String, (String, [u8; 32])>>,
    self_device_id: String,
    session_lifetime: chrono::Duration,
}

impl SessionManager {
    pub fn new(self_device_id: String, session_lifetime: std::time::Duration) -> Self {
        SessionManager {
            keys: RwLock::new(HashMap::new()),
            self_device_id,
            session_lifetime: chrono::Duration::from_std(session_lifetime)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    fn session_for_peer(&self, peer_id: &str) -> Option<(String, [u8; 32])> {
        self.keys.read().unwrap().get(peer_id).cloned()
    }

    fn get_or_create_session(
        &self,
        peer_id: &str,
        key_manager: &KeyManager,
        store: &Store,
    ) -> Result<(String, [u8; 32]), SessionError> {
        if let Some(existing) = self.session_for_peer(peer_id) {
            return Ok(existing);
        }

        let session_key = key_manager.new_session_key();
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        store.put_session(&SessionRecord {
            session_id: session_id.clone(),
            peer_id: peer_id.to_string(),
            key: session_key,
            created_at: now,
            expires_at: now + self.session_lifetime,
        })?;

        self.keys
            .write()
            .unwrap()
            .insert(peer_id.to_string(), (session_id.clone(), session_key));

        Ok((session_id, session_key))
    }

    /// Pad, encrypt and envelope a plaintext message bound for `peer_id`,
    /// returning the serialized JSON envelope ready for the transport.
    pub fn encode_outbound(
        &self,
        peer_id: &str,
        plaintext: &[u8],
        key_manager: &KeyManager,
        store: &Store,
    ) -> Result<Vec<u8>, SessionError> {
        let (session_id, session_key) = self.get_or_create_session(peer_id, key_manager, store)?;

        let padded = cipher::pad(plaintext);
        let ciphertext = cipher::encrypt(&padded, &session_key)?;

        let envelope = MessageEnvelope {
            msg_type: "message".to_string(),
            session_id: session_id.clone(),
            from: self.self_device_id.clone(),
            data: hex::encode(&ciphertext),
        };
        let serialized =
            serde_json::to_vec(&envelope).expect("MessageEnvelope always serializes");

        store.add_message(
            peer_id,
            &ciphertext,
            Direction::Sent,
            Some(&session_id),
            true,
        )?;

        Ok(serialized)
    }

    /// Parse, decrypt and unpad an inbound envelope received from `peer_id`.
    pub fn decode_inbound(
        &self,
        peer_id: &str,
        envelope_bytes: &[u8],
        store: &Store,
    ) -> Result<InboundOutcome, SessionError> {
        let envelope: MessageEnvelope =
            serde_json::from_slice(envelope_bytes).map_err(|_| SessionError::NotAMessage)?;
        if envelope.msg_type != "message" {
            return Err(SessionError::NotAMessage);
        }

        let ciphertext = hex::decode(&envelope.data).map_err(|_| SessionError::BadHex)?;

        let session_key = match self.session_for_peer(peer_id) {
            Some((_, key)) => key,
            None => {
                store.add_message(peer_id, &ciphertext, Direction::Received, None, true)?;
                return Ok(InboundOutcome::Undecryptable);
            }
        };

        let padded = match cipher::decrypt(&ciphertext, &session_key) {
            Ok(p) => p,
            Err(_) => {
                store.add_message(peer_id, &ciphertext, Direction::Received, None, true)?;
                return Ok(InboundOutcome::Undecryptable);
            }
        };
        let plaintext = cipher::unpad(&padded)?;

        store.touch_peer_last_seen(peer_id)?;
        store.add_message(
            peer_id,
            &ciphertext,
            Direction::Received,
            Some(&envelope.session_id),
            true,
        )?;

        Ok(InboundOutcome::Message { plaintext })
    }

    /// Establish a session key by wrapping it for `peer_pub` and returning
    /// the wrapped bytes to send to the peer out-of-band of the message path.
    pub fn wrap_session_key_for_peer(
        &self,
        peer_id: &str,
        peer_pub: &RsaPublicKey,
        key_manager: &KeyManager,
        store: &Store,
    ) -> Result<Vec<u8>, SessionError> {
        let (_, session_key) = self.get_or_create_session(peer_id, key_manager, store)?;
        Ok(key_manager.wrap(&session_key, peer_pub)?)
    }

    /// Install a session key received from a peer's wrapped envelope.
    pub fn adopt_unwrapped_session_key(
        &self,
        peer_id: &str,
        session_key: [u8; 32],
        store: &Store,
    ) -> Result<(), SessionError> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        store.put_session(&SessionRecord {
            session_id: session_id.clone(),
            peer_id: peer_id.to_string(),
            key: session_key,
            created_at: now,
            expires_at: now + self.session_lifetime,
        })?;

        self.keys
            .write()
            .unwrap()
            .insert(peer_id.to_string(), (session_id, session_key));
        Ok(())
    }
}
