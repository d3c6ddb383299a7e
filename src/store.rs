//! Persistent relational store: peers, messages, sessions (spec §3/§4.4, C4).

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const DEFAULT_MESSAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "sent" => Direction::Sent,
            _ => Direction::Received,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: String,
    pub display_name: Option<String>,
    pub public_key_pem: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub trust_level: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub peer_id: String,
    pub ciphertext: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub session_id: Option<String>,
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub peer_id: String,
    pub key: [u8; 32],
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|_| StoreError::DataDir)?;
        }
        let conn = Connection::open(path)?;
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS peers (
                peer_id TEXT PRIMARY KEY,
                display_name TEXT,
                public_key_pem TEXT,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                trust_level INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_id TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                timestamp TEXT NOT NULL,
                direction TEXT NOT NULL,
                session_id TEXT,
                delivered INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                peer_id TEXT NOT NULL,
                key BLOB NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
            [],
        )?;

        for idx in &[
            "CREATE INDEX IF NOT EXISTS idx_messages_peer ON messages(peer_id)",
            "CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_peer ON sessions(peer_id)",
        ] {
            conn.execute(idx, [])?;
        }

        Ok(())
    }

    /// Upsert a peer record, preserving the original `first_seen`.
    pub fn add_peer(&self, peer_id: &str, public_key_pem: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO peers (peer_id, display_name, public_key_pem, first_seen, last_seen, trust_level)
             VALUES (?1, NULL, ?2, ?3, ?3, 0)
             ON CONFLICT(peer_id) DO UPDATE SET
                public_key_pem = excluded.public_key_pem,
                last_seen = excluded.last_seen",
            params![peer_id, public_key_pem, now],
        )?;
        Ok(())
    }

    pub fn touch_peer_last_seen(&self, peer_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE peers SET last_seen = ?1 WHERE peer_id = ?2",
            params![Utc::now().to_rfc3339(), peer_id],
        )?;
        Ok(())
    }

    pub fn get_peer(&self, peer_id: &str) -> Result<Option<Peer>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT peer_id, display_name, public_key_pem, first_seen, last_seen, trust_level
             FROM peers WHERE peer_id = ?1",
            params![peer_id],
            row_to_peer,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn delete_peer(&self, peer_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM peers WHERE peer_id = ?1", params![peer_id])?;
        Ok(())
    }

    /// Persist a message record; `ciphertext` is stored as-is, never plaintext.
    pub fn add_message(
        &self,
        peer_id: &str,
        ciphertext: &[u8],
        direction: Direction,
        session_id: Option<&str>,
        delivered: bool,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO messages (peer_id, ciphertext, timestamp, direction, session_id, delivered)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                peer_id,
                ciphertext,
                now,
                direction.as_str(),
                session_id,
                delivered as i64
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Messages for `peer_id`, ascending by timestamp, bounded by `limit`.
    pub fn get_messages(
        &self,
        peer_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let limit = if limit == 0 { DEFAULT_MESSAGE_LIMIT } else { limit };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, peer_id, ciphertext, timestamp, direction, session_id, delivered
             FROM messages WHERE peer_id = ?1 ORDER BY timestamp ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![peer_id, limit], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn put_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (session_id, peer_id, key, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                key = excluded.key, expires_at = excluded.expires_at",
            params![
                session.session_id,
                session.peer_id,
                session.key.to_vec(),
                session.created_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_session_for_peer(&self, peer_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT session_id, peer_id, key, created_at, expires_at
             FROM sessions WHERE peer_id = ?1 ORDER BY created_at DESC LIMIT 1",
            params![peer_id],
            row_to_session,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Delete sessions whose `expires_at` has already passed.
    pub fn cleanup_expired_sessions(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let deleted = conn.execute("DELETE FROM sessions WHERE expires_at < ?1", params![now])?;
        Ok(deleted)
    }
}

fn row_to_peer(row: &rusqlite::Row) -> rusqlite::Result<Peer> {
    Ok(Peer {
        peer_id: row.get(0)?,
        display_name: row.get(1)?,
        public_key_pem: row.get(2)?,
        first_seen: parse_rfc3339(row.get::<_, String>(3)?),
        last_seen: parse_rfc3339(row.get::<_, String>(4)?),
        trust_level: row.get(5)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        peer_id: row.get(1)?,
        ciphertext: row.get(2)?,
        timestamp: parse_rfc3339(row.get::<_, String>(3)?),
        direction: Direction::from_str(&row.get::<_, String>(4)?),
        session_id: row.get(5)?,
        delivered: row.get::<_, i64>(6)? != 0,
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
    let key_vec: Vec<u8> = row.get(2)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&key_vec[..32.min(key_vec.len())]);
    Ok(SessionRecord {
        session_id: row.get(0)?,
        peer_id: row.get(1)?,
        key,
        created_at: parse_rfc3339(row.get::<_, String>(3)?),
        expires_at: parse_rfc3339(row.get::<_, String>(4)?),
    })
}

fn parse_rfc3339(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_peer_preserves_first_seen_on_upsert() {
        let store = Store::open_in_memory().unwrap();
        store.add_peer("127.0.0.1:9000", None).unwrap();
        let first = store.get_peer("127.0.0.1:9000").unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        store.add_peer("127.0.0.1:9000", Some("pem-data")).unwrap();
        let second = store.get_peer("127.0.0.1:9000").unwrap().unwrap();

        assert_eq!(first.first_seen, second.first_seen);
        assert_eq!(second.public_key_pem.as_deref(), Some("pem-data"));
    }

    #[test]
    fn messages_are_ordered_and_bounded() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .add_message("peer-a", format!("ct{i}").as_bytes(), Direction::Sent, None, true)
                .unwrap();
        }
        let msgs = store.get_messages("peer-a", 3).unwrap();
        assert_eq!(msgs.len(), 3);
        assert!(msgs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn expired_sessions_are_swept() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .put_session(&SessionRecord {
                session_id: "s1".into(),
                peer_id: "peer-a".into(),
                key: [0u8; 32],
                created_at: now - chrono::Duration::hours(25),
                expires_at: now - chrono::Duration::hours(1),
            })
            .unwrap();
        store
            .put_session(&SessionRecord {
                session_id: "s2".into(),
                peer_id: "peer-b".into(),
                key: [1u8; 32],
                created_at: now,
                expires_at: now + chrono::Duration::hours(24),
            })
            .unwrap();

        let deleted = store.cleanup_expired_sessions().unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_session_for_peer("peer-a").unwrap().is_none());
        assert!(store.get_session_for_peer("peer-b").unwrap().is_some());
    }
}
