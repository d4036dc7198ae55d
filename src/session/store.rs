//! Sessions and the stores that keep them between requests.
//!
//! ## Design
//!
//! 1. **Create is free**: `create()` only builds a value. Nothing is stored
//!    until the dispatcher sees the session was modified and calls `save()`.
//! 2. **Sharded Locks**: the in-memory store spreads sessions across shards
//!    so concurrent requests for different sessions rarely contend.
//! 3. **Idle expiry**: every load refreshes the access time; the sweeper
//!    removes sessions idle for longer than the configured timeout.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Session ids longer than this are treated as forged or corrupt.
pub const MAX_SESSION_ID_LEN: usize = 40;

/// Number of shards for the in-memory store.
const NUM_SHARDS: usize = 16;

/// Errors raised by session stores.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session id: {0:?}")]
    InvalidId(String),

    /// Backend failure (for stores backed by something other than memory)
    #[error("session storage failed: {0}")]
    Storage(String),
}

/// A client session: an id plus a bag of named string values.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    values: HashMap<String, String>,
    created_at: Instant,
    accessed_at: Instant,
    modified: bool,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            values: HashMap::new(),
            created_at: now,
            accessed_at: now,
            modified: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Stores a value and marks the session as modified.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
        self.modified = true;
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let removed = self.values.remove(name);
        if removed.is_some() {
            self.modified = true;
        }
        removed
    }

    /// Drops every value.
    pub fn clear(&mut self) {
        if !self.values.is_empty() {
            self.values.clear();
            self.modified = true;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether anything changed since the session was created or loaded.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn accessed_at(&self) -> Instant {
        self.accessed_at
    }

    /// How long the session has gone unused.
    pub fn idle_time(&self) -> Duration {
        self.accessed_at.elapsed()
    }

    fn touch(&mut self) {
        self.accessed_at = Instant::now();
    }
}

/// Where sessions live between requests.
///
/// Implementations are shared across all connections and must be
/// thread-safe.
pub trait SessionStore: Send + Sync {
    /// A new session with a fresh id. Not stored until saved.
    fn create(&self) -> Session;

    /// A new session with the given id. Not stored until saved.
    fn create_with_id(&self, id: &str) -> Session;

    /// Loads a stored session, refreshing its access time.
    fn load(&self, id: &str) -> Option<Session>;

    /// Stores the session, replacing any previous copy.
    fn save(&self, session: &Session) -> Result<(), SessionError>;

    /// Removes a session. Returns true if it existed.
    fn remove(&self, id: &str) -> bool;

    /// Removes sessions idle for longer than `max_idle`, returning how many.
    fn cleanup(&self, max_idle: Duration) -> usize;
}

/// Generates a session id: 32 lowercase hex characters.
pub fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The built-in in-memory session store.
///
/// # Example
///
/// ```
/// use portico::session::{MemorySessionStore, SessionStore};
///
/// let store = MemorySessionStore::new();
/// let mut session = store.create();
/// session.set("user", "ada");
/// store.save(&session).unwrap();
///
/// let loaded = store.load(session.id()).unwrap();
/// assert_eq!(loaded.get("user"), Some("ada"));
/// assert!(!loaded.is_modified());
/// ```
pub struct MemorySessionStore {
    shards: Vec<RwLock<HashMap<String, Session>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    /// Determines which shard a session id belongs to.
    #[inline]
    fn shard(&self, id: &str) -> &RwLock<HashMap<String, Session>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySessionStore")
            .field("shards", &self.shards.len())
            .field("sessions", &self.len())
            .finish()
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self) -> Session {
        Session::new(generate_session_id())
    }

    fn create_with_id(&self, id: &str) -> Session {
        Session::new(id)
    }

    fn load(&self, id: &str) -> Option<Session> {
        let mut sessions = self.shard(id).write().unwrap();
        let session = sessions.get_mut(id)?;
        session.touch();

        let mut loaded = session.clone();
        loaded.modified = false;
        Some(loaded)
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        if session.id.is_empty() || session.id.len() > MAX_SESSION_ID_LEN {
            return Err(SessionError::InvalidId(session.id.clone()));
        }

        let mut stored = session.clone();
        stored.modified = false;
        stored.touch();
        self.shard(&session.id)
            .write()
            .unwrap()
            .insert(session.id.clone(), stored);
        Ok(())
    }

    fn remove(&self, id: &str) -> bool {
        self.shard(id).write().unwrap().remove(id).is_some()
    }

    fn cleanup(&self, max_idle: Duration) -> usize {
        let mut cleaned = 0;

        for shard in &self.shards {
            let mut sessions = shard.write().unwrap();
            let before = sessions.len();
            sessions.retain(|_, session| session.idle_time() <= max_idle);
            cleaned += before - sessions.len();
        }

        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids() {
        let a = generate_session_id();
        let b = generate_session_id();

        assert_eq!(a.len(), 32);
        assert!(a.len() <= MAX_SESSION_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_modified_flag() {
        let mut session = Session::new("abc");
        assert!(!session.is_modified());

        assert_eq!(session.remove("missing"), None);
        session.clear();
        assert!(!session.is_modified());

        session.set("k", "v");
        assert!(session.is_modified());
        assert_eq!(session.get("k"), Some("v"));
    }

    #[test]
    fn test_create_does_not_store() {
        let store = MemorySessionStore::new();
        let session = store.create();

        assert!(store.is_empty());
        assert!(store.load(session.id()).is_none());
    }

    #[test]
    fn test_save_load_remove() {
        let store = MemorySessionStore::new();
        let mut session = store.create_with_id("client-1");
        session.set("cart", "3 items");
        store.save(&session).unwrap();

        let loaded = store.load("client-1").unwrap();
        assert_eq!(loaded.get("cart"), Some("3 items"));
        assert_eq!(store.len(), 1);

        assert!(store.remove("client-1"));
        assert!(!store.remove("client-1"));
        assert!(store.load("client-1").is_none());
    }

    #[test]
    fn test_save_rejects_bad_ids() {
        let store = MemorySessionStore::new();

        let long = Session::new("x".repeat(MAX_SESSION_ID_LEN + 1));
        assert!(matches!(store.save(&long), Err(SessionError::InvalidId(_))));
        assert!(matches!(
            store.save(&Session::new("")),
            Err(SessionError::InvalidId(_))
        ));
    }

    #[test]
    fn test_cleanup_removes_idle_sessions() {
        let store = MemorySessionStore::new();
        for i in 0..10 {
            store.save(&Session::new(format!("s{}", i))).unwrap();
        }

        std::thread::sleep(Duration::from_millis(20));
        store.load("s3");

        let removed = store.cleanup(Duration::from_millis(10));
        assert_eq!(removed, 9);
        assert!(store.load("s3").is_some());
    }
}
