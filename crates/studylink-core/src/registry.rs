//! In-memory session registry used by discovery services
//!
//! Maps a room code to the endpoint registered under it (the host) and the
//! participants presently in that room. Discovery services use it to:
//! - reject a second registration of a code that is still live
//! - validate that a join code belongs to an active endpoint
//! - track who is in a room so departures can be cleaned up
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SessionRegistry<A>                                      │
//! │  └── rooms: RoomCode → Room                              │
//! │       ├── host: A          (address / port of endpoint)  │
//! │       ├── participants     (codes that joined the room)  │
//! │       └── registered_at    (unix millis)                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here is persisted; a registry lives as long as its process.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::RegistryError;
use crate::types::RoomCode;

/// A live room, keyed by the host's code
#[derive(Debug, Clone)]
struct Room<A> {
    host: A,
    participants: BTreeSet<RoomCode>,
    registered_at: i64,
}

/// Thread-safe registry of live endpoints and their rooms.
///
/// `A` is whatever a discovery service needs to reach the endpoint: an
/// in-process channel for the memory transport, a dialable address for the
/// rendezvous service.
#[derive(Debug)]
pub struct SessionRegistry<A> {
    rooms: RwLock<HashMap<RoomCode, Room<A>>>,
}

impl<A: Clone> SessionRegistry<A> {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Register an endpoint under `code`, opening its room.
    ///
    /// Fails with [`RegistryError::CodeTaken`] while another endpoint holds
    /// the code.
    pub fn register(&self, code: RoomCode, host: A) -> Result<(), RegistryError> {
        let mut rooms = self.rooms.write();
        if rooms.contains_key(&code) {
            return Err(RegistryError::CodeTaken(code));
        }
        debug!(%code, "Registered endpoint");
        rooms.insert(
            code,
            Room {
                host,
                participants: BTreeSet::new(),
                registered_at: chrono::Utc::now().timestamp_millis(),
            },
        );
        Ok(())
    }

    /// Remove an endpoint and its room.
    ///
    /// The code is also removed from every room it had joined. Returns the
    /// host value if the code was registered.
    pub fn unregister(&self, code: &RoomCode) -> Option<A> {
        let mut rooms = self.rooms.write();
        for room in rooms.values_mut() {
            room.participants.remove(code);
        }
        let removed = rooms.remove(code).map(|room| room.host);
        if removed.is_some() {
            debug!(%code, "Unregistered endpoint");
        }
        removed
    }

    /// Look up the endpoint registered under `code`
    pub fn resolve(&self, code: &RoomCode) -> Option<A> {
        self.rooms.read().get(code).map(|room| room.host.clone())
    }

    /// Whether `code` belongs to a live endpoint
    pub fn is_active(&self, code: &RoomCode) -> bool {
        self.rooms.read().contains_key(code)
    }

    /// Record `participant` as present in `room`
    pub fn join(&self, room: &RoomCode, participant: RoomCode) -> Result<(), RegistryError> {
        let mut rooms = self.rooms.write();
        let entry = rooms
            .get_mut(room)
            .ok_or_else(|| RegistryError::RoomNotFound(room.clone()))?;
        debug!(%room, %participant, "Participant joined room");
        entry.participants.insert(participant);
        Ok(())
    }

    /// Remove `participant` from `room`; returns whether it was present
    pub fn leave(&self, room: &RoomCode, participant: &RoomCode) -> bool {
        let mut rooms = self.rooms.write();
        match rooms.get_mut(room) {
            Some(entry) => entry.participants.remove(participant),
            None => false,
        }
    }

    /// Everyone presently in `room`: the host first, then joined participants
    pub fn participants(&self, room: &RoomCode) -> Vec<RoomCode> {
        let rooms = self.rooms.read();
        match rooms.get(room) {
            Some(entry) => std::iter::once(room.clone())
                .chain(entry.participants.iter().cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// When `code` was registered (unix millis)
    pub fn registered_at(&self, code: &RoomCode) -> Option<i64> {
        self.rooms.read().get(code).map(|room| room.registered_at)
    }

    /// Number of live endpoints
    pub fn len(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: Clone> Default for SessionRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = SessionRegistry::new();
        registry.register(code("111111"), "addr-a").unwrap();

        assert!(registry.is_active(&code("111111")));
        assert_eq!(registry.resolve(&code("111111")), Some("addr-a"));
        assert_eq!(registry.resolve(&code("222222")), None);
        assert!(registry.registered_at(&code("111111")).is_some());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = SessionRegistry::new();
        registry.register(code("111111"), 1).unwrap();

        let err = registry.register(code("111111"), 2).unwrap_err();
        assert_eq!(err, RegistryError::CodeTaken(code("111111")));
        // original holder is untouched
        assert_eq!(registry.resolve(&code("111111")), Some(1));
    }

    #[test]
    fn test_code_reusable_after_unregister() {
        let registry = SessionRegistry::new();
        registry.register(code("111111"), 1).unwrap();
        assert_eq!(registry.unregister(&code("111111")), Some(1));
        assert!(registry.is_empty());
        registry.register(code("111111"), 2).unwrap();
        assert_eq!(registry.resolve(&code("111111")), Some(2));
    }

    #[test]
    fn test_join_and_leave() {
        let registry = SessionRegistry::new();
        registry.register(code("111111"), ()).unwrap();
        registry.register(code("222222"), ()).unwrap();

        registry.join(&code("111111"), code("222222")).unwrap();
        assert_eq!(
            registry.participants(&code("111111")),
            vec![code("111111"), code("222222")]
        );

        assert!(registry.leave(&code("111111"), &code("222222")));
        assert!(!registry.leave(&code("111111"), &code("222222")));
        assert_eq!(registry.participants(&code("111111")), vec![code("111111")]);
    }

    #[test]
    fn test_join_unknown_room() {
        let registry: SessionRegistry<()> = SessionRegistry::new();
        let err = registry.join(&code("333333"), code("111111")).unwrap_err();
        assert_eq!(err, RegistryError::RoomNotFound(code("333333")));
    }

    #[test]
    fn test_unregister_removes_participation() {
        let registry = SessionRegistry::new();
        registry.register(code("111111"), ()).unwrap();
        registry.register(code("222222"), ()).unwrap();
        registry.join(&code("111111"), code("222222")).unwrap();

        registry.unregister(&code("222222"));
        assert_eq!(registry.participants(&code("111111")), vec![code("111111")]);
        assert!(registry.participants(&code("222222")).is_empty());
    }
}
