//! Per-path last-event identifier store.
//!
//! Process-global, no persistence. A single `RwLock` guards the map, the
//! same concurrency model the subscription index uses.

use rand::Rng;
use std::collections::HashMap;
use std::sync::RwLock;

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 6;

#[derive(Default)]
pub struct EventIdStore {
    ids: RwLock<HashMap<String, String>>,
}

impl EventIdStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a fresh 6-character alphanumeric id, stores it under
    /// `path`, and returns it.
    pub fn set_event_id(&self, path: &str) -> String {
        let id = generate_id();
        self.ids
            .write()
            .expect("event id store poisoned")
            .insert(path.to_owned(), id.clone());
        id
    }

    #[must_use]
    pub fn last_event_id(&self, path: &str) -> Option<String> {
        self.ids
            .read()
            .expect("event id store poisoned")
            .get(path)
            .cloned()
    }
}

fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_last_event_id_round_trips() {
        let store = EventIdStore::new();
        assert_eq!(store.last_event_id("/races/1"), None);
        let id = store.set_event_id("/races/1");
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(store.last_event_id("/races/1"), Some(id));
    }

    #[test]
    fn paths_are_independent() {
        let store = EventIdStore::new();
        let a = store.set_event_id("/a");
        let b = store.set_event_id("/b");
        assert_ne!(a, b);
        assert_eq!(store.last_event_id("/a"), Some(a));
        assert_eq!(store.last_event_id("/b"), Some(b));
    }

    #[test]
    fn overwriting_replaces_previous_id() {
        let store = EventIdStore::new();
        let first = store.set_event_id("/a");
        let second = store.set_event_id("/a");
        assert_ne!(first, second);
        assert_eq!(store.last_event_id("/a"), Some(second));
    }
}
