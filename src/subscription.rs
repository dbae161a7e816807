//! Indexed map `path -> (profile -> Emitter)` that fans notifications out to
//! exactly the connections whose negotiated profile matches.

use crate::negotiate::EventProfile;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Pushed into a subscriber's channel; `session.rs` turns these into wire
/// bytes.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    Notification { body: String, last_event: bool },
    End,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

struct Emitter {
    subscribers: Vec<Subscriber>,
}

impl Emitter {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[derive(Default)]
struct PathEntry {
    // Linear, not hashed: profiles compare by deep structural equality,
    // and the first-inserted equal profile is retained as the canonical
    // key so later subscribers with an equal profile share it.
    profiles: Vec<(EventProfile, Emitter)>,
}

#[derive(Default)]
struct IndexState {
    paths: IndexMap<String, PathEntry>,
}

/// Process-wide subscription index.
pub struct SubscriptionIndex {
    state: Mutex<IndexState>,
    next_id: AtomicU64,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IndexState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new subscriber for `(path, profile)` and returns a
    /// receiver for the notifications it should write, plus an idempotent
    /// unsubscribe handle.
    pub fn subscribe(
        self: &Arc<Self>,
        path: String,
        profile: EventProfile,
    ) -> (mpsc::UnboundedReceiver<NotificationEvent>, Unsubscribe) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.state.lock().expect("subscription index poisoned");
            let entry = state.paths.entry(path.clone()).or_default();
            match entry.profiles.iter_mut().find(|(p, _)| *p == profile) {
                Some((_, emitter)) => emitter.subscribers.push(Subscriber { id, tx }),
                None => entry.profiles.push((
                    profile.clone(),
                    Emitter {
                        subscribers: vec![Subscriber { id, tx }],
                    },
                )),
            }
        }
        trace!(path = %path, subscriber = id, "subscribed");

        let unsubscribe = Unsubscribe {
            index: Arc::clone(self),
            path,
            profile,
            id,
            done: Arc::new(AtomicBool::new(false)),
        };
        (rx, unsubscribe)
    }

    fn unsubscribe(&self, path: &str, profile: &EventProfile, id: u64) {
        let mut state = self.state.lock().expect("subscription index poisoned");
        let Some(entry) = state.paths.get_mut(path) else {
            return;
        };
        let Some(slot) = entry.profiles.iter_mut().position(|(p, _)| p == profile) else {
            return;
        };
        entry.profiles[slot].1.subscribers.retain(|s| s.id != id);
        if entry.profiles[slot].1.is_empty() {
            entry.profiles.remove(slot);
        }
        if entry.profiles.is_empty() {
            state.paths.shift_remove(path);
        }
        trace!(path, subscriber = id, "unsubscribed");
    }

    /// Invokes `generate_notification(profile)` for every subscriber under
    /// `path`; a truthy result is delivered. When `last_event` is set, every
    /// emitter under the path additionally receives an `End`.
    pub fn notify(
        &self,
        path: &str,
        mut generate_notification: impl FnMut(&EventProfile) -> Option<String>,
        last_event: bool,
    ) {
        let state = self.state.lock().expect("subscription index poisoned");
        let Some(entry) = state.paths.get(path) else {
            debug!(path, "notify on path with no subscribers");
            return;
        };

        for (profile, emitter) in &entry.profiles {
            let Some(body) = generate_notification(profile) else {
                continue;
            };
            // Snapshot before delivering: a subscriber that unsubscribes
            // itself mid-delivery must not corrupt this iteration.
            for subscriber in emitter.subscribers.clone_refs() {
                let _ = subscriber.send(NotificationEvent::Notification {
                    body: body.clone(),
                    last_event,
                });
            }
        }

        if last_event {
            for (_, emitter) in &entry.profiles {
                for subscriber in emitter.subscribers.clone_refs() {
                    let _ = subscriber.send(NotificationEvent::End);
                }
            }
        }
    }
}

trait CloneRefs {
    fn clone_refs(&self) -> Vec<mpsc::UnboundedSender<NotificationEvent>>;
}

impl CloneRefs for Vec<Subscriber> {
    fn clone_refs(&self) -> Vec<mpsc::UnboundedSender<NotificationEvent>> {
        self.iter().map(|s| s.tx.clone()).collect()
    }
}

/// One-shot, idempotent unsubscribe handle returned by [`SubscriptionIndex::subscribe`].
#[derive(Clone)]
pub struct Unsubscribe {
    index: Arc<SubscriptionIndex>,
    path: String,
    profile: EventProfile,
    id: u64,
    done: Arc<AtomicBool>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.index.unsubscribe(&self.path, &self.profile, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::StructuredItem;

    fn profile(bare: &str) -> EventProfile {
        EventProfile {
            content_type: StructuredItem::new(bare),
        }
    }

    #[tokio::test]
    async fn notify_delivers_only_to_matching_profile() {
        let index = Arc::new(SubscriptionIndex::new());
        let (mut rx_a, _unsub_a) = index.subscribe("/r".to_owned(), profile("message/rfc822"));
        let (mut rx_b, _unsub_b) = index.subscribe("/r".to_owned(), profile("application/json"));

        index.notify("/r", |p| Some(format!("hello {}", p.content_type.bare)), false);

        match rx_a.try_recv().unwrap() {
            NotificationEvent::Notification { body, .. } => {
                assert_eq!(body, "hello message/rfc822");
            }
            _ => panic!("expected notification"),
        }
        match rx_b.try_recv().unwrap() {
            NotificationEvent::Notification { body, .. } => {
                assert_eq!(body, "hello application/json");
            }
            _ => panic!("expected notification"),
        }
    }

    #[tokio::test]
    async fn equal_profiles_share_one_emitter() {
        let index = Arc::new(SubscriptionIndex::new());
        let (mut rx_a, _unsub_a) = index.subscribe("/r".to_owned(), profile("message/rfc822"));
        let (mut rx_b, _unsub_b) = index.subscribe("/r".to_owned(), profile("message/rfc822"));

        index.notify("/r", |_| Some("x".to_owned()), false);

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_removes_empty_emitter_and_path() {
        let index = Arc::new(SubscriptionIndex::new());
        let (_rx, unsub) = index.subscribe("/r".to_owned(), profile("message/rfc822"));
        unsub.unsubscribe();
        // idempotent: a second call must not panic
        unsub.unsubscribe();

        let state = index.state.lock().unwrap();
        assert!(state.paths.get("/r").is_none());
    }

    #[tokio::test]
    async fn notify_on_absent_path_is_a_silent_no_op() {
        let index = Arc::new(SubscriptionIndex::new());
        index.notify("/missing", |_| Some("x".to_owned()), false);
    }

    #[tokio::test]
    async fn last_event_sends_end_to_every_emitter_under_path() {
        let index = Arc::new(SubscriptionIndex::new());
        let (mut rx, _unsub) = index.subscribe("/r".to_owned(), profile("message/rfc822"));

        index.notify("/r", |_| Some("bye".to_owned()), true);

        match rx.try_recv().unwrap() {
            NotificationEvent::Notification { last_event, .. } => assert!(last_event),
            _ => panic!("expected the terminal notification first"),
        }
        match rx.try_recv().unwrap() {
            NotificationEvent::End => {}
            _ => panic!("expected end after the terminal notification"),
        }
    }
}
