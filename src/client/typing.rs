use std::collections::HashMap;
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::websocket::TypingPayload;

pub const TYPING_IDLE: Duration = Duration::from_millis(1_200);
pub const TYPING_EXPIRY: Duration = Duration::from_millis(1_600);

#[derive(Debug, Default)]
struct NotifierInner {
    armed: bool,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

/// Edge-triggered outgoing typing indicator.
#[derive(Clone, Debug)]
pub struct TypingNotifier {
    inner: Arc<Mutex<NotifierInner>>,
    idle: Duration,
}

impl TypingNotifier {
    pub fn new(idle: Duration) -> Self {
        Self { inner: Arc::default(), idle }
    }

    /// Records a keystroke. Returns true when the caller should announce
    /// `isTyping: true`; `on_idle` runs once the user has been quiet for the
    /// idle period and should announce `isTyping: false`.
    pub fn poke<F>(&self, on_idle: F) -> bool where F: FnOnce() + Send + 'static {
        let mut inner = self.inner.lock().expect("typing notifier poisoned");
        let announce = !inner.armed;
        inner.armed = true;
        inner.epoch += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }

        let epoch = inner.epoch;
        let idle = self.idle;
        let notifier = self.clone();
        inner.timer = Some(
            tokio::spawn(async move {
                tokio::time::sleep(idle).await;
                if notifier.expire(epoch) {
                    on_idle();
                }
            })
        );
        announce
    }

    fn expire(&self, epoch: u64) -> bool {
        let mut inner = self.inner.lock().expect("typing notifier poisoned");
        if inner.armed && inner.epoch == epoch {
            inner.armed = false;
            inner.timer = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().expect("typing notifier poisoned").armed
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("typing notifier poisoned");
        inner.armed = false;
        inner.epoch += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug)]
struct TypingEntry {
    display_name: String,
    generation: u64,
    timer: JoinHandle<()>,
}

type TypingKey = (String, String);

#[derive(Debug, Default)]
struct TrackerInner {
    entries: HashMap<TypingKey, TypingEntry>,
    next_generation: u64,
}

/// Incoming typing indicators, each expiring independently.
#[derive(Clone, Debug)]
pub struct TypingTracker {
    inner: Arc<Mutex<TrackerInner>>,
    expiry: Duration,
    revision: Arc<watch::Sender<u64>>,
}

impl TypingTracker {
    pub fn new(expiry: Duration, revision: Arc<watch::Sender<u64>>) -> Self {
        Self { inner: Arc::default(), expiry, revision }
    }

    pub fn receive(&self, payload: &TypingPayload) {
        let key = (payload.conversation_id.clone(), payload.user_id.clone());
        let mut inner = self.inner.lock().expect("typing tracker poisoned");

        if let Some(previous) = inner.entries.remove(&key) {
            previous.timer.abort();
        }

        if payload.is_typing {
            inner.next_generation += 1;
            let generation = inner.next_generation;
            let tracker = self.clone();
            let expiry = self.expiry;
            let timer_key = key.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                tracker.expire(&timer_key, generation);
            });
            inner.entries.insert(key, TypingEntry {
                display_name: payload.display_name.clone(),
                generation,
                timer,
            });
        }
        drop(inner);
        self.bump();
    }

    fn expire(&self, key: &TypingKey, generation: u64) {
        let mut inner = self.inner.lock().expect("typing tracker poisoned");
        let current = inner.entries.get(key).map_or(false, |e| e.generation == generation);
        if current {
            inner.entries.remove(key);
            drop(inner);
            self.bump();
        }
    }

    /// Users currently typing in `conversation_id`, sorted by user id.
    pub fn typing_in(&self, conversation_id: &str) -> Vec<TypingUser> {
        let inner = self.inner.lock().expect("typing tracker poisoned");
        let mut users: Vec<TypingUser> = inner.entries
            .iter()
            .filter(|((conversation, _), _)| conversation == conversation_id)
            .map(|((_, user_id), entry)| TypingUser {
                user_id: user_id.clone(),
                display_name: entry.display_name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("typing tracker poisoned");
        for (_, entry) in inner.entries.drain() {
            entry.timer.abort();
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }
}
