use crate::api::ChatMessage;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_MAX_SESSIONS: usize = 1000;
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug)]
struct SessionEntry {
    messages: Vec<ChatMessage>,
    touched: Instant,
}

/// Per-session conversation, oldest turns dropped past `limit`.
///
/// Sessions idle for longer than the TTL are forgotten, and the least
/// recently used one goes first once `max_sessions` is reached.
#[derive(Debug)]
pub struct ChatHistoryStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    limit: usize,
    max_sessions: usize,
    ttl: Duration,
}

impl ChatHistoryStore {
    pub fn new(limit: usize) -> Self {
        Self::with_retention(limit, DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TTL)
    }

    pub fn with_retention(limit: usize, max_sessions: usize, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limit: limit.max(1),
            max_sessions: max_sessions.max(1),
            ttl,
        }
    }

    pub fn get(&self, session: &str) -> Vec<ChatMessage> {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get_mut(session) {
            Some(entry) => {
                entry.touched = Instant::now();
                entry.messages.clone()
            }
            None => Vec::new(),
        }
    }

    pub fn append(&self, session: &str, messages: impl IntoIterator<Item = ChatMessage>) {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if !guard.contains_key(session) {
            self.evict(&mut guard, now);
        }

        let entry = guard
            .entry(session.to_string())
            .or_insert_with(|| SessionEntry {
                messages: Vec::new(),
                touched: now,
            });
        entry.touched = now;
        entry.messages.extend(messages);
        if entry.messages.len() > self.limit {
            let excess = entry.messages.len() - self.limit;
            entry.messages.drain(0..excess);
        }
    }

    pub fn clear(&self, session: &str) {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(session);
    }

    fn evict(&self, sessions: &mut HashMap<String, SessionEntry>, now: Instant) {
        sessions.retain(|_, entry| now.duration_since(entry.touched) < self.ttl);

        while sessions.len() >= self.max_sessions {
            let stale = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(id, _)| id.clone());
            match stale {
                Some(id) => {
                    sessions.remove(&id);
                }
                None => break,
            }
        }
    }
}
