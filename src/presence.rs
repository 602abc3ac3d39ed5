use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::events::UserSummary;
use crate::now_ms;

#[derive(Clone, Debug)]
pub struct PresenceEntry {
    pub user_id: String,
    pub nickname: String,
    pub socket_id: String,
    pub lang: String,
    pub joined_at: u64,
}

/// What a `join` did, so the session layer knows whether to announce it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First sight of this identity in the room; announce the join.
    Fresh,
    /// Rejoin inside the grace period; stay silent.
    Reconnect,
    /// Duplicate join from a live identity; refreshed in place, no announcement.
    Refresh,
}

#[derive(Debug)]
pub struct LeaveNotice {
    pub nickname: String,
    /// The leaver was the last user; the room was pruned and there is no
    /// audience left to notify.
    pub room_emptied: bool,
}

/// Tracks who is in which room, keyed by the client's durable user id
/// rather than the transport socket, so reconnects and extra tabs collapse
/// into a single presence entry.
pub struct PresenceManager {
    // room_id -> user_id -> entry
    rooms: RwLock<HashMap<String, HashMap<String, PresenceEntry>>>,
    // socket_id -> (room_id, user_id)
    socket_index: RwLock<HashMap<String, (String, String)>>,
    // user_id -> grace timer for a disconnect not yet finalized
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
    grace_period: Duration,
}

impl PresenceManager {
    pub fn new(grace_period: Duration) -> Self {
        PresenceManager {
            rooms: RwLock::new(HashMap::new()),
            socket_index: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        nickname: &str,
        lang: &str,
        socket_id: &str,
    ) -> JoinOutcome {
        let reconnected = {
            let mut pending = self.pending.lock().await;
            match pending.remove(user_id) {
                Some(timer) => {
                    timer.abort();
                    true
                }
                None => false,
            }
        };

        self.socket_index
            .write()
            .await
            .insert(socket_id.to_string(), (room_id.to_string(), user_id.to_string()));

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        match room.get_mut(user_id) {
            Some(entry) => {
                // joined_at survives so the user keeps their list position
                entry.socket_id = socket_id.to_string();
                entry.nickname = nickname.to_string();
                entry.lang = lang.to_string();
                if reconnected {
                    debug!("{user_id} reconnected to {room_id} within the grace period");
                    JoinOutcome::Reconnect
                } else {
                    JoinOutcome::Refresh
                }
            }
            None => {
                room.insert(
                    user_id.to_string(),
                    PresenceEntry {
                        user_id: user_id.to_string(),
                        nickname: nickname.to_string(),
                        socket_id: socket_id.to_string(),
                        lang: lang.to_string(),
                        joined_at: now_ms(),
                    },
                );
                JoinOutcome::Fresh
            }
        }
    }

    /// Marks the socket dead and reports which `(room, user)` it belonged
    /// to. The presence entry itself stays until the caller's grace timer
    /// fires `finish_disconnect`.
    pub async fn begin_disconnect(&self, socket_id: &str) -> Option<(String, String)> {
        self.socket_index.write().await.remove(socket_id)
    }

    pub async fn register_pending(&self, user_id: &str, timer: JoinHandle<()>) {
        if let Some(old) = self.pending.lock().await.insert(user_id.to_string(), timer) {
            old.abort();
        }
    }

    /// Finalizes a leave after the grace period. Returns `None` when there
    /// is nothing to announce: the user rejoined meanwhile, or a newer
    /// socket took over the presence entry.
    pub async fn finish_disconnect(
        &self,
        room_id: &str,
        user_id: &str,
        socket_id: &str,
    ) -> Option<LeaveNotice> {
        self.pending.lock().await.remove(user_id);

        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;
        let entry = room.get(user_id)?;
        if entry.socket_id != socket_id {
            // another connection owns this presence now
            return None;
        }

        let nickname = room.remove(user_id).map(|e| e.nickname)?;
        let room_emptied = room.is_empty();
        if room_emptied {
            rooms.remove(room_id);
        }
        Some(LeaveNotice { nickname, room_emptied })
    }

    /// Snapshot for client display, ordered by join time.
    pub async fn list_users(&self, room_id: &str) -> Vec<UserSummary> {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(room_id) else {
            return Vec::new();
        };
        let mut entries: Vec<&PresenceEntry> = room.values().collect();
        entries.sort_by(|a, b| (a.joined_at, &a.user_id).cmp(&(b.joined_at, &b.user_id)));
        entries
            .into_iter()
            .map(|e| UserSummary { nickname: e.nickname.clone(), user_id: e.user_id.clone() })
            .collect()
    }

    pub async fn sockets_in(&self, room_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| room.values().map(|e| e.socket_id.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn resolve(&self, socket_id: &str) -> Option<(String, String)> {
        self.socket_index.read().await.get(socket_id).cloned()
    }

    pub async fn nickname_of(&self, room_id: &str, user_id: &str) -> Option<String> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id)?.get(user_id).map(|e| e.nickname.clone())
    }

    pub async fn lang_of(&self, room_id: &str, user_id: &str) -> Option<String> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id)?.get(user_id).map(|e| e.lang.clone())
    }

    /// (active rooms, live sockets) for the stats endpoint.
    pub async fn stats(&self) -> (usize, usize) {
        let rooms = self.rooms.read().await.len();
        let users = self.socket_index.read().await.len();
        (rooms, users)
    }
}
