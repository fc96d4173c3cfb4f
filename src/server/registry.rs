//! Session table with admission control
//!
//! Sessions live in a `DashMap` keyed by id for O(1) lookup from any task.
//! Insert and remove additionally take one structural lock so the capacity
//! check and the insert are atomic; nothing holds that lock across I/O.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::session::{ClientSession, SessionState, SessionStats};
use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::network::PacketWriter;
use crate::protocol::ServerState;

pub struct SessionRegistry {
    sessions: DashMap<u32, Arc<ClientSession>>,
    structural: Mutex<()>,
    next_id: AtomicU32,
    max_clients: usize,
    audio_queue_capacity: usize,
    video_queue_capacity: usize,
    video_ring_capacity: usize,
}

impl SessionRegistry {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            structural: Mutex::new(()),
            next_id: AtomicU32::new(1),
            max_clients: config.max_clients,
            audio_queue_capacity: config.audio_queue_capacity,
            video_queue_capacity: config.video_queue_capacity,
            video_ring_capacity: config.video_ring_capacity,
        }
    }

    /// Register a new connection. Ids start at 1 (0 is the server) and are
    /// never reused within a process.
    pub fn admit(&self, writer: Arc<PacketWriter>) -> Result<Arc<ClientSession>, RelayError> {
        let _guard = self.structural.lock();
        if self.sessions.len() >= self.max_clients {
            return Err(RelayError::CapacityReached(self.max_clients));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ClientSession::new(
            id,
            writer,
            self.audio_queue_capacity,
            self.video_queue_capacity,
            self.video_ring_capacity,
        ));
        self.sessions.insert(id, Arc::clone(&session));
        tracing::debug!(client_id = id, total = self.sessions.len(), "Session admitted");
        Ok(session)
    }

    pub fn remove(&self, id: u32) -> Option<Arc<ClientSession>> {
        let _guard = self.structural.lock();
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn get(&self, id: u32) -> Option<Arc<ClientSession>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// All sessions, ordered by id
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    /// Joined sessions, ordered by id
    pub fn connected(&self) -> Vec<Arc<ClientSession>> {
        let mut sessions = self.snapshot();
        sessions.retain(|s| s.state().is_connected());
        sessions
    }

    pub fn counts(&self) -> ServerState {
        let mut state = ServerState::default();
        for entry in self.sessions.iter() {
            match entry.value().state() {
                SessionState::Joined => state.connected_clients += 1,
                SessionState::Active => {
                    state.connected_clients += 1;
                    state.active_clients += 1;
                }
                _ => {}
            }
        }
        state
    }

    pub fn stats(&self) -> Vec<SessionStats> {
        self.snapshot().iter().map(|s| s.stats()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Ask every session to close; each receive thread tears itself down.
    pub fn close_all(&self) {
        for session in self.snapshot() {
            session.request_close();
        }
    }
}
