//! Transfer states and the bounded session registry.

use std::fs::File;
use std::net::IpAddr;
use std::path::PathBuf;

use tracing::debug;

use crate::protocol::MAX_REQUESTS;

/// Per-session transfer state. The first four belong to the client role, the rest to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Done,
    WaitingForSummary,
    /// The server said it is asking upstream; keep waiting.
    PossiblyWaitingForSummary,
    ReceivingChunks,
    SendingSummary,
    SendingChunks,
    WaitingForLocation,
}

impl SessionState {
    pub fn is_server_role(self) -> bool {
        matches!(
            self,
            SessionState::SendingSummary
                | SessionState::SendingChunks
                | SessionState::WaitingForLocation
        )
    }
}

/// Index of a record in the registry's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(usize);

/// One in-progress transfer.
#[derive(Debug)]
pub struct Session {
    id: u16,
    peer: IpAddr,
    artifact: String,
    seq: u64,
    pub state: SessionState,
    pub current_chunk: u16,
    pub nr_chunks: u16,
    /// Backing artifact file (server role).
    pub file: Option<File>,
    /// Where the fetched artifact goes (client role).
    pub destination: Option<PathBuf>,
}

impl Session {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    /// The last chunk has been sent (or there was nothing to send).
    pub fn is_fully_served(&self) -> bool {
        match self.state {
            SessionState::SendingChunks => self.current_chunk.saturating_add(1) >= self.nr_chunks,
            SessionState::SendingSummary => self.file.is_some() && self.nr_chunks == 0,
            _ => false,
        }
    }
}

/// Fixed-capacity slot table. A free slot is `None`; handles are slot indices.
/// Session ids start at 1, wrap at `u16::MAX` and skip 0 and ids still in use.
pub struct SessionRegistry {
    slots: Vec<Option<Session>>,
    next_id: u16,
    next_seq: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_REQUESTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            next_id: 1,
            next_seq: 0,
        }
    }

    /// Insert a new record. Refuses a second record for the same (peer, artifact).
    /// When every slot is taken, the oldest record waiting on an upstream location
    /// answer gives up its slot: that answer goes straight to the node, never back here.
    pub fn create(
        &mut self,
        peer: IpAddr,
        artifact: &str,
        state: SessionState,
    ) -> Result<SessionHandle, RegistryError> {
        if let Some(existing) = self.find_by_source(peer, artifact).and_then(|h| self.get(h)) {
            return Err(RegistryError::AlreadyActive { id: existing.id });
        }
        let index = match self.slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => self.reclaim_parked().ok_or(RegistryError::Full {
                capacity: self.slots.len(),
            })?,
        };
        let id = self.allocate_id();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots[index] = Some(Session {
            id,
            peer,
            artifact: artifact.to_string(),
            seq,
            state,
            current_chunk: 0,
            nr_chunks: 0,
            file: None,
            destination: None,
        });
        Ok(SessionHandle(index))
    }

    fn reclaim_parked(&mut self) -> Option<usize> {
        let handle = self.first_match(|s| s.state == SessionState::WaitingForLocation)?;
        if let Some(parked) = self.retire(handle) {
            debug!(peer = %parked.peer, artifact = %parked.artifact, "parked session reclaimed");
        }
        Some(handle.0)
    }

    fn allocate_id(&mut self) -> u16 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            // terminates: a slot is free, so fewer than u16::MAX ids are in use
            if self.find_by_session(id).is_none() {
                return id;
            }
        }
    }

    /// Oldest matching record, so lookups behave like a scan in insertion order.
    fn first_match(&self, pred: impl Fn(&Session) -> bool) -> Option<SessionHandle> {
        self.iter()
            .filter(|(_, s)| pred(s))
            .min_by_key(|(_, s)| s.seq)
            .map(|(h, _)| h)
    }

    pub fn find_by_source(&self, peer: IpAddr, artifact: &str) -> Option<SessionHandle> {
        self.first_match(|s| s.peer == peer && s.artifact == artifact)
    }

    pub fn find_by_session(&self, id: u16) -> Option<SessionHandle> {
        self.first_match(|s| s.id == id)
    }

    pub fn find_by_artifact(&self, artifact: &str) -> Option<SessionHandle> {
        self.first_match(|s| s.artifact == artifact)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    /// Free the slot; the record (and its open file) is handed back.
    pub fn retire(&mut self, handle: SessionHandle) -> Option<Session> {
        self.slots.get_mut(handle.0).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionHandle, &Session)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (SessionHandle(i), s)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("all {capacity} session slots are in use")]
    Full { capacity: usize },
    #[error("session {id} is already active for this peer and artifact")]
    AlreadyActive { id: u16 },
}
