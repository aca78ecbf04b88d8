//! Host-driven chunk server: the host passes received datagrams, the server returns
//! datagrams to send. No sockets here; file I/O only for reading artifacts.

use std::fs::File;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::chunk::{self, ChunkError};
use crate::directory::ArtifactDirectory;
use crate::protocol::{Message, DEFAULT_PORT, MAX_REQUESTS};
use crate::session::{RegistryError, SessionHandle, SessionRegistry, SessionState};
use crate::wire::{self, DecodeError, EncodeError};

/// Session id used in a summary that reports an unavailable artifact.
pub const UNAVAILABLE_SESSION: u16 = 0;

/// Tunables for a chunk server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Number of concurrent sessions.
    pub max_sessions: usize,
    /// Repository asked when an artifact is not in the local manifest.
    pub upstream: Option<SocketAddr>,
    /// Port nodes listen on; repository-location answers are sent there.
    pub node_port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_sessions: MAX_REQUESTS,
            upstream: None,
            node_port: DEFAULT_PORT,
        }
    }
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    Send(SocketAddr, Vec<u8>),
}

/// Repository server state: the artifact directory and the live sessions.
pub struct ChunkServer {
    directory: ArtifactDirectory,
    sessions: SessionRegistry,
    options: ServerOptions,
}

impl ChunkServer {
    pub fn new(directory: ArtifactDirectory, options: ServerOptions) -> Self {
        Self {
            directory,
            sessions: SessionRegistry::with_capacity(options.max_sessions),
            options,
        }
    }

    pub fn directory(&self) -> &ArtifactDirectory {
        &self.directory
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Decode and handle one datagram. Errors mean the datagram was dropped;
    /// no state was changed and nothing needs to be sent.
    pub fn on_datagram(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
    ) -> Result<Vec<OutboundAction>, ServerError> {
        let msg = wire::decode(bytes)?;
        self.on_message(from, msg)
    }

    pub fn on_message(
        &mut self,
        from: SocketAddr,
        msg: Message,
    ) -> Result<Vec<OutboundAction>, ServerError> {
        match msg {
            Message::GetArtifact { artifact } => self.on_get_artifact(from, &artifact),
            Message::GetChunk {
                session_id,
                chunk_id,
            } => self.on_get_chunk(from, session_id, chunk_id),
            Message::EndChunks => {
                self.on_end_chunks(from);
                Ok(Vec::new())
            }
            Message::GetRepoAddr {
                requester,
                artifact,
            } => self.on_get_repo_addr(requester, &artifact),
            Message::Summary { .. }
            | Message::Chunk { .. }
            | Message::AckLookingForPacket
            | Message::RepoAddr { .. } => {
                warn!(%from, command = ?msg.command(), "client-role message sent to server, dropped");
                Ok(Vec::new())
            }
        }
    }

    fn on_get_artifact(
        &mut self,
        from: SocketAddr,
        artifact: &str,
    ) -> Result<Vec<OutboundAction>, ServerError> {
        let peer = from.ip();
        let handle = match self.sessions.find_by_source(peer, artifact) {
            Some(h) => h,
            None => {
                let h = self
                    .sessions
                    .create(peer, artifact, SessionState::SendingSummary)?;
                debug!(%peer, artifact, "session created");
                h
            }
        };
        let Some(session) = self.sessions.get_mut(handle) else {
            return Ok(Vec::new());
        };
        if session.state == SessionState::SendingChunks {
            // the client started over, e.g. a rerun of an interrupted fetch
            info!(%peer, artifact, session = session.id(), "artifact requested again, restarting transfer");
        }

        let Some(path) = self.directory.resolve(artifact) else {
            return self.artifact_unresolved(from, handle, artifact);
        };
        let (file, nr_chunks) = match open_artifact(path) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(artifact, path = %path.display(), error = %e, "cannot serve artifact");
                self.sessions.retire(handle);
                return reply_unavailable(from);
            }
        };
        let Some(session) = self.sessions.get_mut(handle) else {
            return Ok(Vec::new());
        };
        session.file = Some(file);
        session.nr_chunks = nr_chunks;
        session.current_chunk = 0;
        session.state = SessionState::SendingSummary;
        info!(%peer, artifact, session = session.id(), nr_chunks, "sending summary");
        let reply = wire::encode(&Message::Summary {
            session_id: session.id(),
            nr_chunks,
        })?;
        Ok(vec![OutboundAction::Send(from, reply)])
    }

    fn artifact_unresolved(
        &mut self,
        from: SocketAddr,
        handle: SessionHandle,
        artifact: &str,
    ) -> Result<Vec<OutboundAction>, ServerError> {
        let Some(upstream) = self.options.upstream else {
            warn!(%from, artifact, "artifact not in manifest");
            self.sessions.retire(handle);
            return reply_unavailable(from);
        };
        if let Some(session) = self.sessions.get_mut(handle) {
            session.state = SessionState::WaitingForLocation;
        }
        info!(%from, artifact, %upstream, "artifact not local, asking upstream");
        let requester = match from.ip() {
            IpAddr::V6(ip) => ip,
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        };
        let ack = wire::encode(&Message::AckLookingForPacket)?;
        let query = wire::encode(&Message::GetRepoAddr {
            requester,
            artifact: artifact.to_string(),
        })?;
        Ok(vec![
            OutboundAction::Send(from, ack),
            OutboundAction::Send(upstream, query),
        ])
    }

    fn on_get_chunk(
        &mut self,
        from: SocketAddr,
        session_id: u16,
        chunk_id: u16,
    ) -> Result<Vec<OutboundAction>, ServerError> {
        let Some(session) = self
            .sessions
            .find_by_session(session_id)
            .and_then(|h| self.sessions.get_mut(h))
            .filter(|s| s.peer() == from.ip())
        else {
            debug!(%from, session_id, "chunk request for unknown session ignored");
            return Ok(Vec::new());
        };
        let admissible = match session.state {
            SessionState::SendingChunks => session.current_chunk <= chunk_id,
            SessionState::SendingSummary => session.current_chunk == 0 && chunk_id == 0,
            _ => false,
        };
        if !admissible || chunk_id >= session.nr_chunks {
            debug!(
                %from,
                session_id,
                chunk_id,
                current = session.current_chunk,
                "chunk request not admissible, ignored"
            );
            return Ok(Vec::new());
        }
        let Some(file) = session.file.as_mut() else {
            return Ok(Vec::new());
        };
        let data = chunk::read_chunk(file, chunk_id).map_err(|source| ServerError::Io {
            artifact: session.artifact().to_string(),
            source,
        })?;
        session.state = SessionState::SendingChunks;
        session.current_chunk = chunk_id;
        debug!(session_id, chunk_id, len = data.len(), "sending chunk");
        let reply = wire::encode(&Message::Chunk { chunk_id, data })?;
        Ok(vec![OutboundAction::Send(from, reply)])
    }

    /// Retire the peer's sessions that have sent their last chunk.
    fn on_end_chunks(&mut self, from: SocketAddr) {
        let done: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.peer() == from.ip() && s.is_fully_served())
            .map(|(h, _)| h)
            .collect();
        for handle in done {
            if let Some(session) = self.sessions.retire(handle) {
                info!(%from, artifact = session.artifact(), session = session.id(), "transfer finished");
            }
        }
    }

    fn on_get_repo_addr(
        &mut self,
        requester: Ipv6Addr,
        artifact: &str,
    ) -> Result<Vec<OutboundAction>, ServerError> {
        if self.directory.resolve(artifact).is_none() {
            debug!(%requester, artifact, "location query for unknown artifact ignored");
            return Ok(Vec::new());
        }
        let ip = requester
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(requester));
        let to = SocketAddr::new(ip, self.options.node_port);
        info!(%to, artifact, "answering location query");
        let reply = wire::encode(&Message::RepoAddr {
            artifact: artifact.to_string(),
        })?;
        Ok(vec![OutboundAction::Send(to, reply)])
    }
}

fn open_artifact(path: &Path) -> Result<(File, u16), ServerError> {
    let file = File::open(path).map_err(|source| ServerError::Io {
        artifact: path.display().to_string(),
        source,
    })?;
    let len = file
        .metadata()
        .map_err(|source| ServerError::Io {
            artifact: path.display().to_string(),
            source,
        })?
        .len();
    Ok((file, chunk::chunk_count(len)?))
}

fn reply_unavailable(from: SocketAddr) -> Result<Vec<OutboundAction>, ServerError> {
    let reply = wire::encode(&Message::Summary {
        session_id: UNAVAILABLE_SESSION,
        nr_chunks: 0,
    })?;
    Ok(vec![OutboundAction::Send(from, reply)])
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("dropped datagram: {0}")]
    Decode(#[from] DecodeError),
    #[error("cannot encode reply: {0}")]
    Encode(#[from] EncodeError),
    #[error("session not created: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("i/o error on {artifact}: {source}")]
    Io {
        artifact: String,
        #[source]
        source: io::Error,
    },
}
