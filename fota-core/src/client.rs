//! Client role: fetch one artifact from a repository server, one chunk at a time.
//! Host-driven like the server: the host sends what `FetchAction` says, feeds back
//! received datagrams, and calls `on_timeout` when its single-shot timer fires.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::chunk::{ChunkAssembler, ChunkReceiveResult};
use crate::protocol::Message;
use crate::server::UNAVAILABLE_SESSION;
use crate::session::SessionState;
use crate::wire::{self, EncodeError};

/// Retries per request before the fetch gives up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// What the host should do next.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchAction {
    /// Send the datagram and (re)arm the timer.
    Send(SocketAddr, Vec<u8>),
    /// Nothing to send; keep waiting.
    Wait,
    /// Transfer done. Send `end_chunks` to the server and keep `image`.
    Complete {
        image: Vec<u8>,
        end_chunks: (SocketAddr, Vec<u8>),
    },
}

/// State of one artifact fetch.
pub struct ArtifactFetch {
    artifact: String,
    server: SocketAddr,
    state: SessionState,
    session_id: u16,
    assembler: Option<ChunkAssembler>,
    last_request: Option<Vec<u8>>,
    max_retries: u32,
    retries_left: u32,
}

impl ArtifactFetch {
    pub fn new(server: SocketAddr, artifact: &str) -> Self {
        Self {
            artifact: artifact.to_string(),
            server,
            state: SessionState::WaitingForSummary,
            session_id: 0,
            assembler: None,
            last_request: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retries_left: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.retries_left = max_retries;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn session_id(&self) -> Option<u16> {
        (self.session_id != 0).then_some(self.session_id)
    }

    /// (chunks received, total chunks); total is 0 until the summary arrives.
    pub fn progress(&self) -> (u16, u16) {
        self.assembler
            .as_ref()
            .map(|a| (a.received(), a.nr_chunks()))
            .unwrap_or((0, 0))
    }

    /// First request: GET_ARTIFACT to the configured server.
    pub fn start(&mut self) -> Result<FetchAction, FetchError> {
        self.state = SessionState::WaitingForSummary;
        self.request(Message::GetArtifact {
            artifact: self.artifact.clone(),
        })
    }

    fn request(&mut self, msg: Message) -> Result<FetchAction, FetchError> {
        let bytes = wire::encode(&msg)?;
        self.last_request = Some(bytes.clone());
        self.retries_left = self.max_retries;
        Ok(FetchAction::Send(self.server, bytes))
    }

    /// Handle one received datagram. Corrupt or unexpected datagrams are dropped.
    pub fn on_datagram(&mut self, from: SocketAddr, bytes: &[u8]) -> Result<FetchAction, FetchError> {
        match wire::decode(bytes) {
            Ok(msg) => self.on_message(from, msg),
            Err(e) => {
                debug!(%from, error = %e, "datagram dropped");
                Ok(FetchAction::Wait)
            }
        }
    }

    pub fn on_message(&mut self, from: SocketAddr, msg: Message) -> Result<FetchAction, FetchError> {
        if let Message::RepoAddr { artifact } = &msg {
            return self.on_repo_addr(from, artifact);
        }
        if from != self.server {
            debug!(%from, "datagram from a peer other than the server dropped");
            return Ok(FetchAction::Wait);
        }
        match msg {
            Message::Summary {
                session_id,
                nr_chunks,
            } => self.on_summary(session_id, nr_chunks),
            Message::Chunk { chunk_id, data } => self.on_chunk(chunk_id, &data),
            Message::AckLookingForPacket => {
                if self.state == SessionState::WaitingForSummary {
                    info!(artifact = %self.artifact, "server is asking upstream");
                    self.state = SessionState::PossiblyWaitingForSummary;
                }
                Ok(FetchAction::Wait)
            }
            other => {
                debug!(command = ?other.command(), "server-role message ignored");
                Ok(FetchAction::Wait)
            }
        }
    }

    fn awaiting_summary(&self) -> bool {
        matches!(
            self.state,
            SessionState::WaitingForSummary | SessionState::PossiblyWaitingForSummary
        )
    }

    fn on_summary(&mut self, session_id: u16, nr_chunks: u16) -> Result<FetchAction, FetchError> {
        if !self.awaiting_summary() {
            return Ok(FetchAction::Wait);
        }
        if session_id == UNAVAILABLE_SESSION {
            self.state = SessionState::Done;
            return Err(FetchError::ArtifactUnavailable(self.artifact.clone()));
        }
        info!(artifact = %self.artifact, session_id, nr_chunks, "summary received");
        self.session_id = session_id;
        self.assembler = Some(ChunkAssembler::new(nr_chunks));
        if nr_chunks == 0 {
            return self.finish(Vec::new());
        }
        self.state = SessionState::ReceivingChunks;
        self.request(Message::GetChunk {
            session_id,
            chunk_id: 0,
        })
    }

    fn on_chunk(&mut self, chunk_id: u16, data: &[u8]) -> Result<FetchAction, FetchError> {
        if self.state != SessionState::ReceivingChunks {
            return Ok(FetchAction::Wait);
        }
        let Some(assembler) = self.assembler.as_mut() else {
            return Ok(FetchAction::Wait);
        };
        match assembler.accept(chunk_id, data) {
            ChunkReceiveResult::Ignored => {
                debug!(chunk_id, len = data.len(), "unexpected chunk ignored");
                Ok(FetchAction::Wait)
            }
            ChunkReceiveResult::InProgress => {
                let next = assembler.received();
                self.request(Message::GetChunk {
                    session_id: self.session_id,
                    chunk_id: next,
                })
            }
            ChunkReceiveResult::Complete(image) => self.finish(image),
        }
    }

    fn finish(&mut self, image: Vec<u8>) -> Result<FetchAction, FetchError> {
        self.state = SessionState::Done;
        self.last_request = None;
        info!(artifact = %self.artifact, len = image.len(), "transfer complete");
        let end = wire::encode(&Message::EndChunks)?;
        Ok(FetchAction::Complete {
            image,
            end_chunks: (self.server, end),
        })
    }

    /// Another repository holds the artifact: restart there.
    fn on_repo_addr(&mut self, from: SocketAddr, artifact: &str) -> Result<FetchAction, FetchError> {
        if artifact != self.artifact || !self.awaiting_summary() {
            return Ok(FetchAction::Wait);
        }
        info!(artifact, repository = %from, "redirected to repository");
        self.server = from;
        self.start()
    }

    /// The timer fired with no useful answer: resend the last request or give up.
    pub fn on_timeout(&mut self) -> Result<FetchAction, FetchError> {
        let Some(last) = self.last_request.clone() else {
            return Ok(FetchAction::Wait);
        };
        if self.retries_left == 0 {
            warn!(artifact = %self.artifact, state = ?self.state, "giving up");
            let state = self.state;
            self.state = SessionState::Done;
            self.last_request = None;
            return Err(FetchError::TimedOut { state });
        }
        self.retries_left -= 1;
        debug!(state = ?self.state, retries_left = self.retries_left, "retrying");
        Ok(FetchAction::Send(self.server, last))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("artifact {0:?} is not available")]
    ArtifactUnavailable(String),
    #[error("no answer while in state {state:?}")]
    TimedOut { state: SessionState },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
