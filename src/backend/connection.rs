//! Backend-side protocol state machine.
//!
//! Mirrors the client connection but in the client role: connect,
//! authenticate with the session's backend credentials, then relay
//! commands and collect complete replies. A fresh connection replays the
//! session-command history as one pipeline before routing anything new.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::auth::BackendCredentials;
use crate::protocol::{
    capabilities, get_lenenc_int, is_err_packet, is_ok_packet, split_into_frames,
    AssembleResult, AuthSwitchRequest, Command, ErrPacket, HandshakeResponse, InitialHandshake,
    LogicalPacket, OkPacket, Packet, PacketAssembler, PacketCodec, SessionTrack,
};
use crate::target::Server;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("backend authentication failed: {0}")]
    Auth(String),
    #[error("backend closed the connection")]
    Disconnected,
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

impl BackendError {
    /// Transient failures may be recovered by reconnect + replay without
    /// the client noticing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Connect(_) | BackendError::Io(_) | BackendError::Disconnected
        )
    }
}

/// The shape of the reply a routed command produces; drives the reply
/// collector's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// OK, ERR or a resultset (possibly multi-result).
    Generic,
    /// COM_STMT_PREPARE: prepare-ok header plus definition blocks.
    Prepare { proxy_statement_id: u32 },
    /// COM_FIELD_LIST: column definitions terminated by EOF.
    FieldList,
    /// COM_STATISTICS: one bare string packet.
    Statistics,
}

/// What a complete reply amounted to.
#[derive(Debug, Clone)]
pub enum ReplyKind {
    Ok(OkPacket),
    Err(ErrPacket),
    ResultSet { row_count: usize },
    PrepareOk {
        statement_id: u32,
        num_params: u16,
        num_columns: u16,
    },
    Raw,
}

/// One complete logical reply: every frame, plus digested metadata.
#[derive(Debug, Clone)]
pub struct Reply {
    pub frames: Vec<Packet>,
    pub kind: ReplyKind,
    pub session_track: Vec<SessionTrack>,
    /// Status flags from the terminating OK/EOF, when present.
    pub status_flags: u16,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        matches!(self.kind, ReplyKind::Ok(_) | ReplyKind::PrepareOk { .. })
    }

    pub fn is_err(&self) -> bool {
        matches!(self.kind, ReplyKind::Err(_))
    }

    /// A stable digest for comparing replies from different backends.
    pub fn outcome_digest(&self) -> (bool, u16, u64) {
        match &self.kind {
            ReplyKind::Ok(ok) => (true, 0, ok.affected_rows),
            ReplyKind::PrepareOk { .. } => (true, 0, 0),
            ReplyKind::Err(err) => (false, err.error_code, 0),
            ReplyKind::ResultSet { row_count } => (true, 0, *row_count as u64),
            ReplyKind::Raw => (true, 0, 0),
        }
    }
}

pub struct BackendConnection {
    framed: Framed<TcpStream, PacketCodec>,
    server: Arc<Server>,
    capabilities: u64,
    thread_id: u32,
    credentials_key: String,
    /// Reply shapes for routed commands not yet answered, oldest first.
    pending: VecDeque<(ReplyShape, Instant)>,
    /// proxy statement id -> backend statement id.
    statement_ids: HashMap<u32, u32>,
    created_at: Instant,
    last_used: Instant,
}

impl BackendConnection {
    /// Connect and authenticate.
    pub async fn connect(
        server: Arc<Server>,
        credentials: &BackendCredentials,
        database: Option<&str>,
    ) -> Result<Self, BackendError> {
        let (mut framed, handshake) = Self::open(&server).await?;

        let mut caps = backend_capabilities(handshake.capabilities);
        if database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capabilities: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: credentials.username().to_string(),
            auth_response: credentials.compute_token(&handshake.scramble),
            database: database.map(str::to_string),
            auth_plugin_name: handshake.auth_plugin_name.clone(),
            attributes: vec![],
        };
        framed.send(response.encode(1)).await?;

        let mut reply = framed.next().await.ok_or(BackendError::Disconnected)??;

        if let Some(switch) = AuthSwitchRequest::parse(&reply.payload) {
            let token = credentials.compute_token(&switch.plugin_data);
            framed
                .send(Packet::new(reply.sequence_id.wrapping_add(1), token))
                .await?;
            reply = framed.next().await.ok_or(BackendError::Disconnected)??;
        }

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload, caps)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            return Err(BackendError::Auth(err.error_message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(BackendError::Protocol(
                "expected OK after backend handshake".into(),
            ));
        }

        server.update_handshake_info(&handshake.server_version, handshake.capabilities);
        server.connection_opened();
        debug!(
            server = server.name(),
            thread_id = handshake.connection_id,
            "backend connection established"
        );

        let now = Instant::now();
        Ok(Self {
            framed,
            server,
            capabilities: caps,
            thread_id: handshake.connection_id,
            credentials_key: credentials.pool_key(),
            pending: VecDeque::new(),
            statement_ids: HashMap::new(),
            created_at: now,
            last_used: now,
        })
    }

    /// TCP connect and read the server handshake without authenticating.
    /// Passthrough authentication uses this to relay the backend's
    /// scramble to the client.
    pub async fn open(
        server: &Arc<Server>,
    ) -> Result<(Framed<TcpStream, PacketCodec>, InitialHandshake), BackendError> {
        let stream = TcpStream::connect(server.address())
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        let mut framed = Framed::new(stream, PacketCodec);

        let packet = framed.next().await.ok_or(BackendError::Disconnected)??;
        let handshake = InitialHandshake::parse(&packet.payload)
            .ok_or_else(|| BackendError::Protocol("invalid backend handshake".into()))?;
        Ok((framed, handshake))
    }

    /// Complete a passthrough authentication: forward the client's own
    /// handshake response and return the backend's verdict packet. On OK
    /// the connection is usable.
    pub async fn authenticate_passthrough(
        server: Arc<Server>,
        mut framed: Framed<TcpStream, PacketCodec>,
        handshake: InitialHandshake,
        mut response: HandshakeResponse,
        credentials_key: String,
    ) -> Result<(Packet, Option<Self>), BackendError> {
        response.capabilities = backend_capabilities(handshake.capabilities)
            | (response.capabilities & capabilities::CLIENT_CONNECT_WITH_DB);
        framed.send(response.encode(1)).await?;

        let reply = framed.next().await.ok_or(BackendError::Disconnected)??;
        if is_ok_packet(&reply.payload) {
            server.update_handshake_info(&handshake.server_version, handshake.capabilities);
            server.connection_opened();
            let now = Instant::now();
            let conn = Self {
                framed,
                server,
                capabilities: backend_capabilities(handshake.capabilities),
                thread_id: handshake.connection_id,
                credentials_key,
                pending: VecDeque::new(),
                statement_ids: HashMap::new(),
                created_at: now,
                last_used: now,
            };
            Ok((reply, Some(conn)))
        } else {
            Ok((reply, None))
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn capabilities(&self) -> u64 {
        self.capabilities
    }

    pub fn credentials_key(&self) -> &str {
        &self.credentials_key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn outstanding_replies(&self) -> usize {
        self.pending.len()
    }

    /// Send one logical command. The payload includes the command byte;
    /// frames are numbered from zero as on every command boundary.
    pub async fn send_command(
        &mut self,
        payload: Bytes,
        shape: ReplyShape,
    ) -> Result<(), BackendError> {
        let payload = self.map_statement_id(payload)?;
        let (frames, _) = split_into_frames(payload, 0);
        for frame in frames {
            self.framed.feed(frame).await?;
        }
        SinkExt::<Packet>::flush(&mut self.framed).await?;

        self.last_used = Instant::now();
        self.pending.push_back((shape, Instant::now()));
        self.server.operation_started();
        Ok(())
    }

    /// Send a command that produces no reply (QUIT, STMT_CLOSE, ...).
    pub async fn send_no_response(&mut self, payload: Bytes) -> Result<(), BackendError> {
        let payload = self.map_statement_id(payload)?;
        let (frames, _) = split_into_frames(payload, 0);
        for frame in frames {
            self.framed.feed(frame).await?;
        }
        SinkExt::<Packet>::flush(&mut self.framed).await?;
        self.last_used = Instant::now();
        Ok(())
    }

    /// Rewrite the statement id of statement commands from the proxy's id
    /// space to this backend's. Forgets mappings on COM_STMT_CLOSE.
    fn map_statement_id(&mut self, payload: Bytes) -> Result<Bytes, BackendError> {
        let Some(command) = payload.first().map(|b| Command::from(*b)) else {
            return Ok(payload);
        };
        let needs_mapping = matches!(
            command,
            Command::StmtExecute
                | Command::StmtClose
                | Command::StmtReset
                | Command::StmtFetch
                | Command::StmtSendLongData
        );
        if !needs_mapping {
            return Ok(payload);
        }
        if payload.len() < 5 {
            return Err(BackendError::Protocol("short statement command".into()));
        }

        let proxy_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let backend_id = match self.statement_ids.get(&proxy_id) {
            Some(id) => *id,
            None => {
                return Err(BackendError::Protocol(format!(
                    "statement {proxy_id} is not prepared on server '{}'",
                    self.server.name()
                )))
            }
        };
        if command == Command::StmtClose {
            self.statement_ids.remove(&proxy_id);
        }

        let mut rewritten = BytesMut::from(&payload[..]);
        rewritten[1..5].copy_from_slice(&backend_id.to_le_bytes());
        Ok(rewritten.freeze())
    }

    /// Read the next complete reply. Frames come back exactly as received
    /// except that prepare-ok statement ids are rewritten into the
    /// proxy's id space.
    pub async fn read_reply(&mut self) -> Result<Reply, BackendError> {
        let (shape, started) = self
            .pending
            .pop_front()
            .ok_or_else(|| BackendError::Protocol("reply without outstanding request".into()))?;

        let result = self.collect_reply(shape).await;
        self.server.operation_finished(started.elapsed());
        self.last_used = Instant::now();
        result
    }

    async fn collect_reply(&mut self, shape: ReplyShape) -> Result<Reply, BackendError> {
        let mut frames = Vec::new();
        let mut next_seq = 1u8;

        match shape {
            ReplyShape::Statistics => {
                let packet = self.read_logical(&mut next_seq, &mut frames).await?;
                let _ = packet;
                Ok(Reply {
                    frames,
                    kind: ReplyKind::Raw,
                    session_track: vec![],
                    status_flags: 0,
                })
            }
            ReplyShape::FieldList => {
                loop {
                    let packet = self.read_logical(&mut next_seq, &mut frames).await?;
                    if is_err_packet(&packet.payload) {
                        let err = self.parse_err(&packet)?;
                        return Ok(Reply {
                            frames,
                            kind: ReplyKind::Err(err),
                            session_track: vec![],
                            status_flags: 0,
                        });
                    }
                    if self.is_terminator(&packet.payload) {
                        return Ok(Reply {
                            frames,
                            kind: ReplyKind::Raw,
                            session_track: vec![],
                            status_flags: 0,
                        });
                    }
                }
            }
            ReplyShape::Prepare { proxy_statement_id } => {
                self.collect_prepare(proxy_statement_id, &mut next_seq, frames)
                    .await
            }
            ReplyShape::Generic => self.collect_generic(&mut next_seq, frames).await,
        }
    }

    async fn collect_generic(
        &mut self,
        next_seq: &mut u8,
        mut frames: Vec<Packet>,
    ) -> Result<Reply, BackendError> {
        let mut total_rows = 0usize;
        let mut kind = ReplyKind::Raw;
        let mut session_track = Vec::new();
        let mut status_flags = 0u16;

        loop {
            let first = self.read_logical(next_seq, &mut frames).await?;

            if is_err_packet(&first.payload) {
                let err = self.parse_err(&first)?;
                return Ok(Reply {
                    frames,
                    kind: ReplyKind::Err(err),
                    session_track,
                    status_flags,
                });
            }

            if is_ok_packet(&first.payload) {
                let ok = OkPacket::parse(&first.payload, self.capabilities)
                    .ok_or_else(|| BackendError::Protocol("bad OK packet".into()))?;
                status_flags = ok.status_flags;
                session_track.extend(ok.session_track.iter().cloned());
                let more = ok.more_results();
                kind = ReplyKind::Ok(ok);
                if more {
                    continue;
                }
                return Ok(Reply {
                    frames,
                    kind,
                    session_track,
                    status_flags,
                });
            }

            // Some commands answer with a bare EOF (or its OK disguise).
            if first.payload.first() == Some(&0xFE) {
                if self.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0 {
                    if let Some(ok) = OkPacket::parse(&first.payload, self.capabilities) {
                        status_flags = ok.status_flags;
                        session_track.extend(ok.session_track.iter().cloned());
                        kind = ReplyKind::Ok(ok);
                    }
                } else {
                    status_flags = terminator_status(&first.payload, self.capabilities);
                }
                return Ok(Reply {
                    frames,
                    kind,
                    session_track,
                    status_flags,
                });
            }

            // Resultset.
            let mut head = &first.payload[..];
            let column_count = get_lenenc_int(&mut head)
                .ok_or_else(|| BackendError::Protocol("bad column count".into()))?
                as usize;

            for _ in 0..column_count {
                self.read_logical(next_seq, &mut frames).await?;
            }
            if self.capabilities & capabilities::CLIENT_DEPRECATE_EOF == 0 {
                self.read_logical(next_seq, &mut frames).await?;
            }

            let (rows, flags, more) = self.read_rows(next_seq, &mut frames).await?;
            total_rows += rows;
            status_flags = flags;
            kind = ReplyKind::ResultSet {
                row_count: total_rows,
            };
            if !more {
                return Ok(Reply {
                    frames,
                    kind,
                    session_track,
                    status_flags,
                });
            }
        }
    }

    /// Rows until the terminator. Returns (row count, status, more results).
    async fn read_rows(
        &mut self,
        next_seq: &mut u8,
        frames: &mut Vec<Packet>,
    ) -> Result<(usize, u16, bool), BackendError> {
        let mut rows = 0usize;
        loop {
            let packet = self.read_logical(next_seq, frames).await?;
            if is_err_packet(&packet.payload) {
                return Ok((rows, 0, false));
            }
            if self.is_terminator(&packet.payload) {
                let status = terminator_status(&packet.payload, self.capabilities);
                let more = status & crate::protocol::status_flags::SERVER_MORE_RESULTS_EXIST != 0;
                return Ok((rows, status, more));
            }
            rows += 1;
        }
    }

    async fn collect_prepare(
        &mut self,
        proxy_statement_id: u32,
        next_seq: &mut u8,
        mut frames: Vec<Packet>,
    ) -> Result<Reply, BackendError> {
        let first = self.read_logical(next_seq, &mut frames).await?;

        if is_err_packet(&first.payload) {
            let err = self.parse_err(&first)?;
            return Ok(Reply {
                frames,
                kind: ReplyKind::Err(err),
                session_track: vec![],
                status_flags: 0,
            });
        }

        if first.payload.len() < 12 || first.payload[0] != 0x00 {
            return Err(BackendError::Protocol("bad prepare-ok packet".into()));
        }

        let backend_id = u32::from_le_bytes([
            first.payload[1],
            first.payload[2],
            first.payload[3],
            first.payload[4],
        ]);
        let num_columns = u16::from_le_bytes([first.payload[5], first.payload[6]]) as usize;
        let num_params = u16::from_le_bytes([first.payload[7], first.payload[8]]) as usize;

        self.statement_ids.insert(proxy_statement_id, backend_id);

        // Rewrite the id in the frame the client will see.
        let last = frames.len() - 1;
        let mut payload = BytesMut::from(&frames[last].payload[..]);
        payload[1..5].copy_from_slice(&proxy_statement_id.to_le_bytes());
        frames[last].payload = payload.freeze();

        let with_eof = self.capabilities & capabilities::CLIENT_DEPRECATE_EOF == 0;
        if num_params > 0 {
            for _ in 0..num_params {
                self.read_logical(next_seq, &mut frames).await?;
            }
            if with_eof {
                self.read_logical(next_seq, &mut frames).await?;
            }
        }
        if num_columns > 0 {
            for _ in 0..num_columns {
                self.read_logical(next_seq, &mut frames).await?;
            }
            if with_eof {
                self.read_logical(next_seq, &mut frames).await?;
            }
        }

        Ok(Reply {
            frames,
            kind: ReplyKind::PrepareOk {
                statement_id: proxy_statement_id,
                num_params: num_params as u16,
                num_columns: num_columns as u16,
            },
            session_track: vec![],
            status_flags: 0,
        })
    }

    fn parse_err(&self, packet: &LogicalPacket) -> Result<ErrPacket, BackendError> {
        ErrPacket::parse(&packet.payload, self.capabilities)
            .ok_or_else(|| BackendError::Protocol("bad ERR packet".into()))
    }

    fn is_terminator(&self, payload: &Bytes) -> bool {
        if payload.first() != Some(&0xFE) {
            return false;
        }
        if self.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0 {
            payload.len() >= 7
        } else {
            payload.len() < 9
        }
    }

    async fn read_logical(
        &mut self,
        next_seq: &mut u8,
        frames: &mut Vec<Packet>,
    ) -> Result<LogicalPacket, BackendError> {
        let mut assembler = PacketAssembler::new();
        loop {
            let frame = self
                .framed
                .next()
                .await
                .ok_or(BackendError::Disconnected)??;
            frames.push(frame.clone());
            match assembler
                .push(frame, *next_seq)
                .map_err(|e| BackendError::Protocol(e.to_string()))?
            {
                AssembleResult::Complete(lp) => {
                    *next_seq = lp.last_seq.wrapping_add(1);
                    return Ok(lp);
                }
                AssembleResult::NeedMore => {
                    *next_seq = next_seq.wrapping_add(1);
                }
            }
        }
    }

    /// Execute the session-command history as one pipeline: write every
    /// command, then collect the replies in order.
    pub async fn replay_history(
        &mut self,
        entries: &[(u32, Bytes, ReplyShape)],
    ) -> Result<Vec<(u32, Reply)>, BackendError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            server = self.server.name(),
            commands = entries.len(),
            "replaying session command history"
        );

        for (_, payload, shape) in entries {
            self.send_command(payload.clone(), *shape).await?;
        }

        let mut results = Vec::with_capacity(entries.len());
        for (id, _, _) in entries {
            let reply = self.read_reply().await?;
            if reply.is_err() {
                warn!(
                    server = self.server.name(),
                    history_id = id,
                    "session command failed during replay"
                );
            }
            results.push((*id, reply));
        }
        Ok(results)
    }

    /// Run COM_CHANGE_USER with new credentials. The server answers with
    /// an auth-switch carrying a fresh scramble; the token is computed
    /// against that. Prepared statements die with the old user.
    pub async fn change_user(
        &mut self,
        credentials: &BackendCredentials,
        database: Option<&str>,
    ) -> Result<Reply, BackendError> {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&[Command::ChangeUser as u8]);
        payload.extend_from_slice(credentials.username().as_bytes());
        payload.extend_from_slice(&[0, 0]); // NUL + empty token
        if let Some(db) = database {
            payload.extend_from_slice(db.as_bytes());
        }
        payload.extend_from_slice(&[0]);
        payload.extend_from_slice(&0x21u16.to_le_bytes());
        payload.extend_from_slice(crate::protocol::DEFAULT_AUTH_PLUGIN.as_bytes());
        payload.extend_from_slice(&[0]);

        let (frames, _) = split_into_frames(payload.freeze(), 0);
        for frame in frames {
            self.framed.feed(frame).await?;
        }
        SinkExt::<Packet>::flush(&mut self.framed).await?;

        let mut reply = self.framed.next().await.ok_or(BackendError::Disconnected)??;
        if let Some(switch) = AuthSwitchRequest::parse(&reply.payload) {
            let token = credentials.compute_token(&switch.plugin_data);
            self.framed
                .send(Packet::new(reply.sequence_id.wrapping_add(1), token))
                .await?;
            reply = self.framed.next().await.ok_or(BackendError::Disconnected)??;
        }

        let kind = if is_ok_packet(&reply.payload) {
            self.statement_ids.clear();
            self.credentials_key = credentials.pool_key();
            ReplyKind::Ok(
                OkPacket::parse(&reply.payload, self.capabilities)
                    .ok_or_else(|| BackendError::Protocol("bad OK packet".into()))?,
            )
        } else if is_err_packet(&reply.payload) {
            ReplyKind::Err(self.parse_err(&LogicalPacket {
                payload: reply.payload.clone(),
                first_seq: reply.sequence_id,
                last_seq: reply.sequence_id,
            })?)
        } else {
            return Err(BackendError::Protocol(
                "unexpected packet after COM_CHANGE_USER".into(),
            ));
        };

        self.last_used = Instant::now();
        Ok(Reply {
            frames: vec![reply],
            kind,
            session_track: vec![],
            status_flags: 0,
        })
    }

    /// Close by sending COM_QUIT; errors are ignored, the socket is going
    /// away either way.
    pub async fn quit(mut self) {
        let _ = self
            .framed
            .send(Packet::new(0, Bytes::from_static(&[0x01])))
            .await;
        self.server.connection_closed();
        // Outstanding operations will never finish.
        for _ in 0..self.pending.len() {
            self.server
                .operation_finished(std::time::Duration::from_secs(0));
        }
        self.pending.clear();
    }
}

/// Capabilities requested from backends. The proxy talks the EOF-less
/// protocol to servers that support it and never asks for compression or
/// LOCAL INFILE.
fn backend_capabilities(server_caps: u64) -> u64 {
    let wanted = capabilities::CLIENT_PROTOCOL_41
        | capabilities::CLIENT_SECURE_CONNECTION
        | capabilities::CLIENT_PLUGIN_AUTH
        | capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | capabilities::CLIENT_TRANSACTIONS
        | capabilities::CLIENT_MULTI_STATEMENTS
        | capabilities::CLIENT_MULTI_RESULTS
        | capabilities::CLIENT_PS_MULTI_RESULTS
        | capabilities::CLIENT_SESSION_TRACK
        | capabilities::CLIENT_DEPRECATE_EOF;
    wanted & server_caps
}

fn terminator_status(payload: &Bytes, caps: u64) -> u16 {
    if caps & capabilities::CLIENT_DEPRECATE_EOF != 0 {
        // OK packet in EOF disguise; status lives after the lenenc ints.
        OkPacket::parse(payload, caps)
            .map(|ok| ok.status_flags)
            .unwrap_or(0)
    } else if payload.len() >= 5 {
        u16::from_le_bytes([payload[3], payload[4]])
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_caps_are_masked_by_server() {
        let server = capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_SECURE_CONNECTION;
        let caps = backend_capabilities(server);
        assert_eq!(
            caps,
            capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_SECURE_CONNECTION
        );
        assert_eq!(caps & capabilities::CLIENT_DEPRECATE_EOF, 0);
    }

    #[test]
    fn terminator_status_eof_form() {
        // EOF: 0xFE, warnings u16, status u16.
        let payload = Bytes::from_static(&[0xFE, 0, 0, 0x08, 0x00]);
        let status = terminator_status(&payload, capabilities::CLIENT_PROTOCOL_41);
        assert_eq!(
            status,
            crate::protocol::status_flags::SERVER_MORE_RESULTS_EXIST
        );
    }

    #[test]
    fn reply_digest_distinguishes_outcomes() {
        let ok = Reply {
            frames: vec![],
            kind: ReplyKind::Ok(OkPacket {
                affected_rows: 2,
                ..OkPacket::new()
            }),
            session_track: vec![],
            status_flags: 0,
        };
        let err = Reply {
            frames: vec![],
            kind: ReplyKind::Err(ErrPacket::new(1064, "42000", "syntax")),
            session_track: vec![],
            status_flags: 0,
        };
        assert_ne!(ok.outcome_digest(), err.outcome_digest());
        assert!(ok.is_ok());
        assert!(err.is_err());
    }
}
