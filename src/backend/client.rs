//! A minimal self-contained client connection.
//!
//! Used where the proxy itself needs to run SQL against a backend: the
//! user-account fetcher and the auxiliary KILL path. Speaks the text
//! protocol only and never enters a pool.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::protocol::{
    capabilities, compute_auth_token, get_lenenc_int, is_err_packet, is_ok_packet,
    AssembleResult, AuthSwitchRequest, ErrPacket, HandshakeResponse, InitialHandshake,
    LogicalPacket, OkPacket, Packet, PacketAssembler, PacketCodec, DEFAULT_AUTH_PLUGIN,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },
    #[error("connection closed by server")]
    Disconnected,
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

/// One text-protocol resultset.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// Outcome of a single statement inside a (multi-)query.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Rows(ResultSet),
    Done(OkPacket),
    Failed(ErrPacket),
}

impl QueryOutcome {
    pub fn rows(&self) -> Option<&ResultSet> {
        match self {
            QueryOutcome::Rows(rs) => Some(rs),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrPacket> {
        match self {
            QueryOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Capabilities the local client asks for. EOF-terminated resultsets keep
/// the parser single-path.
const LOCAL_CLIENT_CAPS: u64 = capabilities::CLIENT_PROTOCOL_41
    | capabilities::CLIENT_SECURE_CONNECTION
    | capabilities::CLIENT_PLUGIN_AUTH
    | capabilities::CLIENT_MULTI_STATEMENTS
    | capabilities::CLIENT_MULTI_RESULTS
    | capabilities::CLIENT_TRANSACTIONS;

pub struct LocalClient {
    framed: Framed<TcpStream, PacketCodec>,
    capabilities: u64,
    /// Connection id the server assigned; the thread id KILL needs.
    pub thread_id: u32,
    pub server_version: String,
    pub server_capabilities: u64,
}

impl LocalClient {
    /// Connect and authenticate with the given credentials.
    pub async fn connect(
        addr: &str,
        user: &str,
        password: &str,
        database: Option<&str>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let mut framed = Framed::new(stream, PacketCodec);

        let handshake_packet = framed
            .next()
            .await
            .ok_or(ClientError::Disconnected)??;
        let handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ClientError::Protocol("invalid server handshake".into()))?;

        debug!(
            addr = %addr,
            server_version = %handshake.server_version,
            "connected to backend"
        );

        let mut caps = LOCAL_CLIENT_CAPS & handshake.capabilities;
        if database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let auth_response = compute_auth_token(password, &handshake.scramble);
        let response = HandshakeResponse {
            capabilities: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: user.to_string(),
            auth_response,
            database: database.map(str::to_string),
            auth_plugin_name: handshake.auth_plugin_name.clone(),
            attributes: vec![],
        };
        framed.send(response.encode(1)).await?;

        let mut reply = framed.next().await.ok_or(ClientError::Disconnected)??;

        // The server may ask to redo the exchange with another plugin.
        if let Some(switch) = AuthSwitchRequest::parse(&reply.payload) {
            if switch.plugin_name != DEFAULT_AUTH_PLUGIN {
                return Err(ClientError::Auth(format!(
                    "server requested unsupported plugin '{}'",
                    switch.plugin_name
                )));
            }
            let token = compute_auth_token(password, &switch.plugin_data);
            framed
                .send(Packet::new(reply.sequence_id.wrapping_add(1), token))
                .await?;
            reply = framed.next().await.ok_or(ClientError::Disconnected)??;
        }

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload, caps)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            return Err(ClientError::Auth(err.error_message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(ClientError::Protocol("expected OK after handshake".into()));
        }

        Ok(Self {
            framed,
            capabilities: caps,
            thread_id: handshake.connection_id,
            server_version: handshake.server_version,
            server_capabilities: handshake.capabilities,
        })
    }

    /// Run one statement, discarding any rows. Returns the final OK.
    pub async fn execute(&mut self, sql: &str) -> Result<OkPacket, ClientError> {
        let outcomes = self.multi_query(&[sql]).await?;
        match outcomes.into_iter().next() {
            Some(QueryOutcome::Done(ok)) => Ok(ok),
            Some(QueryOutcome::Rows(_)) => Ok(OkPacket::new()),
            Some(QueryOutcome::Failed(err)) => Err(ClientError::Server {
                code: err.error_code,
                message: err.error_message,
            }),
            None => Err(ClientError::Protocol("no response".into())),
        }
    }

    /// Run one statement and return its rows.
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet, ClientError> {
        let outcomes = self.multi_query(&[sql]).await?;
        match outcomes.into_iter().next() {
            Some(QueryOutcome::Rows(rs)) => Ok(rs),
            Some(QueryOutcome::Done(_)) => Ok(ResultSet::default()),
            Some(QueryOutcome::Failed(err)) => Err(ClientError::Server {
                code: err.error_code,
                message: err.error_message,
            }),
            None => Err(ClientError::Protocol("no response".into())),
        }
    }

    /// Send several statements as one batched multi-query and collect the
    /// outcome of each. A failed statement aborts the rest server-side;
    /// the returned list is then shorter than the input.
    pub async fn multi_query(&mut self, statements: &[&str]) -> Result<Vec<QueryOutcome>, ClientError> {
        let joined = statements.join("; ");
        let mut payload = BytesMut::with_capacity(joined.len() + 1);
        payload.extend_from_slice(&[0x03]); // COM_QUERY
        payload.extend_from_slice(joined.as_bytes());
        self.framed.send(Packet::new(0, payload.freeze())).await?;

        let mut outcomes = Vec::new();
        let mut next_seq = 1u8;

        loop {
            let (outcome, more, seq) = self.read_result(next_seq).await?;
            next_seq = seq;
            let failed = matches!(outcome, QueryOutcome::Failed(_));
            outcomes.push(outcome);
            if failed || !more {
                break;
            }
        }

        Ok(outcomes)
    }

    /// Read one complete result (OK, ERR or a resultset). Returns the
    /// outcome, whether more results follow and the next expected
    /// sequence number.
    async fn read_result(
        &mut self,
        mut next_seq: u8,
    ) -> Result<(QueryOutcome, bool, u8), ClientError> {
        let first = self.read_logical(&mut next_seq).await?;

        if is_err_packet(&first.payload) {
            let err = ErrPacket::parse(&first.payload, self.capabilities)
                .ok_or_else(|| ClientError::Protocol("bad ERR packet".into()))?;
            return Ok((QueryOutcome::Failed(err), false, next_seq));
        }

        if is_ok_packet(&first.payload) {
            let ok = OkPacket::parse(&first.payload, self.capabilities)
                .ok_or_else(|| ClientError::Protocol("bad OK packet".into()))?;
            let more = ok.more_results();
            return Ok((QueryOutcome::Done(ok), more, next_seq));
        }

        // Resultset: column count, column definitions, EOF, rows, EOF.
        let mut head = &first.payload[..];
        let column_count = get_lenenc_int(&mut head)
            .ok_or_else(|| ClientError::Protocol("bad column count".into()))?
            as usize;

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let def = self.read_logical(&mut next_seq).await?;
            columns.push(column_name(&def.payload));
        }

        // EOF after column definitions.
        let _ = self.read_logical(&mut next_seq).await?;

        let mut rows = Vec::new();
        let (more, final_seq) = loop {
            let packet = self.read_logical(&mut next_seq).await?;
            if is_err_packet(&packet.payload) {
                let err = ErrPacket::parse(&packet.payload, self.capabilities)
                    .ok_or_else(|| ClientError::Protocol("bad ERR packet".into()))?;
                return Ok((QueryOutcome::Failed(err), false, next_seq));
            }
            if packet.payload.first() == Some(&0xFE) && packet.payload.len() < 9 {
                // Terminating EOF: warnings u16, status u16.
                let more = if packet.payload.len() >= 5 {
                    let status = u16::from_le_bytes([packet.payload[3], packet.payload[4]]);
                    status & crate::protocol::status_flags::SERVER_MORE_RESULTS_EXIST != 0
                } else {
                    false
                };
                break (more, next_seq);
            }
            rows.push(parse_text_row(&packet.payload, column_count)?);
        };

        Ok((
            QueryOutcome::Rows(ResultSet { columns, rows }),
            more,
            final_seq,
        ))
    }

    async fn read_logical(&mut self, next_seq: &mut u8) -> Result<LogicalPacket, ClientError> {
        let mut assembler = PacketAssembler::new();
        loop {
            let frame = self
                .framed
                .next()
                .await
                .ok_or(ClientError::Disconnected)??;
            match assembler
                .push(frame, *next_seq)
                .map_err(|e| ClientError::Protocol(e.to_string()))?
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
}

/// Pull the column name out of a column-definition packet: the fifth
/// length-encoded string (catalog, schema, table, org_table, name).
fn column_name(payload: &Bytes) -> String {
    let mut buf = &payload[..];
    for _ in 0..4 {
        if crate::protocol::get_lenenc_bytes(&mut buf).is_none() {
            return String::new();
        }
    }
    crate::protocol::get_lenenc_bytes(&mut buf)
        .map(|b| String::from_utf8_lossy(&b).to_string())
        .unwrap_or_default()
}

fn parse_text_row(payload: &Bytes, column_count: usize) -> Result<Vec<Option<String>>, ClientError> {
    let mut buf = &payload[..];
    let mut row = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        if buf.first() == Some(&0xFB) {
            use bytes::Buf;
            buf.advance(1);
            row.push(None);
        } else {
            let value = crate::protocol::get_lenenc_bytes(&mut buf)
                .ok_or_else(|| ClientError::Protocol("truncated row".into()))?;
            row.push(Some(String::from_utf8_lossy(&value).to_string()));
        }
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_row_with_nulls() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[5]);
        buf.extend_from_slice(b"alice");
        buf.extend_from_slice(&[0xFB]);
        buf.extend_from_slice(&[1]);
        buf.extend_from_slice(b"Y");

        let row = parse_text_row(&buf.freeze(), 3).unwrap();
        assert_eq!(row[0].as_deref(), Some("alice"));
        assert_eq!(row[1], None);
        assert_eq!(row[2].as_deref(), Some("Y"));
    }

    #[test]
    fn truncated_row_is_error() {
        let buf = Bytes::from_static(&[200]); // claims 200 bytes, has none
        assert!(parse_text_row(&buf, 1).is_err());
    }

    #[test]
    fn column_name_extraction() {
        let mut buf = BytesMut::new();
        for field in [&b"def"[..], b"sales", b"users", b"users", b"username"] {
            buf.extend_from_slice(&[field.len() as u8]);
            buf.extend_from_slice(field);
        }
        assert_eq!(column_name(&buf.freeze()), "username");
    }
}
