use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{
    capabilities::*, get_lenenc_bytes, get_lenenc_int, put_lenenc_int, status_flags, Packet,
};

/// MariaDB error codes the proxy produces itself.
#[allow(dead_code)]
pub mod error_codes {
    pub const ER_CON_COUNT_ERROR: u16 = 1040;
    pub const ER_BAD_HANDSHAKE: u16 = 1043;
    pub const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_BAD_DB_ERROR: u16 = 1049;
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
    pub const ER_PARSE_ERROR: u16 = 1064;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
    pub const ER_HOST_NOT_PRIVILEGED: u16 = 1130;
    pub const ER_ABORTING_CONNECTION: u16 = 1152;
    pub const ER_NET_PACKETS_OUT_OF_ORDER: u16 = 1156;
    pub const ER_NO_SUCH_THREAD: u16 = 1094;
    pub const ER_KILL_DENIED_ERROR: u16 = 1095;
    pub const ER_PLUGIN_IS_NOT_LOADED: u16 = 1524;
    pub const ER_CONNECTION_KILLED: u16 = 1927;
}

/// A session-state change reported in an OK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTrack {
    SystemVariable { name: String, value: String },
    Schema(String),
    StateChange,
    Gtid(String),
    TransactionCharacteristics(String),
    TransactionState(String),
    Other(u8),
}

/// OK packet, optionally carrying session-tracking data.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    pub session_track: Vec<SessionTrack>,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            status_flags: status_flags::SERVER_STATUS_AUTOCOMMIT,
            ..Self::default()
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & status_flags::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn in_readonly_transaction(&self) -> bool {
        self.status_flags & status_flags::SERVER_STATUS_IN_TRANS_READONLY != 0
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & status_flags::SERVER_MORE_RESULTS_EXIST != 0
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u64) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        if capabilities & CLIENT_SESSION_TRACK != 0 && !self.info.is_empty() {
            put_lenenc_int(&mut buf, self.info.len() as u64);
            buf.extend_from_slice(self.info.as_bytes());
        } else if !self.info.is_empty() {
            buf.extend_from_slice(self.info.as_bytes());
        }

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse from packet payload, decoding session-track entries when the
    /// capability was negotiated.
    pub fn parse(payload: &[u8], capabilities: u64) -> Option<Self> {
        if payload.first() != Some(&0x00) && payload.first() != Some(&0xFE) {
            return None;
        }
        let mut buf = &payload[1..];

        let affected_rows = get_lenenc_int(&mut buf)?;
        let last_insert_id = get_lenenc_int(&mut buf)?;

        let (status, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
            if buf.len() < 4 {
                return None;
            }
            (buf.get_u16_le(), buf.get_u16_le())
        } else {
            (0, 0)
        };

        let mut info = String::new();
        let mut session_track = Vec::new();

        if capabilities & CLIENT_SESSION_TRACK != 0 {
            if !buf.is_empty() {
                if let Some(bytes) = get_lenenc_bytes(&mut buf) {
                    info = String::from_utf8_lossy(&bytes).to_string();
                }
            }
            if status & status_flags::SERVER_SESSION_STATE_CHANGED != 0 && !buf.is_empty() {
                if let Some(block) = get_lenenc_bytes(&mut buf) {
                    session_track = parse_session_track(&block);
                }
            }
        } else if !buf.is_empty() {
            info = String::from_utf8_lossy(buf).to_string();
        }

        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags: status,
            warnings,
            info,
            session_track,
        })
    }
}

fn parse_session_track(mut block: &[u8]) -> Vec<SessionTrack> {
    let mut out = Vec::new();
    while !block.is_empty() {
        let ty = block[0];
        block.advance(1);
        let data = match get_lenenc_bytes(&mut block) {
            Some(d) => d,
            None => break,
        };
        let mut inner = &data[..];
        let entry = match ty {
            0x00 => {
                let name = get_lenenc_bytes(&mut inner);
                let value = get_lenenc_bytes(&mut inner);
                match (name, value) {
                    (Some(n), Some(v)) => SessionTrack::SystemVariable {
                        name: String::from_utf8_lossy(&n).to_string(),
                        value: String::from_utf8_lossy(&v).to_string(),
                    },
                    _ => SessionTrack::Other(ty),
                }
            }
            0x01 => match get_lenenc_bytes(&mut inner) {
                Some(schema) => {
                    SessionTrack::Schema(String::from_utf8_lossy(&schema).to_string())
                }
                None => SessionTrack::Other(ty),
            },
            0x02 => SessionTrack::StateChange,
            0x03 => match get_lenenc_bytes(&mut inner) {
                Some(gtid) => SessionTrack::Gtid(String::from_utf8_lossy(&gtid).to_string()),
                None => SessionTrack::Other(ty),
            },
            0x04 => match get_lenenc_bytes(&mut inner) {
                Some(c) => SessionTrack::TransactionCharacteristics(
                    String::from_utf8_lossy(&c).to_string(),
                ),
                None => SessionTrack::Other(ty),
            },
            0x05 => match get_lenenc_bytes(&mut inner) {
                Some(s) => {
                    SessionTrack::TransactionState(String::from_utf8_lossy(&s).to_string())
                }
                None => SessionTrack::Other(ty),
            },
            other => SessionTrack::Other(other),
        };
        out.push(entry);
    }
    out
}

/// ERR packet: `0xFF u16le(code) '#' sqlstate(5) message`.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.into(),
        }
    }

    pub fn access_denied(user: &str, host: &str, using_password: bool) -> Self {
        let pw = if using_password { "YES" } else { "NO" };
        Self::new(
            error_codes::ER_ACCESS_DENIED_ERROR,
            "28000",
            format!("Access denied for user '{user}'@'{host}' (using password: {pw})"),
        )
    }

    pub fn packets_out_of_order(expected: u8, got: u8) -> Self {
        Self::new(
            error_codes::ER_NET_PACKETS_OUT_OF_ORDER,
            "08S01",
            format!("Got packets out of order (expected {expected} but got {got})"),
        )
    }

    pub fn unknown_database(db: &str) -> Self {
        Self::new(
            error_codes::ER_BAD_DB_ERROR,
            "42000",
            format!("Unknown database '{db}'"),
        )
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u64) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            let state = if self.sql_state.len() == 5 {
                self.sql_state.as_bytes()
            } else {
                b"HY000"
            };
            buf.extend_from_slice(state);
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8], capabilities: u64) -> Option<Self> {
        if payload.first() != Some(&0xFF) {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) =
            if capabilities & CLIENT_PROTOCOL_41 != 0 && !buf.is_empty() && buf[0] == b'#' {
                buf.advance(1);
                if buf.len() >= 5 {
                    let sql_state = String::from_utf8_lossy(&buf[..5]).to_string();
                    buf.advance(5);
                    (sql_state, String::from_utf8_lossy(buf).to_string())
                } else {
                    ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
                }
            } else {
                ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
            };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Check if payload is an OK packet.
pub fn is_ok_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0x00
}

/// Check if payload is an ERR packet.
pub fn is_err_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

/// Check if payload is an EOF packet. With DEPRECATE_EOF the 0xFE marker
/// introduces an OK packet instead.
pub fn is_eof_packet(payload: &Bytes, capabilities: u64) -> bool {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        false
    } else {
        !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
    }
}

/// Check if payload is an OK packet in its 0xFE disguise (DEPRECATE_EOF).
pub fn is_eof_ok_packet(payload: &Bytes, capabilities: u64) -> bool {
    capabilities & CLIENT_DEPRECATE_EOF != 0
        && !payload.is_empty()
        && payload[0] == 0xFE
        && payload.len() < super::packet::MAX_PACKET_SIZE
        && payload.len() >= 7
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS: u64 = CLIENT_PROTOCOL_41 | CLIENT_SESSION_TRACK;

    #[test]
    fn ok_roundtrip() {
        let ok = OkPacket {
            affected_rows: 3,
            last_insert_id: 7,
            status_flags: status_flags::SERVER_STATUS_AUTOCOMMIT,
            warnings: 1,
            info: String::new(),
            session_track: vec![],
        };
        let packet = ok.encode(2, CAPS);
        assert_eq!(packet.sequence_id, 2);

        let parsed = OkPacket::parse(&packet.payload, CAPS).unwrap();
        assert_eq!(parsed.affected_rows, 3);
        assert_eq!(parsed.last_insert_id, 7);
        assert_eq!(parsed.warnings, 1);
        assert!(!parsed.in_transaction());
    }

    #[test]
    fn ok_with_schema_track() {
        // Hand-built OK with a schema change entry.
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        buf.put_u8(0); // affected rows
        buf.put_u8(0); // insert id
        buf.put_u16_le(status_flags::SERVER_SESSION_STATE_CHANGED);
        buf.put_u16_le(0);
        buf.put_u8(0); // empty info
        let mut track = BytesMut::new();
        track.put_u8(0x01);
        track.put_u8(6); // entry length
        track.put_u8(5); // schema name length
        track.extend_from_slice(b"sales");
        put_lenenc_int(&mut buf, track.len() as u64);
        buf.extend_from_slice(&track);

        let parsed = OkPacket::parse(&buf, CAPS).unwrap();
        assert_eq!(
            parsed.session_track,
            vec![SessionTrack::Schema("sales".to_string())]
        );
    }

    #[test]
    fn err_roundtrip() {
        let err = ErrPacket::packets_out_of_order(1, 2);
        let packet = err.encode(1, CAPS);

        let parsed = ErrPacket::parse(&packet.payload, CAPS).unwrap();
        assert_eq!(parsed.error_code, 1156);
        assert_eq!(parsed.sql_state, "08S01");
        assert!(parsed.error_message.contains("out of order"));
    }

    #[test]
    fn classification_helpers() {
        let ok = Bytes::from_static(&[0x00, 0, 0, 2, 0, 0, 0]);
        let err = Bytes::from_static(&[0xFF, 0, 0]);
        let eof = Bytes::from_static(&[0xFE, 0, 0, 2, 0]);

        assert!(is_ok_packet(&ok));
        assert!(is_err_packet(&err));
        assert!(is_eof_packet(&eof, CLIENT_PROTOCOL_41));
        assert!(!is_eof_packet(&eof, CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF));
        assert!(is_eof_ok_packet(
            &Bytes::from_static(&[0xFE, 0, 0, 2, 0, 0, 0]),
            CLIENT_DEPRECATE_EOF
        ));
    }
}
