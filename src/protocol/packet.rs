use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MariaDB packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1). A logical packet whose payload
/// reaches this size continues in the next frame.
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// A single wire frame: sequence number plus payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode frame to bytes (header + payload). The payload must fit in
    /// one frame; logical packets are split by the codec.
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        debug_assert!(len <= MAX_PACKET_SIZE);
        dst.put_u8((len & 0xFF) as u8);
        dst.put_u8(((len >> 8) & 0xFF) as u8);
        dst.put_u8(((len >> 16) & 0xFF) as u8);
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode one frame, returns None if not enough data buffered.
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }

    /// True when this frame terminates a logical packet.
    pub fn is_final_frame(&self) -> bool {
        self.payload.len() < MAX_PACKET_SIZE
    }

    /// Command code of a client command packet, if any.
    pub fn command(&self) -> Option<Command> {
        self.payload.first().map(|b| Command::from(*b))
    }
}

/// Client/server capability flags. The MariaDB extended capabilities live
/// in the upper 32 bits and travel in the dedicated field of the handshake.
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u64 = 1;
    pub const CLIENT_FOUND_ROWS: u64 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u64 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u64 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u64 = 1 << 4;
    pub const CLIENT_COMPRESS: u64 = 1 << 5;
    pub const CLIENT_ODBC: u64 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u64 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u64 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u64 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u64 = 1 << 10;
    pub const CLIENT_SSL: u64 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u64 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u64 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u64 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u64 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u64 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u64 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u64 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u64 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u64 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u64 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u64 = 1 << 24;

    // MariaDB extended capabilities. On the wire these occupy a separate
    // 32-bit field; internally we keep them in the upper half of a u64.
    pub const MARIADB_CLIENT_PROGRESS: u64 = 1 << 32;
    pub const MARIADB_CLIENT_STMT_BULK_OPERATIONS: u64 = 1 << 34;
    pub const MARIADB_CLIENT_EXTENDED_METADATA: u64 = 1 << 35;
    pub const MARIADB_CLIENT_CACHE_METADATA: u64 = 1 << 36;

    /// Capabilities the proxy itself understands on the client side.
    /// Anything a backend cannot do is masked out during negotiation.
    pub const PROXY_CAPABILITIES: u64 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_IGNORE_SPACE
        | CLIENT_PROTOCOL_41
        | CLIENT_INTERACTIVE
        | CLIENT_SSL
        | CLIENT_IGNORE_SIGPIPE
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_CONNECT_ATTRS
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_SESSION_TRACK
        | CLIENT_DEPRECATE_EOF
        | MARIADB_CLIENT_STMT_BULK_OPERATIONS
        | MARIADB_CLIENT_EXTENDED_METADATA
        | MARIADB_CLIENT_CACHE_METADATA;

    /// Split a combined capability word into the classic 32-bit field and
    /// the MariaDB extended field.
    pub fn split(caps: u64) -> (u32, u32) {
        (caps as u32, (caps >> 32) as u32)
    }

    /// Combine the classic and extended fields into one word.
    pub fn combine(classic: u32, extended: u32) -> u64 {
        classic as u64 | ((extended as u64) << 32)
    }
}

/// Server status flags carried in OK/EOF packets.
#[allow(dead_code)]
pub mod status_flags {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXIST: u16 = 0x0008;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Client command codes, first payload byte of a command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}

impl Command {
    /// Commands that generate no reply from the server.
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            Command::Quit | Command::StmtClose | Command::StmtSendLongData
        )
    }
}

/// Encode a length-encoded integer.
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Encode a length-encoded byte string.
pub fn put_lenenc_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_lenenc_int(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Decode a length-encoded integer, advancing the slice past it.
pub fn get_lenenc_int(buf: &mut &[u8]) -> Option<u64> {
    if buf.is_empty() {
        return None;
    }
    let first = buf[0];
    match first {
        0..=0xFA => {
            buf.advance(1);
            Some(first as u64)
        }
        0xFC if buf.len() >= 3 => {
            let v = u16::from_le_bytes([buf[1], buf[2]]) as u64;
            buf.advance(3);
            Some(v)
        }
        0xFD if buf.len() >= 4 => {
            let v = u32::from_le_bytes([buf[1], buf[2], buf[3], 0]) as u64;
            buf.advance(4);
            Some(v)
        }
        0xFE if buf.len() >= 9 => {
            let v = u64::from_le_bytes([
                buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
            ]);
            buf.advance(9);
            Some(v)
        }
        _ => None,
    }
}

/// Decode a length-encoded byte string.
pub fn get_lenenc_bytes(buf: &mut &[u8]) -> Option<Vec<u8>> {
    let len = get_lenenc_int(buf)? as usize;
    if buf.len() < len {
        return None;
    }
    let out = buf[..len].to_vec();
    buf.advance(len);
    Some(out)
}

/// Read a NUL-terminated string, advancing past the terminator.
pub fn get_cstr(buf: &mut &[u8]) -> Option<String> {
    let null_pos = buf.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&buf[..null_pos]).to_string();
    buf.advance(null_pos + 1);
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut buf = BytesMut::new();
        Packet::new(3, vec![1u8, 2, 3]).encode(&mut buf);
        let decoded = Packet::decode(&mut buf).unwrap();
        assert_eq!(decoded.sequence_id, 3);
        assert_eq!(&decoded.payload[..], &[1, 2, 3]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        Packet::new(0, vec![0u8; 10]).encode(&mut buf);
        let mut partial = buf.split_to(8);
        assert!(Packet::decode(&mut partial).is_none());
    }

    #[test]
    fn lenenc_int_roundtrip() {
        for v in [0u64, 250, 251, 65535, 65536, 16777215, 16777216, u64::MAX] {
            let mut buf = BytesMut::new();
            put_lenenc_int(&mut buf, v);
            let frozen = buf.freeze();
            let mut slice = &frozen[..];
            assert_eq!(get_lenenc_int(&mut slice), Some(v));
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn capability_split_combine() {
        let caps = capabilities::CLIENT_PROTOCOL_41 | capabilities::MARIADB_CLIENT_CACHE_METADATA;
        let (lo, hi) = capabilities::split(caps);
        assert_eq!(capabilities::combine(lo, hi), caps);
        assert_eq!(hi, (capabilities::MARIADB_CLIENT_CACHE_METADATA >> 32) as u32);
    }

    #[test]
    fn final_frame_detection() {
        assert!(Packet::new(0, vec![0u8; 100]).is_final_frame());
        assert!(!Packet::new(0, vec![0u8; MAX_PACKET_SIZE]).is_final_frame());
    }
}
