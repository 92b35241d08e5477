use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, get_cstr, get_lenenc_bytes, get_lenenc_int, Packet};

/// Length of the full authentication scramble.
pub const SCRAMBLE_LEN: usize = 20;

/// Default authentication plugin offered in the initial handshake.
pub const DEFAULT_AUTH_PLUGIN: &str = "mysql_native_password";

/// Minimum size of a valid HandshakeResponse payload. Anything shorter is
/// a pre-4.1 client, which is not supported.
pub const MIN_HANDSHAKE_RESPONSE_LEN: usize = 38;

/// Initial handshake packet (server -> client).
///
/// The fixed section between the protocol-version byte and the plugin
/// name is 44 bytes: thread id, split scramble, capability words, status
/// and the MariaDB extended-capability field.
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub scramble: [u8; SCRAMBLE_LEN],
    pub capabilities: u64,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create a handshake for a new client session. `capabilities` is the
    /// already-negotiated set (see [`crate::session::negotiate_capabilities`]).
    pub fn new(server_version: &str, connection_id: u32, capabilities: u64) -> Self {
        let mut scramble = [0u8; SCRAMBLE_LEN];
        rand::thread_rng().fill_bytes(&mut scramble);
        // NUL bytes would terminate the scramble early in old clients.
        for b in scramble.iter_mut() {
            if *b == 0 {
                *b = b'*';
            }
        }

        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            connection_id,
            scramble,
            capabilities,
            character_set: 0x21, // utf8_general_ci
            status_flags: super::packet::status_flags::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
        }
    }

    /// Handshake reusing a backend's scramble and plugin, so the client's
    /// token can be forwarded verbatim (passthrough authentication).
    pub fn with_scramble(
        server_version: &str,
        connection_id: u32,
        capabilities: u64,
        scramble: [u8; SCRAMBLE_LEN],
        auth_plugin_name: &str,
    ) -> Self {
        let mut hs = Self::new(server_version, connection_id, capabilities);
        hs.scramble = scramble;
        hs.auth_plugin_name = auth_plugin_name.to_string();
        hs
    }

    /// Encode to the first packet of the exchange (sequence 0).
    pub fn encode(&self) -> Packet {
        let (caps_lo, caps_ext) = split(self.capabilities);
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);

        // First 8 bytes of the scramble, then a filler.
        buf.extend_from_slice(&self.scramble[..8]);
        buf.put_u8(0);

        buf.put_u16_le((caps_lo & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le((caps_lo >> 16) as u16);

        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((SCRAMBLE_LEN + 1) as u8);
        } else {
            buf.put_u8(0);
        }

        // Six filler bytes, then the MariaDB extended capability word.
        buf.extend_from_slice(&[0u8; 6]);
        buf.put_u32_le(caps_ext);

        // Remaining 12 scramble bytes plus terminator.
        buf.extend_from_slice(&self.scramble[8..]);
        buf.put_u8(0);

        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    /// Parse a handshake received from a backend server.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 46 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();
        let server_version = get_cstr(&mut buf)?;
        let connection_id = buf.get_u32_le();

        if buf.len() < 36 {
            return None;
        }
        let mut scramble = [0u8; SCRAMBLE_LEN];
        scramble[..8].copy_from_slice(&buf[..8]);
        buf.advance(8);
        buf.advance(1); // filler

        let caps_low = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let caps_high = buf.get_u16_le() as u32;
        let caps_lo = caps_low | (caps_high << 16);

        let scramble_len = buf.get_u8() as usize;
        buf.advance(6);
        let caps_ext = buf.get_u32_le();

        let capabilities = combine(caps_lo, caps_ext);

        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            // Scramble tail: advertised total minus the 8 bytes already
            // read, at least 12, ending in a NUL.
            let tail = scramble_len.saturating_sub(9).max(12);
            if buf.len() < tail {
                return None;
            }
            scramble[8..].copy_from_slice(&buf[..12]);
            buf.advance(tail);
            if !buf.is_empty() {
                buf.advance(1); // scramble terminator
            }
        }

        let auth_plugin_name = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            scramble,
            capabilities,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// SSLRequest: the 32-byte capabilities block a client sends before
/// switching to TLS. Same layout as the head of a HandshakeResponse.
#[derive(Debug, Clone, Copy)]
pub struct SslRequest {
    pub capabilities: u64,
    pub max_packet_size: u32,
    pub character_set: u8,
}

impl SslRequest {
    pub const PAYLOAD_LEN: usize = 32;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != Self::PAYLOAD_LEN {
            return None;
        }
        let mut buf = payload;
        let caps_lo = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();
        buf.advance(19);
        let caps_ext = buf.get_u32_le();
        Some(Self {
            capabilities: combine(caps_lo, caps_ext),
            max_packet_size,
            character_set,
        })
    }

    /// Is this payload an SSLRequest rather than a full HandshakeResponse?
    pub fn looks_like(payload: &[u8]) -> bool {
        payload.len() == Self::PAYLOAD_LEN
    }
}

/// HandshakeResponse packet (client -> server).
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capabilities: u64,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
    pub attributes: Vec<(String, String)>,
}

impl HandshakeResponse {
    /// Parse from packet payload. Returns None for malformed or pre-4.1
    /// responses.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < MIN_HANDSHAKE_RESPONSE_LEN {
            return None;
        }

        let mut buf = payload;

        let caps_lo = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();
        buf.advance(19);
        let caps_ext = buf.get_u32_le();
        let capabilities = combine(caps_lo, caps_ext);

        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            // Pre-4.1 response; the short auth token format is rejected.
            return None;
        }

        let username = get_cstr(&mut buf)?;

        let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            get_lenenc_bytes(&mut buf)?
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let db = get_cstr(&mut buf)?;
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            name
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        let mut attributes = Vec::new();
        if capabilities & CLIENT_CONNECT_ATTRS != 0 && !buf.is_empty() {
            if let Some(total) = get_lenenc_int(&mut buf) {
                let mut attr_buf = &buf[..buf.len().min(total as usize)];
                while !attr_buf.is_empty() {
                    let key = match get_lenenc_bytes(&mut attr_buf) {
                        Some(k) => k,
                        None => break,
                    };
                    let value = match get_lenenc_bytes(&mut attr_buf) {
                        Some(v) => v,
                        None => break,
                    };
                    attributes.push((
                        String::from_utf8_lossy(&key).to_string(),
                        String::from_utf8_lossy(&value).to_string(),
                    ));
                }
            }
        }

        Some(Self {
            capabilities,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            attributes,
        })
    }

    /// Encode to a packet, used on the backend side of the proxy.
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let (caps_lo, caps_ext) = split(self.capabilities);
        let mut buf = BytesMut::new();

        buf.put_u32_le(caps_lo);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 19]);
        buf.put_u32_le(caps_ext);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            super::packet::put_lenenc_bytes(&mut buf, &self.auth_response);
        } else if self.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// COM_CHANGE_USER payload: new credentials on a live session.
#[derive(Debug, Clone)]
pub struct ChangeUserRequest {
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub character_set: u8,
    pub auth_plugin_name: String,
}

impl ChangeUserRequest {
    /// Parse a COM_CHANGE_USER payload (including the command byte).
    pub fn parse(payload: &[u8], capabilities: u64) -> Option<Self> {
        if payload.first() != Some(&(super::packet::Command::ChangeUser as u8)) {
            return None;
        }
        let mut buf = &payload[1..];

        let username = get_cstr(&mut buf)?;

        let auth_response = if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = {
            let db = get_cstr(&mut buf)?;
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        };

        let character_set = if buf.len() >= 2 {
            let cs = buf.get_u16_le();
            (cs & 0xFF) as u8
        } else {
            0x21
        };

        let auth_plugin_name = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            get_cstr(&mut buf).unwrap_or_else(|| DEFAULT_AUTH_PLUGIN.to_string())
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        Some(Self {
            username,
            auth_response,
            database,
            character_set,
            auth_plugin_name,
        })
    }
}

/// AuthSwitchRequest (server -> client): ask the client to redo the
/// exchange with a different plugin.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Bytes,
}

impl AuthSwitchRequest {
    pub const MARKER: u8 = 0xFE;

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(Self::MARKER);
        buf.extend_from_slice(self.plugin_name.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(&self.plugin_data);
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&Self::MARKER) || payload.len() < 2 {
            return None;
        }
        let mut buf = &payload[1..];
        let plugin_name = get_cstr(&mut buf)?;
        Some(Self {
            plugin_name,
            plugin_data: Bytes::copy_from_slice(buf),
        })
    }
}

/// Compute a mysql_native_password auth token:
/// `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`.
pub fn compute_auth_token(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let hash1 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip() {
        let hs = InitialHandshake::new("10.6.14-hermes", 42, PROXY_CAPABILITIES);
        let packet = hs.encode();
        assert_eq!(packet.sequence_id, 0);

        let parsed = InitialHandshake::parse(&packet.payload).unwrap();
        assert_eq!(parsed.server_version, "10.6.14-hermes");
        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.scramble, hs.scramble);
        assert_eq!(parsed.capabilities, hs.capabilities);
        assert_eq!(parsed.auth_plugin_name, DEFAULT_AUTH_PLUGIN);
    }

    #[test]
    fn handshake_fixed_section_is_44_bytes() {
        let hs = InitialHandshake::new("x", 1, PROXY_CAPABILITIES);
        let packet = hs.encode();
        // version byte + "x\0" + fixed section + plugin cstr
        let plugin_len = DEFAULT_AUTH_PLUGIN.len() + 1;
        assert_eq!(packet.payload.len(), 1 + 2 + 44 + plugin_len);
    }

    #[test]
    fn handshake_response_roundtrip() {
        let response = HandshakeResponse {
            capabilities: CLIENT_PROTOCOL_41
                | CLIENT_SECURE_CONNECTION
                | CLIENT_PLUGIN_AUTH
                | CLIENT_CONNECT_WITH_DB,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "alice".to_string(),
            auth_response: vec![1u8; 20],
            database: Some("sales".to_string()),
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
            attributes: vec![],
        };

        let packet = response.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.auth_response, vec![1u8; 20]);
        assert_eq!(parsed.database.as_deref(), Some("sales"));
        assert_eq!(parsed.auth_plugin_name, DEFAULT_AUTH_PLUGIN);
    }

    #[test]
    fn pre_41_response_rejected() {
        // A response without CLIENT_PROTOCOL_41 must not parse.
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u32_le(1024);
        buf.put_u8(8);
        buf.extend_from_slice(&[0u8; 23]);
        buf.extend_from_slice(b"bob\0");
        buf.extend_from_slice(&[0u8; 9]);
        assert!(HandshakeResponse::parse(&buf).is_none());
    }

    #[test]
    fn ssl_request_detection() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((CLIENT_SSL | CLIENT_PROTOCOL_41) as u32);
        buf.put_u32_le(1 << 24);
        buf.put_u8(0x21);
        buf.extend_from_slice(&[0u8; 19]);
        buf.put_u32_le(0);

        assert!(SslRequest::looks_like(&buf));
        let req = SslRequest::parse(&buf).unwrap();
        assert!(req.capabilities & CLIENT_SSL != 0);
    }

    #[test]
    fn native_token_matches_known_vector() {
        // Token must verify against the double-hashed password.
        let scramble = [7u8; SCRAMBLE_LEN];
        let token = compute_auth_token("pw", &scramble);
        assert_eq!(token.len(), 20);

        // Recover SHA1(password) and compare its hash with the stored hash.
        let mut hasher = Sha1::new();
        hasher.update(b"pw");
        let hash1 = hasher.finalize();
        let mut hasher = Sha1::new();
        hasher.update(hash1);
        let stored = hasher.finalize();

        let mut hasher = Sha1::new();
        hasher.update(scramble);
        hasher.update(stored);
        let expected: Vec<u8> = hasher
            .finalize()
            .iter()
            .zip(hash1.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        assert_eq!(token, expected);
    }

    #[test]
    fn change_user_parse() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x11);
        buf.extend_from_slice(b"carol\0");
        buf.put_u8(3);
        buf.extend_from_slice(&[9, 9, 9]);
        buf.extend_from_slice(b"inventory\0");
        buf.put_u16_le(0x21);
        buf.extend_from_slice(b"mysql_native_password\0");

        let caps = CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        let req = ChangeUserRequest::parse(&buf, caps).unwrap();
        assert_eq!(req.username, "carol");
        assert_eq!(req.auth_response, vec![9, 9, 9]);
        assert_eq!(req.database.as_deref(), Some("inventory"));
        assert_eq!(req.auth_plugin_name, DEFAULT_AUTH_PLUGIN);
    }
}
