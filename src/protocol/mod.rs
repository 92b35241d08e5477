mod codec;
mod handshake;
mod packet;
pub mod proxy;
mod response;

pub use codec::{
    split_into_frames, AssembleResult, LogicalPacket, PacketAssembler, PacketCodec, SequenceError,
};
pub use handshake::{
    compute_auth_token, AuthSwitchRequest, ChangeUserRequest, HandshakeResponse, InitialHandshake,
    SslRequest, DEFAULT_AUTH_PLUGIN, MIN_HANDSHAKE_RESPONSE_LEN, SCRAMBLE_LEN,
};
pub use packet::{
    capabilities, get_cstr, get_lenenc_bytes, get_lenenc_int, put_lenenc_bytes, put_lenenc_int,
    status_flags, Command, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE,
};
pub use response::{
    error_codes, is_eof_ok_packet, is_eof_packet, is_err_packet, is_ok_packet, ErrPacket,
    OkPacket, SessionTrack,
};
