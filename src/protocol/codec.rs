use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{Packet, MAX_PACKET_SIZE};

/// Frame-level codec for use with tokio Framed. Logical packet assembly
/// is layered on top by [`PacketAssembler`].
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Packet::decode(src))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Encoder that can encode raw bytes directly
impl Encoder<&[u8]> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

/// A fully reassembled logical packet: the concatenated payloads of one
/// or more wire frames. `last_seq` is the sequence number of the final
/// frame, so the next packet written in the same exchange uses
/// `last_seq + 1`.
#[derive(Debug, Clone)]
pub struct LogicalPacket {
    pub payload: Bytes,
    pub first_seq: u8,
    pub last_seq: u8,
}

impl LogicalPacket {
    pub fn command(&self) -> Option<super::packet::Command> {
        self.payload.first().map(|b| super::packet::Command::from(*b))
    }
}

/// Raised when a frame arrives with an unexpected sequence number. Maps
/// to error 1156 "Got packets out of order" on the client side.
#[derive(Debug, thiserror::Error)]
#[error("got packet with sequence {got}, expected {expected}")]
pub struct SequenceError {
    pub expected: u8,
    pub got: u8,
}

/// Accumulates wire frames into logical packets, validating that the
/// sequence numbers within one logical packet are consecutive.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    buf: BytesMut,
    first_seq: Option<u8>,
    expect_seq: Option<u8>,
}

/// Outcome of feeding one frame to the assembler.
#[derive(Debug)]
pub enum AssembleResult {
    /// The logical packet is complete.
    Complete(LogicalPacket),
    /// More continuation frames are required.
    NeedMore,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a logical packet is partially assembled.
    pub fn in_progress(&self) -> bool {
        self.first_seq.is_some()
    }

    /// Feed the next wire frame. `expected_first` is the sequence number
    /// the first frame of a new logical packet must carry.
    pub fn push(
        &mut self,
        frame: Packet,
        expected_first: u8,
    ) -> Result<AssembleResult, SequenceError> {
        let expected = match self.expect_seq {
            Some(seq) => seq,
            None => expected_first,
        };
        if frame.sequence_id != expected {
            // Reset so a later exchange starts clean.
            self.reset();
            return Err(SequenceError {
                expected,
                got: frame.sequence_id,
            });
        }

        if self.first_seq.is_none() {
            self.first_seq = Some(frame.sequence_id);
        }
        self.expect_seq = Some(frame.sequence_id.wrapping_add(1));

        let is_final = frame.is_final_frame();
        self.buf.extend_from_slice(&frame.payload);

        if is_final {
            let payload = self.buf.split().freeze();
            let first_seq = self.first_seq.take().unwrap_or(0);
            let last_seq = self.expect_seq.take().unwrap_or(1).wrapping_sub(1);
            Ok(AssembleResult::Complete(LogicalPacket {
                payload,
                first_seq,
                last_seq,
            }))
        } else {
            Ok(AssembleResult::NeedMore)
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.first_seq = None;
        self.expect_seq = None;
    }
}

/// Split a logical payload into wire frames, assigning sequence numbers
/// starting at `seq`. Returns the frames and the sequence number the
/// next packet in the exchange should use. A payload whose length is an
/// exact multiple of the maximum frame size gets a trailing empty frame,
/// as the receiver only stops on a short frame.
pub fn split_into_frames(payload: Bytes, mut seq: u8) -> (Vec<Packet>, u8) {
    let mut frames = Vec::with_capacity(payload.len() / MAX_PACKET_SIZE + 1);
    let mut offset = 0usize;

    loop {
        let remaining = payload.len() - offset;
        let take = remaining.min(MAX_PACKET_SIZE);
        frames.push(Packet::new(seq, payload.slice(offset..offset + take)));
        seq = seq.wrapping_add(1);
        offset += take;
        if take < MAX_PACKET_SIZE {
            break;
        }
        if offset == payload.len() {
            // Exactly at a frame boundary: terminate with an empty frame.
            frames.push(Packet::new(seq, Bytes::new()));
            seq = seq.wrapping_add(1);
            break;
        }
    }

    (frames, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_packet() {
        let mut asm = PacketAssembler::new();
        let frame = Packet::new(0, vec![3u8, b'S', b'E', b'L']);
        match asm.push(frame, 0).unwrap() {
            AssembleResult::Complete(lp) => {
                assert_eq!(&lp.payload[..], &[3, b'S', b'E', b'L']);
                assert_eq!(lp.first_seq, 0);
                assert_eq!(lp.last_seq, 0);
            }
            AssembleResult::NeedMore => panic!("expected complete packet"),
        }
    }

    #[test]
    fn continuation_frames_concatenate_in_order() {
        let mut asm = PacketAssembler::new();
        let full = Packet::new(0, vec![0xAAu8; MAX_PACKET_SIZE]);
        let tail = Packet::new(1, vec![0xBBu8; 5]);

        assert!(matches!(asm.push(full, 0).unwrap(), AssembleResult::NeedMore));
        match asm.push(tail, 0).unwrap() {
            AssembleResult::Complete(lp) => {
                assert_eq!(lp.payload.len(), MAX_PACKET_SIZE + 5);
                assert_eq!(lp.payload[0], 0xAA);
                assert_eq!(lp.payload[MAX_PACKET_SIZE], 0xBB);
                assert_eq!(lp.last_seq, 1);
            }
            AssembleResult::NeedMore => panic!("expected complete packet"),
        }
    }

    #[test]
    fn sequence_violation_detected() {
        let mut asm = PacketAssembler::new();
        let err = asm.push(Packet::new(2, vec![1u8]), 1).unwrap_err();
        assert_eq!(err.expected, 1);
        assert_eq!(err.got, 2);
        assert!(!asm.in_progress());
    }

    #[test]
    fn split_small_payload() {
        let (frames, next) = split_into_frames(Bytes::from(vec![1u8, 2, 3]), 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence_id, 1);
        assert_eq!(next, 2);
    }

    #[test]
    fn split_large_payload_roundtrips() {
        let payload = Bytes::from(vec![7u8; MAX_PACKET_SIZE + 5]);
        let (frames, next) = split_into_frames(payload.clone(), 0);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.len(), MAX_PACKET_SIZE);
        assert_eq!(frames[1].payload.len(), 5);
        assert_eq!(next, 2);

        let mut asm = PacketAssembler::new();
        let mut result = None;
        for f in frames {
            if let AssembleResult::Complete(lp) = asm.push(f, 0).unwrap() {
                result = Some(lp);
            }
        }
        assert_eq!(result.unwrap().payload, payload);
    }

    #[test]
    fn split_exact_multiple_appends_empty_frame() {
        let payload = Bytes::from(vec![7u8; MAX_PACKET_SIZE]);
        let (frames, _) = split_into_frames(payload, 0);
        assert_eq!(frames.len(), 2);
        assert!(frames[1].payload.is_empty());
    }
}
