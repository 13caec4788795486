use std::fmt::{Display, Formatter};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ack_bitmap::AckBitmap;
use crate::seq::SeqNr;

/// size (u16) + type (u16) + session id (u32)
pub const HEADER_LEN: usize = 8;
pub const DATA_HEADER_LEN: usize = HEADER_LEN + 8;
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;
pub const MAX_DATA_PAYLOAD_LEN: usize = MAX_MESSAGE_LEN - DATA_HEADER_LEN;

/// marker for 'no ack deadline hint' in the wire representation of a Data message
const NO_ACK_DEADLINE: u32 = u32::MAX;

/// Identifies one socket's lifetime on a channel. Messages with a different session id are
///  leftovers from a previous connection (or garbage) and are never applied to a socket.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SessionId(u32);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl SessionId {
    pub fn from_raw(value: u32) -> SessionId {
        SessionId(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageKind {
    Data = 1,
    Ack = 2,
    Hello = 3,
    HelloAck = 4,
    Reset = 5,
    TransmitClose = 6,
    TransmitCloseAck = 7,
    ReceiveClose = 8,
    ReceiveCloseAck = 9,
    Close = 10,
    CloseAck = 11,
}

impl MessageKind {
    /// The minimum length of a message of this kind, including the common header
    pub fn min_len(&self) -> usize {
        match self {
            MessageKind::Data => DATA_HEADER_LEN,
            MessageKind::Ack => HEADER_LEN + 16,
            MessageKind::Hello | MessageKind::HelloAck => HEADER_LEN + 8,
            _ => HEADER_LEN,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataMessage {
    pub seq: SeqNr,
    /// Advisory: the sender would like an Ack within this time. Zero means 'ack immediately'.
    pub ack_deadline: Option<Duration>,
    pub payload: Bytes,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckMessage {
    /// the next sequence number the receiver expects, i.e. everything before it was received
    pub base: SeqNr,
    pub bitmap: AckBitmap,
    /// free space (in bytes) in the receiver's in-order buffer
    pub receive_window_remaining: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HelloMessage {
    pub initial_seq: SeqNr,
    pub receive_window: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamMessage {
    Data(DataMessage),
    Ack(AckMessage),
    Hello(HelloMessage),
    HelloAck(HelloMessage),
    Reset,
    TransmitClose,
    TransmitCloseAck,
    ReceiveClose,
    ReceiveCloseAck,
    Close,
    CloseAck,
}

impl StreamMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            StreamMessage::Data(_) => MessageKind::Data,
            StreamMessage::Ack(_) => MessageKind::Ack,
            StreamMessage::Hello(_) => MessageKind::Hello,
            StreamMessage::HelloAck(_) => MessageKind::HelloAck,
            StreamMessage::Reset => MessageKind::Reset,
            StreamMessage::TransmitClose => MessageKind::TransmitClose,
            StreamMessage::TransmitCloseAck => MessageKind::TransmitCloseAck,
            StreamMessage::ReceiveClose => MessageKind::ReceiveClose,
            StreamMessage::ReceiveCloseAck => MessageKind::ReceiveCloseAck,
            StreamMessage::Close => MessageKind::Close,
            StreamMessage::CloseAck => MessageKind::CloseAck,
        }
    }

    fn wire_len(&self) -> usize {
        match self {
            StreamMessage::Data(data) => DATA_HEADER_LEN + data.payload.len(),
            other => other.kind().min_len(),
        }
    }

    /// Writes the complete message including the common header.
    ///
    /// Data payloads must not exceed [MAX_DATA_PAYLOAD_LEN] - this is ensured by validating
    ///  the configured max payload size, so a violation is a bug.
    pub fn ser(&self, session: SessionId, buf: &mut BytesMut) {
        let len = self.wire_len();
        assert!(len <= MAX_MESSAGE_LEN, "message of {} bytes exceeds the maximum message size", len);

        buf.reserve(len);
        buf.put_u16(len as u16);
        buf.put_u16(self.kind().into());
        buf.put_u32(session.to_raw());

        match self {
            StreamMessage::Data(data) => {
                buf.put_u32(data.seq.to_raw());
                buf.put_u32(Self::ack_deadline_to_raw(data.ack_deadline));
                buf.put_slice(&data.payload);
            }
            StreamMessage::Ack(ack) => {
                buf.put_u32(ack.base.to_raw());
                buf.put_u64(ack.bitmap.to_raw());
                buf.put_u32(ack.receive_window_remaining);
            }
            StreamMessage::Hello(hello) | StreamMessage::HelloAck(hello) => {
                buf.put_u32(hello.initial_seq.to_raw());
                buf.put_u32(hello.receive_window);
            }
            _ => {}
        }
    }

    pub fn to_bytes(&self, session: SessionId) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.ser(session, &mut buf);
        buf.freeze()
    }

    /// Parses a single message that was delivered by the tunnel as one unit.
    pub fn deser(mut buf: Bytes) -> anyhow::Result<(SessionId, StreamMessage)> {
        let received_len = buf.len();

        let declared_len = buf.try_get_u16()?;
        let raw_kind = buf.try_get_u16()?;
        let session = SessionId::from_raw(buf.try_get_u32()?);

        if usize::from(declared_len) != received_len {
            bail!("declared message length {} does not match received length {}", declared_len, received_len);
        }

        let kind = MessageKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid message type {}", raw_kind))?;
        if received_len < kind.min_len() {
            bail!("{:?} message of {} bytes is shorter than the minimum of {}", kind, received_len, kind.min_len());
        }

        let message = match kind {
            MessageKind::Data => {
                let seq = SeqNr::from_raw(buf.try_get_u32()?);
                let ack_deadline = Self::ack_deadline_from_raw(buf.try_get_u32()?);
                let payload = buf.copy_to_bytes(buf.remaining());
                StreamMessage::Data(DataMessage { seq, ack_deadline, payload })
            }
            MessageKind::Ack => {
                let base = SeqNr::from_raw(buf.try_get_u32()?);
                let bitmap = AckBitmap::from_raw(buf.try_get_u64()?);
                let receive_window_remaining = buf.try_get_u32()?;
                StreamMessage::Ack(AckMessage { base, bitmap, receive_window_remaining })
            }
            MessageKind::Hello => StreamMessage::Hello(Self::deser_hello(&mut buf)?),
            MessageKind::HelloAck => StreamMessage::HelloAck(Self::deser_hello(&mut buf)?),
            MessageKind::Reset => StreamMessage::Reset,
            MessageKind::TransmitClose => StreamMessage::TransmitClose,
            MessageKind::TransmitCloseAck => StreamMessage::TransmitCloseAck,
            MessageKind::ReceiveClose => StreamMessage::ReceiveClose,
            MessageKind::ReceiveCloseAck => StreamMessage::ReceiveCloseAck,
            MessageKind::Close => StreamMessage::Close,
            MessageKind::CloseAck => StreamMessage::CloseAck,
        };
        Ok((session, message))
    }

    fn deser_hello(buf: &mut impl Buf) -> anyhow::Result<HelloMessage> {
        let initial_seq = SeqNr::from_raw(buf.try_get_u32()?);
        let receive_window = buf.try_get_u32()?;
        Ok(HelloMessage { initial_seq, receive_window })
    }

    fn ack_deadline_to_raw(ack_deadline: Option<Duration>) -> u32 {
        match ack_deadline {
            None => NO_ACK_DEADLINE,
            Some(d) => u32::try_from(d.as_millis())
                .unwrap_or(NO_ACK_DEADLINE - 1)
                .min(NO_ACK_DEADLINE - 1),
        }
    }

    fn ack_deadline_from_raw(raw: u32) -> Option<Duration> {
        match raw {
            NO_ACK_DEADLINE => None,
            millis => Some(Duration::from_millis(millis.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::data(StreamMessage::Data(DataMessage { seq: SeqNr::from_raw(0x01020304), ack_deadline: Some(Duration::from_millis(5000)), payload: Bytes::from_static(b"AB") }),
        vec![0,18, 0,1, 0,0,0,9, 1,2,3,4, 0,0,0x13,0x88, 65,66])]
    #[case::data_immediate_ack(StreamMessage::Data(DataMessage { seq: SeqNr::from_raw(7), ack_deadline: Some(Duration::ZERO), payload: Bytes::from_static(b"x") }),
        vec![0,17, 0,1, 0,0,0,9, 0,0,0,7, 0,0,0,0, 120])]
    #[case::data_no_deadline(StreamMessage::Data(DataMessage { seq: SeqNr::from_raw(7), ack_deadline: None, payload: Bytes::new() }),
        vec![0,16, 0,1, 0,0,0,9, 0,0,0,7, 255,255,255,255])]
    #[case::ack(StreamMessage::Ack(AckMessage { base: SeqNr::from_raw(u32::MAX), bitmap: AckBitmap::from_raw(0x8000_0000_0000_0005), receive_window_remaining: 4096 }),
        vec![0,24, 0,2, 0,0,0,9, 255,255,255,255, 0x80,0,0,0,0,0,0,5, 0,0,0x10,0])]
    #[case::hello(StreamMessage::Hello(HelloMessage { initial_seq: SeqNr::from_raw(3), receive_window: 256 }),
        vec![0,16, 0,3, 0,0,0,9, 0,0,0,3, 0,0,1,0])]
    #[case::hello_ack(StreamMessage::HelloAck(HelloMessage { initial_seq: SeqNr::from_raw(4), receive_window: 1 }),
        vec![0,16, 0,4, 0,0,0,9, 0,0,0,4, 0,0,0,1])]
    #[case::reset(StreamMessage::Reset, vec![0,8, 0,5, 0,0,0,9])]
    #[case::transmit_close(StreamMessage::TransmitClose, vec![0,8, 0,6, 0,0,0,9])]
    #[case::transmit_close_ack(StreamMessage::TransmitCloseAck, vec![0,8, 0,7, 0,0,0,9])]
    #[case::receive_close(StreamMessage::ReceiveClose, vec![0,8, 0,8, 0,0,0,9])]
    #[case::receive_close_ack(StreamMessage::ReceiveCloseAck, vec![0,8, 0,9, 0,0,0,9])]
    #[case::close(StreamMessage::Close, vec![0,8, 0,10, 0,0,0,9])]
    #[case::close_ack(StreamMessage::CloseAck, vec![0,8, 0,11, 0,0,0,9])]
    fn test_ser_deser(#[case] message: StreamMessage, #[case] expected_buf: Vec<u8>) {
        let buf = message.to_bytes(SessionId::from_raw(9));
        assert_eq!(buf.as_ref(), expected_buf.as_slice());

        let (session, deser_message) = StreamMessage::deser(buf).unwrap();
        assert_eq!(session, SessionId::from_raw(9));
        assert_eq!(deser_message, message);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_header(vec![0,8, 0,5, 0,0])]
    #[case::declared_len_too_big(vec![0,9, 0,5, 0,0,0,9])]
    #[case::declared_len_too_small(vec![0,8, 0,5, 0,0,0,9, 1])]
    #[case::unknown_type(vec![0,8, 0,99, 0,0,0,9])]
    #[case::type_zero(vec![0,8, 0,0, 0,0,0,9])]
    #[case::short_data(vec![0,12, 0,1, 0,0,0,9, 0,0,0,1])]
    #[case::short_ack(vec![0,20, 0,2, 0,0,0,9, 0,0,0,1, 0,0,0,0,0,0,0,0])]
    #[case::short_hello(vec![0,12, 0,3, 0,0,0,9, 0,0,0,1])]
    #[case::short_hello_ack(vec![0,8, 0,4, 0,0,0,9])]
    fn test_deser_rejects(#[case] buf: Vec<u8>) {
        assert!(StreamMessage::deser(Bytes::from(buf)).is_err());
    }

    #[test]
    fn test_deser_data_takes_remaining_payload() {
        let buf = Bytes::from(vec![0,20, 0,1, 0,0,0,1, 0,0,0,2, 0,0,0,0, 1,2,3,4]);
        let (_, message) = StreamMessage::deser(buf).unwrap();
        match message {
            StreamMessage::Data(data) => assert_eq!(data.payload.as_ref(), &[1,2,3,4]),
            other => panic!("unexpected message {:?}", other),
        }
    }
}
