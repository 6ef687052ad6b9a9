use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// WFTNP header size in bytes
pub const HEADER_SIZE: usize = 6;

/// Protocol version carried in every frame
pub const WFTNP_VERSION: u8 = 1;

/// Maximum plausible payload length
///
/// WFTNP tunnels GATT values and discovery lists; anything larger than this
/// is treated as stream corruption and resynchronized past.
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// WFTNP message types
///
/// The protocol is BLE GATT tunneled over TCP: requests 1-5 carry GATT
/// discovery and characteristic access, type 6 is an unsolicited notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// List the 128-bit UUIDs of all services
    DiscoverServices = 1,
    /// List characteristics and property bits of one service
    DiscoverCharacteristics = 2,
    /// Read a characteristic value
    ReadCharacteristic = 3,
    /// Write a characteristic value
    WriteCharacteristic = 4,
    /// Enable or disable notifications on a characteristic
    EnableNotifications = 5,
    /// Unsolicited notification: 16-byte characteristic UUID + value
    Notification = 6,
}

impl MessageType {
    /// Convert from the wire discriminant
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::DiscoverServices),
            2 => Some(Self::DiscoverCharacteristics),
            3 => Some(Self::ReadCharacteristic),
            4 => Some(Self::WriteCharacteristic),
            5 => Some(Self::EnableNotifications),
            6 => Some(Self::Notification),
            _ => None,
        }
    }
}

/// A single WFTNP wire frame
///
/// Header layout: version (u8), message type (u8), sequence (u8), response
/// code (u8), payload length (u16 big-endian), then the payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Message type discriminant
    pub msg_type: MessageType,
    /// Sequence number correlating requests with responses
    pub seq: u8,
    /// Response code; zero on requests and successful responses
    pub resp_code: u8,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a request frame with a zero response code
    #[must_use]
    pub const fn request(msg_type: MessageType, seq: u8, payload: Bytes) -> Self {
        Self {
            msg_type,
            seq,
            resp_code: 0,
            payload,
        }
    }

    /// Serialize the frame to wire bytes
    ///
    /// # Panics
    ///
    /// Panics if the payload exceeds [`MAX_PAYLOAD_SIZE`]; callers construct
    /// payloads from fixed-size protocol structures well under the limit.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        assert!(self.payload.len() <= MAX_PAYLOAD_SIZE);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(WFTNP_VERSION);
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.seq);
        buf.put_u8(self.resp_code);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Incremental WFTNP frame decoder
///
/// Accumulates raw socket bytes and yields complete frames, keeping any
/// partial trailing frame buffered for the next read. A corrupt header
/// (wrong version, unknown type, implausible length) causes the decoder to
/// skip forward one byte at a time until a plausible header aligns, so a
/// single damaged frame never poisons the stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Append raw bytes and extract every complete frame now available
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut skipped = 0usize;

        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }

            if !Self::header_plausible(&self.buf[..HEADER_SIZE]) {
                self.buf.advance(1);
                skipped += 1;
                continue;
            }

            let dlen = usize::from(u16::from_be_bytes([self.buf[4], self.buf[5]]));
            if self.buf.len() < HEADER_SIZE + dlen {
                break;
            }

            let mut header = self.buf.split_to(HEADER_SIZE);
            let payload = self.buf.split_to(dlen).freeze();

            header.advance(1); // version already validated
            let msg_type = MessageType::from_u8(header.get_u8())
                .unwrap_or(MessageType::Notification); // unreachable after plausibility check
            let seq = header.get_u8();
            let resp_code = header.get_u8();

            frames.push(Frame {
                msg_type,
                seq,
                resp_code,
                payload,
            });
        }

        if skipped > 0 {
            warn!(skipped, "resynchronized past corrupt bytes");
        }

        frames
    }

    /// Number of buffered bytes awaiting more data
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop buffered bytes, e.g. when a connection is torn down
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn header_plausible(header: &[u8]) -> bool {
        if header[0] != WFTNP_VERSION || MessageType::from_u8(header[1]).is_none() {
            return false;
        }
        let dlen = usize::from(u16::from_be_bytes([header[4], header[5]]));
        dlen <= MAX_PAYLOAD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(msg_type: MessageType, seq: u8, resp: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = Frame::request(msg_type, seq, Bytes::copy_from_slice(payload));
        f.resp_code = resp;
        f.encode().to_vec()
    }

    #[test]
    fn test_encode_layout() {
        let bytes = frame_bytes(MessageType::WriteCharacteristic, 7, 0, b"\xAA\xBB");

        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        assert_eq!(bytes[0], WFTNP_VERSION);
        assert_eq!(bytes[1], MessageType::WriteCharacteristic as u8);
        assert_eq!(bytes[2], 7);
        assert_eq!(bytes[3], 0);
        assert_eq!(&bytes[4..6], &[0, 2]); // big-endian length
        assert_eq!(&bytes[6..], b"\xAA\xBB");
    }

    #[test]
    fn test_decode_single_frame() {
        let mut decoder = FrameDecoder::new();
        let bytes = frame_bytes(MessageType::ReadCharacteristic, 3, 0, b"value");

        let frames = decoder.push(&bytes);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MessageType::ReadCharacteristic);
        assert_eq!(frames[0].seq, 3);
        assert_eq!(&frames[0].payload[..], b"value");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_multiple_frames_one_push() {
        let mut decoder = FrameDecoder::new();
        let mut data = frame_bytes(MessageType::DiscoverServices, 1, 0, b"");
        data.extend(frame_bytes(MessageType::Notification, 0, 0, b"n"));

        let frames = decoder.push(&data);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].msg_type, MessageType::DiscoverServices);
        assert_eq!(frames[1].msg_type, MessageType::Notification);
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let mut decoder = FrameDecoder::new();
        let bytes = frame_bytes(MessageType::Notification, 0, 0, b"telemetry");

        assert!(decoder.push(&bytes[..4]).is_empty());
        assert_eq!(decoder.buffered(), 4);

        let frames = decoder.push(&bytes[4..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"telemetry");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut decoder = FrameDecoder::new();
        let bytes = frame_bytes(MessageType::EnableNotifications, 9, 0, b"\x01");

        let mut frames = Vec::new();
        for b in &bytes {
            frames.extend(decoder.push(&[*b]));
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 9);
    }

    #[test]
    fn test_resync_after_corrupt_frame() {
        let mut decoder = FrameDecoder::new();

        // garbage that looks nothing like a header, then a valid frame
        let mut data = vec![0xFF, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x42];
        data.extend(frame_bytes(MessageType::Notification, 0, 0, b"ok"));

        let frames = decoder.push(&data);

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"ok");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_resync_on_bad_version() {
        let mut decoder = FrameDecoder::new();

        let mut corrupt = frame_bytes(MessageType::Notification, 0, 0, b"x");
        corrupt[0] = 2; // unsupported version
        corrupt.extend(frame_bytes(MessageType::Notification, 1, 0, b"good"));

        let frames = decoder.push(&corrupt);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 1);
        assert_eq!(&frames[0].payload[..], b"good");
    }

    #[test]
    fn test_resync_on_implausible_length() {
        let mut decoder = FrameDecoder::new();

        let mut corrupt = frame_bytes(MessageType::Notification, 0, 0, b"x");
        corrupt[4] = 0xFF;
        corrupt[5] = 0xFF; // declares a 65535-byte payload
        corrupt.extend(frame_bytes(MessageType::ReadCharacteristic, 2, 0, b"good"));

        let frames = decoder.push(&corrupt);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MessageType::ReadCharacteristic);
    }

    #[test]
    fn test_clear_resets_buffer() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[WFTNP_VERSION, 6, 0]);
        assert_eq!(decoder.buffered(), 3);

        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }
}
