//! WebSocket frame parsing and serialization
//!
//! [`FrameCodec`] is stateless: decoding looks at whatever bytes are buffered
//! and either yields one complete frame together with the number of bytes it
//! occupied, or reports that more bytes are needed. Nothing is consumed until
//! a whole frame is present, so a caller can retry the same buffer after
//! every read.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mask::{apply_mask, generate_mask};
use crate::protocol::Role;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation frame
    Continuation,
    /// Text frame
    Text,
    /// Binary frame
    Binary,
    /// Connection close
    Close,
    /// Ping
    Ping,
    /// Pong
    Pong,
    /// Reserved data opcode (0x3-0x7)
    ReservedData(u8),
    /// Reserved control opcode (0xB-0xF)
    ReservedControl(u8),
}

impl OpCode {
    /// Parse opcode from the low nibble of a byte
    #[inline]
    pub fn from_u8(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            n @ 0x3..=0x7 => OpCode::ReservedData(n),
            n => OpCode::ReservedControl(n),
        }
    }

    /// Wire value
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::ReservedData(n) | OpCode::ReservedControl(n) => n & 0x0F,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(self) -> bool {
        self.as_u8() >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(self) -> bool {
        self.as_u8() < 0x8
    }

    /// Check if this opcode is reserved for future use
    #[inline]
    pub fn is_reserved(self) -> bool {
        matches!(self, OpCode::ReservedData(_) | OpCode::ReservedControl(_))
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1
    pub rsv1: bool,
    /// RSV2
    pub rsv2: bool,
    /// RSV3
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (must be true for client->server)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        let mut size = 2;

        if self.payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            size += 8;
        } else if self.payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
            size += 2;
        }

        if self.masked {
            size += 4;
        }

        size
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        buf.put_u8(b0);

        let mask_bit = if self.masked { 0x80 } else { 0x00 };

        if self.payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// A complete WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader {
                fin,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a continuation frame
    #[inline]
    pub fn continuation(data: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(OpCode::Continuation, data.into(), fin)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Frame opcode
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }
}

/// Outcome of a decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of bytes it occupied
    Frame(Frame, usize),
    /// The buffer holds only part of a frame
    NeedMoreData,
}

/// Stateless frame encoder/decoder for one endpoint role
///
/// A server codec requires masked input and writes unmasked frames; a client
/// codec is the mirror image.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec for `role`
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            max_frame_size,
        }
    }

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Encode `frame` for this role into `buf`
    ///
    /// Clients mask with a fresh random key on every call; servers never
    /// mask. Any mask already present on `frame` is ignored.
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> Result<()> {
        let opcode = frame.header.opcode;
        if opcode.is_control() {
            if !frame.header.fin {
                return Err(Error::InvalidArgument("control frames cannot be fragmented"));
            }
            if frame.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(Error::InvalidArgument(
                    "control frame payload exceeds 125 bytes",
                ));
            }
        }
        if (frame.payload.len() as u64) >> 63 != 0 {
            return Err(Error::FrameTooLarge);
        }

        let mask = match self.role {
            Role::Client => Some(generate_mask()?),
            Role::Server => None,
        };
        encode_frame(buf, opcode, &frame.payload, frame.header.fin, mask);
        Ok(())
    }

    /// Try to decode one frame from the front of `buf`
    ///
    /// Never consumes anything; on success the caller advances by the
    /// returned byte count.
    pub fn decode(&self, buf: &[u8]) -> Result<Decoded> {
        let (header, header_len) = match self.decode_header(buf)? {
            Some(parsed) => parsed,
            None => return Ok(Decoded::NeedMoreData),
        };

        let payload_len = header.payload_len as usize;
        let total = header_len + payload_len;
        if buf.len() < total {
            return Ok(Decoded::NeedMoreData);
        }

        let mut payload = BytesMut::from(&buf[header_len..total]);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Decoded::Frame(
            Frame {
                header,
                payload: payload.freeze(),
            },
            total,
        ))
    }

    /// Decode one frame and split it off the front of `buf`
    ///
    /// Zero-copy variant of [`decode`](Self::decode) used by the I/O pipe.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let (header, header_len) = match self.decode_header(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        let payload_len = header.payload_len as usize;
        if buf.len() < header_len + payload_len {
            return Ok(None);
        }

        buf.advance(header_len);
        let mut payload = buf.split_to(payload_len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }

    /// Parse and validate a header
    ///
    /// Returns `None` while the header itself is incomplete. Validation
    /// happens as soon as the bytes it depends on are present, so garbage is
    /// rejected without waiting for a payload that may never come.
    fn decode_header(&self, buf: &[u8]) -> Result<Option<(FrameHeader, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        let rsv2 = b0 & 0x20 != 0;
        let rsv3 = b0 & 0x10 != 0;

        // No extension is ever negotiated
        if rsv1 || rsv2 || rsv3 {
            return Err(Error::Protocol("reserved bits must be 0"));
        }

        let opcode = OpCode::from_u8(b0);
        if opcode.is_reserved() {
            return Err(Error::Protocol("reserved opcode"));
        }

        // Control frames must not be fragmented
        if opcode.is_control() && !fin {
            return Err(Error::Protocol("control frame must not be fragmented"));
        }

        let masked = b1 & 0x80 != 0;
        let len_byte = b1 & 0x7F;

        match self.role {
            Role::Server if !masked => {
                return Err(Error::Protocol("client frames must be masked"));
            }
            Role::Client if masked => {
                return Err(Error::Protocol("server frames must not be masked"));
            }
            _ => {}
        }

        let (payload_len, mut header_len) = match len_byte {
            0..=125 => (len_byte as u64, 2),
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if len < 126 {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                (len, 4)
            }
            _ => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(Error::Protocol("payload length MSB must be 0"));
                }
                if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                    return Err(Error::Protocol("payload length not minimal"));
                }
                (len, 10)
            }
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::Protocol("control frame too large"));
        }

        if payload_len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }

        let mask = if masked {
            if buf.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [
                buf[header_len],
                buf[header_len + 1],
                buf[header_len + 2],
                buf[header_len + 3],
            ];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some((
            FrameHeader {
                fin,
                rsv1,
                rsv2,
                rsv3,
                opcode,
                masked,
                payload_len,
                mask,
            },
            header_len,
        )))
    }
}

/// Encode a frame into a buffer
///
/// For masked frames (client mode) the payload is copied and masked in the
/// output buffer; `payload` itself is left untouched.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let header = FrameHeader {
        fin,
        rsv1: false,
        rsv2: false,
        rsv3: false,
        opcode,
        masked: mask.is_some(),
        payload_len: payload.len() as u64,
        mask,
    };

    buf.reserve(header.header_size() + payload.len());
    header.encode(buf);

    if let Some(m) = mask {
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> FrameCodec {
        FrameCodec::new(Role::Client, 1024 * 1024)
    }

    fn server() -> FrameCodec {
        FrameCodec::new(Role::Server, 1024 * 1024)
    }

    fn expect_frame(decoded: Decoded) -> (Frame, usize) {
        match decoded {
            Decoded::Frame(frame, consumed) => (frame, consumed),
            Decoded::NeedMoreData => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), OpCode::ReservedData(0x3));
        assert_eq!(OpCode::from_u8(0xB), OpCode::ReservedControl(0xB));
        assert!(OpCode::ReservedControl(0xB).is_control());
    }

    #[test]
    fn test_decode_small_unmasked() {
        let buf = [0x81, 0x05, b'h', b'e', b'l', b'l', b'o'];
        let (frame, consumed) = expect_frame(client().decode(&buf).unwrap());
        assert!(frame.header.fin);
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_decode_small_masked() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut payload = *b"Hello";
        apply_mask(&mut payload, mask);

        let mut buf = BytesMut::new();
        buf.put_u8(0x81);
        buf.put_u8(0x85);
        buf.put_slice(&mask);
        buf.put_slice(&payload);

        let (frame, _) = expect_frame(server().decode(&buf).unwrap());
        assert_eq!(frame.payload.as_ref(), b"Hello");
        assert_eq!(frame.header.mask, Some(mask));
    }

    #[test]
    fn test_decode_needs_more_at_every_boundary() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &[7u8; 300], true, Some([1, 2, 3, 4]));

        let codec = server();
        for cut in 0..buf.len() {
            assert_eq!(
                codec.decode(&buf[..cut]).unwrap(),
                Decoded::NeedMoreData,
                "cut at {}",
                cut
            );
        }
        let (frame, consumed) = expect_frame(codec.decode(&buf).unwrap());
        assert_eq!(consumed, buf.len());
        assert_eq!(frame.payload.as_ref(), &[7u8; 300][..]);
    }

    #[test]
    fn test_round_trip_lengths() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = Frame::binary(payload.clone());

            let mut wire = BytesMut::new();
            client().encode(&frame, &mut wire).unwrap();
            let (decoded, consumed) = expect_frame(server().decode(&wire).unwrap());
            assert_eq!(consumed, wire.len());
            assert_eq!(decoded.opcode(), OpCode::Binary);
            assert!(decoded.is_final());
            assert_eq!(decoded.payload.as_ref(), &payload[..], "len {}", len);

            let mut wire = BytesMut::new();
            server().encode(&frame, &mut wire).unwrap();
            let (decoded, _) = expect_frame(client().decode(&wire).unwrap());
            assert_eq!(decoded.payload.as_ref(), &payload[..]);
        }
    }

    #[test]
    fn test_length_encodings() {
        let mut wire = BytesMut::new();
        server().encode(&Frame::binary(vec![0u8; 125]), &mut wire).unwrap();
        assert_eq!(wire[1], 125);

        let mut wire = BytesMut::new();
        server().encode(&Frame::binary(vec![0u8; 126]), &mut wire).unwrap();
        assert_eq!(wire[1], 126);
        assert_eq!(&wire[2..4], &126u16.to_be_bytes());

        let mut wire = BytesMut::new();
        server().encode(&Frame::binary(vec![0u8; 65536]), &mut wire).unwrap();
        assert_eq!(wire[1], 127);
        assert_eq!(&wire[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn test_header_for_4gib_payload() {
        let header = FrameHeader {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Binary,
            masked: false,
            payload_len: 1 << 32,
            mask: None,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), header.header_size());
        assert_eq!(buf[1], 127);

        let codec = FrameCodec::new(Role::Client, usize::MAX);
        assert_eq!(codec.decode(&buf).unwrap(), Decoded::NeedMoreData);
        assert!(matches!(
            client().decode(&buf),
            Err(Error::FrameTooLarge)
        ));

        // Header plus the first payload bytes: length is known, frame is not
        buf.extend_from_slice(&[0xAB; 16]);
        let (parsed, header_len) = codec.decode_header(&buf).unwrap().unwrap();
        assert_eq!(parsed.payload_len, 1 << 32);
        assert_eq!(header_len, 10);
        assert!(parsed.fin);
        assert_eq!(parsed.opcode, OpCode::Binary);
        assert_eq!(codec.decode(&buf).unwrap(), Decoded::NeedMoreData);

        let mut partial = buf.clone();
        assert!(codec.decode_from(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), buf.len());
    }

    #[test]
    fn test_client_masks_and_server_does_not() {
        let frame = Frame::text("test");

        let mut wire = BytesMut::new();
        client().encode(&frame, &mut wire).unwrap();
        assert_eq!(wire[0], 0x81);
        assert_eq!(wire[1], 0x84);
        let mask = [wire[2], wire[3], wire[4], wire[5]];
        let mut payload = wire[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"test");

        let mut wire = BytesMut::new();
        server().encode(&frame, &mut wire).unwrap();
        assert_eq!(&wire[..], &[0x81, 0x04, b't', b'e', b's', b't']);
    }

    #[test]
    fn test_masking_direction_enforced() {
        // Unmasked frame arriving at a server
        assert!(matches!(
            server().decode(&[0x81, 0x00]),
            Err(Error::Protocol(_))
        ));
        // Masked frame arriving at a client
        assert!(matches!(
            client().decode(&[0x81, 0x80, 0, 0, 0, 0]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        for b0 in [0xC1u8, 0xA1, 0x91] {
            assert!(matches!(
                client().decode(&[b0, 0x00]),
                Err(Error::Protocol(_))
            ));
        }
    }

    #[test]
    fn test_reserved_opcode_rejected() {
        assert!(client().decode(&[0x83, 0x00]).is_err());
        assert!(client().decode(&[0x8B, 0x00]).is_err());
    }

    #[test]
    fn test_control_frame_fragmentation() {
        // Ping without FIN
        assert!(client().decode(&[0x09, 0x00]).is_err());
    }

    #[test]
    fn test_control_frame_too_large() {
        assert!(client().decode(&[0x89, 126, 0x00, 0x7E]).is_err());
        assert!(client().encode(&Frame::ping(vec![0u8; 126]), &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_non_minimal_length_rejected() {
        assert!(client().decode(&[0x82, 126, 0x00, 0x05]).is_err());
        let mut buf = vec![0x82, 127];
        buf.extend_from_slice(&100u64.to_be_bytes());
        assert!(client().decode(&buf).is_err());
    }

    #[test]
    fn test_length_msb_rejected() {
        let mut buf = vec![0x82, 127];
        buf.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert!(matches!(
            FrameCodec::new(Role::Client, usize::MAX).decode(&buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_from_advances_buffer() {
        let mut buf = BytesMut::from(&[0x81, 0x02, b'h', b'i', 0x89, 0x00][..]);
        let codec = client();
        let first = codec.decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"hi");
        let second = codec.decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(second.opcode(), OpCode::Ping);
        assert!(buf.is_empty());
        assert!(codec.decode_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_close_frame() {
        let frame = Frame::close(1000, "goodbye");
        assert_eq!(frame.opcode(), OpCode::Close);
        assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&frame.payload[2..], b"goodbye");
    }
}
