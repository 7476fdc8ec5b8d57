//! Relay frame and UDP fragment codecs.
//!
//! All multi-byte fields are big-endian. The kind (and, for fragments, the
//! peer id) is XOR-masked with the random nonce so that header bytes vary
//! from packet to packet.
//!
//! ## Relay frame
//!
//! ```text
//! +---------+----------------------+-------------+-----------+
//! | nonce   | kind ^ (nonce & ffff)| size        | payload   |
//! | u32     | u16                  | u32         | size      |
//! +---------+----------------------+-------------+-----------+
//! ```
//!
//! ## Fragment
//!
//! ```text
//! +---------+----------------------+-------------------------------------+------------+
//! | nonce   | kind ^ (nonce & ffff)| peer_id ^ (nonce | !nonce << 32)    | ciphertext |
//! | u32     | u16                  | u64                                 |            |
//! +---------+----------------------+-------------------------------------+------------+
//! ```

use crate::error::CodecError;
use crate::ids::PeerId;
use crate::message::MessageKind;
use crate::{FRAGMENT_HEADER_SIZE, FRAME_HEADER_SIZE, HEADER_NONCE_SIZE, MAX_MESSAGE_SIZE};

fn mask_kind(kind: u16, nonce: u32) -> u16 {
    kind ^ (nonce & 0xFFFF) as u16
}

fn mask_peer(peer: u64, nonce: u32) -> u64 {
    let nonce = u64::from(nonce);
    peer ^ (nonce | (!nonce << 32))
}

/// A complete relay frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Per-frame random nonce
    pub nonce: u32,
    /// Message kind
    pub kind: MessageKind,
    /// Payload (ciphertext for non-handshake kinds)
    pub payload: Vec<u8>,
}

/// Encode one relay frame.
///
/// # Errors
///
/// Returns [`CodecError::MessageTooLarge`] if the payload exceeds
/// [`MAX_MESSAGE_SIZE`].
pub fn encode_frame(nonce: u32, kind: MessageKind, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&nonce.to_be_bytes());
    buf.extend_from_slice(&mask_kind(kind.into(), nonce).to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[derive(Debug, Clone, Copy)]
struct PendingHeader {
    nonce: u32,
    kind: MessageKind,
    size: usize,
}

/// Streaming decoder for relay frames.
///
/// Bytes may arrive in arbitrary chunks; partial headers and payloads are
/// buffered until the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pending: Option<PendingHeader>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes held back waiting for more input.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed `input` and return every frame it completes.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown kind or an oversized declared size.
    /// The decoder should be discarded after an error.
    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<Frame>, CodecError> {
        self.buf.extend_from_slice(input);

        let mut frames = Vec::new();
        let mut pos = 0;

        loop {
            let header = match self.pending {
                Some(header) => header,
                None => {
                    if self.buf.len() - pos < FRAME_HEADER_SIZE {
                        break;
                    }
                    let header = Self::read_header(&self.buf[pos..pos + FRAME_HEADER_SIZE])?;
                    pos += FRAME_HEADER_SIZE;
                    self.pending = Some(header);
                    header
                }
            };

            if self.buf.len() - pos < header.size {
                break;
            }

            frames.push(Frame {
                nonce: header.nonce,
                kind: header.kind,
                payload: self.buf[pos..pos + header.size].to_vec(),
            });
            pos += header.size;
            self.pending = None;
        }

        self.buf.drain(..pos);
        Ok(frames)
    }

    fn read_header(header: &[u8]) -> Result<PendingHeader, CodecError> {
        let nonce = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let masked = u16::from_be_bytes([header[4], header[5]]);
        let size = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;

        let kind = MessageKind::try_from(mask_kind(masked, nonce))?;
        if size > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(PendingHeader { nonce, kind, size })
    }
}

/// Decoded fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Per-packet random nonce (also the tunnel cipher counter)
    pub nonce: u32,
    /// Fragment kind, [`MessageKind::Fragment`] or [`MessageKind::Discovery`]
    pub kind: MessageKind,
    /// Sending peer
    pub peer_id: PeerId,
}

/// Encode a UDP fragment around already-encrypted `ciphertext`.
#[must_use]
pub fn encode_fragment(header: FragmentHeader, ciphertext: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + ciphertext.len());
    buf.extend_from_slice(&header.nonce.to_be_bytes());
    buf.extend_from_slice(&mask_kind(header.kind.into(), header.nonce).to_be_bytes());
    buf.extend_from_slice(&mask_peer(header.peer_id.0, header.nonce).to_be_bytes());
    buf.extend_from_slice(ciphertext);
    buf
}

/// Split a UDP fragment into its header and ciphertext.
///
/// # Errors
///
/// Returns [`CodecError::TooShort`] if `data` is shorter than the header and
/// [`CodecError::UnknownKind`] if the unmasked kind is not known.
pub fn decode_fragment(data: &[u8]) -> Result<(FragmentHeader, &[u8]), CodecError> {
    if data.len() < FRAGMENT_HEADER_SIZE {
        return Err(CodecError::TooShort {
            expected: FRAGMENT_HEADER_SIZE,
            actual: data.len(),
        });
    }

    let nonce = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let masked_kind = u16::from_be_bytes([data[4], data[5]]);
    let mut peer = [0u8; 8];
    peer.copy_from_slice(&data[HEADER_NONCE_SIZE + 2..FRAGMENT_HEADER_SIZE]);
    let masked_peer = u64::from_be_bytes(peer);

    let header = FragmentHeader {
        nonce,
        kind: MessageKind::try_from(mask_kind(masked_kind, nonce))?,
        peer_id: PeerId(mask_peer(masked_peer, nonce)),
    };
    Ok((header, &data[FRAGMENT_HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let encoded = encode_frame(0x0000_0001, MessageKind::Heartbeat, b"abc").unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 3);
        assert_eq!(&encoded[..4], &[0, 0, 0, 1]);
        // kind 3 masked with nonce low bits 1
        assert_eq!(&encoded[4..6], &[0, 2]);
        assert_eq!(&encoded[6..10], &[0, 0, 0, 3]);
        assert_eq!(&encoded[10..], b"abc");
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let mut stream = encode_frame(77, MessageKind::Forward, b"first").unwrap();
        stream.extend(encode_frame(78, MessageKind::Discovery, b"second").unwrap());

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &stream {
            frames.extend(decoder.decode(std::slice::from_ref(byte)).unwrap());
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].nonce, 77);
        assert_eq!(frames[0].kind, MessageKind::Forward);
        assert_eq!(frames[0].payload, b"first");
        assert_eq!(frames[1].kind, MessageKind::Discovery);
        assert_eq!(frames[1].payload, b"second");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_zero_length_payload() {
        let mut stream = encode_frame(5, MessageKind::Heartbeat, &[]).unwrap();
        stream.extend(encode_frame(6, MessageKind::Heartbeat, b"x").unwrap());

        let frames = FrameDecoder::new().decode(&stream).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].payload.is_empty());
        assert_eq!(frames[1].payload, b"x");
    }

    #[test]
    fn test_partial_header_is_buffered() {
        let stream = encode_frame(9, MessageKind::ProbeRequest, b"payload").unwrap();
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&stream[..4]).unwrap().is_empty());
        assert_eq!(decoder.buffered(), 4);
        let frames = decoder.decode(&stream[4..]).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_oversized_rejected() {
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            encode_frame(1, MessageKind::Forward, &big),
            Err(CodecError::MessageTooLarge { .. })
        ));

        let mut header = Vec::new();
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&u16::from(MessageKind::Forward).to_be_bytes());
        header.extend_from_slice(&((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes());
        assert!(matches!(
            FrameDecoder::new().decode(&header),
            Err(CodecError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_max_size_accepted() {
        let payload = vec![0xAB; MAX_MESSAGE_SIZE];
        let stream = encode_frame(3, MessageKind::Forward, &payload).unwrap();
        let frames = FrameDecoder::new().decode(&stream).unwrap();
        assert_eq!(frames[0].payload.len(), MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&999u16.to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(
            FrameDecoder::new().decode(&header),
            Err(CodecError::UnknownKind(999))
        );
    }

    #[test]
    fn test_fragment_masks_header() {
        let header = FragmentHeader {
            nonce: 0xDEAD_BEEF,
            kind: MessageKind::Fragment,
            peer_id: PeerId(12_345_678),
        };
        let encoded = encode_fragment(header, b"cipher");
        assert_eq!(encoded.len(), FRAGMENT_HEADER_SIZE + 6);
        // Peer id is not written in the clear.
        assert_ne!(&encoded[6..14], &12_345_678u64.to_be_bytes());

        let (decoded, body) = decode_fragment(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, b"cipher");
    }

    #[test]
    fn test_fragment_too_short() {
        assert_eq!(
            decode_fragment(&[0u8; 13]).unwrap_err(),
            CodecError::TooShort {
                expected: FRAGMENT_HEADER_SIZE,
                actual: 13
            }
        );
    }
}
