//! Property-based tests for Strand
//!
//! Uses proptest to verify codec and crypto invariants across large input
//! spaces.

use proptest::prelude::*;

// ============================================================================
// Relay Frame Properties
// ============================================================================

mod frame_properties {
    use super::*;
    use strand_core::codec::{FrameDecoder, encode_frame};
    use strand_core::{FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE, MessageKind};

    fn kind() -> impl Strategy<Value = MessageKind> {
        prop_oneof![
            Just(MessageKind::Handshake),
            Just(MessageKind::HandshakeAck),
            Just(MessageKind::Heartbeat),
            Just(MessageKind::ProbeRequest),
            Just(MessageKind::ProbeResponse),
            Just(MessageKind::SyncPeer),
            Just(MessageKind::Forward),
            Just(MessageKind::EchoRequest),
        ]
    }

    proptest! {
        /// A stream of frames decodes to the same frames however it is cut
        #[test]
        fn stream_decodes_regardless_of_chunking(
            frames in prop::collection::vec(
                (any::<u32>(), kind(), prop::collection::vec(any::<u8>(), 0..256)),
                1..8,
            ),
            cuts in prop::collection::vec(1usize..64, 1..32),
        ) {
            let mut stream = Vec::new();
            for (nonce, kind, payload) in &frames {
                stream.extend(encode_frame(*nonce, *kind, payload).unwrap());
            }

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            let mut rest = &stream[..];
            let mut cut = cuts.iter().cycle();
            while !rest.is_empty() {
                let n = (*cut.next().unwrap()).min(rest.len());
                decoded.extend(decoder.decode(&rest[..n]).unwrap());
                rest = &rest[n..];
            }

            prop_assert_eq!(decoder.buffered(), 0);
            prop_assert_eq!(decoded.len(), frames.len());
            for (frame, (nonce, kind, payload)) in decoded.iter().zip(&frames) {
                prop_assert_eq!(frame.nonce, *nonce);
                prop_assert_eq!(frame.kind, *kind);
                prop_assert_eq!(&frame.payload, payload);
            }
        }

        /// Frame length is always header plus payload
        #[test]
        fn frame_length(nonce in any::<u32>(), len in 0usize..=MAX_MESSAGE_SIZE) {
            let payload = vec![0xAB; len];
            let encoded = encode_frame(nonce, MessageKind::Forward, &payload).unwrap();
            prop_assert_eq!(encoded.len(), FRAME_HEADER_SIZE + len);
        }

        /// Oversized payloads are refused on both sides
        #[test]
        fn oversized_frames_rejected(extra in 1usize..512, nonce in any::<u32>()) {
            let payload = vec![0u8; MAX_MESSAGE_SIZE + extra];
            prop_assert!(encode_frame(nonce, MessageKind::Forward, &payload).is_err());

            let mut header = Vec::new();
            header.extend_from_slice(&nonce.to_be_bytes());
            header.extend_from_slice(&((u16::from(MessageKind::Forward)) ^ (nonce & 0xFFFF) as u16).to_be_bytes());
            header.extend_from_slice(&((MAX_MESSAGE_SIZE + extra) as u32).to_be_bytes());
            prop_assert!(FrameDecoder::new().decode(&header).is_err());
        }

        /// Arbitrary bytes never panic the decoder
        #[test]
        fn decoder_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = FrameDecoder::new().decode(&data);
        }
    }
}

// ============================================================================
// Fragment Properties
// ============================================================================

mod fragment_properties {
    use super::*;
    use strand_core::codec::{FragmentHeader, decode_fragment, encode_fragment};
    use strand_core::{FRAGMENT_HEADER_SIZE, MessageKind, PeerId};

    proptest! {
        /// Header fields survive the nonce masking
        #[test]
        fn fragment_header_unmasks(
            nonce in any::<u32>(),
            peer in any::<u64>(),
            discovery in any::<bool>(),
            body in prop::collection::vec(any::<u8>(), 0..128),
        ) {
            let kind = if discovery { MessageKind::Discovery } else { MessageKind::Fragment };
            let header = FragmentHeader { nonce, kind, peer_id: PeerId(peer) };
            let encoded = encode_fragment(header, &body);
            prop_assert_eq!(encoded.len(), FRAGMENT_HEADER_SIZE + body.len());

            let (decoded, rest) = decode_fragment(&encoded).unwrap();
            prop_assert_eq!(decoded, header);
            prop_assert_eq!(rest, &body[..]);
        }

        /// Truncated fragments are rejected
        #[test]
        fn short_fragments_rejected(data in prop::collection::vec(any::<u8>(), 0..FRAGMENT_HEADER_SIZE)) {
            prop_assert!(decode_fragment(&data).is_err());
        }
    }
}

// ============================================================================
// Message Properties
// ============================================================================

mod message_properties {
    use super::*;
    use strand_core::message::{Forward, SyncPeer, SyncPurpose};
    use strand_core::{Message, MessageKind, PeerId};

    fn purpose() -> impl Strategy<Value = SyncPurpose> {
        prop_oneof![
            Just(SyncPurpose::Catchup),
            Just(SyncPurpose::CatchupAck),
            Just(SyncPurpose::PairRequest),
            Just(SyncPurpose::PairResponse),
            Just(SyncPurpose::EndpointsChanged),
        ]
    }

    proptest! {
        #[test]
        fn sync_peer_payload(
            src in any::<u64>(),
            dst in any::<u64>(),
            purpose in purpose(),
            endpoints in prop::collection::vec("[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}:[0-9]{1,5}", 0..4),
        ) {
            let msg = Message::SyncPeer(SyncPeer {
                src_peer_id: PeerId(src),
                dst_peer_id: PeerId(dst),
                purpose,
                peer: None,
                endpoints,
            });
            let payload = msg.encode_payload().unwrap();
            prop_assert_eq!(Message::decode(msg.kind(), &payload).unwrap(), msg);
        }

        #[test]
        fn forward_payload(
            src in any::<u64>(),
            dst in any::<u64>(),
            nonce in any::<u32>(),
            fragment in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let msg = Message::Forward(Forward {
                src_peer_id: PeerId(src),
                dst_peer_id: PeerId(dst),
                nonce,
                fragment,
            });
            let payload = msg.encode_payload().unwrap();
            prop_assert_eq!(Message::decode(msg.kind(), &payload).unwrap(), msg);
        }

        /// Garbage payloads are errors, not panics
        #[test]
        fn garbage_probe_request(data in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = Message::decode(MessageKind::ProbeRequest, &data);
        }
    }
}

// ============================================================================
// Tunnel Cipher Properties
// ============================================================================

mod tunnel_cipher_properties {
    use super::*;
    use strand_crypto::aead::TunnelCipher;
    use strand_crypto::x25519::PrivateKey;

    proptest! {
        /// Both ends derive the same cipher from their static keys
        #[test]
        fn derived_ciphers_interoperate(
            a in any::<[u8; 32]>(),
            b in any::<[u8; 32]>(),
            counter in any::<u32>(),
            packet in prop::collection::vec(any::<u8>(), 1..1500),
        ) {
            let alice = PrivateKey::from_bytes(a);
            let bob = PrivateKey::from_bytes(b);
            let (Ok(to_bob), Ok(to_alice)) = (
                TunnelCipher::derive(&alice, &bob.public_key()),
                TunnelCipher::derive(&bob, &alice.public_key()),
            ) else {
                // Low order points are refused by both sides alike
                return Ok(());
            };

            let sealed = to_bob.seal(u64::from(counter), &packet).unwrap();
            prop_assert_eq!(to_alice.open(u64::from(counter), &sealed).unwrap(), packet);
        }

        /// A packet opened under another counter fails authentication
        #[test]
        fn wrong_counter_rejected(
            key in any::<[u8; 32]>(),
            counter in any::<u32>(),
            delta in 1u32..,
            packet in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let cipher = TunnelCipher::new(&key);
            let sealed = cipher.seal(u64::from(counter), &packet).unwrap();
            let other = u64::from(counter.wrapping_add(delta));
            prop_assert!(cipher.open(other, &sealed).is_err());
        }
    }
}

// ============================================================================
// Credential Properties
// ============================================================================

mod credential_properties {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::OnceLock;
    use strand_crypto::credential::{CredentialClaims, CredentialSigner};

    fn signer() -> &'static CredentialSigner {
        static SIGNER: OnceLock<CredentialSigner> = OnceLock::new();
        SIGNER.get_or_init(|| CredentialSigner::generate(1024).expect("rsa keygen"))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Any flipped bit invalidates the credential
        #[test]
        fn tampered_credentials_rejected(
            user in any::<u64>(),
            peer in any::<u64>(),
            octets in any::<[u8; 4]>(),
            flip in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let claims = CredentialClaims::new(user, peer, IpAddr::V4(Ipv4Addr::from(octets)), u64::MAX);
            let mut credential = signer().issue(&claims).unwrap();
            prop_assert_eq!(signer().verifier().verify(&credential).unwrap(), claims);

            let i = flip.index(credential.len());
            credential[i] ^= 1 << bit;
            prop_assert!(signer().verifier().verify(&credential).is_err());
        }

        /// Expiry is enforced at the verification time given
        #[test]
        fn expiry_enforced(expires_at in 1u64..u64::MAX / 2, skew in 1u64..1_000_000) {
            let claims = CredentialClaims::new(1, 2, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), expires_at);
            let credential = signer().issue(&claims).unwrap();
            prop_assert!(signer().verifier().verify_at(&credential, expires_at).is_ok());
            prop_assert!(signer().verifier().verify_at(&credential, expires_at + skew).is_err());
        }
    }
}
