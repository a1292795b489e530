//! Property-based tests for KTN packet encoding and validation
//!
//! Random packets must survive encoding, and any single-bit change to the
//! fields the checksum covers must make the packet invalid.

use bytes::Bytes;
use ktn_protocol::packet::{Flag, Packet, MAX_PAYLOAD_SIZE};
use ktn_protocol::sequence::SeqNumber;
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// Property test strategies

fn seq_number_strategy() -> impl Strategy<Value = SeqNumber> {
    any::<u32>().prop_map(SeqNumber::new)
}

fn endpoint_strategy() -> impl Strategy<Value = SocketAddr> {
    prop_oneof![
        (any::<[u8; 4]>(), any::<u16>())
            .prop_map(|(ip, port)| SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)),
        (any::<[u8; 16]>(), any::<u16>())
            .prop_map(|(ip, port)| SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)),
    ]
}

fn control_flag_strategy() -> impl Strategy<Value = Flag> {
    prop_oneof![
        Just(Flag::Syn),
        Just(Flag::SynAck),
        Just(Flag::Ack),
        Just(Flag::Fin),
    ]
}

fn data_packet_strategy() -> impl Strategy<Value = Packet> {
    (
        seq_number_strategy(),
        endpoint_strategy(),
        endpoint_strategy(),
        prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE),
    )
        .prop_map(|(seq, src, dst, payload)| Packet::data(seq, src, dst, Bytes::from(payload)))
}

fn control_packet_strategy() -> impl Strategy<Value = Packet> {
    (
        control_flag_strategy(),
        seq_number_strategy(),
        seq_number_strategy(),
        endpoint_strategy(),
        endpoint_strategy(),
    )
        .prop_map(|(flag, seq, ack, src, dst)| Packet::control(flag, seq, ack, src, dst))
}

fn packet_strategy() -> impl Strategy<Value = Packet> {
    prop_oneof![data_packet_strategy(), control_packet_strategy()]
}

proptest! {
    #[test]
    fn prop_encoded_packet_decodes_intact(packet in packet_strategy()) {
        let bytes = packet.to_bytes();
        prop_assert_eq!(bytes.len(), packet.size());

        let decoded = Packet::from_bytes(&bytes).unwrap();
        prop_assert!(decoded.is_intact());
        prop_assert!(decoded.is_valid_for(packet.destination));
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn prop_bit_flip_is_detected(packet in packet_strategy(), index in any::<prop::sample::Index>(), bit in 0u8..8) {
        let mut bytes = packet.to_bytes();
        let at = index.index(bytes.len());
        bytes[at] ^= 1 << bit;

        // Either the damaged datagram no longer decodes, or it decodes to a
        // packet that fails validation
        if let Ok(decoded) = Packet::from_bytes(&bytes) {
            prop_assert!(!decoded.is_intact() || !decoded.is_valid_for(packet.destination));
        }
    }

    #[test]
    fn prop_truncation_is_rejected(packet in packet_strategy(), cut in 1usize..16) {
        let bytes = packet.to_bytes();
        let cut = cut.min(bytes.len());
        prop_assert!(Packet::from_bytes(&bytes[..bytes.len() - cut]).is_err());
    }

    #[test]
    fn prop_wrong_destination_is_invalid(packet in packet_strategy(), other in endpoint_strategy()) {
        prop_assume!(other != packet.destination);
        prop_assert!(packet.is_intact());
        prop_assert!(!packet.is_valid_for(other));
    }

    #[test]
    fn prop_sequence_increment_wraps(raw in any::<u32>()) {
        let seq = SeqNumber::new(raw);
        prop_assert_eq!(seq.next().as_raw(), raw.wrapping_add(1));
        prop_assert_eq!(seq.distance_to(seq.next()), 1);
        prop_assert!(seq.next().is_ahead_of(seq));
    }
}

#[test]
fn test_control_packet_with_payload_rejected() {
    let src: SocketAddr = "127.0.0.1:8001".parse().unwrap();
    let dst: SocketAddr = "127.0.0.1:8002".parse().unwrap();
    let mut bytes = Packet::data(SeqNumber::new(1), src, dst, Bytes::from_static(b"x")).to_bytes();
    // Flag byte follows seq and ack
    bytes[8] = Flag::Fin.as_u8();
    assert!(Packet::from_bytes(&bytes).is_err());
}
