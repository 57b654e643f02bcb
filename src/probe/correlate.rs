use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use std::net::IpAddr;

use crate::probe::icmp::{ICMP_HEADER_SIZE, ICMPV6_ECHO_REQUEST};

// IP protocol numbers
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

// ICMPv4 type codes
const ICMP_ECHO_REQUEST: u8 = 8;

// ICMPv6 type codes
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_ECHO_REPLY: u8 = 129;

const IPV6_HEADER_LEN: usize = 40;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// What kind of answer an inbound packet carries for one of our requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    EchoReply,
    DestUnreachable(u8),
}

/// Inbound ICMP message correlated to one of our Echo Requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Source address of the inbound packet
    pub responder: IpAddr,
    /// Sequence number of the Echo Request this answers
    pub sequence: u16,
    pub kind: ResponseKind,
}

/// Calculate ICMP checksum (RFC 1071)
/// Returns true if checksum is valid (sums to 0xFFFF or 0x0000 after folding)
fn validate_icmp_checksum(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    let mut sum: u32 = 0;

    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }

    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum == 0xFFFF || sum == 0x0000
}

/// Read identifier and sequence from an ICMP echo header
fn echo_fields(icmp_data: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([icmp_data[4], icmp_data[5]]),
        u16::from_be_bytes([icmp_data[6], icmp_data[7]]),
    )
}

/// Parse an inbound ICMP packet and correlate it to our identifier
///
/// When `has_ip_header` is false, the packet starts directly at the ICMP
/// header (raw ICMPv6 sockets and unprivileged datagram sockets deliver it
/// that way). Raw IPv4 sockets include the IPv4 header.
///
/// Returns None if:
/// - Packet is malformed or truncated
/// - Packet is not an Echo Reply or Destination Unreachable
/// - Packet does not answer one of our requests (wrong identifier)
/// - ICMP checksum of an Echo Reply is invalid
pub fn parse_icmp_response(
    data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
    has_ip_header: bool,
) -> Option<ParsedResponse> {
    if data.is_empty() {
        return None;
    }

    if responder.is_ipv6() {
        parse_icmpv6(data, responder, our_identifier)
    } else if has_ip_header {
        let ip_packet = Ipv4Packet::new(data)?;
        if ip_packet.get_version() != 4 {
            return None;
        }
        let ip_header_len = (ip_packet.get_header_length() as usize) * 4;
        if ip_header_len < IPV4_MIN_HEADER_LEN || data.len() < ip_header_len {
            return None;
        }
        parse_icmpv4(&data[ip_header_len..], responder, our_identifier)
    } else {
        parse_icmpv4(data, responder, our_identifier)
    }
}

/// Parse an ICMPv4 message (starting at the ICMP header)
fn parse_icmpv4(icmp_data: &[u8], responder: IpAddr, our_identifier: u16) -> Option<ParsedResponse> {
    if icmp_data.len() < ICMP_HEADER_SIZE {
        return None;
    }
    let icmp_packet = IcmpPacket::new(icmp_data)?;

    match icmp_packet.get_icmp_type() {
        IcmpTypes::EchoReply => {
            if !validate_icmp_checksum(icmp_data) {
                return None;
            }

            let (identifier, sequence) = echo_fields(icmp_data);
            (identifier == our_identifier).then_some(ParsedResponse {
                responder,
                sequence,
                kind: ResponseKind::EchoReply,
            })
        }
        IcmpTypes::DestinationUnreachable => {
            let code = icmp_packet.get_icmp_code().0;
            let sequence = quoted_request_v4(icmp_data, our_identifier)?;
            Some(ParsedResponse {
                responder,
                sequence,
                kind: ResponseKind::DestUnreachable(code),
            })
        }
        _ => None,
    }
}

/// Recover the sequence number of our Echo Request quoted in an ICMPv4 error
///
/// ICMP error format:
/// [0-7]  ICMP header
/// [8..]  Original IP header + first 8 bytes of original payload
fn quoted_request_v4(icmp_data: &[u8], our_identifier: u16) -> Option<u16> {
    if icmp_data.len() < ICMP_HEADER_SIZE + IPV4_MIN_HEADER_LEN + ICMP_HEADER_SIZE {
        return None;
    }

    let original_ip_data = &icmp_data[ICMP_HEADER_SIZE..];
    let original_ip = Ipv4Packet::new(original_ip_data)?;
    let orig_ihl = (original_ip.get_header_length() as usize) * 4;

    if original_ip.get_next_level_protocol().0 != IPPROTO_ICMP
        || orig_ihl < IPV4_MIN_HEADER_LEN
        || original_ip_data.len() < orig_ihl + ICMP_HEADER_SIZE
    {
        return None;
    }

    let original_payload = &original_ip_data[orig_ihl..];
    if original_payload[0] != ICMP_ECHO_REQUEST {
        return None;
    }

    let (identifier, sequence) = echo_fields(original_payload);
    (identifier == our_identifier).then_some(sequence)
}

/// Parse an ICMPv6 message (Linux strips the IPv6 header on raw ICMPv6 sockets)
fn parse_icmpv6(icmp_data: &[u8], responder: IpAddr, our_identifier: u16) -> Option<ParsedResponse> {
    if icmp_data.len() < ICMP_HEADER_SIZE {
        return None;
    }

    let icmp_type = icmp_data[0];
    let icmp_code = icmp_data[1];

    match icmp_type {
        ICMPV6_ECHO_REPLY => {
            let (identifier, sequence) = echo_fields(icmp_data);
            (identifier == our_identifier).then_some(ParsedResponse {
                responder,
                sequence,
                kind: ResponseKind::EchoReply,
            })
        }
        ICMPV6_DEST_UNREACHABLE => {
            let sequence = quoted_request_v6(icmp_data, our_identifier)?;
            Some(ParsedResponse {
                responder,
                sequence,
                kind: ResponseKind::DestUnreachable(icmp_code),
            })
        }
        _ => None,
    }
}

/// Recover the sequence number of our Echo Request quoted in an ICMPv6 error
///
/// Assumes the quoted IPv6 packet carries no extension headers, which holds
/// for the Echo Requests we send.
fn quoted_request_v6(icmp_data: &[u8], our_identifier: u16) -> Option<u16> {
    // 8 (ICMPv6 header) + 40 (IPv6 header) + 8 (original ICMPv6 header)
    if icmp_data.len() < ICMP_HEADER_SIZE + IPV6_HEADER_LEN + ICMP_HEADER_SIZE {
        return None;
    }

    let original_ipv6_data = &icmp_data[ICMP_HEADER_SIZE..];
    if original_ipv6_data[0] >> 4 != 6 {
        return None;
    }
    // Next header field is at byte 6 of IPv6 header
    if original_ipv6_data[6] != IPPROTO_ICMPV6 {
        return None;
    }

    let original_payload = &original_ipv6_data[IPV6_HEADER_LEN..];
    if original_payload[0] != ICMPV6_ECHO_REQUEST {
        return None;
    }

    let (identifier, sequence) = echo_fields(original_payload);
    (identifier == our_identifier).then_some(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::icmp::build_echo_request;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const ID: u16 = 0x1234;

    /// Helper to compute and set ICMP checksum for a packet slice
    /// Assumes checksum field is at offset 2-3 of the ICMP section
    fn set_icmp_checksum(icmp_data: &mut [u8]) {
        icmp_data[2] = 0;
        icmp_data[3] = 0;

        let mut sum: u32 = 0;
        let mut i = 0;
        while i + 1 < icmp_data.len() {
            sum += u16::from_be_bytes([icmp_data[i], icmp_data[i + 1]]) as u32;
            i += 2;
        }
        if i < icmp_data.len() {
            sum += (icmp_data[i] as u32) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        let checksum = !sum as u16;
        icmp_data[2] = (checksum >> 8) as u8;
        icmp_data[3] = (checksum & 0xFF) as u8;
    }

    fn ipv4_header(protocol: u8, dst: Ipv4Addr) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45; // Version 4, IHL 5
        header[8] = 64; // TTL
        header[9] = protocol;
        header[16..20].copy_from_slice(&dst.octets());
        header
    }

    fn echo_reply_v4(identifier: u16, sequence: u16) -> Vec<u8> {
        let mut icmp = vec![0u8, 0, 0, 0];
        icmp.extend_from_slice(&identifier.to_be_bytes());
        icmp.extend_from_slice(&sequence.to_be_bytes());
        icmp.extend_from_slice(&[0xAA; 16]);
        set_icmp_checksum(&mut icmp);
        icmp
    }

    /// Destination Unreachable quoting our Echo Request
    fn dest_unreachable_v4(code: u8, identifier: u16, sequence: u16) -> Vec<u8> {
        let mut icmp = vec![3u8, code, 0, 0, 0, 0, 0, 0];
        icmp.extend(ipv4_header(IPPROTO_ICMP, Ipv4Addr::new(192, 0, 2, 9)));
        icmp.extend(build_echo_request(identifier, sequence, &[0u8; 8], false));
        set_icmp_checksum(&mut icmp);
        icmp
    }

    #[test]
    fn test_empty_packet_returns_none() {
        let responder = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert!(parse_icmp_response(&[], responder, ID, true).is_none());
    }

    #[test]
    fn test_truncated_packet_returns_none() {
        let responder = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let truncated = [0x45]; // IPv4, IHL=5
        assert!(parse_icmp_response(&truncated, responder, ID, true).is_none());
    }

    #[test]
    fn test_invalid_ip_version_returns_none() {
        let responder = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let mut packet = vec![0x35u8];
        packet.extend_from_slice(&[0u8; 19]);
        packet.extend(echo_reply_v4(ID, 1));
        assert!(parse_icmp_response(&packet, responder, ID, true).is_none());
    }

    #[test]
    fn test_parse_echo_reply_v4() {
        let responder = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9));
        let mut packet = ipv4_header(IPPROTO_ICMP, Ipv4Addr::new(10, 0, 0, 1));
        packet.extend(echo_reply_v4(ID, 42));

        let parsed = parse_icmp_response(&packet, responder, ID, true).unwrap();
        assert_eq!(parsed.responder, responder);
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.kind, ResponseKind::EchoReply);
    }

    #[test]
    fn test_parse_echo_reply_v4_without_ip_header() {
        let responder = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let packet = echo_reply_v4(ID, 7);

        let parsed = parse_icmp_response(&packet, responder, ID, false).unwrap();
        assert_eq!(parsed.sequence, 7);
    }

    #[test]
    fn test_identifier_mismatch_returns_none() {
        let responder = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let mut packet = ipv4_header(IPPROTO_ICMP, Ipv4Addr::new(10, 0, 0, 1));
        packet.extend(echo_reply_v4(0x5678, 1));

        assert!(parse_icmp_response(&packet, responder, ID, true).is_none());
    }

    #[test]
    fn test_bad_checksum_returns_none() {
        let responder = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let mut packet = ipv4_header(IPPROTO_ICMP, Ipv4Addr::new(10, 0, 0, 1));
        let mut reply = echo_reply_v4(ID, 1);
        reply[2] ^= 0xFF;
        packet.extend(reply);

        assert!(parse_icmp_response(&packet, responder, ID, true).is_none());
    }

    #[test]
    fn test_own_echo_request_is_ignored() {
        // Raw sockets see our outgoing requests on loopback
        let responder = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut packet = ipv4_header(IPPROTO_ICMP, Ipv4Addr::LOCALHOST);
        packet.extend(build_echo_request(ID, 3, &[1, 2, 3, 4], false));

        assert!(parse_icmp_response(&packet, responder, ID, true).is_none());
    }

    #[test]
    fn test_parse_dest_unreachable_v4() {
        let responder = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254));
        let mut packet = ipv4_header(IPPROTO_ICMP, Ipv4Addr::new(10, 0, 0, 1));
        packet.extend(dest_unreachable_v4(1, ID, 99));

        let parsed = parse_icmp_response(&packet, responder, ID, true).unwrap();
        assert_eq!(parsed.responder, responder);
        assert_eq!(parsed.sequence, 99);
        assert_eq!(parsed.kind, ResponseKind::DestUnreachable(1));
    }

    #[test]
    fn test_dest_unreachable_for_foreign_request_returns_none() {
        let responder = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254));
        let mut packet = ipv4_header(IPPROTO_ICMP, Ipv4Addr::new(10, 0, 0, 1));
        packet.extend(dest_unreachable_v4(3, 0x9999, 99));

        assert!(parse_icmp_response(&packet, responder, ID, true).is_none());
    }

    #[test]
    fn test_dest_unreachable_quoting_udp_returns_none() {
        let responder = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254));
        let mut icmp = vec![3u8, 3, 0, 0, 0, 0, 0, 0];
        icmp.extend(ipv4_header(17, Ipv4Addr::new(192, 0, 2, 9)));
        icmp.extend_from_slice(&[0u8; 8]);
        let mut packet = ipv4_header(IPPROTO_ICMP, Ipv4Addr::new(10, 0, 0, 1));
        packet.extend(icmp);

        assert!(parse_icmp_response(&packet, responder, ID, true).is_none());
    }

    #[test]
    fn test_parse_echo_reply_v6() {
        let responder = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let mut icmp = vec![ICMPV6_ECHO_REPLY, 0, 0, 0];
        icmp.extend_from_slice(&ID.to_be_bytes());
        icmp.extend_from_slice(&500u16.to_be_bytes());
        icmp.extend_from_slice(&[0u8; 56]);

        let parsed = parse_icmp_response(&icmp, responder, ID, false).unwrap();
        assert_eq!(parsed.sequence, 500);
        assert_eq!(parsed.kind, ResponseKind::EchoReply);
    }

    #[test]
    fn test_parse_dest_unreachable_v6() {
        let responder: IpAddr = "2001:db8::1".parse().unwrap();
        let mut icmp = vec![ICMPV6_DEST_UNREACHABLE, 3, 0, 0, 0, 0, 0, 0];
        let mut ipv6 = vec![0u8; IPV6_HEADER_LEN];
        ipv6[0] = 0x60;
        ipv6[6] = IPPROTO_ICMPV6;
        ipv6[7] = 64;
        icmp.extend(ipv6);
        icmp.extend(build_echo_request(ID, 77, &[0u8; 8], true));

        let parsed = parse_icmp_response(&icmp, responder, ID, false).unwrap();
        assert_eq!(parsed.sequence, 77);
        assert_eq!(parsed.kind, ResponseKind::DestUnreachable(3));
    }

    #[test]
    fn test_truncated_dest_unreachable_v6_returns_none() {
        let responder: IpAddr = "2001:db8::1".parse().unwrap();
        let mut icmp = vec![ICMPV6_DEST_UNREACHABLE, 3, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(&[0x60; 20]);
        assert!(parse_icmp_response(&icmp, responder, ID, false).is_none());
    }

    // ========================================================================
    // Property-based tests (proptest)
    // ========================================================================

    use proptest::prelude::*;

    proptest! {
        /// Random bytes should not panic when parsed as ICMP
        #[test]
        fn proptest_parse_icmp_no_panic(data in prop::collection::vec(0u8..=255, 0..1500)) {
            let responder = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
            let _ = parse_icmp_response(&data, responder, ID, true);
            let _ = parse_icmp_response(&data, responder, ID, false);
        }

        /// Random bytes should not panic when parsed as ICMPv6
        #[test]
        fn proptest_parse_icmpv6_no_panic(data in prop::collection::vec(0u8..=255, 0..1500)) {
            let responder = IpAddr::V6(Ipv6Addr::LOCALHOST);
            let _ = parse_icmp_response(&data, responder, ID, false);
        }

        /// IPv4 packets with various IHL values should not panic
        #[test]
        fn proptest_parse_ipv4_variable_ihl(
            ihl in 0u8..=15,
            payload in prop::collection::vec(0u8..=255, 0..200)
        ) {
            let header_len = (ihl as usize) * 4;
            let mut data = vec![0u8; header_len.max(20) + payload.len()];

            data[0] = 0x40 | ihl;
            data[9] = IPPROTO_ICMP;

            if header_len < data.len() {
                let copy_len = payload.len().min(data.len() - header_len);
                data[header_len..header_len + copy_len].copy_from_slice(&payload[..copy_len]);
            }

            let responder = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));
            let _ = parse_icmp_response(&data, responder, 0x9999, true);
        }

        /// Echo Replies with a correct checksum correlate for any id/seq
        #[test]
        fn proptest_echo_reply_correlates(identifier in 0u16..=65535, sequence in 0u16..=65535) {
            let responder = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
            let packet = echo_reply_v4(identifier, sequence);
            let parsed = parse_icmp_response(&packet, responder, identifier, false);
            prop_assert_eq!(parsed.map(|p| p.sequence), Some(sequence));
        }

        /// Packets too short for valid IP headers should return None
        #[test]
        fn proptest_short_packets_return_none(size in 0usize..20) {
            let data = vec![0x45u8; size];
            let responder = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
            prop_assert!(parse_icmp_response(&data, responder, ID, true).is_none());
        }
    }
}
