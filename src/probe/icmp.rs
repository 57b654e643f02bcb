use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpType, IcmpTypes, checksum};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::error::PingError;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Default payload size (standard ping)
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;
/// Largest payload accepted by `Pinger::set_payload_size`
pub const MAX_PAYLOAD_SIZE: usize = 65500;

/// ICMPv6 Echo Request type
pub const ICMPV6_ECHO_REQUEST: u8 = 128;

/// Identifiers held by live pingers in this process
static IDENTIFIERS: LazyLock<Mutex<HashSet<u16>>> = LazyLock::new(Default::default);

/// Echo identifier reserved for one pinger, released on drop
///
/// Raw sockets deliver every ICMP reply to every socket, so pingers sharing
/// an identifier would answer each other's requests.
#[derive(Debug)]
pub struct IdentifierClaim {
    id: u16,
    owned: bool,
}

impl IdentifierClaim {
    /// Reserve a random identifier no other live pinger holds
    pub fn allocate() -> Result<Self, PingError> {
        let mut used = IDENTIFIERS.lock();
        let start = rand::random::<u16>();
        let id = (0..=u16::MAX)
            .map(|offset| start.wrapping_add(offset))
            .find(|id| !used.contains(id))
            .ok_or(PingError::IdentifiersExhausted)?;
        used.insert(id);
        Ok(Self { id, owned: true })
    }

    /// Use `id` as given, even if another pinger already holds it
    pub fn fixed(id: u16) -> Self {
        let owned = IDENTIFIERS.lock().insert(id);
        if !owned {
            tracing::warn!(identifier = id, "ICMP identifier shared with another pinger");
        }
        Self { id, owned }
    }

    pub fn id(&self) -> u16 {
        self.id
    }
}

impl Drop for IdentifierClaim {
    fn drop(&mut self) {
        if self.owned {
            IDENTIFIERS.lock().remove(&self.id);
        }
    }
}

/// Generate `size` bytes of pseudo-random payload
pub fn random_payload(size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

/// Build an ICMP Echo Request packet carrying `payload`
///
/// Set ipv6=true to build an ICMPv6 Echo Request. The ICMPv6 checksum is left
/// at zero: the kernel fills it in for raw and datagram ICMPv6 sockets.
pub fn build_echo_request(identifier: u16, sequence: u16, payload: &[u8], ipv6: bool) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload.len()];

    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buffer) {
        if ipv6 {
            packet.set_icmp_type(IcmpType::new(ICMPV6_ECHO_REQUEST));
        } else {
            packet.set_icmp_type(IcmpTypes::EchoRequest);
        }
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(payload);
    }

    if !ipv6 && let Some(icmp) = IcmpPacket::new(&buffer) {
        let cksum = checksum(&icmp);
        buffer[2..4].copy_from_slice(&cksum.to_be_bytes());
    }

    buffer
}
