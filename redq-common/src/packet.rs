//! Bounds-checked key extraction from raw frames.
//!
//! Every header read goes through [`Packet::bytes_at`], which hands out a
//! fixed-size array only when the whole range lies inside the readable
//! region. A short or malformed frame makes extraction return `None`; it can
//! never cause a read past the end of the buffer.

use crate::{ETH_HEADER_LEN, ETH_P_IPV4, ETH_P_IPV6, IPV4_MIN_HEADER_LEN, Ip4Key, MacKey};

const ETH_DEST_OFFSET: usize = 0;
const ETH_SOURCE_OFFSET: usize = 6;
const ETH_PROTO_OFFSET: usize = 12;
const IPV4_SOURCE_OFFSET: usize = ETH_HEADER_LEN + 12;
const IPV4_DEST_OFFSET: usize = ETH_HEADER_LEN + 16;

/// A frame as handed over by the hook: the readable bytes plus the length of
/// the whole packet on the wire, which may be larger when only a prefix is
/// linear or captured.
#[derive(Copy, Clone, Debug)]
pub struct Packet<'a> {
    data: &'a [u8],
    wire_len: usize,
}

impl<'a> Packet<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            wire_len: data.len(),
        }
    }

    /// `wire_len` below the readable length is raised to it.
    pub fn with_wire_len(data: &'a [u8], wire_len: usize) -> Self {
        Self {
            data,
            wire_len: wire_len.max(data.len()),
        }
    }

    pub fn wire_len(&self) -> usize {
        self.wire_len
    }

    pub fn bytes_at<const N: usize>(&self, offset: usize) -> Option<&'a [u8; N]> {
        let end = offset.checked_add(N)?;
        self.data.get(offset..end)?.try_into().ok()
    }

    /// Ethertype of the link-layer header, or `None` if the header is cut short.
    pub fn ether_type(&self) -> Option<u16> {
        self.bytes_at::<ETH_HEADER_LEN>(0)?;
        self.bytes_at::<2>(ETH_PROTO_OFFSET).map(|raw| u16::from_be_bytes(*raw))
    }
}

/// Which address of the frame the key is taken from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Endpoint {
    Source,
    Destination,
}

/// A way of turning a frame into a classification key.
pub trait KeyVariant {
    type Key: Copy + Eq + core::hash::Hash;

    /// Link-layer bytes that are not attributed to usage.
    const LINK_HEADER_LEN: usize;

    fn extract(packet: &Packet<'_>, endpoint: Endpoint) -> Option<Self::Key>;
}

/// IPv4 source/destination address. Frames with any other ethertype, or too
/// short to hold the Ethernet and minimal IPv4 headers, yield nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct AddressKey;

impl KeyVariant for AddressKey {
    type Key = Ip4Key;

    const LINK_HEADER_LEN: usize = ETH_HEADER_LEN;

    fn extract(packet: &Packet<'_>, endpoint: Endpoint) -> Option<Ip4Key> {
        packet.bytes_at::<{ ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN }>(0)?;
        if packet.ether_type()? != ETH_P_IPV4 {
            return None;
        }
        let offset = match endpoint {
            Endpoint::Source => IPV4_SOURCE_OFFSET,
            Endpoint::Destination => IPV4_DEST_OFFSET,
        };
        packet.bytes_at::<4>(offset).map(|raw| Ip4Key::from_octets(*raw))
    }
}

/// Ethernet source/destination address of IPv4 or IPv6 frames.
#[derive(Copy, Clone, Debug, Default)]
pub struct LinkLayerKey;

impl KeyVariant for LinkLayerKey {
    type Key = MacKey;

    const LINK_HEADER_LEN: usize = ETH_HEADER_LEN;

    fn extract(packet: &Packet<'_>, endpoint: Endpoint) -> Option<MacKey> {
        match packet.ether_type()? {
            ETH_P_IPV4 | ETH_P_IPV6 => {}
            _ => return None,
        }
        let offset = match endpoint {
            Endpoint::Source => ETH_SOURCE_OFFSET,
            Endpoint::Destination => ETH_DEST_OFFSET,
        };
        packet.bytes_at::<6>(offset).map(|raw| MacKey::from_octets(*raw))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::vec::Vec;

    const DST_MAC: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    const SRC_MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    fn frame(ether_type: u16, src_ip: [u8; 4], dst_ip: [u8; 4], total_len: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(total_len);
        buf.extend_from_slice(&DST_MAC);
        buf.extend_from_slice(&SRC_MAC);
        buf.extend_from_slice(&ether_type.to_be_bytes());
        // version/ihl, tos, total length, id, flags/frag, ttl, proto, checksum
        buf.extend_from_slice(&[0x45, 0, 0, 60, 0, 0, 0, 0, 64, 17, 0, 0]);
        buf.extend_from_slice(&src_ip);
        buf.extend_from_slice(&dst_ip);
        buf.resize(total_len.max(buf.len()), 0);
        buf
    }

    #[test]
    fn link_layer_key_reads_both_addresses() {
        let buf = frame(ETH_P_IPV4, [10, 0, 0, 5], [10, 0, 0, 1], 74);
        let packet = Packet::new(&buf);
        assert_eq!(
            LinkLayerKey::extract(&packet, Endpoint::Source),
            Some(MacKey(0xAABB_CCDD_EEFF))
        );
        assert_eq!(
            LinkLayerKey::extract(&packet, Endpoint::Destination),
            Some(MacKey(0x1122_3344_5566))
        );
    }

    #[test]
    fn link_layer_key_accepts_ipv6_only_as_second_protocol() {
        let buf = frame(ETH_P_IPV6, [0; 4], [0; 4], 74);
        assert!(LinkLayerKey::extract(&Packet::new(&buf), Endpoint::Source).is_some());

        let arp = frame(0x0806, [0; 4], [0; 4], 74);
        assert_eq!(LinkLayerKey::extract(&Packet::new(&arp), Endpoint::Source), None);
    }

    #[test]
    fn address_key_reads_wire_order_value() {
        let buf = frame(ETH_P_IPV4, [10, 0, 0, 5], [192, 168, 1, 9], 74);
        let packet = Packet::new(&buf);
        let src = AddressKey::extract(&packet, Endpoint::Source).unwrap();
        let dst = AddressKey::extract(&packet, Endpoint::Destination).unwrap();
        assert_eq!(src.0, u32::from_ne_bytes([10, 0, 0, 5]));
        assert_eq!(src.octets(), [10, 0, 0, 5]);
        assert_eq!(dst.octets(), [192, 168, 1, 9]);
    }

    #[test]
    fn address_key_rejects_ipv6() {
        let buf = frame(ETH_P_IPV6, [10, 0, 0, 5], [10, 0, 0, 1], 74);
        assert_eq!(AddressKey::extract(&Packet::new(&buf), Endpoint::Source), None);
    }

    #[test]
    fn every_truncation_short_of_the_header_fails() {
        let buf = frame(ETH_P_IPV4, [10, 0, 0, 5], [10, 0, 0, 1], 74);
        // The buffer beyond `cut` is valid memory; a read of it would still
        // be visible as a successful extraction.
        for cut in 0..buf.len() {
            let packet = Packet::new(&buf[..cut]);
            let mac = LinkLayerKey::extract(&packet, Endpoint::Source);
            let ip = AddressKey::extract(&packet, Endpoint::Destination);
            assert_eq!(mac.is_some(), cut >= ETH_HEADER_LEN, "mac at cut {cut}");
            assert_eq!(
                ip.is_some(),
                cut >= ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN,
                "ip at cut {cut}"
            );
        }
    }

    #[test]
    fn bytes_at_rejects_overflowing_offsets() {
        let buf = [0u8; 8];
        let packet = Packet::new(&buf);
        assert!(packet.bytes_at::<4>(usize::MAX - 1).is_none());
        assert!(packet.bytes_at::<4>(5).is_none());
        assert_eq!(packet.bytes_at::<4>(4), Some(&[0u8; 4]));
    }

    #[test]
    fn wire_len_never_below_readable_len() {
        let buf = [0u8; 60];
        assert_eq!(Packet::with_wire_len(&buf, 10).wire_len(), 60);
        assert_eq!(Packet::with_wire_len(&buf, 1514).wire_len(), 1514);
        assert_eq!(Packet::new(&buf).wire_len(), 60);
    }
}
