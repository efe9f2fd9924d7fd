#![no_std]

// Types shared by every packet-path unit and by the userspace control plane.
// Keep this crate `no_std` friendly so it can be used from in-kernel code.

use core::fmt;
use core::net::Ipv4Addr;

pub mod packet;

pub use packet::{AddressKey, Endpoint, KeyVariant, LinkLayerKey, Packet};

/// Entries per usage table and per blocklist, matching the kernel map sizing.
pub const MAX_MAP_ENTRIES: usize = 4096;

pub const ETH_HEADER_LEN: usize = 14;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const ETH_P_IPV4: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;

/// What the invoking hook should do with the frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Verdict {
    Pass,
    Drop,
}

/// Which side of the interface the frame was seen on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Receive path; usage is attributed to the packet source.
    Ingress,
    /// Transmit path; usage is attributed to the packet destination.
    Egress,
}

impl Direction {
    pub fn endpoint(self) -> Endpoint {
        match self {
            Direction::Ingress => Endpoint::Source,
            Direction::Egress => Endpoint::Destination,
        }
    }
}

/// IPv4 address exactly as it sits in the header: the four bytes in wire
/// order reinterpreted in place, never byte-swapped to host order.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Ip4Key(pub u32);

impl Ip4Key {
    pub fn from_octets(octets: [u8; 4]) -> Self {
        Self(u32::from_ne_bytes(octets))
    }

    pub fn octets(self) -> [u8; 4] {
        self.0.to_ne_bytes()
    }

    pub fn addr(self) -> Ipv4Addr {
        Ipv4Addr::from(self.octets())
    }
}

impl From<Ipv4Addr> for Ip4Key {
    fn from(addr: Ipv4Addr) -> Self {
        Self::from_octets(addr.octets())
    }
}

impl fmt::Display for Ip4Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr(), f)
    }
}

/// Link-layer address packed into the low 48 bits of a u64, first
/// transmitted byte most significant. The upper 16 bits are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MacKey(pub u64);

impl MacKey {
    pub fn from_octets(octets: [u8; 6]) -> Self {
        // Placed byte by byte so the result never depends on host endianness.
        let mut packed = 0u64;
        for byte in octets {
            packed = (packed << 8) | byte as u64;
        }
        Self(packed)
    }

    pub fn octets(self) -> [u8; 6] {
        let mut out = [0u8; 6];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = (self.0 >> (8 * (5 - i))) as u8;
        }
        out
    }
}

impl From<[u8; 6]> for MacKey {
    fn from(octets: [u8; 6]) -> Self {
        Self::from_octets(octets)
    }
}

impl fmt::Display for MacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

// Userspace builds enable `user` to get serde impls for reporting; keys are
// written in their human form.
#[cfg(feature = "user")]
mod user_impls {
    extern crate serde;

    use super::{Ip4Key, MacKey};
    use serde::{Serialize, Serializer};

    impl Serialize for Ip4Key {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl Serialize for MacKey {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;

    #[test]
    fn mac_key_packs_first_byte_most_significant() {
        let key = MacKey::from_octets([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(key.0, 0xAABB_CCDD_EEFF);
        assert_eq!(key.0 >> 48, 0);
        assert_eq!(key.octets(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(key.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn ip4_key_keeps_wire_order() {
        let key = Ip4Key::from(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(key.0.to_ne_bytes(), [10, 0, 0, 5]);
        assert_eq!(key.addr(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(key.to_string(), "10.0.0.5");
    }

    #[test]
    fn direction_selects_endpoint() {
        assert_eq!(Direction::Ingress.endpoint(), Endpoint::Source);
        assert_eq!(Direction::Egress.endpoint(), Endpoint::Destination);
    }
}
