use std::{marker::PhantomData, sync::Arc};

use redq_common::{AddressKey, Direction, KeyVariant, LinkLayerKey, Packet, Verdict};

use crate::table::UsageTable;

/// Per-direction usage accounting for one key variant.
///
/// Purely observational: every call returns [`Verdict::Pass`]. Frames the
/// variant cannot key are not counted and leave both tables untouched.
pub struct Accounting<V: KeyVariant> {
    ingress: Arc<UsageTable<V::Key>>,
    egress: Arc<UsageTable<V::Key>>,
    variant: PhantomData<fn() -> V>,
}

pub type AddressAccounting = Accounting<AddressKey>;
pub type LinkLayerAccounting = Accounting<LinkLayerKey>;

impl<V: KeyVariant> Accounting<V> {
    pub fn new(ingress: Arc<UsageTable<V::Key>>, egress: Arc<UsageTable<V::Key>>) -> Self {
        Self {
            ingress,
            egress,
            variant: PhantomData,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(
            Arc::new(UsageTable::with_capacity(capacity)),
            Arc::new(UsageTable::with_capacity(capacity)),
        )
    }

    pub fn table(&self, direction: Direction) -> &Arc<UsageTable<V::Key>> {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    pub fn process(&self, packet: &Packet<'_>, direction: Direction) -> Verdict {
        let Some(key) = V::extract(packet, direction.endpoint()) else {
            return Verdict::Pass;
        };
        let len = packet.wire_len().saturating_sub(V::LINK_HEADER_LEN) as u64;
        self.table(direction).increment_or_insert(key, len);
        Verdict::Pass
    }
}

impl<V: KeyVariant> Clone for Accounting<V> {
    fn clone(&self) -> Self {
        Self {
            ingress: Arc::clone(&self.ingress),
            egress: Arc::clone(&self.egress),
            variant: PhantomData,
        }
    }
}

impl<V: KeyVariant> Default for Accounting<V> {
    fn default() -> Self {
        Self::with_capacity(redq_common::MAX_MAP_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, thread};

    use redq_common::{ETH_P_IPV4, ETH_P_IPV6, Ip4Key, MacKey};

    use super::*;
    use crate::testutil::frame;

    const HOST_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0a];
    const HOST_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0b];

    #[test]
    fn ipv4_frame_observed_three_times() {
        let accounting = AddressAccounting::default();
        let buf = frame(HOST_B, HOST_A, ETH_P_IPV4, [10, 0, 0, 5], [10, 0, 0, 1], 74);
        for _ in 0..3 {
            let verdict = accounting.process(&Packet::new(&buf), Direction::Ingress);
            assert_eq!(verdict, Verdict::Pass);
        }
        let key = Ip4Key::from(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(accounting.table(Direction::Ingress).peek(&key), Some(3 * 60));
        assert!(accounting.table(Direction::Egress).is_empty());
    }

    #[test]
    fn egress_is_keyed_on_destination() {
        let accounting = AddressAccounting::default();
        let buf = frame(HOST_B, HOST_A, ETH_P_IPV4, [10, 0, 0, 5], [10, 0, 0, 1], 100);
        accounting.process(&Packet::new(&buf), Direction::Egress);
        let dst = Ip4Key::from(Ipv4Addr::new(10, 0, 0, 1));
        let src = Ip4Key::from(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(accounting.table(Direction::Egress).peek(&dst), Some(86));
        assert_eq!(accounting.table(Direction::Egress).peek(&src), None);
        assert!(accounting.table(Direction::Ingress).is_empty());
    }

    #[test]
    fn link_layer_accounting_counts_ipv6_and_uses_wire_length() {
        let accounting = LinkLayerAccounting::default();
        let buf = frame(HOST_B, HOST_A, ETH_P_IPV6, [0; 4], [0; 4], 128);
        // Only the first 64 bytes were captured, the packet was 1514 long.
        accounting.process(&Packet::with_wire_len(&buf[..64], 1514), Direction::Ingress);
        accounting.process(&Packet::new(&buf), Direction::Egress);

        let ingress = accounting.table(Direction::Ingress);
        let egress = accounting.table(Direction::Egress);
        assert_eq!(ingress.peek(&MacKey::from(HOST_A)), Some(1500));
        assert_eq!(egress.peek(&MacKey::from(HOST_B)), Some(114));
    }

    #[test]
    fn malformed_frames_pass_without_touching_tables() {
        let mac = LinkLayerAccounting::default();
        let ip = AddressAccounting::default();
        let arp = frame(HOST_B, HOST_A, 0x0806, [10, 0, 0, 5], [10, 0, 0, 1], 60);
        let ipv4 = frame(HOST_B, HOST_A, ETH_P_IPV4, [10, 0, 0, 5], [10, 0, 0, 1], 60);

        let inputs = [Packet::new(&arp), Packet::new(&ipv4[..13]), Packet::new(&ipv4[..33])];
        for packet in &inputs[..2] {
            for direction in [Direction::Ingress, Direction::Egress] {
                assert_eq!(mac.process(packet, direction), Verdict::Pass);
            }
        }
        for packet in &inputs {
            for direction in [Direction::Ingress, Direction::Egress] {
                assert_eq!(ip.process(packet, direction), Verdict::Pass);
            }
        }
        for direction in [Direction::Ingress, Direction::Egress] {
            assert!(mac.table(direction).is_empty());
            assert!(ip.table(direction).is_empty());
        }
    }

    #[test]
    fn header_only_frame_counts_zero_bytes() {
        let accounting = LinkLayerAccounting::default();
        let buf = frame(HOST_B, HOST_A, ETH_P_IPV4, [0; 4], [0; 4], 14);
        accounting.process(&Packet::new(&buf[..14]), Direction::Ingress);
        assert_eq!(
            accounting.table(Direction::Ingress).peek(&MacKey::from(HOST_A)),
            Some(0)
        );
    }

    #[test]
    fn concurrent_dispatch_sums_exactly() {
        let accounting = AddressAccounting::default();
        let buf = frame(HOST_B, HOST_A, ETH_P_IPV4, [10, 0, 0, 5], [10, 0, 0, 1], 74);
        thread::scope(|s| {
            for _ in 0..4 {
                let accounting = accounting.clone();
                let buf = &buf;
                s.spawn(move || {
                    for _ in 0..2_500 {
                        accounting.process(&Packet::new(buf), Direction::Ingress);
                    }
                });
            }
        });
        let key = Ip4Key::from(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(
            accounting.table(Direction::Ingress).peek(&key),
            Some(10_000 * 60)
        );
    }
}
