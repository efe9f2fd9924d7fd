use std::sync::Arc;

use redq_common::{Endpoint, KeyVariant, LinkLayerKey, Packet, Verdict};

use crate::blocklist::Blocklist;

/// Drops frames whose source link-layer address is blocklisted.
///
/// Frames that cannot be keyed (truncated header, ethertype other than IPv4
/// or IPv6) pass: parse failures are not this filter's concern.
#[derive(Clone)]
pub struct MacFilter {
    blocklist: Arc<Blocklist>,
}

impl MacFilter {
    pub fn new(blocklist: Arc<Blocklist>) -> Self {
        Self { blocklist }
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub fn process(&self, packet: &Packet<'_>) -> Verdict {
        match LinkLayerKey::extract(packet, Endpoint::Source) {
            Some(mac) if self.blocklist.is_blocked(mac) => Verdict::Drop,
            _ => Verdict::Pass,
        }
    }
}
