//! Per-packet usage accounting and link-layer blocklisting.
//!
//! The packet-path pieces ([`Accounting`], [`MacFilter`]) are plain
//! synchronous calls over shared tables and can be driven by any hook. The
//! [`node`] module is the userspace host that feeds them from an interface.

pub mod accounting;
pub mod blocklist;
pub mod filter;
pub mod ledger;
pub mod node;
pub mod table;

pub use accounting::{Accounting, AddressAccounting, LinkLayerAccounting};
pub use blocklist::{Blocklist, parse_mac};
pub use filter::MacFilter;
pub use ledger::{UsageLedger, UsageRecord, UsageStat};
pub use table::{CounterHandle, UsageTable};

#[cfg(test)]
mod testutil;
