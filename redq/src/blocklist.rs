use std::{
    collections::HashSet,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result, bail, ensure};
use parking_lot::RwLock;
use redq_common::{MAX_MAP_ENTRIES, MacKey};

/// Set of blocked link-layer addresses.
///
/// The packet path only ever reads it; inserts and removals come from the
/// control plane. Capacity is fixed like the kernel map it stands in for.
pub struct Blocklist {
    entries: RwLock<HashSet<MacKey>>,
    capacity: usize,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MAP_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashSet::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let blocklist = Self::new();
        let added = blocklist.load_path(path)?;
        tracing::info!(path = %path.display(), entries = added, "loaded mac blocklist");
        Ok(blocklist)
    }

    pub fn is_blocked(&self, key: MacKey) -> bool {
        self.entries.read().contains(&key)
    }

    /// Returns whether the address was newly added.
    pub fn insert(&self, key: MacKey) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.contains(&key) {
            return Ok(false);
        }
        ensure!(
            entries.len() < self.capacity,
            "blocklist is full ({} entries), cannot add {key}",
            self.capacity
        );
        entries.insert(key);
        Ok(true)
    }

    pub fn remove(&self, key: MacKey) -> bool {
        self.entries.write().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sorted copy of the blocked addresses.
    pub fn entries(&self) -> Vec<MacKey> {
        let mut out: Vec<MacKey> = self.entries.read().iter().copied().collect();
        out.sort_unstable();
        out
    }

    pub fn load_path(&self, path: &Path) -> Result<usize> {
        let file = File::open(path)
            .with_context(|| format!("failed to open blocklist at {}", path.display()))?;
        self.load_reader(BufReader::new(file), &path.display().to_string())
    }

    /// Reads one address per line; `#` starts a comment. Returns how many
    /// addresses were new.
    pub fn load_reader<R: BufRead>(&self, reader: R, origin: &str) -> Result<usize> {
        let mut added = 0;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line
                .with_context(|| format!("failed to read line {} of {origin}", line_no + 1))?;
            let trimmed = line.split('#').next().unwrap_or("").trim();
            if trimmed.is_empty() {
                continue;
            }
            let key = parse_mac(trimmed)
                .with_context(|| format!("invalid entry on line {} of {origin}", line_no + 1))?;
            if self.insert(key)? {
                added += 1;
            }
        }
        Ok(added)
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse "aa:bb:cc:dd:ee:ff" (or dash separated) into a packed key.
pub fn parse_mac(s: &str) -> Result<MacKey> {
    let parts: Vec<&str> = s.split([':', '-']).collect();
    if parts.len() != 6 {
        bail!("MAC address must have 6 octets, got '{s}'");
    }
    let mut octets = [0u8; 6];
    for (octet, part) in octets.iter_mut().zip(&parts) {
        ensure!(
            part.len() == 2 && part.bytes().all(|b| b.is_ascii_hexdigit()),
            "invalid MAC octet '{part}' in '{s}'"
        );
        *octet = u8::from_str_radix(part, 16)
            .with_context(|| format!("invalid MAC octet '{part}' in '{s}'"))?;
    }
    Ok(MacKey::from_octets(octets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parse_mac_packs_octets() {
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff").unwrap(), MacKey(0xAABB_CCDD_EEFF));
        assert_eq!(parse_mac("02-00-00-00-00-0A").unwrap(), MacKey(0x0200_0000_000A));
    }

    #[test]
    fn parse_mac_rejects_garbage() {
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("gg:bb:cc:dd:ee:ff").is_err());
        assert!(parse_mac("aaa:bb:cc:dd:ee:ff").is_err());
        assert!(parse_mac("").is_err());
        assert!(parse_mac("+a:bb:cc:dd:ee:ff").is_err());
        assert!(parse_mac("aa:bb:cc:dd:ee:-f").is_err());
    }

    #[test]
    fn insert_remove_round() {
        let blocklist = Blocklist::new();
        let key = MacKey(0x0200_0000_0001);
        assert!(!blocklist.is_blocked(key));
        assert!(blocklist.insert(key).unwrap());
        assert!(!blocklist.insert(key).unwrap());
        assert!(blocklist.is_blocked(key));
        assert!(blocklist.remove(key));
        assert!(!blocklist.remove(key));
        assert!(!blocklist.is_blocked(key));
    }

    #[test]
    fn insert_fails_when_full() {
        let blocklist = Blocklist::with_capacity(2);
        blocklist.insert(MacKey(1)).unwrap();
        blocklist.insert(MacKey(2)).unwrap();
        assert!(blocklist.insert(MacKey(3)).is_err());
        // Re-adding a present key is not a capacity problem.
        assert!(!blocklist.insert(MacKey(2)).unwrap());
        assert_eq!(blocklist.len(), 2);
        assert_eq!(blocklist.capacity(), 2);
    }

    #[test]
    fn load_reader_skips_comments_and_blanks() {
        let input = "# lab hosts\n\naa:bb:cc:dd:ee:ff\n02:00:00:00:00:01  # printer\naa:bb:cc:dd:ee:ff\n";
        let blocklist = Blocklist::new();
        let added = blocklist.load_reader(Cursor::new(input), "test").unwrap();
        assert_eq!(added, 2);
        assert_eq!(
            blocklist.entries(),
            vec![MacKey(0x0200_0000_0001), MacKey(0xAABB_CCDD_EEFF)]
        );
    }

    #[test]
    fn load_reader_reports_line_number() {
        let input = "aa:bb:cc:dd:ee:ff\nnot-a-mac\n";
        let err = Blocklist::new()
            .load_reader(Cursor::new(input), "test")
            .unwrap_err();
        assert!(format!("{err:#}").contains("line 2"), "{err:#}");
    }
}
