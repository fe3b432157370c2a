//! The handle-map payload: `<idx>:<hex>(;<idx>:<hex>)*`.
//!
//! On hosts without stable small-integer descriptor identities
//! (Windows), the parent tells the child which kernel handle carries
//! each of channels 3–5 through this ASCII payload, delivered in an
//! environment variable or a command-line flag. Channels 0–2 ride the
//! host's conventional startup-info slots and never appear here.
//!
//! Parsing is lenient by contract: malformed pairs are skipped,
//! indices outside 3–5 are tolerated and ignored.

use crate::channel::Channel;

/// Map from channels 3–5 to raw host handle values.
///
/// Handle values are opaque integers sized to the host's pointer
/// width; validation against live kernel objects happens in the
/// bootstrap layer, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleMap {
    entries: [Option<u64>; 3],
}

impl HandleMap {
    /// Empty map.
    pub fn new() -> HandleMap {
        HandleMap::default()
    }

    fn slot(channel: Channel) -> Option<usize> {
        match channel {
            Channel::Telemetry => Some(0),
            Channel::DataIn => Some(1),
            Channel::DataOut => Some(2),
            _ => None,
        }
    }

    /// Record the handle for one of channels 3–5. Channels 0–2 are
    /// ignored; they are conveyed through startup-info.
    pub fn insert(&mut self, channel: Channel, handle: u64) {
        if let Some(i) = Self::slot(channel) {
            self.entries[i] = Some(handle);
        }
    }

    /// Raw handle value for a channel, if present.
    pub fn get(&self, channel: Channel) -> Option<u64> {
        Self::slot(channel).and_then(|i| self.entries[i])
    }

    /// Remove a channel's entry (used when validation rejects it).
    pub fn remove(&mut self, channel: Channel) {
        if let Some(i) = Self::slot(channel) {
            self.entries[i] = None;
        }
    }

    /// True when no channel is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }

    /// (channel, handle) pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, u64)> + '_ {
        [Channel::Telemetry, Channel::DataIn, Channel::DataOut]
            .into_iter()
            .filter_map(|ch| self.get(ch).map(|h| (ch, h)))
    }

    /// Serialize to the wire form, e.g. `3:0x1A4;4:0x1B8;5:0x2C0`.
    ///
    /// Hex is uppercase with a `0x` prefix; absent channels are
    /// omitted entirely.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (ch, handle) in self.iter() {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(&format!("{}:0x{:X}", ch.index(), handle));
        }
        out
    }

    /// Parse the wire form.
    ///
    /// Splits on `;`, then each pair at the first `:`. The index is
    /// decimal; the value is hex, optionally `0x`/`0X`-prefixed, any
    /// case. Malformed pairs are skipped; indices outside 3–5 are
    /// ignored.
    pub fn parse(payload: &str) -> HandleMap {
        let mut map = HandleMap::new();
        for pair in payload.split(';') {
            let Some((index, value)) = pair.split_once(':') else {
                continue;
            };
            let Ok(index) = index.trim().parse::<usize>() else {
                continue;
            };
            let Some(channel) = Channel::from_index(index) else {
                continue;
            };
            let value = value.trim();
            let digits = value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .unwrap_or(value);
            let Ok(handle) = u64::from_str_radix(digits, 16) else {
                continue;
            };
            map.insert(channel, handle);
        }
        map
    }
}

impl std::fmt::Display for HandleMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialize())
    }
}
