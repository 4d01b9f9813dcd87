//! Stream identifiers and batch coordinates.
//!
//! A stream is a named, keyed, half-duplex flow of chunk hashes between two
//! peers. The `(name, key, live)` triple selects the registered factory,
//! parameterises it, and separates the tail-following stream from the
//! historical backfill of the same data.

use std::fmt;

/// Number of outbox priority bands. Band 0 is the lowest.
pub const PRIORITY_BANDS: u8 = 2;

/// Default band for historical backfill traffic.
pub const PRIORITY_NORMAL: u8 = 0;

/// Band for live sync traffic. Drains before normal.
pub const PRIORITY_HIGH: u8 = 1;

/// A unique stream identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stream {
    /// Selects the registered server/client factory (e.g. "SYNC").
    pub name: String,
    /// Parameterises the factory. For "SYNC" this is the proximity bin,
    /// base-36 encoded.
    pub key: String,
    /// Whether the stream delivers only data ingested after subscription.
    pub live: bool,
}

impl Stream {
    pub fn new(name: impl Into<String>, key: impl Into<String>, live: bool) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            live,
        }
    }

    /// The paired historical stream of a live stream: same name and key,
    /// `live = false`.
    pub fn history(&self) -> Stream {
        Stream {
            name: self.name.clone(),
            key: self.key.clone(),
            live: false,
        }
    }
}

/// The printable form `name|key|<l|h>` is used as a map key and log token.
impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = if self.live { "l" } else { "h" };
        write!(f, "{}|{}|{}", self.name, self.key, t)
    }
}

/// Priority band for the paired historical server created alongside a live
/// subscription. One band below the live stream's.
pub fn history_priority(priority: u8) -> u8 {
    priority.saturating_sub(1)
}

/// A half-open interval `[from, to)` over a server's local monotonic index.
///
/// `from = 0` on the client's first request means "server picks the
/// starting index based on live/historical". `to = 0` on a server offer
/// means the next batch boundary is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub from: u64,
    pub to: u64,
}

impl Range {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{})", self.from, self.to)
    }
}
