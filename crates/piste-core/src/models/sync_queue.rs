//! Sync queue item model

use serde::{Deserialize, Serialize};

use super::Entry;

/// A locally-created entry awaiting confirmed remote delivery.
///
/// Retry policy lives in the transport layer; this record only carries the
/// bookkeeping it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub entry: Entry,
    /// Number of delivery attempts so far
    #[serde(default)]
    pub retry_count: u32,
    /// Epoch millis of the most recent delivery attempt, 0 when never tried
    #[serde(default)]
    pub last_attempt: i64,
}

impl SyncQueueItem {
    #[must_use]
    pub const fn new(entry: Entry) -> Self {
        Self {
            entry,
            retry_count: 0,
            last_attempt: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunNumber, TimingPoint};

    #[test]
    fn test_new_item_starts_untried() {
        let entry = Entry::new(TimingPoint::Start, RunNumber::One, None, "dev1", "Start");
        let item = SyncQueueItem::new(entry);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.last_attempt, 0);
    }
}
