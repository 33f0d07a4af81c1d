//! Undo action model

use chrono::{DateTime, Utc};

use super::Entry;

/// Maximum number of undo records retained; oldest are evicted first.
pub const MAX_UNDO_DEPTH: usize = 50;

/// A reversible mutation of the entry list.
///
/// Every variant stores the data needed to replay its inverse. `UpdateEntry`
/// deliberately stores only the pre-update snapshot, so redoing an update
/// re-applies the old value rather than the new one; see
/// `store::tests::update_redo_reapplies_pre_update_snapshot`.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    AddEntry(Entry),
    DeleteEntry(Entry),
    DeleteMultiple(Vec<Entry>),
    ClearAll(Vec<Entry>),
    UpdateEntry { old: Entry },
}

impl Action {
    /// Human-readable label for display in undo UI.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::AddEntry(_) => "add entry",
            Self::DeleteEntry(_) => "delete entry",
            Self::DeleteMultiple(_) => "delete entries",
            Self::ClearAll(_) => "clear all",
            Self::UpdateEntry { .. } => "update entry",
        }
    }
}

/// An [`Action`] together with the moment it was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoRecord {
    pub action: Action,
    pub recorded_at: DateTime<Utc>,
}

impl UndoRecord {
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunNumber, TimingPoint};

    #[test]
    fn test_action_labels() {
        let entry = Entry::new(TimingPoint::Start, RunNumber::One, None, "dev1", "Start");
        assert_eq!(Action::AddEntry(entry.clone()).label(), "add entry");
        assert_eq!(Action::ClearAll(vec![entry]).label(), "clear all");
    }
}
