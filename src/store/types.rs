//! Store record types

use serde::{Deserialize, Serialize};

use crate::object::Object;

/// Position in the store's single monotonically increasing sequence.
///
/// Row ids and change-feed positions draw from the same sequence, so a row
/// newer than marker M was written after every change at or before M.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Marker(pub u64);

impl Marker {
    /// The position before any write
    pub const ZERO: Marker = Marker(0);

    /// The following position
    pub fn next(self) -> Marker {
        Marker(self.0 + 1)
    }
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    /// Written by a replace but not yet verified; hidden from scans
    Pending,
    Live,
    Tombstoned,
}

/// An object as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Row id, assigned on insert
    pub row: Marker,
    pub object: Object,
    pub status: RowStatus,
}

impl StoredDocument {
    /// Whether the row is live
    pub fn is_live(&self) -> bool {
        self.status == RowStatus::Live
    }

    /// Whether the row awaits activation
    pub fn is_pending(&self) -> bool {
        self.status == RowStatus::Pending
    }
}

/// What a change record describes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ChangeKind {
    Insert { doc: StoredDocument },
    Delete { doc: StoredDocument },
    /// The retired and inserted rows of one replace, applied as a pair
    Replace {
        retired: StoredDocument,
        inserted: StoredDocument,
    },
}

impl ChangeKind {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ChangeKind::Insert { .. } => "insert",
            ChangeKind::Delete { .. } => "delete",
            ChangeKind::Replace { .. } => "replace",
        }
    }
}

/// One entry of the change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub marker: Marker,
    pub kind: ChangeKind,
}

/// Keyset page request for `find`, newest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scan {
    /// Only rows newer than this marker
    pub since: Option<Marker>,
    /// Only rows older than this marker (the previous page's last row)
    pub before: Option<Marker>,
    pub limit: usize,
}

impl Scan {
    /// First page of rows newer than `since`
    pub fn first(since: Option<Marker>, limit: usize) -> Self {
        Self {
            since,
            before: None,
            limit,
        }
    }

    /// The page following one that ended at `last`
    pub fn after_page(self, last: Marker) -> Self {
        Self {
            before: Some(last),
            ..self
        }
    }

    /// Whether a row falls in this scan's window
    pub fn contains(&self, row: Marker) -> bool {
        self.since.map_or(true, |since| row > since) && self.before.map_or(true, |b| row < b)
    }
}
