//! Sync metadata carried by every replicated record.

use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Origin / version / last-synced triple shared by patients, visits and
/// intake records.
///
/// `sync_version` only ever increases through local edits, and
/// `last_synced_at` is only written by the sync collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Tablet that created the record
    pub origin_tablet: String,
    /// Last confirmed remote sync (0 = never)
    pub last_synced_at: i64,
    /// Incremented on every local mutation
    pub sync_version: i64,
}

impl SyncMetadata {
    /// Metadata for a record created on `origin_tablet`.
    pub fn new(origin_tablet: impl Into<String>) -> Self {
        Self {
            origin_tablet: origin_tablet.into(),
            last_synced_at: 0,
            sync_version: 1,
        }
    }

    /// Whether the record has ever been acknowledged by a remote peer.
    pub fn is_synced(&self) -> bool {
        self.last_synced_at > 0
    }
}
