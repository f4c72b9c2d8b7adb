use serde::{Deserialize, Serialize};

/// Process-wide key/value configuration row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub key: String,
    pub value: String,
    /// ms epoch
    pub updated_at: i64,
}
